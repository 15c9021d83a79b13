//! The purpose of this module is to alleviate the need to import many of the `[stevedore]` types.
//!
//! ```
//! # #![allow(unused_imports)]
//! use stevedore::prelude::*;
//! ```
pub use crate::backend::{Backend, BackendError};
pub use crate::config::{ClaimMode, CompletionMode, PollingInterval, WorkerConfig};
pub use crate::execution::context::ExecutionContext;
pub use crate::execution::pipeline::{ExecutionObserver, Middleware, Next, Outcome};
pub use crate::handler::{ExecutionError, ExecutionResult, Handler};
pub use crate::job::builder::{JobBuilder, Sequence};
pub use crate::job::{Job, JobId, JobStatus};
pub use crate::retry::{Jitter, RetryPolicy};
pub use crate::scheduler::{Worker, WorkerHandle};
pub use crate::{Stevedore, StevedoreError};
