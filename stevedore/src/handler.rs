use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use std::{error::Error, fmt::Display};
use tokio::task::JoinError;

use crate::{
    execution::context::ExecutionContext, job::builder::JobBuilder, registry::ResolutionError,
    retry::RetryPolicy,
};

const ERROR_TYPE_PANIC: &str = "panic";
const ERROR_TYPE_RESOLUTION: &str = "resolution";

/// A unit of work that can be enqueued and executed by a worker.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// The type of the handler's parameter.
    ///
    /// It is stored as JSON alongside the job. If this is not needed it can be set to unit `()`.
    type Param: Serialize + DeserializeOwned + Send + 'static;
    /// The name of the job type.
    ///
    /// This is used to associate the jobs stored in the backend with this particular handler and
    /// so should be unique among the handlers sharing a backend.
    ///
    /// The motivation for using a static string here is to enable developers to rename their rust
    /// types for their handler without breaking the integration with the backend.
    const NAME: &'static str;
    /// Whether a job of this type may be started again when the worker running it dies.
    ///
    /// Jobs which are not safe to run twice should set this to `false`. Such jobs are reported
    /// and left for an operator when their worker stops sending heartbeats.
    const RESTART_ON_CRASH: bool = true;

    async fn handle(&self, param: Self::Param, context: &ExecutionContext) -> ExecutionResult;

    /// The retry policy for this job type, when it should differ from the worker default.
    ///
    /// An override configured via [`crate::config::WorkerConfig::with_retry_policy_for`] takes
    /// precedence.
    fn retry_policy() -> Option<RetryPolicy> {
        None
    }

    fn builder() -> JobBuilder<Self>
    where
        Self: Sized,
    {
        Default::default()
    }
}

#[derive(Debug)]
pub enum ExecutionResult {
    Done,
    Error { error: Box<dyn ExecutionError> },
}

impl<T> From<T> for ExecutionResult
where
    T: ExecutionError + 'static,
{
    fn from(value: T) -> Self {
        Self::Error {
            error: Box::new(value),
        }
    }
}

pub trait ExecutionError: Error + Send {
    fn error_type(&self) -> &'static str {
        "error"
    }
}

/// A classified failure of a single attempt, recorded against the job as its last error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Failure {
    pub error_type: &'static str,
    pub message: String,
}

impl Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.error_type, self.message)
    }
}

impl From<Box<dyn ExecutionError>> for Failure {
    fn from(value: Box<dyn ExecutionError>) -> Self {
        Self {
            error_type: value.error_type(),
            message: value.to_string(),
        }
    }
}

impl From<ResolutionError> for Failure {
    fn from(value: ResolutionError) -> Self {
        Self {
            error_type: ERROR_TYPE_RESOLUTION,
            message: value.to_string(),
        }
    }
}

impl From<JoinError> for Failure {
    fn from(value: JoinError) -> Self {
        let msg = value.to_string();
        let message = match value.try_into_panic() {
            Ok(panic) => panic
                .downcast_ref::<&str>()
                .map(ToString::to_string)
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or(msg),
            Err(_) => msg,
        };
        Self {
            error_type: ERROR_TYPE_PANIC,
            message,
        }
    }
}
