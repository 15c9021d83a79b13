//! Configuration of a worker.
//!
//! ```
//! # use std::time::Duration;
//! # use stevedore::prelude::*;
//! let config = WorkerConfig::default()
//!     .with_max_concurrency(20)
//!     .with_claim_mode(ClaimMode::Batch { size: 5 })
//!     .with_polling_interval(PollingInterval::increasing(
//!         Duration::from_millis(100),
//!         2.0,
//!         Duration::from_secs(5),
//!     ))
//!     .with_completion_mode(CompletionMode::Batching);
//!
//! assert!(config.validate().is_ok());
//! ```
use std::time::Duration;

use chrono::TimeDelta;
use fxhash::FxHashMap;

use crate::{retry::RetryPolicy, StevedoreError};

/// How many jobs a worker claims in a single round trip to the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClaimMode {
    /// Claim one job per free execution slot.
    #[default]
    Single,
    /// Claim up to `size` jobs at once, bounded by the number of free execution slots.
    Batch { size: usize },
}

/// How long the worker sleeps after a claim that found nothing to do.
///
/// The interval starts at `start` and is multiplied by `factor` after every empty claim, up to
/// `max`. It returns to `start` as soon as a claim returns work.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PollingInterval {
    pub(crate) start: Duration,
    pub(crate) factor: f64,
    pub(crate) max: Duration,
}

impl PollingInterval {
    pub const fn constant(interval: Duration) -> Self {
        Self {
            start: interval,
            factor: 1.0,
            max: interval,
        }
    }

    pub const fn increasing(start: Duration, factor: f64, max: Duration) -> Self {
        Self { start, factor, max }
    }
}

impl Default for PollingInterval {
    fn default() -> Self {
        Self::constant(Duration::from_secs(1))
    }
}

/// How successful executions are written back to the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompletionMode {
    /// One backend call per completed job.
    #[default]
    Simple,
    /// Completions are gathered and written in bulk.
    Batching,
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub(crate) max_concurrency: usize,
    pub(crate) claim_mode: ClaimMode,
    pub(crate) polling_interval: PollingInterval,
    pub(crate) store_error_interval: Duration,
    pub(crate) heartbeat_interval: Duration,
    pub(crate) stale_heartbeat_threshold: TimeDelta,
    pub(crate) reclaim_interval: Duration,
    pub(crate) retry_queue_interval: Duration,
    pub(crate) retry_queue_capacity: usize,
    pub(crate) completion_mode: CompletionMode,
    pub(crate) delete_completed: bool,
    pub(crate) default_retry_policy: RetryPolicy,
    pub(crate) retry_policies: FxHashMap<String, RetryPolicy>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 10,
            claim_mode: ClaimMode::default(),
            polling_interval: PollingInterval::default(),
            store_error_interval: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(10),
            stale_heartbeat_threshold: TimeDelta::minutes(1),
            reclaim_interval: Duration::from_secs(30),
            retry_queue_interval: Duration::from_secs(1),
            retry_queue_capacity: 10_000,
            completion_mode: CompletionMode::default(),
            delete_completed: false,
            default_retry_policy: RetryPolicy::default(),
            retry_policies: FxHashMap::default(),
        }
    }
}

impl WorkerConfig {
    /// The number of jobs this worker executes at the same time.
    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    pub fn with_claim_mode(mut self, claim_mode: ClaimMode) -> Self {
        self.claim_mode = claim_mode;
        self
    }

    pub fn with_polling_interval(mut self, polling_interval: PollingInterval) -> Self {
        self.polling_interval = polling_interval;
        self
    }

    /// How long to wait before claiming again after the backend returned an error.
    pub fn with_store_error_interval(mut self, interval: Duration) -> Self {
        self.store_error_interval = interval;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// How old the last heartbeat of a worker must be before it is considered dead and its jobs
    /// are reclaimed. Must exceed the heartbeat interval.
    pub fn with_stale_heartbeat_threshold(mut self, threshold: TimeDelta) -> Self {
        self.stale_heartbeat_threshold = threshold;
        self
    }

    pub fn with_reclaim_interval(mut self, interval: Duration) -> Self {
        self.reclaim_interval = interval;
        self
    }

    /// How often writes that failed after an execution are replayed.
    pub fn with_retry_queue_interval(mut self, interval: Duration) -> Self {
        self.retry_queue_interval = interval;
        self
    }

    /// The number of failed writes held for replay. Once full, executions wait for space before
    /// releasing their slot.
    pub fn with_retry_queue_capacity(mut self, capacity: usize) -> Self {
        self.retry_queue_capacity = capacity;
        self
    }

    pub fn with_completion_mode(mut self, completion_mode: CompletionMode) -> Self {
        self.completion_mode = completion_mode;
        self
    }

    /// Delete completed jobs instead of keeping them with the completed status.
    pub fn with_delete_completed(mut self, delete_completed: bool) -> Self {
        self.delete_completed = delete_completed;
        self
    }

    /// The retry policy for job types that neither configure nor declare their own.
    pub fn with_default_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.default_retry_policy = policy;
        self
    }

    /// Overrides the retry policy of a single job type.
    pub fn with_retry_policy_for(mut self, job_type: impl Into<String>, policy: RetryPolicy) -> Self {
        self.retry_policies.insert(job_type.into(), policy);
        self
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    pub fn validate(&self) -> Result<(), StevedoreError> {
        let invalid = |reason: &str| Err(StevedoreError::InvalidConfig(reason.to_owned()));
        if self.max_concurrency == 0 {
            return invalid("max concurrency must be at least one");
        }
        if u32::try_from(self.max_concurrency).is_err() {
            return invalid("max concurrency is too large");
        }
        if matches!(self.claim_mode, ClaimMode::Batch { size: 0 }) {
            return invalid("batch size must be at least one");
        }
        let polling = &self.polling_interval;
        if polling.start.is_zero() {
            return invalid("polling interval must be positive");
        }
        if !(polling.factor >= 1.0 && polling.factor.is_finite()) {
            return invalid("polling interval factor must be at least one");
        }
        if polling.max < polling.start {
            return invalid("maximum polling interval must not be below the initial interval");
        }
        if self.heartbeat_interval.is_zero() || self.reclaim_interval.is_zero() {
            return invalid("heartbeat and reclaim intervals must be positive");
        }
        if self.retry_queue_interval.is_zero() {
            return invalid("retry queue interval must be positive");
        }
        match self.stale_heartbeat_threshold.to_std() {
            Ok(threshold) if threshold > self.heartbeat_interval => {}
            _ => return invalid("stale heartbeat threshold must exceed the heartbeat interval"),
        }
        if self.retry_queue_capacity == 0 {
            return invalid("retry queue capacity must be at least one");
        }
        if self.default_retry_policy.max_attempts() == 0
            || self.retry_policies.values().any(|policy| policy.max_attempts() == 0)
        {
            return invalid("retry policies must allow at least one attempt");
        }
        Ok(())
    }
}
