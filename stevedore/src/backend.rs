//! The durable queue contract.
//!
//! Every worker in a fleet coordinates solely through an implementation of [`Backend`]. An
//! implementation must provide the following guarantees:
//!
//! - [`Backend::claim`] is atomic and never hands the same job to two claimers: competing
//!   claimers skip rows locked by one another rather than waiting for them.
//! - Every write that moves a job out of [`JobStatus::Processing`] is guarded by the job id, the
//!   processing status, and the owning worker. A write that matches nothing because the caller
//!   lost ownership is a silent no-op, which makes every such write safe to replay.
//! - Completing (or deleting) a job unlocks its successor in the same atomic unit: a
//!   [`SuccessorLink::Next`] target moves from [`JobStatus::WaitingPrev`] to
//!   [`JobStatus::Scheduled`], and a [`SuccessorLink::Sequence`] target promotes exactly one
//!   waiting member of the group, the one with the earliest `scheduled_at`.
//! - [`Backend::reclaim_stuck`] removes workers with a stale heartbeat and restarts the
//!   processing jobs they owned when those jobs are eligible for restart.
//!
//! [`memory::InMemoryBackend`] is a correct reference implementation and the
//! [`crate::test_suite`] macro can be used to check other implementations against it.
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::job::{Job, JobId, JobStatus, SequenceId, SuccessorLink, WorkerId};

pub mod memory;
#[doc(hidden)]
pub mod testing;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Backend: Send + Sync {
    /// Inserts a single job.
    async fn insert(&self, job: NewJob) -> Result<JobId, BackendError>;
    /// Inserts all of the given jobs in a single atomic unit.
    async fn insert_many(&self, jobs: Vec<NewJob>) -> Result<Vec<JobId>, BackendError>;
    /// Inserts a recurrent job, or replaces the cron expression and parameter of the existing
    /// recurrent job with the same job type.
    async fn upsert_recurrent(&self, job: NewJob) -> Result<JobId, BackendError>;
    /// Deletes the given jobs when they have not yet started, returning how many were deleted.
    async fn cancel_jobs(&self, ids: &[JobId]) -> Result<u64, BackendError>;
    /// Deletes the recurrent jobs of the given job type when they are not running.
    async fn delete_recurrent(&self, job_type: &str) -> Result<u64, BackendError>;
    async fn get_job(&self, id: JobId) -> Result<Option<Job>, BackendError>;

    /// Claims up to `limit` scheduled jobs due at `now`, oldest `scheduled_at` first, marking
    /// them as processing for `owner` and incrementing their attempt count.
    async fn claim(
        &self,
        owner: WorkerId,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<ClaimedJob>, BackendError>;
    /// Completes, or deletes when `delete` is set, the given jobs and unlocks their successors.
    async fn complete_jobs(&self, jobs: &[FinishedJob], delete: bool) -> Result<(), BackendError>;
    /// Returns the job to the schedule at `scheduled_at`, recording the error. The attempt count
    /// is kept so it keeps counting towards the retry budget.
    async fn retry_job(
        &self,
        job: ProcessingJob,
        scheduled_at: DateTime<Utc>,
        error: String,
    ) -> Result<(), BackendError>;
    /// Reschedules a recurrent job to its next occurrence, resetting its attempt count.
    async fn reschedule_recurrent(
        &self,
        job: ProcessingJob,
        scheduled_at: DateTime<Utc>,
        error: Option<String>,
    ) -> Result<(), BackendError>;
    /// Marks the job as terminally failed.
    async fn fail_job(&self, job: ProcessingJob, error: String) -> Result<(), BackendError>;

    /// Records that `worker` is alive as of `now`.
    async fn heartbeat(&self, worker: WorkerId, now: DateTime<Utc>) -> Result<(), BackendError>;
    /// Deletes every worker whose last heartbeat is older than `stale_before` and reports the
    /// processing jobs they owned. Jobs eligible for restart are returned to the schedule with
    /// their attempt count decremented, the others are left processing.
    async fn reclaim_stuck(
        &self,
        stale_before: DateTime<Utc>,
    ) -> Result<Vec<ReclaimedJob>, BackendError>;
}

/// A job ready to be inserted into the backend.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub id: JobId,
    pub job_type: String,
    pub parameter: String,
    pub cron: Option<String>,
    pub scheduled_at: DateTime<Utc>,
    /// Inserts the job as [`JobStatus::WaitingPrev`] rather than [`JobStatus::Scheduled`].
    pub waits_for_predecessor: bool,
    pub successor: SuccessorLink,
    pub restart_on_crash: bool,
}

impl NewJob {
    pub fn new(job_type: impl Into<String>, parameter: impl Into<String>) -> Self {
        Self {
            id: JobId::new(),
            job_type: job_type.into(),
            parameter: parameter.into(),
            cron: None,
            scheduled_at: Utc::now(),
            waits_for_predecessor: false,
            successor: SuccessorLink::None,
            restart_on_crash: true,
        }
    }

    pub fn initial_status(&self) -> JobStatus {
        if self.waits_for_predecessor {
            JobStatus::WaitingPrev
        } else {
            JobStatus::Scheduled
        }
    }

    pub(crate) fn into_job(self, created_at: DateTime<Utc>) -> Job {
        Job {
            id: self.id,
            status: self.initial_status(),
            job_type: self.job_type,
            parameter: self.parameter,
            cron: self.cron,
            attempt: 0,
            created_at,
            scheduled_at: self.scheduled_at,
            last_started_at: None,
            last_finished_at: None,
            owner: None,
            successor: self.successor,
            restart_on_crash: self.restart_on_crash,
            last_error: None,
        }
    }
}

/// The snapshot of a job returned by [`Backend::claim`].
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimedJob {
    pub id: JobId,
    pub owner: WorkerId,
    pub job_type: String,
    pub parameter: String,
    pub cron: Option<String>,
    /// The attempt count including the attempt this claim starts.
    pub attempt: u16,
    pub scheduled_at: DateTime<Utc>,
    pub successor: SuccessorLink,
}

impl ClaimedJob {
    pub fn is_recurrent(&self) -> bool {
        self.cron.is_some()
    }

    pub fn processing(&self) -> ProcessingJob {
        ProcessingJob {
            id: self.id,
            owner: self.owner,
        }
    }

    pub fn finished(&self) -> FinishedJob {
        FinishedJob {
            job: self.processing(),
            successor: self.successor,
        }
    }
}

/// The `(job, owner)` pair scoping every write that moves a job out of processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessingJob {
    pub id: JobId,
    pub owner: WorkerId,
}

/// A processing job that finished successfully, along with what it should unlock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FinishedJob {
    pub job: ProcessingJob,
    pub successor: SuccessorLink,
}

impl FinishedJob {
    pub fn sequence(&self) -> Option<SequenceId> {
        match self.successor {
            SuccessorLink::Sequence(sequence) => Some(sequence),
            _ => None,
        }
    }
}

/// A job found owned by a worker that stopped sending heartbeats.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReclaimedJob {
    pub id: JobId,
    pub job_type: String,
    /// Whether the job was returned to the schedule, or left processing for an operator.
    pub restarted: bool,
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Error encoding or decoding data")]
    EncodeDecode(#[from] serde_json::Error),
    #[error("Job {0} already exists")]
    DuplicateJob(JobId),
    #[error("System in bad state")]
    BadState,
    #[error("Storage error: {0}")]
    Storage(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Batched completion failed: {0}")]
    BatchFailed(#[source] Arc<BackendError>),
    #[error("The completion service is no longer running")]
    CompletionUnavailable,
}
