//! The durable job model.
//!
//! A [`Job`] is the stored view of a unit of work. Jobs move through the states of
//! [`JobStatus`] and may point at the job that should be unlocked once they finish via a
//! [`SuccessorLink`].
use std::fmt::Display;

use chrono::{DateTime, Utc};
use uuid::Uuid;

pub mod builder;

/// The unique identifier of a job.
#[derive(Debug, Eq, PartialEq, Clone, Copy, Hash, PartialOrd, Ord)]
pub struct JobId(Uuid);

impl JobId {
    /// Generates a new random job id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for JobId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl From<JobId> for Uuid {
    fn from(value: JobId) -> Self {
        value.0
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "JobId({})", self.0)
    }
}

/// Identifies a group of jobs that run one after the other in scheduled order.
#[derive(Debug, Eq, PartialEq, Clone, Copy, Hash)]
pub struct SequenceId(Uuid);

impl SequenceId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SequenceId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for SequenceId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl From<SequenceId> for Uuid {
    fn from(value: SequenceId) -> Self {
        value.0
    }
}

impl Display for SequenceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SequenceId({})", self.0)
    }
}

/// The identity of a worker process, stamped as the owner of the jobs it claims.
#[derive(Debug, Eq, PartialEq, Clone, Copy, Hash)]
pub struct WorkerId(Uuid);

impl WorkerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for WorkerId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for WorkerId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl From<WorkerId> for Uuid {
    fn from(value: WorkerId) -> Self {
        value.0
    }
}

impl Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "WorkerId({})", self.0)
    }
}

/// The lifecycle state of a job.
///
/// ```text
/// WaitingPrev ──(predecessor finished)──> Scheduled ──(claim)──> Processing
///                                             ^                      │
///                                             └──(retry/recurrent)───┤
///                                                                    ├──> Completed (or deleted)
///                                                                    └──> Failed
/// ```
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum JobStatus {
    Scheduled,
    WaitingPrev,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    /// Whether a job in this status has not yet been picked up by any worker.
    pub fn is_not_started(&self) -> bool {
        matches!(self, Self::Scheduled | Self::WaitingPrev)
    }
}

/// What to unlock once a job finishes.
///
/// Either a single job waiting directly on this one, or a sequence group from which the
/// earliest waiting member is promoted.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Default)]
pub enum SuccessorLink {
    #[default]
    None,
    Next(JobId),
    Sequence(SequenceId),
}

impl SuccessorLink {
    pub fn is_sequence(&self) -> bool {
        matches!(self, Self::Sequence(_))
    }
}

/// The stored view of a job.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub id: JobId,
    pub job_type: String,
    pub parameter: String,
    pub cron: Option<String>,
    pub status: JobStatus,
    pub attempt: u16,
    pub created_at: DateTime<Utc>,
    pub scheduled_at: DateTime<Utc>,
    pub last_started_at: Option<DateTime<Utc>>,
    pub last_finished_at: Option<DateTime<Utc>>,
    pub owner: Option<WorkerId>,
    pub successor: SuccessorLink,
    pub restart_on_crash: bool,
    pub last_error: Option<String>,
}

impl Job {
    /// A recurrent job carries a cron expression and never reaches a terminal state.
    pub fn is_recurrent(&self) -> bool {
        self.cron.is_some()
    }
}
