use chrono::{DateTime, Utc};
use sqlx::prelude::FromRow;
use stevedore::{
    backend::{BackendError, ClaimedJob, ReclaimedJob},
    job::{JobId, SequenceId, SuccessorLink, WorkerId},
};
use uuid::Uuid;

#[derive(sqlx::Type, Debug, Clone, Copy, PartialEq, Eq)]
#[sqlx(type_name = "stevedore_job_status", rename_all = "snake_case")]
pub(crate) enum JobStatus {
    Scheduled,
    WaitingPrev,
    Processing,
    Completed,
    Failed,
}

impl From<JobStatus> for stevedore::job::JobStatus {
    fn from(value: JobStatus) -> Self {
        match value {
            JobStatus::Scheduled => Self::Scheduled,
            JobStatus::WaitingPrev => Self::WaitingPrev,
            JobStatus::Processing => Self::Processing,
            JobStatus::Completed => Self::Completed,
            JobStatus::Failed => Self::Failed,
        }
    }
}

impl From<stevedore::job::JobStatus> for JobStatus {
    fn from(value: stevedore::job::JobStatus) -> Self {
        match value {
            stevedore::job::JobStatus::Scheduled => Self::Scheduled,
            stevedore::job::JobStatus::WaitingPrev => Self::WaitingPrev,
            stevedore::job::JobStatus::Processing => Self::Processing,
            stevedore::job::JobStatus::Completed => Self::Completed,
            stevedore::job::JobStatus::Failed => Self::Failed,
        }
    }
}

/// The successor link as stored: at most one of the two columns is set.
pub(crate) fn successor_columns(successor: SuccessorLink) -> (Option<Uuid>, Option<Uuid>) {
    match successor {
        SuccessorLink::None => (None, None),
        SuccessorLink::Next(id) => (Some(id.into()), None),
        SuccessorLink::Sequence(sequence) => (None, Some(sequence.into())),
    }
}

fn successor_link(next_job_id: Option<Uuid>, sequence_id: Option<Uuid>) -> SuccessorLink {
    match (next_job_id, sequence_id) {
        (Some(id), _) => SuccessorLink::Next(JobId::from(id)),
        (None, Some(sequence)) => SuccessorLink::Sequence(SequenceId::from(sequence)),
        (None, None) => SuccessorLink::None,
    }
}

fn attempt(value: i32) -> Result<u16, BackendError> {
    u16::try_from(value).map_err(|_| BackendError::BadState)
}

#[derive(Debug, FromRow)]
pub(crate) struct Job {
    pub id: Uuid,
    pub job_type: String,
    pub parameter: String,
    pub cron: Option<String>,
    pub status: JobStatus,
    pub attempt: i32,
    pub created_at: DateTime<Utc>,
    pub scheduled_at: DateTime<Utc>,
    pub last_started_at: Option<DateTime<Utc>>,
    pub last_finished_at: Option<DateTime<Utc>>,
    pub owner_id: Option<Uuid>,
    pub next_job_id: Option<Uuid>,
    pub sequence_id: Option<Uuid>,
    pub restart_on_crash: bool,
    pub last_error: Option<String>,
}

impl Job {
    pub(crate) fn into_claimed(self) -> Result<ClaimedJob, BackendError> {
        Ok(ClaimedJob {
            id: self.id.into(),
            owner: self.owner_id.map(WorkerId::from).ok_or(BackendError::BadState)?,
            job_type: self.job_type,
            parameter: self.parameter,
            cron: self.cron,
            attempt: attempt(self.attempt)?,
            scheduled_at: self.scheduled_at,
            successor: successor_link(self.next_job_id, self.sequence_id),
        })
    }
}

impl TryFrom<Job> for stevedore::job::Job {
    type Error = BackendError;

    fn try_from(value: Job) -> Result<Self, Self::Error> {
        Ok(Self {
            id: value.id.into(),
            job_type: value.job_type,
            parameter: value.parameter,
            cron: value.cron,
            status: value.status.into(),
            attempt: attempt(value.attempt)?,
            created_at: value.created_at,
            scheduled_at: value.scheduled_at,
            last_started_at: value.last_started_at,
            last_finished_at: value.last_finished_at,
            owner: value.owner_id.map(WorkerId::from),
            successor: successor_link(value.next_job_id, value.sequence_id),
            restart_on_crash: value.restart_on_crash,
            last_error: value.last_error,
        })
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct Reclaimed {
    pub id: Uuid,
    pub job_type: String,
}

impl Reclaimed {
    pub(crate) fn into_reclaimed(self, restarted: bool) -> ReclaimedJob {
        ReclaimedJob {
            id: self.id.into(),
            job_type: self.job_type,
            restarted,
        }
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct Unlocked {
    pub next_job_id: Option<Uuid>,
    pub sequence_id: Option<Uuid>,
}

#[cfg(test)]
mod test {
    use super::*;

    fn row() -> Job {
        Job {
            id: Uuid::new_v4(),
            job_type: "job".to_owned(),
            parameter: "null".to_owned(),
            cron: None,
            status: JobStatus::Processing,
            attempt: 2,
            created_at: Utc::now(),
            scheduled_at: Utc::now(),
            last_started_at: Some(Utc::now()),
            last_finished_at: None,
            owner_id: Some(Uuid::new_v4()),
            next_job_id: None,
            sequence_id: None,
            restart_on_crash: true,
            last_error: None,
        }
    }

    #[test]
    fn successor_round_trips_through_columns() {
        let links = [
            SuccessorLink::None,
            SuccessorLink::Next(JobId::new()),
            SuccessorLink::Sequence(SequenceId::new()),
        ];

        for link in links {
            let (next, sequence) = successor_columns(link);
            assert_eq!(successor_link(next, sequence), link);
        }
    }

    #[test]
    fn claimed_job_requires_an_owner() {
        let job = Job {
            owner_id: None,
            ..row()
        };

        assert!(matches!(job.into_claimed(), Err(BackendError::BadState)));
    }

    #[test]
    fn negative_attempt_is_bad_state() {
        let job = Job {
            attempt: -1,
            ..row()
        };

        assert!(matches!(
            stevedore::job::Job::try_from(job),
            Err(BackendError::BadState)
        ));
    }

    #[test]
    fn converts_to_claimed_job() {
        let job = row();
        let (id, owner) = (job.id, job.owner_id);

        let claimed = job.into_claimed().unwrap();

        assert_eq!(Uuid::from(claimed.id), id);
        assert_eq!(Some(Uuid::from(claimed.owner)), owner);
        assert_eq!(claimed.attempt, 2);
        assert_eq!(claimed.successor, SuccessorLink::None);
    }
}
