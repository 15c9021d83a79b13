//! Enqueuing jobs.
//!
//! A [`JobBuilder`] enqueues a single job, either to run once at a given time or as a recurrent
//! job following a cron expression. A [`Sequence`] enqueues several jobs atomically so that they
//! run one after the other.
use std::{marker::PhantomData, str::FromStr};

use chrono::{DateTime, TimeDelta, Utc};
use cron::Schedule;

use crate::{
    backend::{Backend, NewJob},
    handler::Handler,
    StevedoreError,
};

use super::{JobId, SequenceId, SuccessorLink};

const NULL_PARAM: &str = "null";

pub struct JobBuilder<H: Handler> {
    id: JobId,
    param: Option<H::Param>,
    scheduled_at: Option<DateTime<Utc>>,
    cron: Option<String>,
    restart_on_crash: bool,
    _handler: PhantomData<fn() -> H>,
}

impl<H: Handler> Default for JobBuilder<H> {
    fn default() -> Self {
        Self {
            id: JobId::new(),
            param: None,
            scheduled_at: None,
            cron: None,
            restart_on_crash: H::RESTART_ON_CRASH,
            _handler: PhantomData,
        }
    }
}

impl<H: Handler> JobBuilder<H> {
    pub fn with_param(self, param: H::Param) -> Self {
        Self {
            param: Some(param),
            ..self
        }
    }

    /// Use a caller chosen id, for example to make enqueuing idempotent.
    pub fn with_id(self, id: JobId) -> Self {
        Self { id, ..self }
    }

    pub fn schedule_at(self, schedule_at: DateTime<Utc>) -> Self {
        Self {
            scheduled_at: Some(schedule_at),
            ..self
        }
    }

    pub fn schedule_in(self, schedule_in: TimeDelta) -> Self {
        Self {
            scheduled_at: Some(Utc::now() + schedule_in),
            ..self
        }
    }

    /// Makes the job recurrent, running at every occurrence of the cron expression.
    ///
    /// The expression includes seconds, for example `"0 */5 * * * *"` runs every five minutes.
    /// There is at most one recurrent job per job type: enqueuing another replaces the expression
    /// and parameter of the existing one.
    pub fn recurring(self, cron: impl Into<String>) -> Self {
        Self {
            cron: Some(cron.into()),
            ..self
        }
    }

    /// Overrides [`Handler::RESTART_ON_CRASH`] for this job.
    pub fn restart_on_crash(self, restart_on_crash: bool) -> Self {
        Self {
            restart_on_crash,
            ..self
        }
    }

    pub fn build(self) -> Result<NewJob, StevedoreError> {
        let now = Utc::now();
        let scheduled_at = match &self.cron {
            Some(cron) => match self.scheduled_at {
                Some(scheduled_at) => {
                    parse_cron(cron)?;
                    scheduled_at
                }
                None => parse_cron(cron)?
                    .after(&now)
                    .next()
                    .ok_or_else(|| StevedoreError::CronExhausted(cron.clone()))?,
            },
            None => self.scheduled_at.unwrap_or(now),
        };
        let parameter = match &self.param {
            Some(param) => serde_json::to_string(param)?,
            // A handler taking `()` or an `Option` can run without a parameter.
            None => serde_json::from_str::<H::Param>(NULL_PARAM)
                .map(|_| NULL_PARAM.to_owned())
                .map_err(|_| StevedoreError::MissingParam(H::NAME))?,
        };
        Ok(NewJob {
            id: self.id,
            job_type: H::NAME.to_owned(),
            parameter,
            cron: self.cron,
            scheduled_at,
            waits_for_predecessor: false,
            successor: SuccessorLink::None,
            restart_on_crash: self.restart_on_crash,
        })
    }

    /// Enqueues the job, returning its id. A recurrent job returns the id of the recurrent job
    /// of this type, which may already have existed.
    pub async fn enqueue<B: Backend + ?Sized>(self, backend: &B) -> Result<JobId, StevedoreError> {
        let job = self.build()?;
        let id = if job.cron.is_some() {
            backend.upsert_recurrent(job).await?
        } else {
            backend.insert(job).await?
        };
        tracing::debug!(job_id = %id, job_type = H::NAME, "Enqueued job {id}");
        Ok(id)
    }
}

fn parse_cron(cron: &str) -> Result<Schedule, StevedoreError> {
    Schedule::from_str(cron).map_err(|source| StevedoreError::InvalidCron {
        expression: cron.to_owned(),
        source,
    })
}

enum SequenceKind {
    Chain,
    Group(SequenceId),
}

/// Jobs enqueued together that run one after the other.
///
/// In a [chain](Sequence::chain) each job unlocks the one added after it. In a
/// [group](Sequence::group) every completion unlocks the waiting member with the earliest
/// schedule, so members run in the order they were added. In both cases only the first job is
/// claimable straight away, and a failed job keeps the rest of the sequence waiting.
pub struct Sequence {
    kind: SequenceKind,
    jobs: Result<Vec<NewJob>, StevedoreError>,
}

impl Sequence {
    pub fn chain() -> Self {
        Self {
            kind: SequenceKind::Chain,
            jobs: Ok(Vec::new()),
        }
    }

    pub fn group() -> Self {
        Self {
            kind: SequenceKind::Group(SequenceId::new()),
            jobs: Ok(Vec::new()),
        }
    }

    pub fn then<H: Handler>(self, job: JobBuilder<H>) -> Self {
        let jobs = self.jobs.and_then(|mut jobs| {
            jobs.push(job.build()?);
            Ok(jobs)
        });
        Self { jobs, ..self }
    }

    pub fn build(self) -> Result<Vec<NewJob>, StevedoreError> {
        let mut jobs = self.jobs?;
        if jobs.iter().any(|job| job.cron.is_some()) {
            return Err(StevedoreError::InvalidSequence(
                "recurrent jobs cannot be part of a sequence",
            ));
        }
        match self.kind {
            SequenceKind::Chain => {
                let next_ids = jobs.iter().skip(1).map(|job| job.id).collect::<Vec<_>>();
                for (job, next) in jobs.iter_mut().zip(next_ids) {
                    job.successor = SuccessorLink::Next(next);
                }
            }
            SequenceKind::Group(sequence) => {
                let mut previous: Option<DateTime<Utc>> = None;
                for job in &mut jobs {
                    job.successor = SuccessorLink::Sequence(sequence);
                    if let Some(previous) = previous {
                        job.scheduled_at =
                            job.scheduled_at.max(previous + TimeDelta::milliseconds(1));
                    }
                    previous = Some(job.scheduled_at);
                }
            }
        }
        for job in jobs.iter_mut().skip(1) {
            job.waits_for_predecessor = true;
        }
        Ok(jobs)
    }

    /// Enqueues every job of the sequence atomically, returning their ids in order.
    pub async fn enqueue<B: Backend + ?Sized>(
        self,
        backend: &B,
    ) -> Result<Vec<JobId>, StevedoreError> {
        let jobs = self.build()?;
        if jobs.is_empty() {
            return Ok(Vec::new());
        }
        Ok(backend.insert_many(jobs).await?)
    }
}
