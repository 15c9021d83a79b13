//! Provides an in memory implementation of [`Backend`].
//!
//! Currently this is provided for testing purposes and not designed for use in a production system.
//!
//! It is not optimized instead is designed to be a correct implementation for use in a test setup.
//! All state lives behind a single lock, so every operation is trivially atomic.
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::job::{Job, JobId, JobStatus, SuccessorLink, WorkerId};

use super::{Backend, BackendError, ClaimedJob, FinishedJob, NewJob, ProcessingJob, ReclaimedJob};

/// An in memory implementation of [`Backend`].
///
/// It is provided as a correct (but not optimized) implementation primarily for use in testing
/// circumstances. Clones share the same underlying state, so a clone can be handed to several
/// workers to simulate a fleet.
///
/// **This is not designed for use in a production systems.**
#[derive(Clone, Default)]
pub struct InMemoryBackend {
    state: Arc<Mutex<State>>,
}

#[derive(Default)]
struct State {
    jobs: HashMap<JobId, Job>,
    workers: HashMap<WorkerId, DateTime<Utc>>,
}

impl InMemoryBackend {
    /// Creates a new instance of [`InMemoryBackend`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of every stored job.
    pub fn jobs(&self) -> Result<Vec<Job>, BackendError> {
        Ok(self.lock()?.jobs.values().cloned().collect())
    }

    /// Returns the ids of the workers currently registered.
    pub fn workers(&self) -> Result<Vec<WorkerId>, BackendError> {
        Ok(self.lock()?.workers.keys().copied().collect())
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, BackendError> {
        self.state.lock().map_err(|_| BackendError::BadState)
    }
}

impl State {
    fn owned_mut(&mut self, job: ProcessingJob) -> Option<&mut Job> {
        self.jobs.get_mut(&job.id).filter(|stored| {
            stored.status == JobStatus::Processing && stored.owner == Some(job.owner)
        })
    }

    fn unlock(&mut self, successor: SuccessorLink) {
        match successor {
            SuccessorLink::None => {}
            SuccessorLink::Next(id) => {
                if let Some(next) = self
                    .jobs
                    .get_mut(&id)
                    .filter(|next| next.status == JobStatus::WaitingPrev)
                {
                    next.status = JobStatus::Scheduled;
                }
            }
            SuccessorLink::Sequence(sequence) => {
                if let Some(next) = self
                    .jobs
                    .values_mut()
                    .filter(|job| {
                        job.status == JobStatus::WaitingPrev
                            && job.successor == SuccessorLink::Sequence(sequence)
                    })
                    .min_by(|a, b| {
                        a.scheduled_at
                            .cmp(&b.scheduled_at)
                            .then(a.created_at.cmp(&b.created_at))
                    })
                {
                    next.status = JobStatus::Scheduled;
                }
            }
        }
    }

    fn insert(&mut self, job: NewJob, now: DateTime<Utc>) -> Result<JobId, BackendError> {
        if self.jobs.contains_key(&job.id) {
            return Err(BackendError::DuplicateJob(job.id));
        }
        let id = job.id;
        self.jobs.insert(id, job.into_job(now));
        Ok(id)
    }
}

impl Job {
    fn mark_processing(&mut self, owner: WorkerId, now: DateTime<Utc>) {
        self.status = JobStatus::Processing;
        self.owner = Some(owner);
        self.last_started_at = Some(now);
        self.attempt += 1;
    }

    fn mark_scheduled(&mut self, scheduled_at: DateTime<Utc>) {
        self.status = JobStatus::Scheduled;
        self.owner = None;
        self.scheduled_at = scheduled_at;
        self.last_finished_at = Some(Utc::now());
    }

    fn claimed(&self, owner: WorkerId) -> ClaimedJob {
        ClaimedJob {
            id: self.id,
            owner,
            job_type: self.job_type.clone(),
            parameter: self.parameter.clone(),
            cron: self.cron.clone(),
            attempt: self.attempt,
            scheduled_at: self.scheduled_at,
            successor: self.successor,
        }
    }
}

#[async_trait]
impl Backend for InMemoryBackend {
    async fn insert(&self, job: NewJob) -> Result<JobId, BackendError> {
        self.lock()?.insert(job, Utc::now())
    }

    async fn insert_many(&self, jobs: Vec<NewJob>) -> Result<Vec<JobId>, BackendError> {
        let mut state = self.lock()?;
        if let Some(existing) = jobs.iter().find(|job| state.jobs.contains_key(&job.id)) {
            return Err(BackendError::DuplicateJob(existing.id));
        }
        let now = Utc::now();
        jobs.into_iter().map(|job| state.insert(job, now)).collect()
    }

    async fn upsert_recurrent(&self, job: NewJob) -> Result<JobId, BackendError> {
        let mut state = self.lock()?;
        match state
            .jobs
            .values_mut()
            .find(|stored| stored.job_type == job.job_type && stored.is_recurrent())
        {
            Some(stored) => {
                stored.cron = job.cron;
                stored.parameter = job.parameter;
                if stored.status != JobStatus::Processing {
                    stored.scheduled_at = job.scheduled_at;
                }
                Ok(stored.id)
            }
            None => state.insert(job, Utc::now()),
        }
    }

    async fn cancel_jobs(&self, ids: &[JobId]) -> Result<u64, BackendError> {
        let mut state = self.lock()?;
        let before = state.jobs.len();
        state
            .jobs
            .retain(|id, job| !(ids.contains(id) && job.status.is_not_started()));
        Ok((before - state.jobs.len()) as u64)
    }

    async fn delete_recurrent(&self, job_type: &str) -> Result<u64, BackendError> {
        let mut state = self.lock()?;
        let before = state.jobs.len();
        state.jobs.retain(|_, job| {
            !(job.job_type == job_type
                && job.is_recurrent()
                && job.status != JobStatus::Processing)
        });
        Ok((before - state.jobs.len()) as u64)
    }

    async fn get_job(&self, id: JobId) -> Result<Option<Job>, BackendError> {
        Ok(self.lock()?.jobs.get(&id).cloned())
    }

    async fn claim(
        &self,
        owner: WorkerId,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<ClaimedJob>, BackendError> {
        let mut state = self.lock()?;
        let mut ready = state
            .jobs
            .values_mut()
            .filter(|job| job.status == JobStatus::Scheduled && job.scheduled_at <= now)
            .collect::<Vec<_>>();
        ready.sort_by(|a, b| {
            a.scheduled_at
                .cmp(&b.scheduled_at)
                .then(a.created_at.cmp(&b.created_at))
        });
        Ok(ready
            .into_iter()
            .take(limit)
            .map(|job| {
                job.mark_processing(owner, now);
                job.claimed(owner)
            })
            .collect())
    }

    async fn complete_jobs(&self, jobs: &[FinishedJob], delete: bool) -> Result<(), BackendError> {
        let mut state = self.lock()?;
        for finished in jobs {
            let Some(job) = state.owned_mut(finished.job) else {
                continue;
            };
            let successor = job.successor;
            if delete {
                state.jobs.remove(&finished.job.id);
            } else {
                job.status = JobStatus::Completed;
                job.owner = None;
                job.last_finished_at = Some(Utc::now());
            }
            state.unlock(successor);
        }
        Ok(())
    }

    async fn retry_job(
        &self,
        job: ProcessingJob,
        scheduled_at: DateTime<Utc>,
        error: String,
    ) -> Result<(), BackendError> {
        if let Some(job) = self.lock()?.owned_mut(job) {
            job.mark_scheduled(scheduled_at);
            job.last_error = Some(error);
        }
        Ok(())
    }

    async fn reschedule_recurrent(
        &self,
        job: ProcessingJob,
        scheduled_at: DateTime<Utc>,
        error: Option<String>,
    ) -> Result<(), BackendError> {
        if let Some(job) = self.lock()?.owned_mut(job) {
            job.mark_scheduled(scheduled_at);
            job.attempt = 0;
            job.last_error = error;
        }
        Ok(())
    }

    async fn fail_job(&self, job: ProcessingJob, error: String) -> Result<(), BackendError> {
        if let Some(job) = self.lock()?.owned_mut(job) {
            job.status = JobStatus::Failed;
            job.owner = None;
            job.last_finished_at = Some(Utc::now());
            job.last_error = Some(error);
        }
        Ok(())
    }

    async fn heartbeat(&self, worker: WorkerId, now: DateTime<Utc>) -> Result<(), BackendError> {
        self.lock()?.workers.insert(worker, now);
        Ok(())
    }

    async fn reclaim_stuck(
        &self,
        stale_before: DateTime<Utc>,
    ) -> Result<Vec<ReclaimedJob>, BackendError> {
        let mut state = self.lock()?;
        let mut dead = Vec::new();
        state.workers.retain(|worker, heartbeat| {
            let stale = *heartbeat < stale_before;
            if stale {
                dead.push(*worker);
            }
            !stale
        });
        Ok(state
            .jobs
            .values_mut()
            .filter(|job| {
                job.status == JobStatus::Processing
                    && job.owner.is_some_and(|owner| dead.contains(&owner))
            })
            .map(|job| {
                if job.restart_on_crash {
                    job.status = JobStatus::Scheduled;
                    job.owner = None;
                    job.attempt = job.attempt.saturating_sub(1);
                }
                ReclaimedJob {
                    id: job.id,
                    job_type: job.job_type.clone(),
                    restarted: job.restart_on_crash,
                }
            })
            .collect())
    }
}
