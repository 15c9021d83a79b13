use async_trait::async_trait;
use chrono::{DateTime, Utc};
use stevedore::{
    backend::{
        Backend, BackendError, ClaimedJob, FinishedJob, NewJob, ProcessingJob, ReclaimedJob,
    },
    job::{Job, JobId, WorkerId},
};
use tracing::instrument;

use crate::{map_err, map_insert_err, StevedorePgBackend};

#[async_trait]
impl Backend for StevedorePgBackend {
    #[instrument(skip_all, fields(job_id = %job.id, job_type = %job.job_type))]
    async fn insert(&self, job: NewJob) -> Result<JobId, BackendError> {
        Self::insert_job(&self.pool, &job)
            .await
            .map_err(|error| map_insert_err(error, job.id))?;
        Ok(job.id)
    }

    #[instrument(skip_all, fields(count = jobs.len()))]
    async fn insert_many(&self, jobs: Vec<NewJob>) -> Result<Vec<JobId>, BackendError> {
        self.insert_jobs(&jobs).await?;
        Ok(jobs.iter().map(|job| job.id).collect())
    }

    #[instrument(skip_all, fields(job_type = %job.job_type))]
    async fn upsert_recurrent(&self, job: NewJob) -> Result<JobId, BackendError> {
        self.upsert_recurrent_job(&job)
            .await
            .map(JobId::from)
            .map_err(|error| map_insert_err(error, job.id))
    }

    #[instrument(skip(self))]
    async fn cancel_jobs(&self, ids: &[JobId]) -> Result<u64, BackendError> {
        self.delete_not_started(ids).await.map_err(map_err)
    }

    #[instrument(skip(self))]
    async fn delete_recurrent(&self, job_type: &str) -> Result<u64, BackendError> {
        self.delete_recurrent_jobs(job_type).await.map_err(map_err)
    }

    async fn get_job(&self, id: JobId) -> Result<Option<Job>, BackendError> {
        self.load_job(id)
            .await
            .map_err(map_err)?
            .map(TryFrom::try_from)
            .transpose()
    }

    #[instrument(skip(self))]
    async fn claim(
        &self,
        owner: WorkerId,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<ClaimedJob>, BackendError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.claim_jobs(owner, limit, now).await
    }

    #[instrument(skip_all, fields(count = jobs.len(), delete))]
    async fn complete_jobs(&self, jobs: &[FinishedJob], delete: bool) -> Result<(), BackendError> {
        if jobs.is_empty() {
            return Ok(());
        }
        self.finish_jobs(jobs, delete).await.map_err(map_err)
    }

    #[instrument(skip(self, error))]
    async fn retry_job(
        &self,
        job: ProcessingJob,
        scheduled_at: DateTime<Utc>,
        error: String,
    ) -> Result<(), BackendError> {
        let result = self._retry_job(job, scheduled_at, error).await;
        Self::handle_guarded_update(result, job)
    }

    #[instrument(skip(self, error))]
    async fn reschedule_recurrent(
        &self,
        job: ProcessingJob,
        scheduled_at: DateTime<Utc>,
        error: Option<String>,
    ) -> Result<(), BackendError> {
        let result = self._reschedule_recurrent(job, scheduled_at, error).await;
        Self::handle_guarded_update(result, job)
    }

    #[instrument(skip(self, error))]
    async fn fail_job(&self, job: ProcessingJob, error: String) -> Result<(), BackendError> {
        let result = self._fail_job(job, error).await;
        Self::handle_guarded_update(result, job)
    }

    async fn heartbeat(&self, worker: WorkerId, now: DateTime<Utc>) -> Result<(), BackendError> {
        self.record_heartbeat(worker, now).await.map_err(map_err)
    }

    #[instrument(skip(self))]
    async fn reclaim_stuck(
        &self,
        stale_before: DateTime<Utc>,
    ) -> Result<Vec<ReclaimedJob>, BackendError> {
        self.reclaim_from_dead_workers(stale_before)
            .await
            .map_err(map_err)
    }
}
