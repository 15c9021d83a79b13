//! Recording the outcome of an execution in the backend.
//!
//! A write that fails is never lost: it is pushed onto the [`RetryQueue`] and replayed in order by
//! [`PostProcessingService::do_retries_from_queue`]. Since every write is guarded by the job's
//! owner, replaying a write that already took effect, or whose job has since been reclaimed by
//! another worker, is harmless.
use std::{str::FromStr, sync::Arc};

use chrono::{DateTime, Utc};
use cron::Schedule;
use tokio::sync::Mutex;
use tracing::instrument;

use crate::{
    backend::{Backend, BackendError, ClaimedJob},
    completion::CompletionService,
    retry::RetryPolicy,
};

mod retry_queue;

use retry_queue::{PendingWrite, RetryQueue};

pub(crate) struct PostProcessingService {
    backend: Arc<dyn Backend>,
    completion: Arc<dyn CompletionService>,
    retry_queue: RetryQueue,
    replaying: Mutex<()>,
}

impl PostProcessingService {
    pub(crate) fn new(
        backend: Arc<dyn Backend>,
        completion: Arc<dyn CompletionService>,
        retry_queue_capacity: usize,
    ) -> Self {
        Self {
            backend,
            completion,
            retry_queue: RetryQueue::new(retry_queue_capacity),
            replaying: Mutex::new(()),
        }
    }

    pub(crate) async fn handle_completed(&self, job: &ClaimedJob) {
        tracing::debug!(job_id = %job.id, "Job completed");
        self.apply(PendingWrite::Complete(job.finished())).await;
    }

    pub(crate) async fn handle_failed(&self, job: &ClaimedJob, policy: &RetryPolicy, error: String) {
        let write = match policy.next_interval(job.attempt) {
            Some(interval) => {
                let scheduled_at = Utc::now()
                    .checked_add_signed(interval)
                    .unwrap_or(DateTime::<Utc>::MAX_UTC);
                tracing::warn!(
                    job_id = %job.id,
                    attempt = job.attempt,
                    %scheduled_at,
                    %error,
                    "Job failed, retrying"
                );
                PendingWrite::Retry {
                    job: job.processing(),
                    scheduled_at,
                    error,
                }
            }
            None => {
                tracing::error!(
                    job_id = %job.id,
                    attempt = job.attempt,
                    %error,
                    "Job failed, attempts exhausted"
                );
                PendingWrite::Fail {
                    job: job.processing(),
                    error,
                }
            }
        };
        self.apply(write).await;
    }

    /// Returns a recurrent job to the schedule at its next occurrence, whatever the outcome of
    /// this execution. A job whose cron expression no longer has a next occurrence is failed.
    pub(crate) async fn reschedule_recurrent(&self, job: &ClaimedJob, error: Option<String>) {
        let cron = job.cron.as_deref().unwrap_or_default();
        let write = match next_occurrence(cron, Utc::now()) {
            Ok(scheduled_at) => {
                if let Some(error) = &error {
                    tracing::warn!(job_id = %job.id, %error, "Recurrent job failed");
                }
                PendingWrite::Recurrent {
                    job: job.processing(),
                    scheduled_at,
                    error,
                }
            }
            Err(reason) => {
                tracing::error!(job_id = %job.id, cron, %reason, "Cannot reschedule recurrent job");
                PendingWrite::Fail {
                    job: job.processing(),
                    error: match error {
                        Some(error) => format!("{error}; {reason}"),
                        None => reason,
                    },
                }
            }
        };
        self.apply(write).await;
    }

    /// Replays the queued writes oldest first, stopping at the first one that fails again.
    ///
    /// Returns the number of writes replayed.
    #[instrument(skip(self))]
    pub(crate) async fn do_retries_from_queue(&self) -> usize {
        let Ok(_replaying) = self.replaying.try_lock() else {
            return 0;
        };
        let mut replayed = 0;
        while let Some(write) = self.retry_queue.peek() {
            match self.write(&write).await {
                Ok(()) => {
                    self.retry_queue.pop();
                    replayed += 1;
                }
                Err(error) => {
                    tracing::warn!(
                        ?error,
                        job_id = %write.job().id,
                        pending = self.retry_queue.len(),
                        "Replaying write failed"
                    );
                    break;
                }
            }
        }
        if replayed > 0 {
            tracing::info!(replayed, "Replayed queued writes");
        }
        replayed
    }

    pub(crate) fn pending_writes(&self) -> usize {
        self.retry_queue.len()
    }

    async fn apply(&self, write: PendingWrite) {
        if let Err(error) = self.write(&write).await {
            tracing::warn!(
                ?error,
                job_id = %write.job().id,
                "Failed to record job outcome, queueing for retry"
            );
            self.retry_queue.push(write).await;
        }
    }

    async fn write(&self, write: &PendingWrite) -> Result<(), BackendError> {
        match write {
            PendingWrite::Complete(finished) => self.completion.complete_job(*finished).await,
            PendingWrite::Retry {
                job,
                scheduled_at,
                error,
            } => {
                self.backend
                    .retry_job(*job, *scheduled_at, error.clone())
                    .await
            }
            PendingWrite::Recurrent {
                job,
                scheduled_at,
                error,
            } => {
                self.backend
                    .reschedule_recurrent(*job, *scheduled_at, error.clone())
                    .await
            }
            PendingWrite::Fail { job, error } => self.backend.fail_job(*job, error.clone()).await,
        }
    }
}

/// The first occurrence of the cron expression strictly after `now`.
pub(crate) fn next_occurrence(cron: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>, String> {
    Schedule::from_str(cron)
        .map_err(|error| format!("invalid cron expression {cron:?}: {error}"))?
        .after(&now)
        .next()
        .ok_or_else(|| format!("cron expression {cron:?} has no future occurrence"))
}
