//! The worker lifecycle: claiming jobs, dispatching them to execution slots, sending heartbeats,
//! reclaiming jobs of dead workers, and replaying failed writes.
//!
//! Execution slots are the permits of a semaphore sized to the worker's maximum concurrency. A
//! slot is acquired before every claim and moved into the task executing the claimed job, so it
//! is released on every exit path of that task, and the number of jobs running never exceeds the
//! configured maximum.
use std::{sync::Arc, time::Duration};

use chrono::Utc;
use tokio::{
    sync::{OwnedSemaphorePermit, Semaphore},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::{
    backend::{Backend, ClaimedJob},
    completion::{BatchingCompletion, CompletionService, SimpleCompletion},
    config::{ClaimMode, CompletionMode, WorkerConfig},
    execution::{pipeline::Pipeline, ExecutionService},
    job::WorkerId,
    post_processing::PostProcessingService,
    registry::JobsRegistry,
    StevedoreError,
};

mod polling;

use polling::PollingBackoff;

/// A configured worker, ready to be started with [`Worker::start`].
pub struct Worker {
    pub(crate) id: WorkerId,
    pub(crate) backend: Arc<dyn Backend>,
    pub(crate) config: WorkerConfig,
    pub(crate) registry: Arc<JobsRegistry>,
    pub(crate) pipeline: Arc<Pipeline>,
}

impl Worker {
    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Registers the worker with the backend and starts its background loops.
    ///
    /// Fails without starting anything when the initial heartbeat cannot be recorded.
    pub async fn start(self) -> Result<WorkerHandle, StevedoreError> {
        let Self {
            id,
            backend,
            config,
            registry,
            pipeline,
        } = self;
        backend.heartbeat(id, Utc::now()).await?;
        tracing::info!(
            worker_id = %id,
            job_types = ?registry.job_types().collect::<Vec<_>>(),
            max_concurrency = config.max_concurrency,
            "Starting worker {id}"
        );

        let shutdown = CancellationToken::new();
        let mut completion_task = None;
        let completion: Arc<dyn CompletionService> = match config.completion_mode {
            CompletionMode::Simple => Arc::new(SimpleCompletion::new(
                backend.clone(),
                config.delete_completed,
            )),
            CompletionMode::Batching => {
                let (completion, handle) = BatchingCompletion::spawn(
                    backend.clone(),
                    config.delete_completed,
                    config.max_concurrency,
                );
                completion_task = Some(handle);
                Arc::new(completion)
            }
        };
        let post_processing = Arc::new(PostProcessingService::new(
            backend.clone(),
            completion,
            config.retry_queue_capacity,
        ));
        let execution = Arc::new(ExecutionService::new(
            registry,
            pipeline,
            post_processing.clone(),
            shutdown.child_token(),
        ));
        let slots = Arc::new(Semaphore::new(config.max_concurrency));
        let scheduler = Arc::new(Scheduler {
            id,
            backend,
            config,
            execution,
            post_processing: post_processing.clone(),
            slots: slots.clone(),
            shutdown: shutdown.clone(),
        });

        let span = tracing::info_span!("worker", worker_id = %id);
        let loops = vec![
            tokio::spawn(scheduler.clone().claim_loop().instrument(span.clone())),
            tokio::spawn(scheduler.clone().heartbeat_loop().instrument(span.clone())),
            tokio::spawn(scheduler.clone().reclaim_loop().instrument(span.clone())),
            tokio::spawn(scheduler.clone().retry_queue_loop().instrument(span)),
        ];

        Ok(WorkerHandle {
            id,
            shutdown,
            slots,
            max_concurrency: scheduler.config.max_concurrency,
            retry_queue_interval: scheduler.config.retry_queue_interval,
            post_processing,
            loops,
            completion_task,
        })
    }
}

/// A handle to a running worker.
#[must_use = "dropping the handle does not stop the worker, call graceful_shutdown"]
pub struct WorkerHandle {
    id: WorkerId,
    shutdown: CancellationToken,
    slots: Arc<Semaphore>,
    max_concurrency: usize,
    retry_queue_interval: Duration,
    post_processing: Arc<PostProcessingService>,
    loops: Vec<JoinHandle<()>>,
    completion_task: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Jobs currently executing on this worker.
    pub fn running_jobs(&self) -> usize {
        self.max_concurrency - self.slots.available_permits()
    }

    /// Writes waiting to be replayed against the backend.
    pub fn pending_writes(&self) -> usize {
        self.post_processing.pending_writes()
    }

    /// Stops claiming new jobs and waits for the running ones to finish.
    ///
    /// Running handlers observe the shutdown through
    /// [`ExecutionContext::cancelled`](crate::execution::context::ExecutionContext::cancelled).
    /// Queued writes keep being replayed while running jobs finish. Writes still queued once
    /// every job has finished are attempted one last time.
    pub async fn graceful_shutdown(self) -> Result<(), StevedoreError> {
        tracing::debug!(worker_id = %self.id, "Shutting down worker {}", self.id);
        self.shutdown.cancel();
        for handle in self.loops {
            handle
                .await
                .map_err(|_| StevedoreError::GracefulShutdownFailed)?;
        }
        let permits =
            u32::try_from(self.max_concurrency).map_err(|_| StevedoreError::GracefulShutdownFailed)?;
        let all_slots = self.slots.acquire_many(permits);
        tokio::pin!(all_slots);
        let _all_slots = loop {
            tokio::select! {
                slots = &mut all_slots => {
                    break slots.map_err(|_| StevedoreError::GracefulShutdownFailed)?;
                }
                _ = tokio::time::sleep(self.retry_queue_interval) => {
                    if self.post_processing.pending_writes() > 0 {
                        self.post_processing.do_retries_from_queue().await;
                    }
                }
            }
        };
        self.post_processing.do_retries_from_queue().await;
        let pending = self.post_processing.pending_writes();
        if pending > 0 {
            tracing::error!(pending, "Worker stopped with writes still pending");
        }
        drop(self.post_processing);
        if let Some(handle) = self.completion_task {
            handle
                .await
                .map_err(|_| StevedoreError::GracefulShutdownFailed)?;
        }
        tracing::info!(worker_id = %self.id, "Worker {} stopped", self.id);
        Ok(())
    }
}

struct Scheduler {
    id: WorkerId,
    backend: Arc<dyn Backend>,
    config: WorkerConfig,
    execution: Arc<ExecutionService>,
    post_processing: Arc<PostProcessingService>,
    slots: Arc<Semaphore>,
    shutdown: CancellationToken,
}

impl Scheduler {
    async fn claim_loop(self: Arc<Self>) {
        let mut polling = PollingBackoff::new(self.config.polling_interval);
        loop {
            let slot = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                slot = self.slots.clone().acquire_owned() => match slot {
                    Ok(slot) => slot,
                    Err(_) => break,
                },
            };
            let limit = match self.config.claim_mode {
                ClaimMode::Single => 1,
                ClaimMode::Batch { size } => (self.slots.available_permits() + 1).min(size),
            };
            match self.backend.claim(self.id, limit, Utc::now()).await {
                Ok(jobs) if jobs.is_empty() => {
                    drop(slot);
                    if self.sleep(polling.next_delay()).await {
                        break;
                    }
                }
                Ok(jobs) => {
                    polling.reset();
                    tracing::debug!(count = jobs.len(), "Claimed jobs");
                    self.dispatch(jobs, slot).await;
                }
                Err(error) => {
                    drop(slot);
                    tracing::error!(?error, "Failed to claim jobs");
                    if self.sleep(self.config.store_error_interval).await {
                        break;
                    }
                }
            }
        }
        tracing::debug!("Claim loop stopped");
    }

    /// Starts every claimed job, waiting for a free slot for all but the first. Claimed jobs are
    /// always started, even once shutdown has begun, since they are owned by this worker.
    async fn dispatch(&self, jobs: Vec<ClaimedJob>, slot: OwnedSemaphorePermit) {
        let mut slot = Some(slot);
        for job in jobs {
            let slot = match slot.take() {
                Some(slot) => slot,
                None => match self.slots.clone().acquire_owned().await {
                    Ok(slot) => slot,
                    Err(_) => return,
                },
            };
            let execution = self.execution.clone();
            tokio::spawn(
                async move {
                    execution.execute(job).await;
                    drop(execution);
                    drop(slot);
                }
                .in_current_span(),
            );
        }
    }

    async fn heartbeat_loop(self: Arc<Self>) {
        while !self.sleep(self.config.heartbeat_interval).await {
            if let Err(error) = self.backend.heartbeat(self.id, Utc::now()).await {
                tracing::warn!(?error, "Failed to send heartbeat");
            }
        }
        tracing::debug!("Heartbeat loop stopped");
    }

    async fn reclaim_loop(self: Arc<Self>) {
        while !self.sleep(self.config.reclaim_interval).await {
            let stale_before = Utc::now() - self.config.stale_heartbeat_threshold;
            let reclaimed = match self.backend.reclaim_stuck(stale_before).await {
                Ok(reclaimed) => reclaimed,
                Err(error) => {
                    tracing::warn!(?error, "Failed to reclaim stuck jobs");
                    continue;
                }
            };
            for job in reclaimed {
                if job.restarted {
                    tracing::warn!(
                        job_id = %job.id,
                        job_type = %job.job_type,
                        "Restarted job {} of a dead worker",
                        job.id
                    );
                } else {
                    tracing::error!(
                        job_id = %job.id,
                        job_type = %job.job_type,
                        "Job {} of a dead worker cannot be restarted and needs attention",
                        job.id
                    );
                }
            }
        }
        tracing::debug!("Reclaim loop stopped");
    }

    async fn retry_queue_loop(self: Arc<Self>) {
        while !self.sleep(self.config.retry_queue_interval).await {
            if self.post_processing.pending_writes() > 0 {
                self.post_processing.do_retries_from_queue().await;
            }
        }
        tracing::debug!("Retry queue loop stopped");
    }

    /// Sleeps for `duration`, returning `true` when interrupted by shutdown.
    async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.shutdown.cancelled() => true,
            _ = tokio::time::sleep(duration) => false,
        }
    }
}
