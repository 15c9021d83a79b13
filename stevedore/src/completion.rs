//! Writing successful executions back to the backend.
//!
//! [`SimpleCompletion`] issues one backend call per job. [`BatchingCompletion`] gathers the jobs
//! finishing at around the same time and completes them with at most two backend calls per
//! flush: one for the jobs that do not belong to a sequence group and one for those that do.
use std::sync::Arc;

use async_trait::async_trait;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::instrument;

use crate::backend::{Backend, BackendError, FinishedJob};

#[async_trait]
pub(crate) trait CompletionService: Send + Sync {
    async fn complete_job(&self, job: FinishedJob) -> Result<(), BackendError>;
}

pub(crate) struct SimpleCompletion {
    backend: Arc<dyn Backend>,
    delete_completed: bool,
}

impl SimpleCompletion {
    pub(crate) fn new(backend: Arc<dyn Backend>, delete_completed: bool) -> Self {
        Self {
            backend,
            delete_completed,
        }
    }
}

#[async_trait]
impl CompletionService for SimpleCompletion {
    async fn complete_job(&self, job: FinishedJob) -> Result<(), BackendError> {
        self.backend
            .complete_jobs(&[job], self.delete_completed)
            .await
    }
}

struct CompletionRequest {
    job: FinishedJob,
    reply: oneshot::Sender<Result<(), Arc<BackendError>>>,
}

pub(crate) struct BatchingCompletion {
    sender: mpsc::Sender<CompletionRequest>,
}

impl BatchingCompletion {
    /// Spawns the flushing task. It stops once every handle to the service has been dropped.
    pub(crate) fn spawn(
        backend: Arc<dyn Backend>,
        delete_completed: bool,
        max_batch: usize,
    ) -> (Self, JoinHandle<()>) {
        let max_batch = max_batch.max(1);
        let (sender, receiver) = mpsc::channel(max_batch);
        let handle = tokio::spawn(run_batches(backend, receiver, delete_completed, max_batch));
        (Self { sender }, handle)
    }
}

#[async_trait]
impl CompletionService for BatchingCompletion {
    async fn complete_job(&self, job: FinishedJob) -> Result<(), BackendError> {
        let (reply, response) = oneshot::channel();
        self.sender
            .send(CompletionRequest { job, reply })
            .await
            .map_err(|_| BackendError::CompletionUnavailable)?;
        response
            .await
            .map_err(|_| BackendError::CompletionUnavailable)?
            .map_err(BackendError::BatchFailed)
    }
}

async fn run_batches(
    backend: Arc<dyn Backend>,
    mut receiver: mpsc::Receiver<CompletionRequest>,
    delete_completed: bool,
    max_batch: usize,
) {
    while let Some(first) = receiver.recv().await {
        let mut batch = vec![first];
        while batch.len() < max_batch {
            match receiver.try_recv() {
                Ok(request) => batch.push(request),
                Err(_) => break,
            }
        }
        flush(backend.as_ref(), batch, delete_completed).await;
    }
    tracing::debug!("Batching completion stopped");
}

#[instrument(skip_all, fields(size = batch.len()))]
async fn flush(backend: &dyn Backend, batch: Vec<CompletionRequest>, delete_completed: bool) {
    let (grouped, single): (Vec<_>, Vec<_>) = batch
        .into_iter()
        .partition(|request| request.job.successor.is_sequence());
    let mut outcome = Ok(());
    for requests in [&single, &grouped] {
        if requests.is_empty() {
            continue;
        }
        let jobs = requests.iter().map(|request| request.job).collect::<Vec<_>>();
        if let Err(error) = backend.complete_jobs(&jobs, delete_completed).await {
            tracing::error!(?error, jobs = jobs.len(), "Failed to complete batch");
            if outcome.is_ok() {
                outcome = Err(Arc::new(error));
            }
        }
    }
    for request in single.into_iter().chain(grouped) {
        let _ = request.reply.send(outcome.clone());
    }
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;
    use futures::future::join_all;

    use super::*;
    use crate::{
        backend::{MockBackend, ProcessingJob},
        job::{JobId, SequenceId, SuccessorLink, WorkerId},
    };

    fn finished(successor: SuccessorLink) -> FinishedJob {
        FinishedJob {
            job: ProcessingJob {
                id: JobId::new(),
                owner: WorkerId::new(),
            },
            successor,
        }
    }

    #[tokio::test]
    async fn simple_completion_completes_each_job() {
        let job = finished(SuccessorLink::None);
        let mut backend = MockBackend::new();
        backend
            .expect_complete_jobs()
            .withf(move |jobs, delete| jobs.len() == 1 && jobs[0] == job && *delete)
            .times(1)
            .returning(|_, _| Ok(()));
        let completion = SimpleCompletion::new(Arc::new(backend), true);

        assert_matches!(completion.complete_job(job).await, Ok(()));
    }

    #[tokio::test]
    async fn batching_completion_splits_sequence_groups() {
        let sequence = SequenceId::new();
        let jobs = vec![
            finished(SuccessorLink::None),
            finished(SuccessorLink::Sequence(sequence)),
            finished(SuccessorLink::Next(JobId::new())),
            finished(SuccessorLink::Sequence(sequence)),
        ];
        let mut backend = MockBackend::new();
        backend
            .expect_complete_jobs()
            .withf(|jobs, delete| {
                jobs.len() == 2 && jobs.iter().all(|job| !job.successor.is_sequence()) && !*delete
            })
            .times(1)
            .returning(|_, _| Ok(()));
        backend
            .expect_complete_jobs()
            .withf(|jobs, _| {
                jobs.len() == 2 && jobs.iter().all(|job| job.successor.is_sequence())
            })
            .times(1)
            .returning(|_, _| Ok(()));
        let (completion, _handle) = BatchingCompletion::spawn(Arc::new(backend), false, 10);

        let results = join_all(jobs.into_iter().map(|job| completion.complete_job(job))).await;

        assert!(results.iter().all(Result::is_ok));
    }

    #[tokio::test]
    async fn batching_completion_shares_failures() {
        let mut backend = MockBackend::new();
        backend
            .expect_complete_jobs()
            .withf(|jobs, _| jobs.len() == 3)
            .times(1)
            .returning(|_, _| Err(BackendError::BadState));
        let (completion, _handle) = BatchingCompletion::spawn(Arc::new(backend), false, 10);

        let results = join_all(
            (0..3).map(|_| completion.complete_job(finished(SuccessorLink::None))),
        )
        .await;

        for result in results {
            assert_matches!(result, Err(BackendError::BatchFailed(error)) => {
                assert_matches!(*error, BackendError::BadState);
            });
        }
    }

    #[tokio::test]
    async fn batching_completion_respects_max_batch() {
        let mut backend = MockBackend::new();
        backend
            .expect_complete_jobs()
            .withf(|jobs, _| jobs.len() <= 2)
            .times(2)
            .returning(|_, _| Ok(()));
        let (completion, _handle) = BatchingCompletion::spawn(Arc::new(backend), false, 2);

        let results = join_all(
            (0..4).map(|_| completion.complete_job(finished(SuccessorLink::None))),
        )
        .await;

        assert!(results.iter().all(Result::is_ok));
    }

    #[tokio::test]
    async fn batching_completion_unavailable_after_stop() {
        let backend = MockBackend::new();
        let (completion, handle) = BatchingCompletion::spawn(Arc::new(backend), false, 2);
        handle.abort();
        let _ = handle.await;

        assert_matches!(
            completion.complete_job(finished(SuccessorLink::None)).await,
            Err(BackendError::CompletionUnavailable)
        );
    }
}
