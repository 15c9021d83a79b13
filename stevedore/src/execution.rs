use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{instrument, Instrument};

use crate::{
    backend::ClaimedJob,
    handler::{ExecutionResult, Failure},
    post_processing::PostProcessingService,
    registry::JobsRegistry,
};

pub mod context;
pub mod pipeline;

use context::ExecutionContext;
use pipeline::Pipeline;

/// Runs claimed jobs through the pipeline and hands their outcome to post-processing.
pub(crate) struct ExecutionService {
    registry: Arc<JobsRegistry>,
    pipeline: Arc<Pipeline>,
    post_processing: Arc<PostProcessingService>,
    cancellation: CancellationToken,
}

impl ExecutionService {
    pub(crate) fn new(
        registry: Arc<JobsRegistry>,
        pipeline: Arc<Pipeline>,
        post_processing: Arc<PostProcessingService>,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            registry,
            pipeline,
            post_processing,
            cancellation,
        }
    }

    /// Executes the job and records its outcome. Never fails: errors of the handler become a
    /// retry or a failure of the job, and errors of the backend are queued for replay.
    #[instrument(skip_all, fields(job_id = %job.id, job_type = %job.job_type, attempt = job.attempt))]
    pub(crate) async fn execute(&self, job: ClaimedJob) {
        let result = self.run(&job).await;
        match (result, job.is_recurrent()) {
            (Ok(()), false) => self.post_processing.handle_completed(&job).await,
            (Ok(()), true) => self.post_processing.reschedule_recurrent(&job, None).await,
            (Err(failure), false) => {
                let policy = self.registry.retry_policy(&job.job_type);
                self.post_processing
                    .handle_failed(&job, policy, failure.to_string())
                    .await
            }
            (Err(failure), true) => {
                self.post_processing
                    .reschedule_recurrent(&job, Some(failure.to_string()))
                    .await
            }
        }
    }

    async fn run(&self, job: &ClaimedJob) -> Result<(), Failure> {
        let endpoint = self
            .registry
            .resolve(&job.job_type, &job.parameter)
            .inspect_err(|error| {
                tracing::error!(%error, "Cannot resolve job {}", job.id);
            })?;
        let context = ExecutionContext {
            job_id: job.id,
            job_type: job.job_type.clone(),
            attempt: job.attempt,
            is_last_attempt: self
                .registry
                .retry_policy(&job.job_type)
                .is_last_attempt(job.attempt),
            is_recurrent: job.is_recurrent(),
            cancellation: self.cancellation.child_token(),
        };
        let pipeline = self.pipeline.clone();
        let result = tokio::spawn(
            async move { pipeline.execute(&context, endpoint).await }.in_current_span(),
        )
        .await;
        match result {
            Ok(ExecutionResult::Done) => Ok(()),
            Ok(ExecutionResult::Error { error }) => Err(error.into()),
            Err(error) => {
                tracing::error!(%error, "Job {} panicked", job.id);
                Err(error.into())
            }
        }
    }
}

#[cfg(test)]
mod test {
    use chrono::{TimeDelta, Utc};
    use mockall::predicate::{always, eq};

    use super::*;
    use crate::{
        backend::{Backend, BackendError, MockBackend},
        completion::SimpleCompletion,
        handler::{
            test::{MockError, MockExecutionResult, MockReturnHandler},
            Handler,
        },
        job::{JobId, SuccessorLink, WorkerId},
        retry::RetryPolicy,
    };

    fn claimed(parameter: MockExecutionResult, attempt: u16, cron: Option<&str>) -> ClaimedJob {
        ClaimedJob {
            id: JobId::new(),
            owner: WorkerId::new(),
            job_type: MockReturnHandler::NAME.to_owned(),
            parameter: serde_json::to_string(&parameter).unwrap(),
            cron: cron.map(ToOwned::to_owned),
            attempt,
            scheduled_at: Utc::now(),
            successor: SuccessorLink::None,
        }
    }

    fn service(backend: MockBackend) -> ExecutionService {
        let backend: Arc<dyn Backend> = Arc::new(backend);
        let mut registry = JobsRegistry::builder();
        registry.register(|| Some(MockReturnHandler));
        let registry = registry
            .build(&RetryPolicy::default(), &Default::default())
            .unwrap();
        ExecutionService::new(
            Arc::new(registry),
            Arc::new(Pipeline::default()),
            Arc::new(PostProcessingService::new(
                backend.clone(),
                Arc::new(SimpleCompletion::new(backend, false)),
                10,
            )),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn successful_job_is_completed() {
        let job = claimed(MockExecutionResult::Done, 1, None);
        let finished = job.finished();
        let mut backend = MockBackend::new();
        backend
            .expect_complete_jobs()
            .withf(move |jobs, _| jobs.len() == 1 && jobs[0] == finished)
            .times(1)
            .returning(|_, _| Ok(()));

        service(backend).execute(job).await;
    }

    #[tokio::test]
    async fn failing_job_is_retried_with_error_text() {
        let job = claimed(
            MockExecutionResult::Error {
                error: MockError("went wrong".to_owned()),
            },
            1,
            None,
        );
        let processing = job.processing();
        let before = Utc::now();
        let mut backend = MockBackend::new();
        backend
            .expect_retry_job()
            .withf(move |job, scheduled_at, error| {
                *job == processing
                    && *scheduled_at >= before + TimeDelta::seconds(5)
                    && *scheduled_at < before + TimeDelta::seconds(10)
                    && error == "custom: went wrong"
            })
            .times(1)
            .returning(|_, _, _| Ok(()));

        service(backend).execute(job).await;
    }

    #[tokio::test]
    async fn panicking_job_on_last_attempt_is_failed() {
        let job = claimed(MockExecutionResult::Panic, 2, None);
        let mut backend = MockBackend::new();
        backend
            .expect_fail_job()
            .with(eq(job.processing()), eq("panic: job paniced".to_owned()))
            .times(1)
            .returning(|_, _| Ok(()));

        service(backend).execute(job).await;
    }

    #[tokio::test]
    async fn unknown_job_type_is_a_failure() {
        let mut job = claimed(MockExecutionResult::Done, 1, None);
        job.job_type = "unknown".to_owned();
        let mut backend = MockBackend::new();
        backend
            .expect_retry_job()
            .withf(|_, _, error| error.starts_with("resolution: No handler registered"))
            .times(1)
            .returning(|_, _, _| Ok(()));

        service(backend).execute(job).await;
    }

    #[tokio::test]
    async fn undecodable_parameter_is_a_failure() {
        let mut job = claimed(MockExecutionResult::Done, 2, None);
        job.parameter = "{\"not\": \"valid\"}".to_owned();
        let mut backend = MockBackend::new();
        backend
            .expect_fail_job()
            .withf(|_, error| error.starts_with("resolution: Failed to decode"))
            .times(1)
            .returning(|_, _| Ok(()));

        service(backend).execute(job).await;
    }

    #[tokio::test]
    async fn recurrent_job_is_rescheduled_after_success_and_failure() {
        let mut backend = MockBackend::new();
        backend
            .expect_reschedule_recurrent()
            .with(always(), always(), eq(None))
            .times(1)
            .returning(|_, _, _| Ok(()));
        backend
            .expect_reschedule_recurrent()
            .with(always(), always(), eq(Some("panic: job paniced".to_owned())))
            .times(1)
            .returning(|_, _, _| Ok(()));
        let service = service(backend);

        service
            .execute(claimed(MockExecutionResult::Done, 1, Some("0 * * * * *")))
            .await;
        service
            .execute(claimed(MockExecutionResult::Panic, 5, Some("0 * * * * *")))
            .await;
    }

    #[tokio::test]
    async fn backend_failure_is_queued() {
        let job = claimed(MockExecutionResult::Done, 1, None);
        let mut backend = MockBackend::new();
        backend
            .expect_complete_jobs()
            .times(1)
            .returning(|_, _| Err(BackendError::BadState));
        let service = service(backend);

        service.execute(job).await;

        assert_eq!(service.post_processing.pending_writes(), 1);
    }
}
