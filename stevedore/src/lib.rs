//! A durable background job processing engine.
//!
//! Jobs are persisted through a [`Backend`], claimed by any number of workers sharing that
//! backend, executed by the [`Handler`](handler::Handler) registered for their job type, and
//! retried according to a [`RetryPolicy`](retry::RetryPolicy) when they fail.
//!
//! ```no_run
//! # use stevedore::prelude::*;
//! # use stevedore::backend::memory::InMemoryBackend;
//! # use async_trait::async_trait;
//! #[derive(Clone)]
//! struct SendEmail;
//!
//! #[async_trait]
//! impl Handler for SendEmail {
//!     type Param = String;
//!     const NAME: &'static str = "send_email";
//!
//!     async fn handle(&self, address: String, _context: &ExecutionContext) -> ExecutionResult {
//!         println!("Sending email to {address}");
//!         ExecutionResult::Done
//!     }
//! }
//!
//! # async fn run() -> Result<(), StevedoreError> {
//! let backend = InMemoryBackend::new();
//! let worker = Stevedore::builder()
//!     .with_backend(backend.clone())
//!     .with_handler(SendEmail)
//!     .build()?
//!     .start()
//!     .await?;
//!
//! SendEmail::builder()
//!     .with_param("someone@example.com".to_owned())
//!     .enqueue(&backend)
//!     .await?;
//!
//! worker.graceful_shutdown().await?;
//! # Ok(())
//! # }
//! ```
use std::sync::Arc;

use backend::{Backend, BackendError};
use config::WorkerConfig;
use execution::pipeline::{ExecutionObserver, Middleware, ObservabilityMiddleware, Pipeline};
use handler::Handler;
use job::WorkerId;
use scheduler::Worker;
use thiserror::Error;

pub mod backend;
mod completion;
pub mod config;
pub mod execution;
pub mod handler;
pub mod job;
mod post_processing;
pub mod prelude;
pub mod registry;
pub mod retry;
pub mod scheduler;

/// Assembles a [`Worker`] from a backend, a configuration, handlers, and middleware.
#[derive(Default)]
pub struct Stevedore {
    backend: Option<Arc<dyn Backend>>,
    config: WorkerConfig,
    worker_id: Option<WorkerId>,
    registry: registry::JobsRegistryBuilder,
    outer_middleware: Vec<Arc<dyn Middleware>>,
    middleware: Vec<Arc<dyn Middleware>>,
    observer: Option<Arc<dyn ExecutionObserver>>,
}

impl Stevedore {
    pub fn builder() -> Self {
        Self::default()
    }

    pub fn with_backend(self, backend: impl Backend + 'static) -> Self {
        self.with_shared_backend(Arc::new(backend))
    }

    pub fn with_shared_backend(self, backend: Arc<dyn Backend>) -> Self {
        Self {
            backend: Some(backend),
            ..self
        }
    }

    pub fn with_config(self, config: WorkerConfig) -> Self {
        Self { config, ..self }
    }

    /// Use a fixed identity for the worker instead of a random one.
    pub fn with_worker_id(self, worker_id: WorkerId) -> Self {
        Self {
            worker_id: Some(worker_id),
            ..self
        }
    }

    /// Registers a handler, cloning it for every execution.
    pub fn with_handler<H>(self, handler: H) -> Self
    where
        H: Handler + Clone,
    {
        self.with_handler_factory(move || Some(handler.clone()))
    }

    /// Registers a handler created anew for every execution by `factory`.
    ///
    /// An execution for which the factory returns [`None`] fails and is retried.
    pub fn with_handler_factory<H, F>(mut self, factory: F) -> Self
    where
        H: Handler,
        F: Fn() -> Option<H> + Send + Sync + 'static,
    {
        self.registry.register(factory);
        self
    }

    /// Adds a middleware to the user stack. Middleware run in the order they are added.
    pub fn with_middleware(mut self, middleware: impl Middleware + 'static) -> Self {
        self.middleware.push(Arc::new(middleware));
        self
    }

    /// Adds a middleware running before every user middleware.
    pub fn with_outer_middleware(mut self, middleware: impl Middleware + 'static) -> Self {
        self.outer_middleware.push(Arc::new(middleware));
        self
    }

    /// Reports the outcome and duration of every execution to `observer`.
    pub fn with_observer(self, observer: impl ExecutionObserver + 'static) -> Self {
        Self {
            observer: Some(Arc::new(observer)),
            ..self
        }
    }

    pub fn build(self) -> Result<Worker, StevedoreError> {
        let backend = self.backend.ok_or(StevedoreError::MissingBackend)?;
        self.config.validate()?;
        let registry = self.registry.build(
            &self.config.default_retry_policy,
            &self.config.retry_policies,
        )?;
        let mut outer: Vec<Arc<dyn Middleware>> =
            vec![Arc::new(ObservabilityMiddleware::new(self.observer))];
        outer.extend(self.outer_middleware);
        Ok(Worker {
            id: self.worker_id.unwrap_or_default(),
            backend,
            config: self.config,
            registry: Arc::new(registry),
            pipeline: Arc::new(Pipeline::new(outer, self.middleware)),
        })
    }
}

#[derive(Debug, Error)]
pub enum StevedoreError {
    #[error("Failed to gracefully shut down")]
    GracefulShutdownFailed,
    #[error("Error communicating with the backend")]
    Backend(#[from] BackendError),
    #[error("Error encoding or decoding value")]
    EncodeError(#[from] serde_json::Error),
    #[error("No backend configured")]
    MissingBackend,
    #[error("Job type {0} registered more than once")]
    DuplicateJobType(&'static str),
    #[error("Retry policy configured for unregistered job type {0}")]
    UnknownJobType(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Invalid cron expression {expression:?}")]
    InvalidCron {
        expression: String,
        #[source]
        source: cron::error::Error,
    },
    #[error("Cron expression {0:?} has no upcoming occurrence")]
    CronExhausted(String),
    #[error("Invalid sequence: {0}")]
    InvalidSequence(&'static str),
    #[error("Job type {0} requires a parameter")]
    MissingParam(&'static str),
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Mutex,
        },
        time::Duration,
    };

    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use chrono::{TimeDelta, Utc};

    use super::*;
    use crate::{
        backend::memory::InMemoryBackend,
        config::PollingInterval,
        execution::{
            context::ExecutionContext,
            pipeline::{Next, Outcome},
        },
        handler::{
            test::{MockError, MockExecutionResult, MockReturnHandler, SimpleHandler},
            ExecutionResult,
        },
        job::{builder::Sequence, JobStatus},
        retry::RetryPolicy,
    };

    #[test]
    fn build_requires_a_backend() {
        assert_matches!(
            Stevedore::builder().with_handler(SimpleHandler).build().map(|_| ()),
            Err(StevedoreError::MissingBackend)
        );
    }

    #[test]
    fn build_rejects_duplicate_handlers() {
        assert_matches!(
            Stevedore::builder()
                .with_backend(InMemoryBackend::new())
                .with_handler(SimpleHandler)
                .with_handler(SimpleHandler)
                .build()
                .map(|_| ()),
            Err(StevedoreError::DuplicateJobType("simple_handler"))
        );
    }

    #[test]
    fn build_rejects_invalid_config() {
        assert_matches!(
            Stevedore::builder()
                .with_backend(InMemoryBackend::new())
                .with_config(WorkerConfig::default().with_max_concurrency(0))
                .build()
                .map(|_| ()),
            Err(StevedoreError::InvalidConfig(_))
        );
    }

    #[test]
    fn build_uses_the_given_worker_id() {
        let id = WorkerId::new();

        let worker = Stevedore::builder()
            .with_backend(InMemoryBackend::new())
            .with_worker_id(id)
            .build()
            .unwrap();

        assert_eq!(worker.id(), id);
    }

    fn fast_config() -> WorkerConfig {
        WorkerConfig::default()
            .with_polling_interval(PollingInterval::constant(Duration::from_millis(10)))
            .with_retry_queue_interval(Duration::from_millis(10))
    }

    async fn wait_for_status(backend: &InMemoryBackend, id: job::JobId, status: JobStatus) {
        for _ in 0..500 {
            if backend
                .get_job(id)
                .await
                .unwrap()
                .is_some_and(|job| job.status == status)
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {id} never reached {status:?}");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failing_job_is_retried_then_failed() {
        let backend = InMemoryBackend::new();
        let policy = RetryPolicy::new(2, [TimeDelta::milliseconds(50)]);
        let worker = Stevedore::builder()
            .with_backend(backend.clone())
            .with_config(fast_config().with_retry_policy_for(MockReturnHandler::NAME, policy))
            .with_handler(MockReturnHandler)
            .build()
            .unwrap()
            .start()
            .await
            .unwrap();

        let id = MockReturnHandler::builder()
            .with_param(MockExecutionResult::Error {
                error: MockError("went wrong".to_owned()),
            })
            .enqueue(&backend)
            .await
            .unwrap();

        wait_for_status(&backend, id, JobStatus::Failed).await;
        worker.graceful_shutdown().await.unwrap();

        let job = backend.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.attempt, 2);
        assert_eq!(job.last_error.as_deref(), Some("custom: went wrong"));
        assert!(job.owner.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn chained_jobs_run_in_order() {
        #[derive(Clone, Default)]
        struct Recorder(Arc<Mutex<Vec<u32>>>);

        #[async_trait]
        impl Handler for Recorder {
            type Param = u32;
            const NAME: &'static str = "recorder";
            async fn handle(&self, param: u32, _context: &ExecutionContext) -> ExecutionResult {
                self.0.lock().unwrap().push(param);
                ExecutionResult::Done
            }
        }

        let backend = InMemoryBackend::new();
        let recorder = Recorder::default();
        let ids = Sequence::chain()
            .then(Recorder::builder().with_param(1))
            .then(Recorder::builder().with_param(2))
            .then(Recorder::builder().with_param(3))
            .enqueue(&backend)
            .await
            .unwrap();
        let worker = Stevedore::builder()
            .with_backend(backend.clone())
            .with_config(fast_config().with_max_concurrency(4))
            .with_handler(recorder.clone())
            .build()
            .unwrap()
            .start()
            .await
            .unwrap();

        wait_for_status(&backend, ids[2], JobStatus::Completed).await;
        worker.graceful_shutdown().await.unwrap();

        assert_eq!(*recorder.0.lock().unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn recurrent_job_is_rescheduled_after_running() {
        let backend = InMemoryBackend::new();
        let id = SimpleHandler::builder()
            .with_param("tick".to_owned())
            .recurring("* * * * * *")
            .enqueue(&backend)
            .await
            .unwrap();
        let worker = Stevedore::builder()
            .with_backend(backend.clone())
            .with_config(fast_config())
            .with_handler(SimpleHandler)
            .build()
            .unwrap()
            .start()
            .await
            .unwrap();

        let mut ran = false;
        for _ in 0..300 {
            let job = backend.get_job(id).await.unwrap().unwrap();
            if job.last_finished_at.is_some() && job.status == JobStatus::Scheduled {
                assert_eq!(job.attempt, 0);
                assert!(job.scheduled_at > Utc::now() - TimeDelta::seconds(1));
                ran = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        worker.graceful_shutdown().await.unwrap();

        assert!(ran);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failing_recurrent_job_waits_for_its_next_occurrence() {
        const EVERY_TWO_SECONDS: &str = "*/2 * * * * *";
        let backend = InMemoryBackend::new();
        let id = MockReturnHandler::builder()
            .with_param(MockExecutionResult::Error {
                error: MockError("went wrong".to_owned()),
            })
            .recurring(EVERY_TWO_SECONDS)
            .enqueue(&backend)
            .await
            .unwrap();
        let worker = Stevedore::builder()
            .with_backend(backend.clone())
            .with_config(fast_config())
            .with_handler(MockReturnHandler)
            .build()
            .unwrap()
            .start()
            .await
            .unwrap();

        let mut rescheduled = None;
        for _ in 0..500 {
            let job = backend.get_job(id).await.unwrap().unwrap();
            if job.last_finished_at.is_some() && job.status == JobStatus::Scheduled {
                rescheduled = Some(job);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        worker.graceful_shutdown().await.unwrap();

        let job = rescheduled.expect("recurrent job never ran");
        let finished = job.last_finished_at.unwrap();
        assert_eq!(job.attempt, 0);
        assert!(job.owner.is_none());
        assert_eq!(job.last_error.as_deref(), Some("custom: went wrong"));
        assert_eq!(
            Ok(job.scheduled_at),
            crate::post_processing::next_occurrence(EVERY_TWO_SECONDS, finished)
        );
        assert_eq!(job.scheduled_at.timestamp() % 2, 0);
        assert_eq!(job.scheduled_at.timestamp_subsec_nanos(), 0);
        assert!(job.scheduled_at > finished);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn middleware_and_observer_see_every_execution() {
        struct Counting(Arc<AtomicUsize>);

        #[async_trait]
        impl Middleware for Counting {
            async fn handle(&self, context: &ExecutionContext, next: Next<'_>) -> ExecutionResult {
                self.0.fetch_add(1, Ordering::SeqCst);
                next.run(context).await
            }
        }

        struct Observed(Arc<Mutex<Vec<Outcome>>>);

        impl ExecutionObserver for Observed {
            fn observe(&self, _job_type: &str, outcome: Outcome, _duration: Duration) {
                self.0.lock().unwrap().push(outcome);
            }
        }

        let backend = InMemoryBackend::new();
        let counted = Arc::new(AtomicUsize::new(0));
        let outcomes = Arc::new(Mutex::new(Vec::new()));
        let id = SimpleHandler::builder()
            .with_param("data".to_owned())
            .enqueue(&backend)
            .await
            .unwrap();
        let worker = Stevedore::builder()
            .with_backend(backend.clone())
            .with_config(fast_config())
            .with_handler(SimpleHandler)
            .with_middleware(Counting(counted.clone()))
            .with_observer(Observed(outcomes.clone()))
            .build()
            .unwrap()
            .start()
            .await
            .unwrap();

        wait_for_status(&backend, id, JobStatus::Completed).await;
        worker.graceful_shutdown().await.unwrap();

        assert_eq!(counted.load(Ordering::SeqCst), 1);
        assert_eq!(*outcomes.lock().unwrap(), vec![Outcome::Succeeded]);
    }
}
