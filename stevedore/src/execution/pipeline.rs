//! Middleware wrapping the execution of every job.
//!
//! The pipeline runs the outer (system) middleware first, then the user middleware in the order
//! they were registered, and finally the handler itself. Each middleware decides whether and when
//! to continue by calling [`Next::run`].
use std::{panic::AssertUnwindSafe, sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::{future::BoxFuture, FutureExt};
use tokio::time::Instant;

use super::context::ExecutionContext;
use crate::handler::ExecutionResult;

#[async_trait]
pub trait Middleware: Send + Sync {
    async fn handle(&self, context: &ExecutionContext, next: Next<'_>) -> ExecutionResult;
}

/// The innermost step of a pipeline: a resolved handler along with its decoded parameter.
pub(crate) trait Endpoint: Send {
    fn call<'a>(self: Box<Self>, context: &'a ExecutionContext) -> BoxFuture<'a, ExecutionResult>;
}

/// The remainder of the pipeline after the current middleware.
pub struct Next<'a> {
    chain: &'a [Arc<dyn Middleware>],
    endpoint: Box<dyn Endpoint>,
}

impl Next<'_> {
    pub async fn run(self, context: &ExecutionContext) -> ExecutionResult {
        match self.chain.split_first() {
            Some((middleware, chain)) => {
                let next = Next {
                    chain,
                    endpoint: self.endpoint,
                };
                middleware.handle(context, next).await
            }
            None => self.endpoint.call(context).await,
        }
    }
}

#[derive(Default, Clone)]
pub(crate) struct Pipeline {
    chain: Vec<Arc<dyn Middleware>>,
}

impl Pipeline {
    pub(crate) fn new(outer: Vec<Arc<dyn Middleware>>, user: Vec<Arc<dyn Middleware>>) -> Self {
        Self {
            chain: outer.into_iter().chain(user).collect(),
        }
    }

    pub(crate) async fn execute(
        &self,
        context: &ExecutionContext,
        endpoint: Box<dyn Endpoint>,
    ) -> ExecutionResult {
        Next {
            chain: &self.chain,
            endpoint,
        }
        .run(context)
        .await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Succeeded,
    Failed,
}

/// Receives the outcome of every execution, for example to record metrics.
pub trait ExecutionObserver: Send + Sync {
    fn observe(&self, job_type: &str, outcome: Outcome, duration: Duration);
}

/// The outermost middleware: traces every execution and reports it to the configured
/// [`ExecutionObserver`].
#[derive(Default)]
pub(crate) struct ObservabilityMiddleware {
    observer: Option<Arc<dyn ExecutionObserver>>,
}

impl ObservabilityMiddleware {
    pub(crate) fn new(observer: Option<Arc<dyn ExecutionObserver>>) -> Self {
        Self { observer }
    }
}

#[async_trait]
impl Middleware for ObservabilityMiddleware {
    async fn handle(&self, context: &ExecutionContext, next: Next<'_>) -> ExecutionResult {
        let start = Instant::now();
        tracing::debug!(job_id = %context.job_id, attempt = context.attempt, "Executing job");
        let result = AssertUnwindSafe(next.run(context)).catch_unwind().await;
        let duration = start.elapsed();
        let outcome = match &result {
            Ok(ExecutionResult::Done) => Outcome::Succeeded,
            Ok(ExecutionResult::Error { error }) => {
                tracing::debug!(
                    job_id = %context.job_id,
                    error_type = error.error_type(),
                    %error,
                    "Job returned an error"
                );
                Outcome::Failed
            }
            Err(_) => {
                tracing::debug!(job_id = %context.job_id, "Job panicked");
                Outcome::Failed
            }
        };
        if let Some(observer) = &self.observer {
            observer.observe(&context.job_type, outcome, duration);
        }
        // The panic is reported by the task running the pipeline.
        result.unwrap_or_else(|panic| std::panic::resume_unwind(panic))
    }
}

#[cfg(test)]
mod test {
    use std::sync::Mutex;

    use super::*;
    use crate::handler::test::MockError;

    #[derive(Clone, Default)]
    struct Log(Arc<Mutex<Vec<String>>>);

    impl Log {
        fn push(&self, entry: impl Into<String>) {
            self.0.lock().unwrap().push(entry.into());
        }

        fn entries(&self) -> Vec<String> {
            self.0.lock().unwrap().clone()
        }
    }

    struct Recording {
        name: &'static str,
        log: Log,
    }

    #[async_trait]
    impl Middleware for Recording {
        async fn handle(&self, context: &ExecutionContext, next: Next<'_>) -> ExecutionResult {
            self.log.push(format!("enter {}", self.name));
            let result = next.run(context).await;
            self.log.push(format!("exit {}", self.name));
            result
        }
    }

    struct ShortCircuit;

    #[async_trait]
    impl Middleware for ShortCircuit {
        async fn handle(&self, _context: &ExecutionContext, _next: Next<'_>) -> ExecutionResult {
            MockError("rejected".to_owned()).into()
        }
    }

    struct Panicking;

    #[async_trait]
    impl Middleware for Panicking {
        async fn handle(&self, _context: &ExecutionContext, _next: Next<'_>) -> ExecutionResult {
            panic!("middleware exploded")
        }
    }

    struct LoggingEndpoint(Log);

    impl Endpoint for LoggingEndpoint {
        fn call<'a>(
            self: Box<Self>,
            _context: &'a ExecutionContext,
        ) -> BoxFuture<'a, ExecutionResult> {
            Box::pin(async move {
                self.0.push("handler");
                ExecutionResult::Done
            })
        }
    }

    fn recording(name: &'static str, log: &Log) -> Arc<dyn Middleware> {
        Arc::new(Recording {
            name,
            log: log.clone(),
        })
    }

    #[tokio::test]
    async fn outer_middleware_wraps_user_middleware() {
        let log = Log::default();
        let pipeline = Pipeline::new(
            vec![recording("outer", &log)],
            vec![recording("first", &log), recording("second", &log)],
        );

        let result = pipeline
            .execute(
                &ExecutionContext::mock("job"),
                Box::new(LoggingEndpoint(log.clone())),
            )
            .await;

        assert!(matches!(result, ExecutionResult::Done));
        assert_eq!(
            log.entries(),
            vec![
                "enter outer",
                "enter first",
                "enter second",
                "handler",
                "exit second",
                "exit first",
                "exit outer",
            ]
        );
    }

    #[tokio::test]
    async fn middleware_can_skip_the_handler() {
        let log = Log::default();
        let pipeline = Pipeline::new(
            vec![recording("outer", &log)],
            vec![Arc::new(ShortCircuit)],
        );

        let result = pipeline
            .execute(
                &ExecutionContext::mock("job"),
                Box::new(LoggingEndpoint(log.clone())),
            )
            .await;

        assert!(matches!(result, ExecutionResult::Error { .. }));
        assert_eq!(log.entries(), vec!["enter outer", "exit outer"]);
    }

    #[tokio::test]
    async fn empty_pipeline_runs_the_handler() {
        let log = Log::default();

        let result = Pipeline::default()
            .execute(
                &ExecutionContext::mock("job"),
                Box::new(LoggingEndpoint(log.clone())),
            )
            .await;

        assert!(matches!(result, ExecutionResult::Done));
        assert_eq!(log.entries(), vec!["handler"]);
    }

    #[derive(Default)]
    struct CountingObserver(Mutex<Vec<(String, Outcome)>>);

    impl ExecutionObserver for CountingObserver {
        fn observe(&self, job_type: &str, outcome: Outcome, _duration: Duration) {
            self.0.lock().unwrap().push((job_type.to_owned(), outcome));
        }
    }

    #[tokio::test]
    async fn observability_reports_outcomes() {
        let observer = Arc::new(CountingObserver::default());
        let pipeline = Pipeline::new(
            vec![Arc::new(ObservabilityMiddleware::new(Some(observer.clone())))],
            vec![],
        );
        let log = Log::default();

        pipeline
            .execute(
                &ExecutionContext::mock("ok"),
                Box::new(LoggingEndpoint(log.clone())),
            )
            .await;
        let failing = Pipeline::new(
            vec![Arc::new(ObservabilityMiddleware::new(Some(observer.clone())))],
            vec![Arc::new(ShortCircuit)],
        );
        failing
            .execute(
                &ExecutionContext::mock("bad"),
                Box::new(LoggingEndpoint(log.clone())),
            )
            .await;

        assert_eq!(
            *observer.0.lock().unwrap(),
            vec![
                ("ok".to_owned(), Outcome::Succeeded),
                ("bad".to_owned(), Outcome::Failed)
            ]
        );
    }

    #[tokio::test]
    async fn observability_reports_panics_as_failures() {
        let observer = Arc::new(CountingObserver::default());
        let pipeline = Pipeline::new(
            vec![Arc::new(ObservabilityMiddleware::new(Some(observer.clone())))],
            vec![Arc::new(Panicking)],
        );
        let log = Log::default();
        let endpoint = Box::new(LoggingEndpoint(log.clone()));

        let joined = tokio::spawn(async move {
            pipeline
                .execute(&ExecutionContext::mock("explosive"), endpoint)
                .await
        })
        .await;

        let panic = joined.unwrap_err().into_panic();
        assert_eq!(panic.downcast_ref::<&str>(), Some(&"middleware exploded"));
        assert_eq!(
            *observer.0.lock().unwrap(),
            vec![("explosive".to_owned(), Outcome::Failed)]
        );
        assert!(log.entries().is_empty());
    }
}
