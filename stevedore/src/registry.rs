//! The mapping from a stored job type to the handler able to execute it.
use std::{marker::PhantomData, sync::Arc};

use futures::future::BoxFuture;
use fxhash::FxHashMap;
use thiserror::Error;

use crate::{
    execution::{context::ExecutionContext, pipeline::Endpoint},
    handler::{ExecutionResult, Handler},
    retry::RetryPolicy,
    StevedoreError,
};

/// Why a claimed job could not be turned into a handler invocation.
#[derive(Debug, Error)]
pub enum ResolutionError {
    #[error("No handler registered for job type {0}")]
    NotRegistered(String),
    #[error("The handler factory for {0} did not produce a handler")]
    MissingHandler(&'static str),
    #[error("Failed to decode the parameter for {job_type}: {source}")]
    Parameter {
        job_type: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

trait JobInvoker: Send + Sync {
    fn resolve(&self, parameter: &str) -> Result<Box<dyn Endpoint>, ResolutionError>;
}

struct TypedInvoker<H, F> {
    factory: F,
    _handler: PhantomData<fn() -> H>,
}

impl<H, F> JobInvoker for TypedInvoker<H, F>
where
    H: Handler,
    F: Fn() -> Option<H> + Send + Sync,
{
    fn resolve(&self, parameter: &str) -> Result<Box<dyn Endpoint>, ResolutionError> {
        let param = serde_json::from_str::<H::Param>(parameter).map_err(|source| {
            ResolutionError::Parameter {
                job_type: H::NAME,
                source,
            }
        })?;
        let handler = (self.factory)().ok_or(ResolutionError::MissingHandler(H::NAME))?;
        Ok(Box::new(Invocation { handler, param }))
    }
}

struct Invocation<H: Handler> {
    handler: H,
    param: H::Param,
}

impl<H: Handler> Endpoint for Invocation<H> {
    fn call<'a>(self: Box<Self>, context: &'a ExecutionContext) -> BoxFuture<'a, ExecutionResult> {
        Box::pin(async move {
            let Invocation { handler, param } = *self;
            handler.handle(param, context).await
        })
    }
}

struct Registration {
    invoker: Arc<dyn JobInvoker>,
    retry_policy: Option<RetryPolicy>,
}

#[derive(Default)]
pub(crate) struct JobsRegistryBuilder {
    registrations: Vec<(&'static str, Registration)>,
}

impl JobsRegistryBuilder {
    pub(crate) fn register<H, F>(&mut self, factory: F)
    where
        H: Handler,
        F: Fn() -> Option<H> + Send + Sync + 'static,
    {
        self.registrations.push((
            H::NAME,
            Registration {
                invoker: Arc::new(TypedInvoker {
                    factory,
                    _handler: PhantomData,
                }),
                retry_policy: H::retry_policy(),
            },
        ));
    }

    /// Resolves the retry policy of every job type: a configured override wins over the
    /// handler's own policy, which wins over the default.
    pub(crate) fn build(
        self,
        default_policy: &RetryPolicy,
        overrides: &FxHashMap<String, RetryPolicy>,
    ) -> Result<JobsRegistry, StevedoreError> {
        if let Some(job_type) = overrides
            .keys()
            .find(|job_type| !self.registrations.iter().any(|(name, _)| name == job_type))
        {
            return Err(StevedoreError::UnknownJobType(job_type.clone()));
        }
        let mut entries = FxHashMap::default();
        for (name, registration) in self.registrations {
            let retry_policy = overrides
                .get(name)
                .cloned()
                .or(registration.retry_policy)
                .unwrap_or_else(|| default_policy.clone());
            let entry = RegisteredJob {
                invoker: registration.invoker,
                retry_policy,
            };
            if entries.insert(name, entry).is_some() {
                return Err(StevedoreError::DuplicateJobType(name));
            }
        }
        Ok(JobsRegistry {
            entries,
            default_policy: default_policy.clone(),
        })
    }
}

struct RegisteredJob {
    invoker: Arc<dyn JobInvoker>,
    retry_policy: RetryPolicy,
}

pub(crate) struct JobsRegistry {
    entries: FxHashMap<&'static str, RegisteredJob>,
    default_policy: RetryPolicy,
}

impl JobsRegistry {
    pub(crate) fn builder() -> JobsRegistryBuilder {
        Default::default()
    }

    /// The retry policy of the job type, or the default for job types this worker cannot run.
    pub(crate) fn retry_policy(&self, job_type: &str) -> &RetryPolicy {
        self.entries
            .get(job_type)
            .map_or(&self.default_policy, |entry| &entry.retry_policy)
    }

    pub(crate) fn resolve(
        &self,
        job_type: &str,
        parameter: &str,
    ) -> Result<Box<dyn Endpoint>, ResolutionError> {
        self.entries
            .get(job_type)
            .ok_or_else(|| ResolutionError::NotRegistered(job_type.to_owned()))?
            .invoker
            .resolve(parameter)
    }

    pub(crate) fn job_types(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.entries.keys().copied()
    }
}
