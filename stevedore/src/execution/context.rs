use tokio_util::sync::CancellationToken;

use crate::job::JobId;

/// Information about the attempt being executed, passed to every middleware and to the handler.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub job_id: JobId,
    pub job_type: String,
    /// The attempt being executed, starting at one.
    pub attempt: u16,
    /// Whether a failure of this attempt exhausts the job's retry policy.
    pub is_last_attempt: bool,
    pub is_recurrent: bool,
    pub(crate) cancellation: CancellationToken,
}

impl ExecutionContext {
    /// Whether the worker has started shutting down.
    ///
    /// Long running handlers should check this and stop early, returning an error so the job is
    /// retried by another worker.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Completes when the worker starts shutting down.
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await
    }
}

#[cfg(test)]
impl ExecutionContext {
    pub(crate) fn mock(job_type: &str) -> Self {
        Self {
            job_id: JobId::new(),
            job_type: job_type.to_owned(),
            attempt: 1,
            is_last_attempt: false,
            is_recurrent: false,
            cancellation: CancellationToken::new(),
        }
    }
}
