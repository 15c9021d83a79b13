use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

use chrono::{DateTime, Utc};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::backend::{FinishedJob, ProcessingJob};

/// A write that moves a job out of processing.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum PendingWrite {
    Complete(FinishedJob),
    Retry {
        job: ProcessingJob,
        scheduled_at: DateTime<Utc>,
        error: String,
    },
    Recurrent {
        job: ProcessingJob,
        scheduled_at: DateTime<Utc>,
        error: Option<String>,
    },
    Fail {
        job: ProcessingJob,
        error: String,
    },
}

impl PendingWrite {
    pub(crate) fn job(&self) -> ProcessingJob {
        match self {
            Self::Complete(finished) => finished.job,
            Self::Retry { job, .. } | Self::Recurrent { job, .. } | Self::Fail { job, .. } => *job,
        }
    }
}

/// A bounded FIFO of writes waiting to be replayed against the backend.
///
/// Every item holds a permit of the capacity semaphore, so pushing onto a full queue waits until
/// the oldest items have been replayed.
pub(crate) struct RetryQueue {
    items: Mutex<VecDeque<(PendingWrite, OwnedSemaphorePermit)>>,
    capacity: Arc<Semaphore>,
}

impl RetryQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::default(),
            capacity: Arc::new(Semaphore::new(capacity)),
        }
    }

    pub(crate) async fn push(&self, write: PendingWrite) {
        let Ok(permit) = self.capacity.clone().acquire_owned().await else {
            tracing::error!(job_id = %write.job().id, "Retry queue closed, dropping write");
            return;
        };
        self.lock().push_back((write, permit));
    }

    /// A copy of the oldest write, which stays queued until [`RetryQueue::pop`] is called.
    pub(crate) fn peek(&self) -> Option<PendingWrite> {
        self.lock().front().map(|(write, _)| write.clone())
    }

    pub(crate) fn pop(&self) {
        self.lock().pop_front();
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<(PendingWrite, OwnedSemaphorePermit)>> {
        // The guarded operations cannot panic, so a poisoned queue is still consistent.
        self.items
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
