//! Concurrency bound on in-flight backend requests

use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

/// Counting gate in front of the backend
///
/// A request holds its permit until the observation has been reported,
/// which for streams means until the response body is finished or dropped.
#[derive(Debug, Clone)]
pub struct AdmissionController {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

impl AdmissionController {
    pub fn new(capacity: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Wait for a permit, giving up when `cancel` fires first
    ///
    /// Returns `None` if the request was cancelled (client gone, shutdown)
    /// while it was queued.
    pub async fn admit(&self, cancel: &CancellationToken) -> Option<OwnedSemaphorePermit> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            permit = self.semaphore.clone().acquire_owned() => permit.ok(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Permits currently free
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Requests currently holding a permit
    pub fn in_flight(&self) -> usize {
        self.capacity.saturating_sub(self.available())
    }
}
