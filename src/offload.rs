use std::sync::Arc;
use tokio::sync::Semaphore;

use crate::error::{RelayError, Result};

/// Bounded pool for CPU-bound work.
///
/// Jobs run on tokio's blocking threads, never on the workers that drive
/// network I/O. A semaphore caps how many run at once no matter how many
/// requests are in flight; callers past the cap wait asynchronously for a
/// slot.
#[derive(Debug, Clone)]
pub struct OffloadPool {
    slots: Arc<Semaphore>,
    width: usize,
}

impl OffloadPool {
    pub fn new(width: usize) -> Self {
        let width = width.max(1);
        Self {
            slots: Arc::new(Semaphore::new(width)),
            width,
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }

    /// Runs `job` off the caller's task and resolves with its result.
    ///
    /// The job's own error is returned unchanged. A panicking job surfaces as
    /// [`RelayError::Offload`].
    pub async fn run<F, T>(&self, job: F) -> Result<T>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let permit = self
            .slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| RelayError::Offload("pool is shut down".to_string()))?;

        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            job()
        })
        .await
        .map_err(|e| RelayError::Offload(e.to_string()))?
    }
}
