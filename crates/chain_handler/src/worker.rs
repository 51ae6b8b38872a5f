//! Bounded pool running asynchronous message handlers

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

/// Runs at most `size` tasks at a time. Tasks carry no ordering guarantee
/// relative to each other.
pub struct WorkerPool {
    size: u32,
    permits: Arc<Semaphore>,
    closed: AtomicBool,
}

impl WorkerPool {
    /// Create a pool running up to `size` tasks concurrently
    pub fn new(size: u32) -> Self {
        let size = size.max(1);
        Self {
            size,
            permits: Arc::new(Semaphore::new(size as usize)),
            closed: AtomicBool::new(false),
        }
    }

    /// Schedule `task`, waiting while every worker is busy. Tasks sent after
    /// [`WorkerPool::shutdown`] are dropped.
    pub async fn send<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.closed.load(Ordering::Acquire) {
            warn!("dropping task sent to a shut down worker pool");
            return;
        }

        let permit = match self.permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                warn!("dropping task sent to a shut down worker pool");
                return;
            }
        };

        tokio::spawn(async move {
            task.await;
            drop(permit);
        });
    }

    /// Stop accepting tasks and wait for every running task to finish.
    /// Idempotent.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        // Every permit returns once its task completed (or panicked)
        match self.permits.acquire_many(self.size).await {
            Ok(all) => all.forget(),
            Err(_) => debug!("worker pool semaphore already closed"),
        }
        self.permits.close();
    }
}
