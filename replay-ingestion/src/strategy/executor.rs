use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

/// Runs at most `workers` tasks at a time. Extra tasks are spawned right away
/// but wait for a permit before doing any work.
#[derive(Clone)]
pub struct BoundedExecutor {
    permits: Arc<Semaphore>,
    workers: usize,
}

impl BoundedExecutor {
    pub fn new(workers: usize) -> Self {
        let workers = workers.max(1);
        Self {
            permits: Arc::new(Semaphore::new(workers)),
            workers,
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Tasks currently holding a permit.
    pub fn busy(&self) -> usize {
        self.workers - self.permits.available_permits()
    }

    pub fn spawn<F>(&self, task: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let permits = self.permits.clone();
        tokio::spawn(async move {
            // The semaphore is never closed, so a permit always arrives
            let _permit = permits.acquire_owned().await.ok();
            task.await
        })
    }
}
