use crate::task::{spawn_blocking_named, spawn_named};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinHandle};

pub type TaskHandle<T> = JoinHandle<Result<T, JoinError>>;

/// Runs blocking chunk operations with at most `size` of them in flight.
///
/// Tasks beyond the limit wait for a permit before they reach the blocking
/// thread pool. Each task keeps its permit until the operation returns.
pub struct IoPool {
    permits: Arc<Semaphore>,
    size: usize,
    queued: Arc<AtomicU64>,
}

impl IoPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
            queued: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Tasks submitted but not yet finished.
    pub fn pending(&self) -> u64 {
        self.queued.load(Ordering::Relaxed)
    }

    pub fn submit<T, F>(&self, name: &str, op: F) -> TaskHandle<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let permits = Arc::clone(&self.permits);
        let queued = Arc::clone(&self.queued);
        let blocking_name = format!("{name}-blocking");
        queued.fetch_add(1, Ordering::Relaxed);
        spawn_named(name, async move {
            // the semaphore is never closed
            let _permit = permits.acquire_owned().await.ok();
            let result = spawn_blocking_named(&blocking_name, op).await;
            queued.fetch_sub(1, Ordering::Relaxed);
            result
        })
    }

    /// Submits a single operation and waits for it.
    pub async fn run<T, F>(&self, name: &str, op: F) -> Result<T, JoinError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let handle = self.submit(name, op);
        flatten(handle.await)
    }
}

fn flatten<T>(result: Result<Result<T, JoinError>, JoinError>) -> Result<T, JoinError> {
    result.and_then(|inner| inner)
}

/// Waits for every handle and returns their results in submission order.
pub async fn join_all<T>(handles: Vec<TaskHandle<T>>) -> Vec<Result<T, JoinError>> {
    futures::future::join_all(handles)
        .await
        .into_iter()
        .map(flatten)
        .collect()
}
