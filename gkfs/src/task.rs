//! Named task spawning. Names show up in tokio-console when the daemon is
//! built with `tokio_unstable`.

use std::future::Future;
use tokio::task::{Builder, JoinHandle};

pub fn spawn_named<T, F>(name: &str, future: F) -> JoinHandle<T>
where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    Builder::new()
        .name(name)
        .spawn(future)
        .expect("failed to spawn task")
}

/// Runs `f` on the blocking pool. Chunk file I/O goes through here.
pub fn spawn_blocking_named<T, F>(name: &str, f: F) -> JoinHandle<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    Builder::new()
        .name(name)
        .spawn_blocking(f)
        .expect("failed to spawn blocking task")
}
