//! Helpers for working with asynchronous tasks.

use std::future::Future;

use tokio::task::JoinHandle;
use tracing::Instrument as _;

/// Spawns a new asynchronous task, returning a [`JoinHandle`] for it.
///
/// This is a thin wrapper over [`tokio::spawn`] that attaches the spawned future to the current `tracing` span, so
/// that log events emitted from the task carry the same context as the code that spawned it.
pub fn spawn_traced<F, T>(f: F) -> JoinHandle<T>
where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn(f.in_current_span())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn spawned_task_runs_to_completion() {
        let handle = spawn_traced(async { 42 });
        assert_eq!(handle.await.unwrap(), 42);
    }
}
