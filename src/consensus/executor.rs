use crate::core::{RegistryError, Result};
use futures::FutureExt;
use futures::future::{BoxFuture, RemoteHandle};
use tokio::runtime::Handle;

/// Handle to a task submitted through a [`TaskExecutor`].
///
/// Dropping the handle detaches the task; it keeps running.
pub struct TaskHandle {
    handle: Option<RemoteHandle<()>>,
}

impl TaskHandle {
    fn new(handle: RemoteHandle<()>) -> Self {
        Self {
            handle: Some(handle),
        }
    }

    /// Waits for the task to finish.
    pub async fn join(mut self) {
        if let Some(handle) = self.handle.take() {
            handle.await;
        }
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.forget();
        }
    }
}

/// Runs background work for the consensus client, such as connection-event handling
/// and leader refreshes triggered by notifications.
pub trait TaskExecutor: Send + Sync {
    fn submit(&self, task: BoxFuture<'static, ()>) -> TaskHandle;
}

/// [`TaskExecutor`] backed by a tokio runtime handle, so tasks can be submitted from
/// threads that are not runtime workers (e.g. transport callback threads).
#[derive(Clone)]
pub struct TokioTaskExecutor {
    runtime: Handle,
}

impl TokioTaskExecutor {
    pub fn new(runtime: Handle) -> Self {
        Self { runtime }
    }

    /// Binds to the runtime the caller is running on.
    pub fn from_current() -> Result<Self> {
        let runtime = Handle::try_current().map_err(|err| {
            RegistryError::InvalidConfiguration(format!("no tokio runtime available: {}", err))
        })?;
        Ok(Self::new(runtime))
    }
}

impl TaskExecutor for TokioTaskExecutor {
    fn submit(&self, task: BoxFuture<'static, ()>) -> TaskHandle {
        let (remote, handle) = task.remote_handle();
        self.runtime.spawn(remote);
        TaskHandle::new(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_submit_and_join() {
        let executor = TokioTaskExecutor::from_current().unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        let task_counter = counter.clone();
        let handle = executor.submit(Box::pin(async move {
            task_counter.fetch_add(1, Ordering::SeqCst);
        }));
        handle.join().await;

        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dropped_handle_detaches() {
        let executor = TokioTaskExecutor::from_current().unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel();

        drop(executor.submit(Box::pin(async move {
            tokio::task::yield_now().await;
            let _ = tx.send(42);
        })));

        assert_eq!(rx.await.unwrap(), 42);
    }

    #[test]
    fn test_from_current_outside_runtime() {
        assert!(TokioTaskExecutor::from_current().is_err());
    }
}
