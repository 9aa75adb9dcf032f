//! Aware tasks - background tasks tracked by their owner (a server instance or
//! the supervisor) so they can be cancelled in bulk at teardown.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::task::{AbortHandle, JoinHandle};

#[derive(Clone, Default)]
pub struct AwareTasks {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    next_id: AtomicU64,
    tasks: Mutex<HashMap<u64, AbortHandle>>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, HashMap<u64, AbortHandle>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Removes the task's entry when its future finishes or is dropped by abort.
struct Untrack {
    id: u64,
    inner: Arc<Inner>,
}

impl Drop for Untrack {
    fn drop(&mut self) {
        self.inner.lock().remove(&self.id);
    }
}

impl AwareTasks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `fut` and track it until it completes.
    pub fn spawn<F>(&self, fut: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let guard = Untrack {
            id,
            inner: self.inner.clone(),
        };

        // The map stays locked until the handle is stored, so a task that
        // finishes immediately on another worker cannot untrack before insert.
        let mut tasks = self.inner.lock();
        let handle = tokio::spawn(async move {
            let _guard = guard;
            fut.await
        });
        tasks.insert(id, handle.abort_handle());
        handle
    }

    /// Number of tracked tasks still running.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Abort every tracked task.
    pub fn cancel_all(&self) {
        let drained: Vec<AbortHandle> = self.inner.lock().drain().map(|(_, h)| h).collect();
        if !drained.is_empty() {
            tracing::debug!("Cancelling {} aware task(s)", drained.len());
        }
        for handle in drained {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_finished_task_is_untracked() {
        let tasks = AwareTasks::new();
        let handle = tasks.spawn(async { 7 });
        assert_eq!(handle.await.unwrap(), 7);
        assert!(tasks.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_all_aborts_running_tasks() {
        let tasks = AwareTasks::new();
        let a = tasks.spawn(tokio::time::sleep(Duration::from_secs(60)));
        let b = tasks.spawn(tokio::time::sleep(Duration::from_secs(60)));
        assert_eq!(tasks.len(), 2);

        tasks.cancel_all();

        assert!(a.await.unwrap_err().is_cancelled());
        assert!(b.await.unwrap_err().is_cancelled());
        assert!(tasks.is_empty());
    }

    #[tokio::test]
    async fn test_clones_share_registry() {
        let tasks = AwareTasks::new();
        let clone = tasks.clone();
        let handle = clone.spawn(tokio::time::sleep(Duration::from_secs(60)));
        assert_eq!(tasks.len(), 1);
        tasks.cancel_all();
        assert!(handle.await.unwrap_err().is_cancelled());
    }
}
