//! Completion tracking for one call.
//!
//! Every task spawned on behalf of a call acquires a [`WorkToken`] before it
//! starts and releases it (by drop) when it stops, aborted or not. The call's
//! registry entry is only removed once the actor is finished *and* the
//! outstanding count is back to zero, which decouples "the handler returned"
//! from "all forwarding tasks actually stopped".

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::{AbortHandle, JoinHandle};

#[derive(Clone)]
pub(crate) struct CompletionTracker {
    inner: Arc<TrackerInner>,
}

struct TrackerInner {
    outstanding: AtomicUsize,
    idle: Notify,
}

impl CompletionTracker {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(TrackerInner {
                outstanding: AtomicUsize::new(0),
                idle: Notify::new(),
            }),
        }
    }

    pub(crate) fn acquire(&self) -> WorkToken {
        self.inner.outstanding.fetch_add(1, Ordering::SeqCst);
        WorkToken {
            inner: self.inner.clone(),
        }
    }

    pub(crate) fn outstanding(&self) -> usize {
        self.inner.outstanding.load(Ordering::SeqCst)
    }

    /// Wait until no work units are outstanding. Returns immediately if the
    /// count is already zero.
    pub(crate) async fn wait_idle(&self) {
        loop {
            // Registering interest before the check avoids a lost wakeup
            // between the load and the await.
            let notified = self.inner.idle.notified();
            if self.inner.outstanding.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// One outstanding unit of work. Released on drop, including abort.
pub(crate) struct WorkToken {
    inner: Arc<TrackerInner>,
}

impl Drop for WorkToken {
    fn drop(&mut self) {
        if self.inner.outstanding.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.inner.idle.notify_waiters();
        }
    }
}

/// The set of tasks spawned for one call, cancelled as a unit at teardown.
#[derive(Clone, Default)]
pub(crate) struct TaskScope {
    handles: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl TaskScope {
    pub(crate) fn spawn(
        &self,
        future: impl std::future::Future<Output = ()> + Send + 'static,
    ) -> AbortHandle {
        let mut handles = self.handles.lock();
        handles.retain(|handle| !handle.is_finished());
        let handle = tokio::spawn(future);
        let abort = handle.abort_handle();
        handles.push(handle);
        abort
    }

    pub(crate) fn abort_all(&self) {
        for handle in self.handles.lock().drain(..) {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn wait_idle_returns_immediately_when_unused() {
        let tracker = CompletionTracker::new();
        tracker.wait_idle().await;
        assert_eq!(tracker.outstanding(), 0);
    }

    #[tokio::test]
    async fn wait_idle_blocks_until_all_tokens_drop() {
        let tracker = CompletionTracker::new();
        let first = tracker.acquire();
        let second = tracker.acquire();
        assert_eq!(tracker.outstanding(), 2);

        let waiter = {
            let tracker = tracker.clone();
            tokio::spawn(async move { tracker.wait_idle().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        drop(first);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        drop(second);
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn aborted_task_still_releases_its_token() {
        let tracker = CompletionTracker::new();
        let scope = TaskScope::default();
        let token = tracker.acquire();
        scope.spawn(async move {
            let _token = token;
            std::future::pending::<()>().await;
        });
        scope.abort_all();
        tracker.wait_idle().await;
        assert_eq!(tracker.outstanding(), 0);
    }
}
