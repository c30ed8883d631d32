//! Cancellable timeout tasks owned by an agent

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Timer tasks that live inside an agent's cancellation scope.
///
/// Cancelling the parent token (agent shutdown) drops every pending timer
/// without running its action.
#[derive(Clone)]
pub struct TimerScope {
    token: CancellationToken,
    tracker: TaskTracker,
}

impl TimerScope {
    pub fn new(parent: &CancellationToken) -> Self {
        Self {
            token: parent.child_token(),
            tracker: TaskTracker::new(),
        }
    }

    /// Run `action` after `delay` unless the scope is cancelled first
    pub fn schedule<F>(&self, delay: Duration, action: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let token = self.token.clone();
        self.tracker.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => action.await,
            }
        });
    }

    /// Number of timers not yet finished
    pub fn pending(&self) -> usize {
        self.tracker.len()
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Cancel all timers and wait for their tasks to exit
    pub async fn shutdown(&self) {
        self.token.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn test_timer_fires() {
        let scope = TimerScope::new(&CancellationToken::new());
        let fired = Arc::new(AtomicBool::new(false));

        let flag = fired.clone();
        scope.schedule(Duration::from_millis(20), async move {
            flag.store(true, Ordering::SeqCst);
        });
        assert_eq!(scope.pending(), 1);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(fired.load(Ordering::SeqCst));
        assert_eq!(scope.pending(), 0);
    }

    #[tokio::test]
    async fn test_parent_cancellation_drops_timers() {
        let parent = CancellationToken::new();
        let scope = TimerScope::new(&parent);
        let fired = Arc::new(AtomicBool::new(false));

        let flag = fired.clone();
        scope.schedule(Duration::from_millis(50), async move {
            flag.store(true, Ordering::SeqCst);
        });

        parent.cancel();
        scope.shutdown().await;

        assert!(scope.is_cancelled());
        assert_eq!(scope.pending(), 0);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!fired.load(Ordering::SeqCst));
    }
}
