use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{info, warn};

/// Shutdown flag plus a count of open client sessions.
pub struct ShutdownManager {
    shutdown: AtomicBool,
    active_connections: AtomicUsize,
    notify: Notify,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self {
            shutdown: AtomicBool::new(false),
            active_connections: AtomicUsize::new(0),
            notify: Notify::new(),
        }
    }

    pub fn signal_shutdown(&self) {
        if !self.shutdown.swap(true, Ordering::SeqCst) {
            self.notify.notify_waiters();
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Resolve once shutdown has been signalled.
    pub async fn wait(&self) {
        // Register interest first; notify_waiters() only wakes registered waiters.
        let notified = self.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_shutting_down() {
            return;
        }
        notified.await;
    }

    pub fn increment_connections(&self) {
        self.active_connections.fetch_add(1, Ordering::SeqCst);
    }

    pub fn decrement_connections(&self) {
        self.active_connections.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::SeqCst)
    }

    /// Count a session as open until the returned guard is dropped.
    pub fn track(self: &Arc<Self>) -> ConnectionGuard {
        self.increment_connections();
        ConnectionGuard {
            shutdown: Arc::clone(self),
        }
    }

    /// Wait for open sessions to finish. Returns false if some were still
    /// open when `timeout` expired.
    pub async fn wait_for_connections(&self, timeout: Duration) -> bool {
        let active = self.active_connections();
        info!(active, "Waiting for active sessions");

        let start = tokio::time::Instant::now();

        while start.elapsed() < timeout {
            if self.active_connections() == 0 {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let remaining = self.active_connections();
        if remaining == 0 {
            return true;
        }
        warn!(remaining, "Forced shutdown after drain timeout");
        false
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Keeps one session counted in [`ShutdownManager::active_connections`].
pub struct ConnectionGuard {
    shutdown: Arc<ShutdownManager>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.shutdown.decrement_connections();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn starts_running() {
        let manager = ShutdownManager::new();
        assert!(!manager.is_shutting_down());
        assert_eq!(manager.active_connections(), 0);
    }

    #[tokio::test]
    async fn wait_returns_after_signal() {
        let manager = Arc::new(ShutdownManager::new());
        let waiter = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.wait().await })
        };
        tokio::task::yield_now().await;
        manager.signal_shutdown();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter woke")
            .unwrap();
    }

    #[tokio::test]
    async fn wait_after_signal_returns_immediately() {
        let manager = ShutdownManager::new();
        manager.signal_shutdown();
        tokio::time::timeout(Duration::from_millis(100), manager.wait())
            .await
            .expect("already shut down");
    }

    #[tokio::test]
    async fn track_guard_counts_sessions() {
        let manager = Arc::new(ShutdownManager::new());
        let first = manager.track();
        let second = manager.track();
        assert_eq!(manager.active_connections(), 2);
        drop(first);
        assert_eq!(manager.active_connections(), 1);
        drop(second);
        assert_eq!(manager.active_connections(), 0);
    }

    #[tokio::test]
    async fn wait_for_connections_completes_immediately_when_zero() {
        let manager = ShutdownManager::new();

        let start = std::time::Instant::now();
        assert!(manager.wait_for_connections(Duration::from_secs(1)).await);
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn wait_for_connections_times_out() {
        let manager = ShutdownManager::new();
        manager.increment_connections();

        let start = std::time::Instant::now();
        assert!(!manager.wait_for_connections(Duration::from_millis(100)).await);
        assert!(start.elapsed() >= Duration::from_millis(90));
    }
}
