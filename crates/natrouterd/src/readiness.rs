//! Upstream readiness flag.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

/// A boolean signal set when the upstream link has an address.
///
/// Cloning gives another handle to the same flag.
#[derive(Debug, Clone)]
pub struct ReadinessFlag {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for ReadinessFlag {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadinessFlag {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
        }
    }

    /// Sets the flag and releases every waiter.
    pub fn set(&self) {
        self.tx.send_replace(true);
    }

    pub fn clear(&self) {
        self.tx.send_replace(false);
    }

    pub fn is_set(&self) -> bool {
        *self.tx.borrow()
    }

    /// Waits until the flag is set or `timeout` expires. Returns whether
    /// the flag was set.
    pub async fn wait(&self, timeout: Duration) -> bool {
        let mut rx = self.tx.subscribe();
        let ready = matches!(
            tokio::time::timeout(timeout, rx.wait_for(|ready| *ready)).await,
            Ok(Ok(_))
        );
        ready
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_wait_returns_immediately_when_set() {
        let flag = ReadinessFlag::new();
        flag.set();
        assert!(flag.wait(Duration::from_millis(10)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out() {
        let flag = ReadinessFlag::new();
        assert!(!flag.wait(Duration::from_millis(2000)).await);
        assert!(!flag.is_set());
    }

    #[tokio::test]
    async fn test_set_releases_waiter() {
        let flag = ReadinessFlag::new();
        let waiter = {
            let flag = flag.clone();
            tokio::spawn(async move { flag.wait(Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;
        flag.set();
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_clear() {
        let flag = ReadinessFlag::new();
        flag.set();
        flag.clear();
        assert!(!flag.is_set());
    }
}
