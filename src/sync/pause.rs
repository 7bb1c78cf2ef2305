//! Cooperative pause flag.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

/// A cheap observable pause flag.
///
/// Consumers poll [`is_paused`](PauseToken::is_paused) at cooperative
/// checkpoints or park on [`wait_if_paused`](PauseToken::wait_if_paused);
/// this is not a hard suspend. Clones share the same flag.
#[derive(Clone, Debug, Default)]
pub struct PauseToken {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    paused: AtomicBool,
    notify: Notify,
}

impl PauseToken {
    /// Creates an unpaused token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` while paused.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::Acquire)
    }

    /// Raises the pause flag.
    pub fn pause(&self) {
        self.inner.paused.store(true, Ordering::Release);
    }

    /// Clears the pause flag and wakes every parked consumer.
    pub fn resume(&self) {
        self.inner.paused.store(false, Ordering::Release);
        self.inner.notify.notify_waiters();
    }

    /// Parks until the token is resumed; returns immediately when not
    /// paused.
    pub async fn wait_if_paused(&self) {
        while self.inner.paused.load(Ordering::Acquire) {
            let notified = self.inner.notify.notified();
            // Re-check after registering so a resume between the load and
            // the registration is not missed.
            if !self.inner.paused.load(Ordering::Acquire) {
                break;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_pause_resume_flag() {
        let token = PauseToken::new();
        assert!(!token.is_paused());
        token.pause();
        assert!(token.is_paused());
        token.resume();
        assert!(!token.is_paused());
    }

    #[tokio::test]
    async fn test_wait_if_paused_returns_immediately_when_unpaused() {
        let token = PauseToken::new();
        tokio::time::timeout(Duration::from_millis(50), token.wait_if_paused())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_if_paused_parks_until_resume() {
        let token = PauseToken::new();
        token.pause();

        let waiter = {
            let token = token.clone();
            tokio::spawn(async move { token.wait_if_paused().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        token.resume();
        tokio::time::timeout(Duration::from_millis(200), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
