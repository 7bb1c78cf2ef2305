//! Linked cancellation sources.
//!
//! A [`LinkedToken`] observes N parent [`CancellationToken`]s and cancels
//! when any of them fires. Requests keep exactly one linked source at a
//! time; after a cancellation the owner disposes it and builds a fresh one
//! on the next start.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A cancellation source tied to any number of parent sources and an
/// optional timeout.
pub struct LinkedToken {
    token: CancellationToken,
    watchers: Vec<JoinHandle<()>>,
}

impl LinkedToken {
    /// Builds a token cancelled when any of `parents` fires.
    ///
    /// The first parent is linked structurally (`child_token`); further
    /// parents are observed by lightweight watcher tasks that exit once
    /// either side cancels.
    #[must_use]
    pub fn new(parents: &[CancellationToken]) -> Self {
        let (token, rest) = match parents.split_first() {
            Some((first, rest)) => (first.child_token(), rest),
            None => (CancellationToken::new(), &[][..]),
        };

        let mut watchers = Vec::with_capacity(rest.len());
        for parent in rest {
            let parent = parent.clone();
            let child = token.clone();
            watchers.push(tokio::spawn(async move {
                tokio::select! {
                    () = parent.cancelled() => child.cancel(),
                    () = child.cancelled() => {}
                }
            }));
        }
        Self { token, watchers }
    }

    /// Adds a timer that cancels this token after `timeout`.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        let child = self.token.clone();
        self.watchers.push(tokio::spawn(async move {
            tokio::select! {
                () = tokio::time::sleep(timeout) => child.cancel(),
                () = child.cancelled() => {}
            }
        }));
        self
    }

    /// The linked token to hand to suspension points.
    #[must_use]
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Cancels this source directly.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Returns `true` once cancelled (by a parent, the timer, or directly).
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Drop for LinkedToken {
    fn drop(&mut self) {
        for watcher in &self.watchers {
            watcher.abort();
        }
    }
}

impl std::fmt::Debug for LinkedToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkedToken")
            .field("cancelled", &self.is_cancelled())
            .finish_non_exhaustive()
    }
}
