//! The request contract: lifecycle state machine, options, and the
//! scheduler-facing trait implemented by every request variant.
//!
//! A request moves through
//! `OnHold → Waiting → Available → Running → {Completed, Failed, Cancelled}`.
//! Terminal states are absorbing, the terminal latch resolves exactly once,
//! and each notification callback fires at most once. Only the scheduler
//! performs `Available → Running`; only the executing worker leaves
//! `Running`; the owner moves between `OnHold` and the ready states.

mod backoff;
pub(crate) mod driver;
mod options;
mod own;
mod status;

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::scheduler::Scheduler;
use crate::sync::LinkedToken;

pub use backoff::RetryBackoff;
pub use options::{
    CancelledCallback, CompletedCallback, FailedCallback, ProgressCallback, RequestOptions,
    StartedCallback, DEFAULT_TRY_COUNTER,
};
pub use own::OwnRequest;
pub use status::StatusRequest;

/// Priority bucket mapped onto the scheduler channel levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Priority {
    /// Channel level 0; always drained first.
    High,
    /// Channel level 1.
    #[default]
    Normal,
    /// Channel level 2; drained last.
    Low,
}

impl Priority {
    /// Number of channel levels.
    pub const LEVELS: usize = 3;

    /// The channel level for this priority.
    #[must_use]
    pub fn level(self) -> usize {
        match self {
            Self::High => 0,
            Self::Normal => 1,
            Self::Low => 2,
        }
    }
}

/// Lifecycle state of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    /// Owned by the caller; not queued.
    OnHold,
    /// Parked on a timer (deploy delay or retry back-off).
    Waiting,
    /// Queued in the scheduler channel.
    Available,
    /// Being executed by a scheduler worker.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished after exhausting the retry budget.
    Failed,
    /// Cancelled by the owner, an external token, or the scheduler.
    Cancelled,
}

impl RequestState {
    /// Terminal states are absorbing.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::OnHold => "on_hold",
            Self::Waiting => "waiting",
            Self::Available => "available",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Shared state machine every request variant embeds.
pub struct RequestCore {
    state: Mutex<RequestState>,
    latch: watch::Sender<bool>,
    attempts: AtomicU32,
    pause_requested: AtomicBool,
    started_notified: AtomicBool,
    disposed: AtomicBool,
    link: Mutex<Option<LinkedToken>>,
    watcher: Mutex<Option<JoinHandle<()>>>,
    handler: Arc<Scheduler>,
    priority: Priority,
}

impl RequestCore {
    /// Creates a core in `OnHold` bound to its scheduler.
    #[must_use]
    pub fn new(priority: Priority, handler: Arc<Scheduler>) -> Self {
        let (latch, _) = watch::channel(false);
        Self {
            state: Mutex::new(RequestState::OnHold),
            latch,
            attempts: AtomicU32::new(0),
            pause_requested: AtomicBool::new(false),
            started_notified: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            link: Mutex::new(None),
            watcher: Mutex::new(None),
            handler,
            priority,
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> RequestState {
        *self.lock_state()
    }

    /// The scheduler this request belongs to.
    #[must_use]
    pub fn handler(&self) -> &Arc<Scheduler> {
        &self.handler
    }

    /// The request priority.
    #[must_use]
    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// Worker invocations so far.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::Acquire)
    }

    /// Resolves once the request enters any terminal state.
    pub async fn wait(&self) {
        let mut rx = self.latch.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// `true` when a cooperative pause was requested and not yet cleared.
    #[must_use]
    pub fn pause_requested(&self) -> bool {
        self.pause_requested.load(Ordering::Acquire)
    }

    /// The current linked cancellation token; inert when never started.
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.lock_link()
            .as_ref()
            .map_or_else(CancellationToken::new, LinkedToken::token)
    }

    /// Moves `from` any of the listed states to `to`.
    ///
    /// Returns `true` when this call performed the transition. Assignments
    /// after a terminal state are ignored; entering a terminal state
    /// signals the latch exactly once.
    pub(crate) fn try_transition(&self, from: &[RequestState], to: RequestState) -> bool {
        let mut state = self.lock_state();
        if state.is_terminal() || !from.contains(&state) {
            return false;
        }
        *state = to;
        if to.is_terminal() {
            self.latch.send_replace(true);
        }
        true
    }

    /// Forces a terminal state from any non-terminal state.
    pub(crate) fn force_terminal(&self, to: RequestState) -> bool {
        debug_assert!(to.is_terminal());
        let mut state = self.lock_state();
        if state.is_terminal() {
            return false;
        }
        *state = to;
        self.latch.send_replace(true);
        true
    }

    pub(crate) fn request_pause(&self) {
        self.pause_requested.store(true, Ordering::Release);
    }

    pub(crate) fn clear_pause(&self) {
        self.pause_requested.store(false, Ordering::Release);
    }

    /// Returns `true` on the first call only; gates the `on_started`
    /// notification.
    pub(crate) fn mark_started(&self) -> bool {
        !self.started_notified.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn add_attempt(&self) -> u32 {
        self.attempts.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn remove_attempt(&self) {
        let _ = self
            .attempts
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |a| a.checked_sub(1));
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_disposed(&self) -> bool {
        !self.disposed.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn install_link(&self, link: LinkedToken, watcher: JoinHandle<()>) {
        if let Some(old) = self.lock_watcher().replace(watcher) {
            old.abort();
        }
        *self.lock_link() = Some(link);
    }

    pub(crate) fn link_needs_rebuild(&self) -> bool {
        self.lock_link()
            .as_ref()
            .map_or(true, LinkedToken::is_cancelled)
    }

    pub(crate) fn cancel_link(&self) {
        if let Some(link) = self.lock_link().as_ref() {
            link.cancel();
        }
    }

    pub(crate) fn teardown(&self) {
        if let Some(watcher) = self.lock_watcher().take() {
            watcher.abort();
        }
        *self.lock_link() = None;
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, RequestState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn lock_link(&self) -> std::sync::MutexGuard<'_, Option<LinkedToken>> {
        self.link
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn lock_watcher(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.watcher
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl fmt::Debug for RequestCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestCore")
            .field("state", &self.state())
            .field("priority", &self.priority)
            .field("attempts", &self.attempts())
            .finish_non_exhaustive()
    }
}

/// The scheduler-facing request contract.
///
/// Concrete variants ([`StatusRequest`], [`OwnRequest`],
/// [`crate::load::LoadRequest`]) delegate the lifecycle methods to the
/// shared driver so state transitions and callback semantics stay uniform.
#[async_trait]
pub trait Request: Send + Sync {
    /// The shared state machine.
    fn core(&self) -> &RequestCore;

    /// Starts the request: valid only from `OnHold`. Applies the deploy
    /// delay when configured, then enqueues at the request priority.
    fn start(self: Arc<Self>);

    /// Requests a cooperative pause; a running body exits at its next
    /// checkpoint and the request returns to `OnHold`.
    fn pause(&self);

    /// Cancels the request; `on_cancelled` fires exactly once.
    fn cancel(&self);

    /// Terminal cleanup; idempotent. A non-terminal request is cancelled.
    fn dispose(&self);

    /// Scheduler worker entry point: runs one attempt and settles state.
    async fn execute(self: Arc<Self>);

    /// Current lifecycle state.
    fn state(&self) -> RequestState {
        self.core().state()
    }

    /// Resolves once the request is terminal.
    async fn wait(&self) {
        self.core().wait().await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn test_core() -> RequestCore {
        RequestCore::new(Priority::Normal, Scheduler::new_standalone())
    }

    #[test]
    fn test_priority_levels() {
        assert_eq!(Priority::High.level(), 0);
        assert_eq!(Priority::Normal.level(), 1);
        assert_eq!(Priority::Low.level(), 2);
        assert_eq!(Priority::default(), Priority::Normal);
    }

    #[tokio::test]
    async fn test_transition_rules() {
        let core = test_core();
        assert_eq!(core.state(), RequestState::OnHold);

        assert!(!core.try_transition(&[RequestState::Available], RequestState::Running));
        assert!(core.try_transition(&[RequestState::OnHold], RequestState::Available));
        assert!(core.try_transition(&[RequestState::Available], RequestState::Running));
        assert!(core.try_transition(&[RequestState::Running], RequestState::Completed));

        // Terminal states absorb all later assignments.
        assert!(!core.try_transition(&[RequestState::Completed], RequestState::Running));
        assert!(!core.force_terminal(RequestState::Cancelled));
        assert_eq!(core.state(), RequestState::Completed);
    }

    #[tokio::test]
    async fn test_latch_resolves_on_terminal_entry() {
        let core = Arc::new(test_core());
        let waiter = {
            let core = Arc::clone(&core);
            tokio::spawn(async move { core.wait().await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        assert!(core.force_terminal(RequestState::Cancelled));
        waiter.await.unwrap();

        // Resolved latches stay resolved.
        core.wait().await;
    }

    #[test]
    fn test_attempt_counter() {
        let core = test_core();
        assert_eq!(core.add_attempt(), 1);
        assert_eq!(core.add_attempt(), 2);
        core.remove_attempt();
        assert_eq!(core.attempts(), 1);
        core.remove_attempt();
        core.remove_attempt();
        assert_eq!(core.attempts(), 0);
    }
}
