//! Per-request configuration and notification callbacks.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::DownloadError;
use crate::scheduler::Scheduler;

use super::Priority;

/// Default maximum worker invocations per request.
pub const DEFAULT_TRY_COUNTER: u32 = 3;

/// Invoked once when the first worker attempt begins.
pub type StartedCallback = Box<dyn Fn() + Send + Sync>;
/// Invoked once with the completion value.
pub type CompletedCallback<T> = Box<dyn Fn(&T) + Send + Sync>;
/// Invoked once with the last error (absent when none was captured).
pub type FailedCallback = Box<dyn Fn(Option<&DownloadError>) + Send + Sync>;
/// Invoked once when the request is cancelled.
pub type CancelledCallback = Box<dyn Fn() + Send + Sync>;
/// Receives download progress in `0.0..=1.0`.
pub type ProgressCallback = Arc<dyn Fn(f64) + Send + Sync>;

/// Configuration shared by every request variant.
///
/// `T` is the variant's completion value: a response summary for status
/// probes, the callback boolean for own requests, the final path for
/// downloads. All fields are optional with the documented defaults.
pub struct RequestOptions<T> {
    /// Channel priority; `Normal` by default.
    pub priority: Priority,
    /// Start the request on construction; `true` by default.
    pub auto_start: bool,
    /// Delay applied on each `start` before the request becomes available.
    pub deploy_delay: Option<Duration>,
    /// Maximum worker invocations (default [`DEFAULT_TRY_COUNTER`]).
    pub try_counter: u32,
    /// Fixed back-off between attempts; exponential back-off with jitter
    /// when unset.
    pub delay_between_attempts: Option<Duration>,
    /// External cancellation source linked with the scheduler's.
    pub cancel_token: Option<CancellationToken>,
    /// Scheduler this request belongs to; each variant picks its standard
    /// instance when unset.
    pub handler: Option<Arc<Scheduler>>,
    /// Notification callbacks, each invoked at most once.
    pub on_started: Option<StartedCallback>,
    /// See [`CompletedCallback`].
    pub on_completed: Option<CompletedCallback<T>>,
    /// See [`FailedCallback`].
    pub on_failed: Option<FailedCallback>,
    /// See [`CancelledCallback`].
    pub on_cancelled: Option<CancelledCallback>,
}

impl<T> Default for RequestOptions<T> {
    fn default() -> Self {
        Self {
            priority: Priority::default(),
            auto_start: true,
            deploy_delay: None,
            try_counter: DEFAULT_TRY_COUNTER,
            delay_between_attempts: None,
            cancel_token: None,
            handler: None,
            on_started: None,
            on_completed: None,
            on_failed: None,
            on_cancelled: None,
        }
    }
}

impl<T> RequestOptions<T> {
    /// Creates options with all defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the priority.
    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Enables or disables autostart.
    #[must_use]
    pub fn with_auto_start(mut self, auto_start: bool) -> Self {
        self.auto_start = auto_start;
        self
    }

    /// Sets the retry budget (clamped to at least 1).
    #[must_use]
    pub fn with_try_counter(mut self, try_counter: u32) -> Self {
        self.try_counter = try_counter.max(1);
        self
    }

    /// Sets a fixed delay between attempts.
    #[must_use]
    pub fn with_delay_between_attempts(mut self, delay: Duration) -> Self {
        self.delay_between_attempts = Some(delay);
        self
    }

    /// Links an external cancellation source.
    #[must_use]
    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel_token = Some(token);
        self
    }

    /// Assigns the request to a specific scheduler.
    #[must_use]
    pub fn with_handler(mut self, handler: Arc<Scheduler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Sets the completion callback.
    #[must_use]
    pub fn on_completed(mut self, callback: impl Fn(&T) + Send + Sync + 'static) -> Self {
        self.on_completed = Some(Box::new(callback));
        self
    }

    /// Sets the failure callback.
    #[must_use]
    pub fn on_failed(
        mut self,
        callback: impl Fn(Option<&DownloadError>) + Send + Sync + 'static,
    ) -> Self {
        self.on_failed = Some(Box::new(callback));
        self
    }

    /// Sets the cancellation callback.
    #[must_use]
    pub fn on_cancelled(mut self, callback: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_cancelled = Some(Box::new(callback));
        self
    }

    /// Sets the started callback.
    #[must_use]
    pub fn on_started(mut self, callback: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_started = Some(Box::new(callback));
        self
    }
}

impl<T> fmt::Debug for RequestOptions<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestOptions")
            .field("priority", &self.priority)
            .field("auto_start", &self.auto_start)
            .field("deploy_delay", &self.deploy_delay)
            .field("try_counter", &self.try_counter)
            .field("delay_between_attempts", &self.delay_between_attempts)
            .finish_non_exhaustive()
    }
}
