//! Shared request driver.
//!
//! Every request variant delegates its lifecycle here so state transitions,
//! retry policy, and callback semantics stay uniform. The driver owns:
//! start (with deploy delay), cooperative pause, cancellation settling,
//! disposal, and the worker-side attempt loop with back-off re-enqueue.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::DownloadError;
use crate::sync::LinkedToken;

use super::backoff::RetryBackoff;
use super::{Request, RequestOptions, RequestState};

/// Result of one worker invocation of a request body.
pub(crate) enum RunOutcome<T> {
    /// The request produced its completion value.
    Success(T),
    /// The attempt failed; the retry budget decides what happens next.
    Failure(Option<DownloadError>),
    /// The attempt failed in a way no retry can fix.
    Fatal(Option<DownloadError>),
    /// Re-enqueue immediately without consuming a retry attempt.
    Reschedule,
    /// Park in `Waiting` (releasing the worker slot) until the future
    /// resolves, then re-enqueue; does not consume a retry attempt.
    Defer(futures_util::future::BoxFuture<'static, ()>),
    /// A cancellation was observed inside the body.
    Cancelled,
    /// A cooperative pause was observed; the request returns to `OnHold`.
    Suspended,
}

/// The generic seam each variant implements on top of [`Request`].
#[async_trait]
pub(crate) trait Runnable: Request + Send + Sync + Sized + 'static {
    /// Completion value delivered to `on_completed`.
    type Value: Send + Sync + 'static;

    /// The variant's options record.
    fn options(&self) -> &RequestOptions<Self::Value>;

    /// One attempt of the request body. Must observe `cancel` at every
    /// suspension point.
    async fn run(self: Arc<Self>, cancel: CancellationToken) -> RunOutcome<Self::Value>;

    /// Lifecycle propagation targets (chunk siblings); empty by default.
    fn family(&self) -> Vec<Arc<dyn Request>> {
        Vec::new()
    }

    /// Hook invoked exactly once on terminal entry.
    fn on_terminal(&self, _state: RequestState) {}
}

/// Starts a request from `OnHold`, applying the deploy delay when set.
pub(crate) fn start_request<R: Runnable>(this: &Arc<R>) {
    let core = this.core();
    if core.is_disposed() || core.state().is_terminal() {
        return;
    }
    core.clear_pause();
    if core.state() != RequestState::OnHold {
        return;
    }
    if core.link_needs_rebuild() {
        rebuild_link(this);
    }

    match this.options().deploy_delay {
        Some(delay) => {
            if core.try_transition(&[RequestState::OnHold], RequestState::Waiting) {
                let request = Arc::clone(this);
                let token = core.cancel_token();
                tokio::spawn(async move {
                    tokio::select! {
                        () = token.cancelled() => {}
                        () = tokio::time::sleep(delay) => {
                            if request
                                .core()
                                .try_transition(&[RequestState::Waiting], RequestState::Available)
                            {
                                enqueue(&request);
                            }
                        }
                    }
                });
            }
        }
        None => {
            if core.try_transition(&[RequestState::OnHold], RequestState::Available) {
                enqueue(this);
            }
        }
    }

    for member in this.family() {
        member.start();
    }
}

/// Requests a cooperative pause; queued or delayed requests return to
/// `OnHold` immediately, running bodies exit at their next checkpoint.
pub(crate) fn pause_request<R: Runnable>(this: &R) {
    let core = this.core();
    core.request_pause();
    core.try_transition(
        &[RequestState::Available, RequestState::Waiting],
        RequestState::OnHold,
    );
    for member in this.family() {
        member.pause();
    }
}

/// Cancels a request: fires the linked source so in-flight awaits abort,
/// then settles the terminal state synchronously.
pub(crate) fn cancel_request<R: Runnable>(this: &R) {
    this.core().cancel_link();
    settle_cancelled(this);
    for member in this.family() {
        member.cancel();
    }
}

/// Terminal cleanup; idempotent. A live request is cancelled first.
pub(crate) fn dispose_request<R: Runnable>(this: &R) {
    let core = this.core();
    if !core.mark_disposed() {
        return;
    }
    if !core.state().is_terminal() {
        core.cancel_link();
        settle_cancelled(this);
    }
    core.teardown();
}

/// Worker entry point: runs one attempt and settles the post-run state.
pub(crate) async fn drive<R: Runnable>(this: Arc<R>) {
    let core = this.core();
    // Only the scheduler moves Available → Running; a stale channel entry
    // (paused, cancelled, already re-queued) is skipped here.
    if !core.try_transition(&[RequestState::Available], RequestState::Running) {
        return;
    }
    let cancel = core.cancel_token();
    if cancel.is_cancelled() {
        settle_cancelled(this.as_ref());
        return;
    }

    let attempt = core.add_attempt();
    if core.mark_started() {
        if let Some(callback) = &this.options().on_started {
            callback();
        }
    }
    debug!(attempt, "running request");

    let outcome = Arc::clone(&this).run(cancel.clone()).await;
    match outcome {
        RunOutcome::Success(value) => settle_completed(this.as_ref(), &value),
        RunOutcome::Cancelled => settle_cancelled(this.as_ref()),
        RunOutcome::Fatal(error) => settle_failed(this.as_ref(), error.as_ref()),
        RunOutcome::Suspended => {
            // A pause is not a failed attempt.
            core.remove_attempt();
            core.try_transition(&[RequestState::Running], RequestState::OnHold);
        }
        RunOutcome::Reschedule => {
            core.remove_attempt();
            if core.try_transition(&[RequestState::Running], RequestState::Available) {
                enqueue(&this);
            }
        }
        RunOutcome::Defer(ready) => {
            core.remove_attempt();
            if core.try_transition(&[RequestState::Running], RequestState::Waiting) {
                let request = Arc::clone(&this);
                tokio::spawn(async move {
                    tokio::select! {
                        () = cancel.cancelled() => {}
                        () = ready => {
                            if request
                                .core()
                                .try_transition(&[RequestState::Waiting], RequestState::Available)
                            {
                                enqueue(&request);
                            }
                        }
                    }
                });
            }
        }
        RunOutcome::Failure(error) => {
            if cancel.is_cancelled() {
                settle_cancelled(this.as_ref());
                return;
            }
            if attempt < this.options().try_counter {
                retry_later(&this, attempt, cancel);
            } else {
                settle_failed(this.as_ref(), error.as_ref());
            }
        }
    }
}

/// Parks a failed request in `Waiting` and re-enqueues it after the
/// configured (or default exponential) back-off.
fn retry_later<R: Runnable>(this: &Arc<R>, attempt: u32, cancel: CancellationToken) {
    let delay = this
        .options()
        .delay_between_attempts
        .unwrap_or_else(|| RetryBackoff::default().delay_for(attempt));
    debug!(
        attempt,
        delay_ms = delay.as_millis() as u64,
        "attempt failed, retrying after back-off"
    );
    if this
        .core()
        .try_transition(&[RequestState::Running], RequestState::Waiting)
    {
        let request = Arc::clone(this);
        tokio::spawn(async move {
            tokio::select! {
                () = cancel.cancelled() => {}
                () = tokio::time::sleep(delay) => {
                    if request
                        .core()
                        .try_transition(&[RequestState::Waiting], RequestState::Available)
                    {
                        enqueue(&request);
                    }
                }
            }
        });
    }
}

/// Enqueues the request into its scheduler at the request priority.
fn enqueue<R: Runnable>(this: &Arc<R>) {
    let request: Arc<dyn Request> = Arc::clone(this) as Arc<dyn Request>;
    this.core().handler().enqueue(request);
}

/// Rebuilds the linked cancellation source from the scheduler token and
/// the optional user token, and installs the cancel watcher.
fn rebuild_link<R: Runnable>(this: &Arc<R>) {
    let core = this.core();
    let parents: Vec<CancellationToken> = std::iter::once(core.handler().cancel_token())
        .chain(this.options().cancel_token.clone())
        .collect();
    let link = LinkedToken::new(&parents);
    let token = link.token();

    // The watcher delivers `on_cancelled` even while the request sits
    // between state transitions (queued, waiting on a timer, ...).
    let weak = Arc::downgrade(this);
    let watcher = tokio::spawn(async move {
        token.cancelled().await;
        if let Some(request) = weak.upgrade() {
            settle_cancelled(request.as_ref());
        }
    });
    core.install_link(link, watcher);
}

fn settle_completed<R: Runnable>(this: &R, value: &R::Value) {
    if this
        .core()
        .try_transition(&[RequestState::Running], RequestState::Completed)
    {
        if let Some(callback) = &this.options().on_completed {
            callback(value);
        }
        this.on_terminal(RequestState::Completed);
    }
}

fn settle_failed<R: Runnable>(this: &R, error: Option<&DownloadError>) {
    if this.core().force_terminal(RequestState::Failed) {
        warn!(error = error.map(tracing::field::display), "request failed");
        if let Some(callback) = &this.options().on_failed {
            callback(error);
        }
        this.on_terminal(RequestState::Failed);
    }
}

pub(crate) fn settle_cancelled<R: Runnable>(this: &R) {
    if this.core().force_terminal(RequestState::Cancelled) {
        debug!("request cancelled");
        if let Some(callback) = &this.options().on_cancelled {
            callback();
        }
        this.on_terminal(RequestState::Cancelled);
    }
}
