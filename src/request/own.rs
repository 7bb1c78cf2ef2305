//! User-supplied request bodies.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::scheduler::Scheduler;

use super::driver::{self, RunOutcome, Runnable};
use super::{Request, RequestCore, RequestOptions};

type OwnFuture = Pin<Box<dyn Future<Output = bool> + Send>>;
type OwnBody = Box<dyn Fn(CancellationToken) -> OwnFuture + Send + Sync>;

/// Wraps a user-supplied async function as a schedulable request.
///
/// The function receives the request's linked cancellation token and
/// reports success with its boolean result; `false` consumes a retry
/// attempt like any other failure.
pub struct OwnRequest {
    core: RequestCore,
    options: RequestOptions<bool>,
    body: OwnBody,
}

impl OwnRequest {
    /// Creates a request around `body`.
    pub fn new<F, Fut>(body: F, options: RequestOptions<bool>) -> Arc<Self>
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        let handler = options
            .handler
            .clone()
            .unwrap_or_else(|| Scheduler::main().clone());
        let auto_start = options.auto_start;
        let request = Arc::new(Self {
            core: RequestCore::new(options.priority, handler),
            options,
            body: Box::new(move |token| Box::pin(body(token)) as OwnFuture),
        });
        if auto_start {
            Arc::clone(&request).start();
        }
        request
    }
}

#[async_trait]
impl Runnable for OwnRequest {
    type Value = bool;

    fn options(&self) -> &RequestOptions<Self::Value> {
        &self.options
    }

    async fn run(self: Arc<Self>, cancel: CancellationToken) -> RunOutcome<Self::Value> {
        let successful = (self.body)(cancel.clone()).await;
        if cancel.is_cancelled() {
            RunOutcome::Cancelled
        } else if successful {
            RunOutcome::Success(true)
        } else {
            RunOutcome::Failure(None)
        }
    }
}

#[async_trait]
impl Request for OwnRequest {
    fn core(&self) -> &RequestCore {
        &self.core
    }

    fn start(self: Arc<Self>) {
        driver::start_request(&self);
    }

    fn pause(&self) {
        driver::pause_request(self);
    }

    fn cancel(&self) {
        driver::cancel_request(self);
    }

    fn dispose(&self) {
        driver::dispose_request(self);
    }

    async fn execute(self: Arc<Self>) {
        driver::drive(self).await;
    }
}
