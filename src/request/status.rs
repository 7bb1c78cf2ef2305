//! HEAD status probes.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use tokio_util::sync::CancellationToken;
use tracing::instrument;
use url::Url;

use crate::error::DownloadError;
use crate::http::{HttpClient, ResponseSummary, SendOptions};
use crate::scheduler::Scheduler;
use crate::sync::LinkedToken;

use super::driver::{self, RunOutcome, Runnable};
use super::{Request, RequestCore, RequestOptions};

/// Default probe timeout.
pub const DEFAULT_STATUS_TIMEOUT: Duration = Duration::from_secs(10);

/// A request that issues a HEAD probe and succeeds on any 2xx status.
///
/// The completion callback receives the final response summary (after
/// redirects).
pub struct StatusRequest {
    core: RequestCore,
    options: RequestOptions<ResponseSummary>,
    url: String,
    timeout: Duration,
}

impl StatusRequest {
    /// Creates a probe with the default 10 s timeout.
    ///
    /// # Errors
    ///
    /// [`DownloadError::InvalidUrl`] for an empty or unparsable URL.
    pub fn new(
        url: impl Into<String>,
        options: RequestOptions<ResponseSummary>,
    ) -> Result<Arc<Self>, DownloadError> {
        Self::with_timeout(url, options, DEFAULT_STATUS_TIMEOUT)
    }

    /// Creates a probe with an explicit timeout.
    ///
    /// # Errors
    ///
    /// [`DownloadError::InvalidUrl`] for an empty or unparsable URL.
    #[instrument(skip_all)]
    pub fn with_timeout(
        url: impl Into<String>,
        options: RequestOptions<ResponseSummary>,
        timeout: Duration,
    ) -> Result<Arc<Self>, DownloadError> {
        let url = url.into();
        if url.trim().is_empty() || Url::parse(&url).is_err() {
            return Err(DownloadError::invalid_url(url));
        }

        let handler = options
            .handler
            .clone()
            .unwrap_or_else(|| Scheduler::main().clone());
        let auto_start = options.auto_start;
        let request = Arc::new(Self {
            core: RequestCore::new(options.priority, handler),
            options,
            url,
            timeout,
        });
        if auto_start {
            Arc::clone(&request).start();
        }
        Ok(request)
    }

    /// The probed URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Runnable for StatusRequest {
    type Value = ResponseSummary;

    fn options(&self) -> &RequestOptions<Self::Value> {
        &self.options
    }

    async fn run(self: Arc<Self>, cancel: CancellationToken) -> RunOutcome<Self::Value> {
        let linked = LinkedToken::new(&[cancel.clone()]).with_timeout(self.timeout);
        let result = HttpClient::shared()
            .send(Method::HEAD, &self.url, SendOptions::default(), &linked.token())
            .await;

        match result {
            Ok(response) if response.status().is_success() => {
                RunOutcome::Success(ResponseSummary::from_response(&response))
            }
            Ok(response) => RunOutcome::Failure(Some(DownloadError::http_status(
                &self.url,
                response.status().as_u16(),
            ))),
            Err(DownloadError::Cancelled) if cancel.is_cancelled() => RunOutcome::Cancelled,
            // The timeout token fired, not the request's own: the failure
            // stays inside the retry budget.
            Err(DownloadError::Cancelled) => {
                RunOutcome::Failure(Some(DownloadError::timeout(&self.url)))
            }
            Err(error) => RunOutcome::Failure(Some(error)),
        }
    }
}

#[async_trait]
impl Request for StatusRequest {
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

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_rejects_empty_and_invalid_urls() {
        let result = StatusRequest::new("", RequestOptions::default().with_auto_start(false));
        assert!(matches!(result, Err(DownloadError::InvalidUrl { .. })));

        let result = StatusRequest::new(
            "not a url",
            RequestOptions::default().with_auto_start(false),
        );
        assert!(matches!(result, Err(DownloadError::InvalidUrl { .. })));
    }

    #[tokio::test]
    async fn test_without_auto_start_stays_on_hold() {
        let request = StatusRequest::new(
            "https://example.com/resource",
            RequestOptions::default().with_auto_start(false),
        )
        .unwrap();
        assert_eq!(request.state(), super::super::RequestState::OnHold);
    }
}
