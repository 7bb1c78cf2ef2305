//! HTTP adapter over the shared transport.
//!
//! A thin boundary around `reqwest`: one process-wide client with connection
//! pooling, per-call Range / User-Agent / header overrides, and
//! cancellation-aware sends. Responses are returned once headers arrive;
//! bodies are streamed by the caller.

use std::sync::LazyLock;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_LENGTH, RANGE, USER_AGENT};
use reqwest::{Client, Method, Response};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::DownloadError;

/// Default HTTP connect timeout (30 seconds).
pub const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default User-Agent sent when the caller does not override it.
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
    AppleWebKit/537.36 (KHTML, like Gecko) Chrome/105.0.0.0 Safari/537.36";

static SHARED: LazyLock<HttpClient> = LazyLock::new(HttpClient::new);

/// A `Range: bytes=start-[end]` request header (inclusive end).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeHeader {
    /// First byte offset requested.
    pub start: u64,
    /// Last byte offset requested, or open-ended when `None`.
    pub end: Option<u64>,
}

impl RangeHeader {
    /// Renders the header value.
    #[must_use]
    pub fn to_header_value(self) -> String {
        match self.end {
            Some(end) => format!("bytes={}-{end}", self.start),
            None => format!("bytes={}-", self.start),
        }
    }
}

/// Per-send overrides: extra headers, byte range, and User-Agent.
#[derive(Debug, Clone, Copy, Default)]
pub struct SendOptions<'a> {
    /// Additional request headers, merged over the defaults.
    pub headers: &'a [(String, String)],
    /// Optional byte range to request.
    pub range: Option<RangeHeader>,
    /// User-Agent override; [`DEFAULT_USER_AGENT`] otherwise.
    pub user_agent: Option<&'a str>,
}

/// Summary of a completed response, handed to status-probe callbacks.
#[derive(Debug, Clone)]
pub struct ResponseSummary {
    /// HTTP status code.
    pub status: u16,
    /// Final URL after redirects.
    pub url: String,
    /// Response headers.
    pub headers: HeaderMap,
}

impl ResponseSummary {
    /// Captures status, final URL, and headers from a response.
    #[must_use]
    pub fn from_response(response: &Response) -> Self {
        Self {
            status: response.status().as_u16(),
            url: response.url().to_string(),
            headers: response.headers().clone(),
        }
    }
}

/// HTTP client for the engine; designed to be created once and shared.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
}

impl Default for HttpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpClient {
    /// Process-wide shared instance (connection pooling across requests).
    #[must_use]
    pub fn shared() -> &'static HttpClient {
        &SHARED
    }

    /// Creates a client with the default connect timeout.
    ///
    /// # Panics
    ///
    /// Panics if the builder rejects the static configuration, which does
    /// not happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn new() -> Self {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .gzip(true)
            .user_agent(DEFAULT_USER_AGENT)
            .build()
            .expect("failed to build HTTP client with static configuration");
        Self { client }
    }

    /// Sends a request and resolves once response headers arrive.
    ///
    /// The body is not read; stream it via [`Response::bytes_stream`]. Any
    /// status is returned as `Ok`; callers decide what a non-2xx means.
    ///
    /// # Errors
    ///
    /// [`DownloadError::Cancelled`] when `cancel` fires first,
    /// [`DownloadError::Timeout`] / [`DownloadError::Network`] for transport
    /// failures.
    pub async fn send(
        &self,
        method: Method,
        url: &str,
        options: SendOptions<'_>,
        cancel: &CancellationToken,
    ) -> Result<Response, DownloadError> {
        let mut request = self.client.request(method.clone(), url);
        if let Some(user_agent) = options.user_agent {
            request = request.header(USER_AGENT, user_agent);
        }
        if let Some(range) = options.range {
            request = request.header(RANGE, range.to_header_value());
        }
        for (name, value) in options.headers {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    request = request.header(name, value);
                }
                _ => warn!(header = %name, "skipping malformed request header"),
            }
        }

        debug!(%method, url, range = ?options.range, "sending request");
        let send = request.send();
        let response = tokio::select! {
            () = cancel.cancelled() => return Err(DownloadError::Cancelled),
            result = send => result.map_err(|e| {
                if e.is_timeout() {
                    DownloadError::timeout(url)
                } else {
                    DownloadError::network(url, e)
                }
            })?,
        };
        debug!(status = response.status().as_u16(), url, "response headers received");
        Ok(response)
    }

    /// Returns a reference to the underlying reqwest client.
    #[must_use]
    pub fn inner(&self) -> &Client {
        &self.client
    }
}

/// Parses the `Content-Length` header when present and numeric.
#[must_use]
pub fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
}

/// Reads a header as UTF-8, `None` when absent or non-textual.
#[must_use]
pub fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}
