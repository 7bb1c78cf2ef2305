//! Error types for the download engine.
//!
//! This module defines structured errors for all engine operations,
//! providing context-rich error messages for debugging and user feedback.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while executing a request or writing its output.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// Network-level error (DNS resolution, connection refused, TLS errors, etc.)
    #[error("network error requesting {url}: {source}")]
    Network {
        /// The URL that failed.
        url: String,
        /// The underlying network error.
        #[source]
        source: reqwest::Error,
    },

    /// Request timed out before completion.
    #[error("timeout requesting {url}")]
    Timeout {
        /// The URL that timed out.
        url: String,
    },

    /// The request was cancelled at a suspension point.
    #[error("request cancelled")]
    Cancelled,

    /// HTTP error response (4xx client errors, 5xx server errors).
    #[error("HTTP {status} requesting {url}")]
    HttpStatus {
        /// The URL that returned an error status.
        url: String,
        /// The HTTP status code.
        status: u16,
    },

    /// File system error (create file, move, write, flush, etc.)
    #[error("IO error at {path}: {source}")]
    Io {
        /// The file path where the error occurred.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The provided URL is malformed, empty, or invalid.
    #[error("invalid URL: {url}")]
    InvalidUrl {
        /// The invalid URL string.
        url: String,
    },

    /// A byte range where `start >= end`.
    #[error("invalid byte range: start {start} must be below end {end}")]
    InvalidRange {
        /// Range start.
        start: u64,
        /// Range end.
        end: u64,
    },

    /// The resolved filename ends with an extension the caller rejected.
    #[error("file name {file_name:?} has excluded extension {extension:?}")]
    ExcludedExtension {
        /// The rejected filename.
        file_name: String,
        /// The matching excluded extension.
        extension: String,
    },

    /// A destination or temporary path failed validation.
    #[error("invalid path: {path}")]
    InvalidPath {
        /// The offending path.
        path: PathBuf,
    },
}

impl DownloadError {
    /// Creates a network error from a reqwest error.
    pub fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Network {
            url: url.into(),
            source,
        }
    }

    /// Creates a timeout error.
    pub fn timeout(url: impl Into<String>) -> Self {
        Self::Timeout { url: url.into() }
    }

    /// Creates an HTTP status error.
    pub fn http_status(url: impl Into<String>, status: u16) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
        }
    }

    /// Creates an IO error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Creates an invalid URL error.
    pub fn invalid_url(url: impl Into<String>) -> Self {
        Self::InvalidUrl { url: url.into() }
    }

    /// Returns the HTTP status carried by this error, if any.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Returns `true` for errors that no retry can fix.
    ///
    /// Validation failures are terminal for a request; transport, timeout,
    /// HTTP status, and IO errors are left to the retry budget.
    #[must_use]
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidUrl { .. }
                | Self::InvalidRange { .. }
                | Self::ExcludedExtension { .. }
                | Self::InvalidPath { .. }
        )
    }
}

// Note on From trait implementations:
// We intentionally do NOT implement `From<reqwest::Error>` or `From<std::io::Error>`
// because the variants require context (url, path) that the source errors
// don't provide. The helper constructors are the pattern here.

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_display_contains_url() {
        let error = DownloadError::timeout("https://example.com/file.bin");
        assert!(error.to_string().contains("timeout"));
        assert!(error.to_string().contains("https://example.com/file.bin"));
    }

    #[test]
    fn test_http_status_display_and_accessor() {
        let error = DownloadError::http_status("https://example.com/file.bin", 404);
        let msg = error.to_string();
        assert!(msg.contains("404"), "Expected '404' in: {msg}");
        assert_eq!(error.status(), Some(404));
    }

    #[test]
    fn test_io_display_contains_path() {
        let io_error = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "access denied");
        let error = DownloadError::io(PathBuf::from("/tmp/part.bin"), io_error);
        assert!(error.to_string().contains("/tmp/part.bin"));
    }

    #[test]
    fn test_validation_classification() {
        assert!(DownloadError::invalid_url("").is_validation());
        assert!(DownloadError::InvalidRange { start: 9, end: 3 }.is_validation());
        assert!(!DownloadError::timeout("http://x").is_validation());
        assert!(!DownloadError::Cancelled.is_validation());
    }
}
