//! Download request configuration: write modes, byte ranges, and the
//! extended option record.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::DownloadError;
use crate::request::{ProgressCallback, RequestOptions};

/// How the downloaded bytes meet an existing destination file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteMode {
    /// Truncate the destination and its part file before writing.
    Overwrite,
    /// Keep existing files; disambiguate the new one as `name(i).ext`.
    #[default]
    Create,
    /// Resume from the on-disk part file; the file length is the
    /// authoritative bytes-written count across restarts.
    Append,
}

/// A half-specified inclusive byte range.
///
/// `start < end` when both are set; a range with `start` set is
/// incompatible with [`WriteMode::Append`] (the mode is promoted to
/// `Create` at construction).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ByteRange {
    /// First requested byte offset.
    pub start: Option<u64>,
    /// Last requested byte offset (inclusive).
    pub end: Option<u64>,
}

impl ByteRange {
    /// The unbounded range.
    #[must_use]
    pub const fn full() -> Self {
        Self {
            start: None,
            end: None,
        }
    }

    /// Creates a validated range.
    ///
    /// # Errors
    ///
    /// [`DownloadError::InvalidRange`] when both bounds are set and
    /// `start >= end`.
    pub fn new(start: Option<u64>, end: Option<u64>) -> Result<Self, DownloadError> {
        if let (Some(start), Some(end)) = (start, end) {
            if start >= end {
                return Err(DownloadError::InvalidRange { start, end });
            }
        }
        Ok(Self { start, end })
    }

    /// Re-checks the `start < end` invariant.
    ///
    /// # Errors
    ///
    /// [`DownloadError::InvalidRange`] on violation.
    pub fn validate(self) -> Result<Self, DownloadError> {
        Self::new(self.start, self.end)
    }

    /// Range length when both bounds are set: `1 + end - start`.
    #[must_use]
    pub fn length(self) -> Option<u64> {
        match (self.start, self.end) {
            (Some(start), Some(end)) => Some(1 + end - start),
            _ => None,
        }
    }

    /// Effective number of bytes selected out of `total`.
    ///
    /// Canonical rule: both bounds → `end - start + 1`; only `start` →
    /// `total - start`; only `end` → `end + 1`; neither → `total`.
    #[must_use]
    pub fn effective_length(self, total: Option<u64>) -> Option<u64> {
        match (self.start, self.end) {
            (Some(start), Some(end)) => Some(end - start + 1),
            (Some(start), None) => total.map(|t| t.saturating_sub(start)),
            (None, Some(end)) => Some(end + 1),
            (None, None) => total,
        }
    }

    /// Drops an `end` bound that reaches past `total`, leaving the range
    /// open-ended.
    #[must_use]
    pub fn clamped_to(self, total: u64) -> Self {
        let end = self.end.filter(|&end| end < total);
        Self {
            start: self.start,
            end,
        }
    }
}

/// Options for a [`crate::load::LoadRequest`].
///
/// All fields are optional with documented defaults; the URL is the only
/// required input of a download.
pub struct LoadRequestOptions {
    /// Generic request options; the completion value is the final path.
    pub base: RequestOptions<PathBuf>,
    /// Write mode; `Create` by default.
    pub mode: WriteMode,
    /// Fixed filename; resolved from the response / URL when unset.
    pub file_name: Option<String>,
    /// Destination directory; the platform download folder (or the current
    /// directory) when unset.
    pub destination_dir: Option<PathBuf>,
    /// Directory for part files; the destination directory when unset.
    pub temp_dir: Option<PathBuf>,
    /// Extensions (with or without dot) that hard-reject a download.
    pub excluded_extensions: Vec<String>,
    /// Progress reporter receiving values in `0.0..=1.0`.
    pub progress: Option<ProgressCallback>,
    /// Per-attempt timeout for the HTTP send.
    pub timeout: Option<Duration>,
    /// Byte range to download.
    pub range: ByteRange,
    /// Number of parallel chunks; `0` or `1` downloads a single stream.
    pub chunks: u32,
    /// Merge finished chunks into the leading part file while later chunks
    /// are still downloading.
    pub merge_while_progress: bool,
    /// Extra request headers merged over the defaults.
    pub headers: Vec<(String, String)>,
    /// User-Agent override.
    pub user_agent: Option<String>,
}

impl Default for LoadRequestOptions {
    fn default() -> Self {
        Self {
            base: RequestOptions::default(),
            mode: WriteMode::default(),
            file_name: None,
            destination_dir: None,
            temp_dir: None,
            excluded_extensions: Vec::new(),
            progress: None,
            timeout: None,
            range: ByteRange::full(),
            chunks: 0,
            merge_while_progress: false,
            headers: Vec::new(),
            user_agent: None,
        }
    }
}

impl LoadRequestOptions {
    /// Creates options with all defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the write mode.
    #[must_use]
    pub fn with_mode(mut self, mode: WriteMode) -> Self {
        self.mode = mode;
        self
    }

    /// Fixes the output filename.
    #[must_use]
    pub fn with_file_name(mut self, file_name: impl Into<String>) -> Self {
        self.file_name = Some(file_name.into());
        self
    }

    /// Sets the destination directory.
    #[must_use]
    pub fn with_destination_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.destination_dir = Some(dir.into());
        self
    }

    /// Sets the part-file directory.
    #[must_use]
    pub fn with_temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = Some(dir.into());
        self
    }

    /// Sets the byte range.
    #[must_use]
    pub fn with_range(mut self, range: ByteRange) -> Self {
        self.range = range;
        self
    }

    /// Sets the chunk count.
    #[must_use]
    pub fn with_chunks(mut self, chunks: u32) -> Self {
        self.chunks = chunks;
        self
    }

    /// Enables incremental merging.
    #[must_use]
    pub fn with_merge_while_progress(mut self, enabled: bool) -> Self {
        self.merge_while_progress = enabled;
        self
    }

    /// Sets the progress reporter.
    #[must_use]
    pub fn with_progress(mut self, progress: impl Fn(f64) + Send + Sync + 'static) -> Self {
        self.progress = Some(std::sync::Arc::new(progress));
        self
    }

    /// Sets the per-send timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}
