//! Chunked, resumable file downloads.
//!
//! A [`LoadRequest`] walks probe → plan → (optional split) → fetch → write
//! → merge. The first worker invocation probes the content length with a
//! HEAD request; a chunked download splits the effective range into N
//! sibling requests sharing a [`chunk::ChunkCoordinator`], each writing a
//! `_<i>.chunk` part file that is merged into the leading part and renamed
//! into the destination. Part files on disk are the authoritative
//! bytes-written count, so `Append` mode resumes across process restarts.

pub(crate) mod chunk;
mod filename;
mod options;

pub use options::{ByteRange, LoadRequestOptions, WriteMode};

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::HeaderMap;
use reqwest::{Method, Response};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::error::DownloadError;
use crate::fsx;
use crate::http::{self, HttpClient, RangeHeader, SendOptions};
use crate::request::driver::{self, RunOutcome, Runnable};
use crate::request::{
    CompletedCallback, ProgressCallback, Request, RequestCore, RequestOptions, RequestState,
};
use crate::scheduler::Scheduler;
use crate::sync::LinkedToken;

use chunk::{ChunkCoordinator, PROGRESS_BIAS};

/// Outcome of one streaming pass over a response body.
enum StreamEnd {
    /// Server stream ended; total bytes now in the part file.
    Eof(u64),
    /// A cooperative pause was observed.
    Paused,
    /// Cancellation was observed.
    Cancelled,
    /// Transport or filesystem failure.
    Failed(DownloadError),
}

/// Membership of one request in a chunked family.
#[derive(Clone)]
struct ChunkMembership {
    coordinator: Arc<ChunkCoordinator>,
    index: usize,
}

/// A file download request (see module docs).
pub struct LoadRequest {
    core: RequestCore,
    options: LoadRequestOptions,
    url: String,
    parsed_url: Url,
    destination_dir: PathBuf,
    temp_dir: PathBuf,
    mode: WriteMode,
    file_name: Mutex<String>,
    filename_resolved: AtomicBool,
    bytes_written: AtomicU64,
    content_length: tokio::sync::OnceCell<Option<u64>>,
    range: Mutex<ByteRange>,
    original_range: ByteRange,
    membership: Mutex<Option<ChunkMembership>>,
    /// Root-held sibling anchors; the coordinator only keeps weak handles,
    /// so the family is freed with its root.
    family_hold: Mutex<Vec<Arc<LoadRequest>>>,
    on_completed: Mutex<Option<CompletedCallback<PathBuf>>>,
    progress: Mutex<Option<ProgressCallback>>,
    final_path: Mutex<Option<PathBuf>>,
}

impl LoadRequest {
    /// Creates a download request.
    ///
    /// Validation failures are immediate and terminal: empty/invalid URL,
    /// `range.start >= range.end`, an excluded extension on the fixed
    /// filename, or an unusable destination. A `range.start` together with
    /// `Append` mode is promoted to `Create`. With `chunks >= 2` the
    /// request becomes the root of a chunked family; `auto_start` starts
    /// the whole family.
    ///
    /// # Errors
    ///
    /// See above; all are [`DownloadError`] validation variants or `Io`.
    #[instrument(skip_all)]
    pub fn new(
        url: impl Into<String>,
        options: LoadRequestOptions,
    ) -> Result<Arc<Self>, DownloadError> {
        let url = url.into();
        if url.trim().is_empty() {
            return Err(DownloadError::invalid_url(url));
        }
        let parsed_url = Url::parse(&url).map_err(|_| DownloadError::invalid_url(url.clone()))?;
        let range = options.range.validate()?;

        let mut mode = options.mode;
        if mode == WriteMode::Append && range.start.is_some() {
            debug!("range start is set; promoting Append to Create");
            mode = WriteMode::Create;
        }

        let destination_dir = options
            .destination_dir
            .clone()
            .or_else(fsx::download_dir)
            .unwrap_or_else(|| PathBuf::from("."));
        let temp_dir = options
            .temp_dir
            .clone()
            .unwrap_or_else(|| destination_dir.clone());
        fsx::ensure_dir(&destination_dir)?;
        fsx::ensure_dir(&temp_dir)?;

        let initial_name = options
            .file_name
            .as_deref()
            .map(fsx::sanitize_file_name)
            .filter(|name| !name.is_empty());
        if let Some(name) = &initial_name {
            check_excluded(name, &options.excluded_extensions)?;
        }

        let handler = options
            .base
            .handler
            .clone()
            .unwrap_or_else(|| Scheduler::download().clone());
        let auto_start = options.base.auto_start;
        let chunks = options.chunks;

        let mut options = options;
        let on_completed = options.base.on_completed.take();
        let progress = options.progress.take();

        let request = Arc::new(Self {
            core: RequestCore::new(options.base.priority, Arc::clone(&handler)),
            url,
            parsed_url,
            destination_dir,
            temp_dir,
            mode,
            file_name: Mutex::new(initial_name.unwrap_or_default()),
            filename_resolved: AtomicBool::new(false),
            bytes_written: AtomicU64::new(0),
            content_length: tokio::sync::OnceCell::new(),
            range: Mutex::new(range),
            original_range: range,
            membership: Mutex::new(None),
            family_hold: Mutex::new(Vec::new()),
            on_completed: Mutex::new(None),
            progress: Mutex::new(None),
            final_path: Mutex::new(None),
            options,
        });

        if chunks >= 2 {
            let coordinator =
                ChunkCoordinator::new(chunks as usize, request.options.merge_while_progress);
            coordinator.capture_callbacks(progress, on_completed);

            let mut family: Vec<Weak<LoadRequest>> = vec![Arc::downgrade(&request)];
            let mut siblings = Vec::with_capacity(chunks as usize - 1);
            for index in 1..chunks as usize {
                let sibling = request.new_sibling(&coordinator, index);
                family.push(Arc::downgrade(&sibling));
                siblings.push(sibling);
            }
            coordinator.set_requests(family);
            // Siblings live as long as their root (or the scheduler, while
            // queued or running).
            *lock(&request.family_hold) = siblings;
            *lock(&request.membership) = Some(ChunkMembership {
                coordinator,
                index: 0,
            });
        } else {
            *lock(&request.on_completed) = on_completed;
            *lock(&request.progress) = progress;
            if mode == WriteMode::Append {
                request.bootstrap_append()?;
            }
        }

        if auto_start {
            Arc::clone(&request).start();
        }
        Ok(request)
    }

    /// The download URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// The current (possibly still unresolved) filename.
    #[must_use]
    pub fn file_name(&self) -> String {
        lock(&self.file_name).clone()
    }

    /// Bytes written to this request's part file so far.
    #[must_use]
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Acquire)
    }

    /// The destination the download resolves (or resolved) to.
    #[must_use]
    pub fn destination_path(&self) -> PathBuf {
        lock(&self.final_path)
            .clone()
            .unwrap_or_else(|| self.destination_dir.join(self.file_name()))
    }

    fn new_sibling(&self, coordinator: &Arc<ChunkCoordinator>, index: usize) -> Arc<Self> {
        let base = RequestOptions::<PathBuf> {
            priority: self.options.base.priority,
            auto_start: false,
            deploy_delay: None,
            try_counter: self.options.base.try_counter,
            delay_between_attempts: self.options.base.delay_between_attempts,
            cancel_token: None,
            handler: Some(Arc::clone(self.core.handler())),
            on_started: None,
            on_completed: None,
            on_failed: None,
            on_cancelled: None,
        };
        Arc::new(Self {
            core: RequestCore::new(self.options.base.priority, Arc::clone(self.core.handler())),
            options: LoadRequestOptions {
                base,
                mode: self.mode,
                file_name: self.options.file_name.clone(),
                destination_dir: Some(self.destination_dir.clone()),
                temp_dir: Some(self.temp_dir.clone()),
                excluded_extensions: Vec::new(),
                progress: None,
                timeout: self.options.timeout,
                range: self.original_range,
                chunks: self.options.chunks,
                merge_while_progress: self.options.merge_while_progress,
                headers: self.options.headers.clone(),
                user_agent: self.options.user_agent.clone(),
            },
            url: self.url.clone(),
            parsed_url: self.parsed_url.clone(),
            destination_dir: self.destination_dir.clone(),
            temp_dir: self.temp_dir.clone(),
            mode: self.mode,
            file_name: Mutex::new(self.file_name()),
            filename_resolved: AtomicBool::new(false),
            bytes_written: AtomicU64::new(0),
            content_length: tokio::sync::OnceCell::new(),
            range: Mutex::new(self.original_range),
            original_range: self.original_range,
            membership: Mutex::new(Some(ChunkMembership {
                coordinator: Arc::clone(coordinator),
                index,
            })),
            family_hold: Mutex::new(Vec::new()),
            on_completed: Mutex::new(None),
            progress: Mutex::new(None),
            final_path: Mutex::new(None),
        })
    }

    /// Adopts an existing part file (or moves a finished file into one) so
    /// `Append` resumes across restarts. Only possible at construction for
    /// caller-fixed filenames; response-resolved names redo this when the
    /// name is known.
    fn bootstrap_append(&self) -> Result<(), DownloadError> {
        let name = self.file_name();
        if name.is_empty() {
            return Ok(());
        }
        let part = self.part_path_for(&name);
        if let Ok(meta) = std::fs::metadata(&part) {
            self.bytes_written.store(meta.len(), Ordering::Release);
            return Ok(());
        }
        let destination = self.destination_dir.join(&name);
        if let Ok(meta) = std::fs::metadata(&destination) {
            std::fs::rename(&destination, &part).map_err(|e| DownloadError::io(&part, e))?;
            self.bytes_written.store(meta.len(), Ordering::Release);
        }
        Ok(())
    }

    fn membership_snapshot(&self) -> Option<ChunkMembership> {
        lock(&self.membership).clone()
    }

    fn part_path_for(&self, name: &str) -> PathBuf {
        match self.membership_snapshot() {
            Some(membership) => self
                .temp_dir
                .join(format!("{name}_{}.chunk", membership.index)),
            None => self.temp_dir.join(format!("{name}.part")),
        }
    }

    fn current_part_path(&self) -> PathBuf {
        self.part_path_for(&self.file_name())
    }

    fn chunk_part_path(&self, name: &str, index: usize) -> PathBuf {
        self.temp_dir.join(format!("{name}_{index}.chunk"))
    }

    /// Maps a transport error to a run outcome, distinguishing the
    /// request's own cancellation from a fired per-send timeout.
    fn map_failure(&self, error: DownloadError, cancel: &CancellationToken) -> RunOutcome<PathBuf> {
        match error {
            DownloadError::Cancelled if cancel.is_cancelled() => RunOutcome::Cancelled,
            DownloadError::Cancelled => {
                RunOutcome::Failure(Some(DownloadError::timeout(&self.url)))
            }
            error if error.is_validation() => RunOutcome::Fatal(Some(error)),
            error => RunOutcome::Failure(Some(error)),
        }
    }

    /// HEAD probe, memoized per request (and per family through the
    /// coordinator). A server that rejects HEAD yields an unknown length.
    async fn probe(
        &self,
        cancel: &CancellationToken,
        membership: Option<&ChunkMembership>,
    ) -> Result<Option<u64>, DownloadError> {
        match membership {
            Some(membership) => {
                let length = membership
                    .coordinator
                    .content_length()
                    .get_or_try_init(|| self.head_probe(cancel, Some(membership)))
                    .await?;
                Ok(*length)
            }
            None => {
                let length = self
                    .content_length
                    .get_or_try_init(|| self.head_probe(cancel, None))
                    .await?;
                Ok(*length)
            }
        }
    }

    async fn head_probe(
        &self,
        cancel: &CancellationToken,
        membership: Option<&ChunkMembership>,
    ) -> Result<Option<u64>, DownloadError> {
        let linked = self.linked_send_token(cancel);
        let send_options = SendOptions {
            headers: &self.options.headers,
            range: None,
            user_agent: self.options.user_agent.as_deref(),
        };
        let response = HttpClient::shared()
            .send(Method::HEAD, &self.url, send_options, &linked.token())
            .await?;
        if !response.status().is_success() {
            debug!(status = response.status().as_u16(), "HEAD rejected; length unknown");
            return Ok(None);
        }
        let length = http::content_length(response.headers());

        // The probing sibling resolves the family filename from the HEAD
        // headers so every chunk file shares one name.
        if let Some(membership) = membership {
            let name = self.resolve_family_name(response.headers());
            let _ = membership.coordinator.resolved_name().set(name);
        }
        Ok(length)
    }

    /// Resolves (and `Create`-disambiguates) the shared filename of a
    /// chunked family.
    fn resolve_family_name(&self, headers: &HeaderMap) -> String {
        let name = filename::resolve_file_name(
            self.options.file_name.as_deref(),
            headers,
            &self.parsed_url,
        );
        if self.mode == WriteMode::Create {
            fsx::unique_path(&self.destination_dir, &name)
                .file_name()
                .and_then(|n| n.to_str())
                .map_or(name, str::to_string)
        } else {
            name
        }
    }

    fn linked_send_token(&self, cancel: &CancellationToken) -> LinkedToken {
        let linked = LinkedToken::new(std::slice::from_ref(cancel));
        match self.options.timeout {
            Some(timeout) => linked.with_timeout(timeout),
            None => linked,
        }
    }

    async fn send_get(
        &self,
        range: Option<RangeHeader>,
        cancel: &CancellationToken,
    ) -> Result<Response, DownloadError> {
        let linked = self.linked_send_token(cancel);
        let send_options = SendOptions {
            headers: &self.options.headers,
            range,
            user_agent: self.options.user_agent.as_deref(),
        };
        HttpClient::shared()
            .send(Method::GET, &self.url, send_options, &linked.token())
            .await
    }

    fn report_progress(&self, bytes: u64, expected: Option<u64>, membership: Option<&ChunkMembership>) {
        match membership {
            Some(membership) => membership.coordinator.report_chunk_progress(membership.index, bytes),
            None => {
                if let (Some(expected), Some(progress)) = (expected, lock(&self.progress).as_ref())
                {
                    progress(bytes as f64 / (expected + PROGRESS_BIAS) as f64);
                }
            }
        }
    }

    /// Streams the response body into `part`, observing pause and
    /// cancellation between reads and feeding the scheduler's speed meter.
    async fn stream_to_part(
        &self,
        response: Response,
        part: &PathBuf,
        start_bytes: u64,
        expected: Option<u64>,
        membership: Option<&ChunkMembership>,
        cancel: &CancellationToken,
    ) -> StreamEnd {
        let file = match fsx::open_append(part).await {
            Ok(file) => file,
            Err(error) => return StreamEnd::Failed(error),
        };
        let mut writer = BufWriter::new(file);
        let mut stream = response.bytes_stream();
        let mut bytes = start_bytes;
        let started = Instant::now();

        loop {
            match self.core.state() {
                RequestState::Running => {}
                RequestState::Cancelled => {
                    let _ = writer.flush().await;
                    return StreamEnd::Cancelled;
                }
                _ => {
                    let _ = writer.flush().await;
                    return StreamEnd::Paused;
                }
            }
            if self.core.pause_requested() {
                let _ = writer.flush().await;
                return StreamEnd::Paused;
            }

            let next = tokio::select! {
                () = cancel.cancelled() => {
                    let _ = writer.flush().await;
                    return StreamEnd::Cancelled;
                }
                next = stream.next() => next,
            };
            match next {
                None => break,
                Some(Err(error)) => {
                    let _ = writer.flush().await;
                    return StreamEnd::Failed(DownloadError::network(&self.url, error));
                }
                Some(Ok(data)) => {
                    if let Err(error) = writer.write_all(&data).await {
                        return StreamEnd::Failed(DownloadError::io(part.clone(), error));
                    }
                    bytes += data.len() as u64;
                    self.bytes_written.store(bytes, Ordering::Release);
                    if let Some(membership) = membership {
                        membership.coordinator.add_bytes(data.len() as u64);
                    }
                    self.report_progress(bytes, expected, membership);
                }
            }
        }

        if let Err(error) = writer.flush().await {
            return StreamEnd::Failed(DownloadError::io(part.clone(), error));
        }
        let elapsed = started.elapsed().as_secs_f64();
        if elapsed > 0.0 && bytes > start_bytes {
            self.core
                .handler()
                .add_speed((bytes - start_bytes) as f64 / elapsed);
        }
        StreamEnd::Eof(bytes)
    }

    // ---------------- single-stream flow ----------------

    async fn run_single(&self, cancel: CancellationToken) -> RunOutcome<PathBuf> {
        let total = match self.probe(&cancel, None).await {
            Ok(total) => total,
            Err(error) => return self.map_failure(error, &cancel),
        };
        if let Some(total) = total {
            let mut range = lock(&self.range);
            *range = range.clamped_to(total);
        }
        let range = *lock(&self.range);
        let mut expected = range.effective_length(total);

        // The part file on disk is authoritative for resumed attempts.
        if self.filename_resolved.load(Ordering::Acquire) {
            let part = self.current_part_path();
            let on_disk = fsx::file_len(&part).await.unwrap_or(0);
            self.bytes_written.store(on_disk, Ordering::Release);
        }
        let pre_bytes = self.bytes_written();

        if let Some(expected) = expected {
            if pre_bytes >= expected && self.filename_resolved.load(Ordering::Acquire) {
                return self.finalize_single().await;
            }
        }

        let offset = range.start.unwrap_or(0) + pre_bytes;
        let range_header = (offset > 0 || range.end.is_some()).then_some(RangeHeader {
            start: offset,
            end: range.end,
        });
        let response = match self.send_get(range_header, &cancel).await {
            Ok(response) => response,
            Err(error) => return self.map_failure(error, &cancel),
        };
        let status = response.status();

        if status.as_u16() == 416 && expected.is_some_and(|e| pre_bytes >= e) {
            return self.finalize_single().await;
        }
        if !status.is_success() {
            return RunOutcome::Failure(Some(DownloadError::http_status(
                &self.url,
                status.as_u16(),
            )));
        }

        if let Err(error) = self.resolve_target(response.headers(), total).await {
            return self.map_failure(error, &cancel);
        }
        let mut bytes = self.bytes_written();
        if bytes != pre_bytes {
            // Append resolution adopted an existing part after the GET was
            // already in flight; redo the request with the proper offset.
            return RunOutcome::Reschedule;
        }

        // A 200 on a ranged request means the server ignored the range:
        // restart the part from scratch.
        if range_header.is_some() && status.as_u16() == 200 && bytes > 0 {
            let part = self.current_part_path();
            if let Err(error) = fsx::create_truncate(&part).await {
                return self.map_failure(error, &cancel);
            }
            self.bytes_written.store(0, Ordering::Release);
            bytes = 0;
        }

        if expected.is_none() {
            expected = match status.as_u16() {
                206 => http::content_length(response.headers()).map(|len| len + bytes),
                _ => http::content_length(response.headers()),
            };
        }

        let part = self.current_part_path();
        match self
            .stream_to_part(response, &part, bytes, expected, None, &cancel)
            .await
        {
            StreamEnd::Eof(written) => {
                if let Some(expected) = expected {
                    if written < expected {
                        debug!(written, expected, "stream ended early");
                        return RunOutcome::Failure(None);
                    }
                }
                self.finalize_single().await
            }
            StreamEnd::Paused => RunOutcome::Suspended,
            StreamEnd::Cancelled => RunOutcome::Cancelled,
            StreamEnd::Failed(error) => self.map_failure(error, &cancel),
        }
    }

    /// Resolves the filename from the response and applies the write mode.
    /// Runs once per request; later attempts reuse the resolution.
    async fn resolve_target(
        &self,
        headers: &HeaderMap,
        total: Option<u64>,
    ) -> Result<(), DownloadError> {
        if self.filename_resolved.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut name = filename::resolve_file_name(
            self.options.file_name.as_deref(),
            headers,
            &self.parsed_url,
        );
        check_excluded(&name, &self.options.excluded_extensions)?;

        match self.mode {
            WriteMode::Overwrite => {
                fsx::remove_if_exists(&self.destination_dir.join(&name)).await?;
                let part = self.temp_dir.join(format!("{name}.part"));
                fsx::create_truncate(&part).await?;
                self.bytes_written.store(0, Ordering::Release);
            }
            WriteMode::Create => {
                name = self.reserve_create_name(name).await?;
            }
            WriteMode::Append => {
                let part = self.temp_dir.join(format!("{name}.part"));
                if fsx::file_len(&part).await.is_none() {
                    let destination = self.destination_dir.join(&name);
                    if fsx::file_len(&destination).await.is_some() {
                        fsx::atomic_move(&destination, &part).await?;
                    }
                }
                let mut bytes = fsx::file_len(&part).await.unwrap_or(0);
                let expected = lock(&self.range).effective_length(total);
                if expected.is_some_and(|e| bytes > e) {
                    warn!(bytes, "part exceeds content length; restarting");
                    fsx::create_truncate(&part).await?;
                    bytes = 0;
                }
                self.bytes_written.store(bytes, Ordering::Release);
            }
        }
        *lock(&self.file_name) = name;
        Ok(())
    }

    /// Picks a free `name(i).ext` and reserves it by creating the part
    /// file with `create_new`; a racing loser sees `AlreadyExists` and
    /// moves on to the next candidate.
    async fn reserve_create_name(&self, name: String) -> Result<String, DownloadError> {
        let (stem, extension) = fsx::split_name(&name);
        let mut candidate = name.clone();
        for i in 0.. {
            if i > 0 {
                candidate = format!("{stem}({i}){extension}");
            }
            let destination = self.destination_dir.join(&candidate);
            let part = self.temp_dir.join(format!("{candidate}.part"));
            if destination.exists() {
                continue;
            }
            match tokio::fs::OpenOptions::new()
                .create_new(true)
                .write(true)
                .open(&part)
                .await
            {
                Ok(_) => return Ok(candidate),
                Err(error) if error.kind() == std::io::ErrorKind::AlreadyExists => {}
                Err(error) => return Err(DownloadError::io(part, error)),
            }
        }
        unreachable!("unbounded suffix search")
    }

    async fn finalize_single(&self) -> RunOutcome<PathBuf> {
        let name = self.file_name();
        let part = self.temp_dir.join(format!("{name}.part"));
        let destination = self.destination_dir.join(&name);
        if fsx::file_len(&part).await.is_some() {
            if let Err(error) = fsx::atomic_move(&part, &destination).await {
                return RunOutcome::Failure(Some(error));
            }
        } else if fsx::file_len(&destination).await.is_none() {
            return RunOutcome::Failure(None);
        }
        if let Some(progress) = lock(&self.progress).as_ref() {
            progress(1.0);
        }
        info!(path = %destination.display(), "download complete");
        *lock(&self.final_path) = Some(destination.clone());
        RunOutcome::Success(destination)
    }

    // ---------------- chunked flow ----------------

    async fn run_chunk(
        &self,
        cancel: CancellationToken,
        membership: ChunkMembership,
    ) -> RunOutcome<PathBuf> {
        let coordinator = &membership.coordinator;
        let total = match self.probe(&cancel, Some(&membership)).await {
            Ok(total) => total,
            Err(error) => return self.map_failure(error, &cancel),
        };
        // Chunk planning needs a concrete length.
        let Some(total) = total else {
            return self.trigger_fallback(&membership, None, &cancel).await;
        };

        {
            let mut range = lock(&self.range);
            *range = range.clamped_to(total);
        }
        if !coordinator.slots_planned() {
            let range = *lock(&self.range);
            let start = range.start.unwrap_or(0);
            let length = range.effective_length(Some(total)).unwrap_or(0);
            coordinator.plan_chunks(start, length);
        }
        let Some(slot) = coordinator.slot(membership.index) else {
            return RunOutcome::Fatal(None);
        };

        // Adopt the family filename resolved by the probing sibling.
        let name = coordinator
            .resolved_name()
            .get()
            .cloned()
            .unwrap_or_else(|| {
                filename::resolve_file_name(
                    self.options.file_name.as_deref(),
                    &HeaderMap::new(),
                    &self.parsed_url,
                )
            });
        if let Err(error) = check_excluded(&name, &self.options.excluded_extensions) {
            return RunOutcome::Fatal(Some(error));
        }
        *lock(&self.file_name) = name.clone();

        // First-attempt file preparation per write mode.
        let part = self.chunk_part_path(&name, membership.index);
        if !self.filename_resolved.swap(true, Ordering::AcqRel) {
            if membership.index == 0 && self.mode == WriteMode::Overwrite {
                if let Err(error) = fsx::remove_if_exists(&self.destination_dir.join(&name)).await
                {
                    return self.map_failure(error, &cancel);
                }
            }
            if self.mode != WriteMode::Append {
                if let Err(error) = fsx::create_truncate(&part).await {
                    return self.map_failure(error, &cancel);
                }
            }
        }

        // A finished chunk (a re-run after merge deferral or a retried
        // merge) skips the fetch phase; its part may already hold merged
        // trailing chunks.
        if slot.finished {
            if coordinator.merge_while_progress() || coordinator.all_finished() {
                if let Err(error) = self.merge_ready_chunks(&membership).await {
                    return self.map_failure(error, &cancel);
                }
            }
            if membership.index != 0 {
                *lock(&self.final_path) = Some(part.clone());
                return RunOutcome::Success(part);
            }
            return self.root_finalize(&membership, &cancel).await;
        }

        // The chunk file is authoritative for resume.
        let bytes = fsx::file_len(&part).await.unwrap_or(0);
        self.bytes_written.store(bytes, Ordering::Release);
        if bytes > slot.length {
            warn!(bytes, chunk_length = slot.length, "chunk part exceeds its range");
            return RunOutcome::Fatal(None);
        }

        if bytes < slot.length {
            let range_header = RangeHeader {
                start: slot.start + bytes,
                end: Some(slot.end),
            };
            let response = match self.send_get(Some(range_header), &cancel).await {
                Ok(response) => response,
                Err(error) => return self.map_failure(error, &cancel),
            };
            let status = response.status().as_u16();
            if status != 206 {
                if status == 200 || status == 416 {
                    // The server does not support ranges.
                    return self
                        .trigger_fallback(&membership, Some(response), &cancel)
                        .await;
                }
                return RunOutcome::Failure(Some(DownloadError::http_status(&self.url, status)));
            }

            match self
                .stream_to_part(
                    response,
                    &part,
                    bytes,
                    Some(slot.length),
                    Some(&membership),
                    &cancel,
                )
                .await
            {
                StreamEnd::Eof(written) => {
                    if written < slot.length {
                        debug!(written, expected = slot.length, "chunk stream ended early");
                        return RunOutcome::Failure(None);
                    }
                }
                StreamEnd::Paused => return RunOutcome::Suspended,
                StreamEnd::Cancelled => return RunOutcome::Cancelled,
                StreamEnd::Failed(error) => return self.map_failure(error, &cancel),
            }
        }

        coordinator.mark_finished(membership.index);
        if coordinator.merge_while_progress() || coordinator.all_finished() {
            if let Err(error) = self.merge_ready_chunks(&membership).await {
                return self.map_failure(error, &cancel);
            }
        }

        if membership.index != 0 {
            *lock(&self.final_path) = Some(part.clone());
            return RunOutcome::Success(part);
        }
        self.root_finalize(&membership, &cancel).await
    }

    /// Root epilogue: once every chunk is merged behind the leading part,
    /// rename it into the destination. While siblings are still working,
    /// the root parks in `Waiting` (releasing its worker slot) and is
    /// re-enqueued by the merge latch.
    async fn root_finalize(
        &self,
        membership: &ChunkMembership,
        cancel: &CancellationToken,
    ) -> RunOutcome<PathBuf> {
        let coordinator = &membership.coordinator;
        if coordinator.fallback_started() {
            self.recycle_as_single(membership).await;
            return RunOutcome::Reschedule;
        }
        if coordinator.aborted() {
            return RunOutcome::Fatal(None);
        }
        if !coordinator.merge_complete() {
            let coordinator = Arc::clone(coordinator);
            return RunOutcome::Defer(Box::pin(async move {
                coordinator.wait_merge_done().await;
            }));
        }

        let name = self.file_name();
        let lead = self.chunk_part_path(&name, 0);
        let destination = self.destination_dir.join(&name);
        if let Err(error) = fsx::atomic_move(&lead, &destination).await {
            return self.map_failure(error, cancel);
        }
        info!(path = %destination.display(), chunks = coordinator.chunk_count(), "chunked download complete");
        *lock(&self.final_path) = Some(destination.clone());
        RunOutcome::Success(destination)
    }

    /// Appends every copy-ready chunk (in index order) onto the leading
    /// part file and deletes the source. Serialized by the coordinator's
    /// copy latch; a busy latch means another sibling is merging.
    async fn merge_ready_chunks(&self, membership: &ChunkMembership) -> Result<(), DownloadError> {
        let coordinator = &membership.coordinator;
        if !coordinator.begin_copy() {
            return Ok(());
        }
        let result = self.merge_loop(coordinator).await;
        coordinator.end_copy();
        result
    }

    async fn merge_loop(&self, coordinator: &Arc<ChunkCoordinator>) -> Result<(), DownloadError> {
        let name = self.file_name();
        let lead = self.chunk_part_path(&name, 0);
        while let Some(index) = coordinator.next_copy_candidate() {
            if !coordinator.merge_while_progress() && !coordinator.all_finished() {
                break;
            }
            let source = self.chunk_part_path(&name, index);
            // Zero-length chunks never created a part file.
            if fsx::file_len(&source).await.is_none() {
                coordinator.mark_copied(index);
                continue;
            }
            let mut output = fsx::open_append(&lead).await?;
            let mut input = fsx::open_read(&source).await?;
            tokio::io::copy(&mut input, &mut output)
                .await
                .map_err(|e| DownloadError::io(&source, e))?;
            output
                .flush()
                .await
                .map_err(|e| DownloadError::io(&lead, e))?;
            fsx::remove_if_exists(&source).await?;
            debug!(chunk = index, "chunk merged");
            coordinator.mark_copied(index);
        }
        Ok(())
    }

    /// Switches the family into single-stream mode after the server turned
    /// down a ranged request: siblings are cancelled, the root is recycled
    /// and, when the refusal carried the full body, resumes with it.
    async fn trigger_fallback(
        &self,
        membership: &ChunkMembership,
        response: Option<Response>,
        cancel: &CancellationToken,
    ) -> RunOutcome<PathBuf> {
        let coordinator = &membership.coordinator;
        let first = coordinator.begin_fallback();
        if first {
            info!("server does not support byte ranges; falling back to a single stream");
            for (index, sibling) in coordinator.indexed_siblings() {
                if index != 0 && index != membership.index {
                    sibling.cancel();
                }
            }
            // Wake a root parked on the merge latch.
            coordinator.signal_merge_done();
        }
        if membership.index != 0 {
            return RunOutcome::Cancelled;
        }

        self.recycle_as_single(membership).await;
        if let Some(response) = response {
            if response.status().as_u16() == 200 {
                // The 200 body is the whole file; stream it directly.
                let expected = http::content_length(response.headers());
                let part = self.current_part_path();
                if let Err(error) = fsx::create_truncate(&part).await {
                    return self.map_failure(error, cancel);
                }
                return match self
                    .stream_to_part(response, &part, 0, expected, None, cancel)
                    .await
                {
                    StreamEnd::Eof(written) => {
                        if expected.is_some_and(|e| written < e) {
                            return RunOutcome::Failure(None);
                        }
                        self.finalize_single().await
                    }
                    StreamEnd::Paused => RunOutcome::Suspended,
                    StreamEnd::Cancelled => RunOutcome::Cancelled,
                    StreamEnd::Failed(error) => self.map_failure(error, cancel),
                };
            }
        }
        RunOutcome::Reschedule
    }

    /// Strips chunk membership from the root: restores the captured
    /// callbacks, clears the chunk files, and resets progress so the next
    /// attempt runs as a plain single-stream download.
    async fn recycle_as_single(&self, membership: &ChunkMembership) {
        let coordinator = &membership.coordinator;
        let (progress, on_completed) = coordinator.restore_callbacks();
        if progress.is_some() {
            *lock(&self.progress) = progress;
        }
        if on_completed.is_some() {
            *lock(&self.on_completed) = on_completed;
        }
        if let Some(total) = coordinator.content_length().get() {
            let _ = self.content_length.set(*total);
        }
        if let Some(name) = coordinator.resolved_name().get() {
            *lock(&self.file_name) = name.clone();
        }

        let name = self.file_name();
        if !name.is_empty() {
            for index in 0..coordinator.chunk_count() {
                let _ = fsx::remove_if_exists(&self.chunk_part_path(&name, index)).await;
            }
            let _ = fsx::remove_if_exists(&self.temp_dir.join(format!("{name}.part"))).await;
        }
        self.bytes_written.store(0, Ordering::Release);
        *lock(&self.range) = self.original_range;
        *lock(&self.membership) = None;
        lock(&self.family_hold).clear();
    }
}

#[async_trait]
impl Runnable for LoadRequest {
    type Value = PathBuf;

    fn options(&self) -> &RequestOptions<PathBuf> {
        &self.options.base
    }

    fn family(&self) -> Vec<Arc<dyn Request>> {
        match self.membership_snapshot() {
            Some(membership) if membership.index == 0 => membership
                .coordinator
                .siblings_except(0)
                .into_iter()
                .map(|sibling| sibling as Arc<dyn Request>)
                .collect(),
            _ => Vec::new(),
        }
    }

    fn on_terminal(&self, state: RequestState) {
        match state {
            RequestState::Completed => {
                let path = lock(&self.final_path).clone();
                if let Some(path) = path {
                    if let Some(callback) = lock(&self.on_completed).take() {
                        callback(&path);
                    }
                    if let Some(membership) = self.membership_snapshot() {
                        if membership.index == 0 {
                            membership.coordinator.fire_completed(&path);
                        }
                    }
                }
            }
            RequestState::Failed | RequestState::Cancelled => {
                if let Some(membership) = self.membership_snapshot() {
                    if !membership.coordinator.fallback_started() {
                        membership.coordinator.mark_aborted();
                    }
                    if membership.index == 0 && state == RequestState::Failed {
                        for sibling in membership.coordinator.siblings_except(0) {
                            sibling.cancel();
                        }
                    }
                }
            }
            _ => return,
        }
        // Terminal root: the sibling anchors are no longer needed.
        lock(&self.family_hold).clear();
    }

    async fn run(self: Arc<Self>, cancel: CancellationToken) -> RunOutcome<PathBuf> {
        // A sibling may have switched the family into fallback while this
        // request sat in the queue.
        if let Some(membership) = self.membership_snapshot() {
            if membership.coordinator.fallback_started() {
                if membership.index == 0 {
                    self.recycle_as_single(&membership).await;
                } else {
                    return RunOutcome::Cancelled;
                }
            } else if membership.coordinator.aborted() {
                return RunOutcome::Fatal(None);
            }
        }
        match self.membership_snapshot() {
            Some(membership) => self.run_chunk(cancel, membership).await,
            None => self.run_single(cancel).await,
        }
    }
}

#[async_trait]
impl Request for LoadRequest {
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

fn check_excluded(name: &str, excluded: &[String]) -> Result<(), DownloadError> {
    let lower = name.to_lowercase();
    for extension in excluded {
        let suffix = format!(".{}", extension.trim_start_matches('.').to_lowercase());
        if lower.ends_with(&suffix) {
            return Err(DownloadError::ExcludedExtension {
                file_name: name.to_string(),
                extension: extension.clone(),
            });
        }
    }
    Ok(())
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn standalone_options(dir: &TempDir) -> LoadRequestOptions {
        let mut options = LoadRequestOptions::new()
            .with_destination_dir(dir.path())
            .with_file_name("file.bin");
        options.base = RequestOptions::default()
            .with_auto_start(false)
            .with_handler(Scheduler::new_standalone());
        options
    }

    #[tokio::test]
    async fn test_rejects_invalid_url() {
        let dir = TempDir::new().unwrap();
        let result = LoadRequest::new("", standalone_options(&dir));
        assert!(matches!(result, Err(DownloadError::InvalidUrl { .. })));
        let result = LoadRequest::new("::nope::", standalone_options(&dir));
        assert!(matches!(result, Err(DownloadError::InvalidUrl { .. })));
    }

    #[tokio::test]
    async fn test_rejects_inverted_range() {
        let dir = TempDir::new().unwrap();
        let mut options = standalone_options(&dir);
        options.range = ByteRange {
            start: Some(10),
            end: Some(5),
        };
        let result = LoadRequest::new("https://example.com/f.bin", options);
        assert!(matches!(result, Err(DownloadError::InvalidRange { .. })));
    }

    #[tokio::test]
    async fn test_append_with_range_start_promotes_to_create() {
        let dir = TempDir::new().unwrap();
        let mut options = standalone_options(&dir).with_mode(WriteMode::Append);
        options.range = ByteRange {
            start: Some(100),
            end: None,
        };
        let request = LoadRequest::new("https://example.com/f.bin", options).unwrap();
        assert_eq!(request.mode, WriteMode::Create);
    }

    #[tokio::test]
    async fn test_rejects_excluded_extension_on_fixed_name() {
        let dir = TempDir::new().unwrap();
        let mut options = standalone_options(&dir);
        options.excluded_extensions = vec!["exe".to_string()];
        options.file_name = Some("payload.exe".to_string());
        let result = LoadRequest::new("https://example.com/payload.exe", options);
        assert!(matches!(
            result,
            Err(DownloadError::ExcludedExtension { .. })
        ));
    }

    #[tokio::test]
    async fn test_append_bootstrap_adopts_part_file() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("file.bin.part"), b"12345").unwrap();

        let options = standalone_options(&dir).with_mode(WriteMode::Append);
        let request = LoadRequest::new("https://example.com/file.bin", options).unwrap();
        assert_eq!(request.bytes_written(), 5);
    }

    #[tokio::test]
    async fn test_append_bootstrap_moves_finished_file_into_part() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("file.bin"), b"abcdef").unwrap();

        let options = standalone_options(&dir).with_mode(WriteMode::Append);
        let request = LoadRequest::new("https://example.com/file.bin", options).unwrap();
        assert_eq!(request.bytes_written(), 6);
        assert!(dir.path().join("file.bin.part").exists());
        assert!(!dir.path().join("file.bin").exists());
    }

    #[tokio::test]
    async fn test_chunked_family_is_constructed() {
        let dir = TempDir::new().unwrap();
        let options = standalone_options(&dir).with_chunks(4);
        let request = LoadRequest::new("https://example.com/file.bin", options).unwrap();

        let membership = request.membership_snapshot().unwrap();
        assert_eq!(membership.index, 0);
        assert_eq!(membership.coordinator.chunk_count(), 4);
        assert_eq!(membership.coordinator.siblings_except(0).len(), 3);
        assert_eq!(request.family().len(), 3);
    }

    #[tokio::test]
    async fn test_chunk_part_paths() {
        let dir = TempDir::new().unwrap();
        let options = standalone_options(&dir).with_chunks(2);
        let request = LoadRequest::new("https://example.com/file.bin", options).unwrap();
        assert_eq!(
            request.current_part_path(),
            dir.path().join("file.bin_0.chunk")
        );
    }

    #[test]
    fn test_check_excluded_normalizes_dots_and_case() {
        assert!(check_excluded("a.EXE", &["exe".to_string()]).is_err());
        assert!(check_excluded("a.exe", &[".exe".to_string()]).is_err());
        assert!(check_excluded("a.pdf", &["exe".to_string()]).is_ok());
    }
}
