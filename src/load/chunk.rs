//! Shared state of a chunked download family.
//!
//! All N sibling requests of one chunked download share a coordinator:
//! per-chunk ranges and progress, the memoized content length, the resolved
//! filename, the CAS-guarded copy latch, and the root request's original
//! notification callbacks. Sibling handles are weak; requests live as long
//! as their owner and the scheduler retain them.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::watch;
use tracing::debug;

use crate::request::{CompletedCallback, ProgressCallback};

use super::LoadRequest;

/// Chunk progress forwarding interval: every N-th per-chunk update reaches
/// the user-visible reporter.
const PROGRESS_FORWARD_EVERY: u32 = 5;

/// Progress denominator bias preventing premature 100% reports before
/// finalization.
pub(crate) const PROGRESS_BIAS: u64 = 10;

/// Byte range and merge bookkeeping of one chunk.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ChunkSlot {
    /// First byte (absolute offset).
    pub start: u64,
    /// Last byte (absolute offset, inclusive).
    pub end: u64,
    /// Chunk length in bytes.
    pub length: u64,
    /// Download progress of this chunk in `0.0..=1.0`.
    pub percentage: f64,
    /// Chunk fully written to its part file.
    pub finished: bool,
    /// Chunk appended into the leading part file.
    pub copied: bool,
}

/// Shared state across the siblings of one chunked download.
pub(crate) struct ChunkCoordinator {
    slots: Mutex<Vec<ChunkSlot>>,
    requests: Mutex<Vec<Weak<LoadRequest>>>,
    bytes_written: AtomicU64,
    content_length: tokio::sync::OnceCell<Option<u64>>,
    resolved_name: tokio::sync::OnceCell<String>,
    is_copying: AtomicBool,
    fallback: AtomicBool,
    aborted: AtomicBool,
    merge_done: watch::Sender<bool>,
    progress: Mutex<Option<ProgressCallback>>,
    on_completed: Mutex<Option<CompletedCallback<PathBuf>>>,
    progress_ticks: AtomicU32,
    merge_while_progress: bool,
    chunk_count: usize,
}

impl ChunkCoordinator {
    pub(crate) fn new(chunk_count: usize, merge_while_progress: bool) -> Arc<Self> {
        let (merge_done, _) = watch::channel(false);
        Arc::new(Self {
            slots: Mutex::new(Vec::new()),
            requests: Mutex::new(Vec::new()),
            bytes_written: AtomicU64::new(0),
            content_length: tokio::sync::OnceCell::new(),
            resolved_name: tokio::sync::OnceCell::new(),
            is_copying: AtomicBool::new(false),
            fallback: AtomicBool::new(false),
            aborted: AtomicBool::new(false),
            merge_done,
            progress: Mutex::new(None),
            on_completed: Mutex::new(None),
            progress_ticks: AtomicU32::new(0),
            merge_while_progress,
            chunk_count,
        })
    }

    pub(crate) fn chunk_count(&self) -> usize {
        self.chunk_count
    }

    pub(crate) fn merge_while_progress(&self) -> bool {
        self.merge_while_progress
    }

    /// Memoized effective content length; `None` inside means the server
    /// did not reveal one.
    pub(crate) fn content_length(&self) -> &tokio::sync::OnceCell<Option<u64>> {
        &self.content_length
    }

    /// Memoized resolved filename shared by all part files.
    pub(crate) fn resolved_name(&self) -> &tokio::sync::OnceCell<String> {
        &self.resolved_name
    }

    pub(crate) fn set_requests(&self, requests: Vec<Weak<LoadRequest>>) {
        *lock(&self.requests) = requests;
    }

    /// Upgraded sibling handles, excluding index `except`.
    pub(crate) fn siblings_except(&self, except: usize) -> Vec<Arc<LoadRequest>> {
        self.indexed_siblings()
            .into_iter()
            .filter(|(i, _)| *i != except)
            .map(|(_, sibling)| sibling)
            .collect()
    }

    /// Upgraded sibling handles paired with their chunk index.
    pub(crate) fn indexed_siblings(&self) -> Vec<(usize, Arc<LoadRequest>)> {
        lock(&self.requests)
            .iter()
            .enumerate()
            .filter_map(|(i, weak)| weak.upgrade().map(|sibling| (i, sibling)))
            .collect()
    }

    /// Deterministic split of `[start, start + length)` into the chunk
    /// slots; chunk `N-1` extends to the final byte. Idempotent.
    pub(crate) fn plan_chunks(&self, start: u64, length: u64) {
        let mut slots = lock(&self.slots);
        if !slots.is_empty() {
            return;
        }
        let n = self.chunk_count as u64;
        let mut planned = Vec::with_capacity(self.chunk_count);
        for i in 0..n {
            let lo = start + i * length / n;
            // Exclusive upper bound; the last chunk extends to the end.
            let next = if i == n - 1 {
                start + length
            } else {
                start + (i + 1) * length / n
            };
            let chunk_length = next.saturating_sub(lo);
            let hi = if chunk_length == 0 { lo } else { next - 1 };
            planned.push(ChunkSlot {
                start: lo,
                end: hi,
                length: chunk_length,
                percentage: 0.0,
                finished: chunk_length == 0,
                copied: false,
            });
        }
        debug!(chunks = self.chunk_count, start, length, "planned chunk ranges");
        *slots = planned;
    }

    pub(crate) fn slots_planned(&self) -> bool {
        !lock(&self.slots).is_empty()
    }

    pub(crate) fn slot(&self, index: usize) -> Option<ChunkSlot> {
        lock(&self.slots).get(index).copied()
    }

    /// Records per-chunk progress and forwards a throttled aggregate mean
    /// to the user-visible reporter.
    pub(crate) fn report_chunk_progress(&self, index: usize, bytes: u64) {
        let mean = {
            let mut slots = lock(&self.slots);
            let Some(slot) = slots.get_mut(index) else {
                return;
            };
            slot.percentage = bytes as f64 / (slot.length + PROGRESS_BIAS) as f64;
            slots.iter().map(|s| s.percentage).sum::<f64>() / slots.len() as f64
        };
        let tick = self.progress_ticks.fetch_add(1, Ordering::AcqRel);
        if tick % PROGRESS_FORWARD_EVERY == 0 {
            self.forward_progress(mean);
        }
    }

    /// Forwards a progress value to the captured reporter unconditionally.
    pub(crate) fn forward_progress(&self, value: f64) {
        if let Some(progress) = lock(&self.progress).as_ref() {
            progress(value.clamp(0.0, 1.0));
        }
    }

    /// Total bytes written across all siblings.
    pub(crate) fn add_bytes(&self, delta: u64) -> u64 {
        self.bytes_written.fetch_add(delta, Ordering::AcqRel) + delta
    }

    pub(crate) fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Acquire)
    }

    /// Marks chunk `index` fully downloaded.
    pub(crate) fn mark_finished(&self, index: usize) {
        {
            let mut slots = lock(&self.slots);
            if let Some(slot) = slots.get_mut(index) {
                slot.finished = true;
                slot.percentage = 1.0;
            }
        }
        self.maybe_signal_merge_done();
    }

    pub(crate) fn all_finished(&self) -> bool {
        let slots = lock(&self.slots);
        !slots.is_empty() && slots.iter().all(|s| s.finished)
    }

    /// Acquires the copy latch; at most one sibling merges at a time.
    pub(crate) fn begin_copy(&self) -> bool {
        self.is_copying
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn end_copy(&self) {
        self.is_copying.store(false, Ordering::Release);
    }

    /// Lowest finished, not-yet-copied chunk index whose predecessors are
    /// all copied, making it the only chunk that may be appended next. Chunk 0 never
    /// needs copying (it owns the leading part file).
    pub(crate) fn next_copy_candidate(&self) -> Option<usize> {
        let slots = lock(&self.slots);
        for (i, slot) in slots.iter().enumerate() {
            if i == 0 {
                if !slot.finished {
                    return None;
                }
                continue;
            }
            if slot.copied {
                continue;
            }
            return slot.finished.then_some(i);
        }
        None
    }

    /// Marks chunk `index` appended; signals the merge latch once every
    /// chunk is copied.
    pub(crate) fn mark_copied(&self, index: usize) {
        {
            let mut slots = lock(&self.slots);
            if let Some(slot) = slots.get_mut(index) {
                slot.copied = true;
            }
        }
        self.maybe_signal_merge_done();
    }

    /// Signals the merge latch once every chunk is finished and every
    /// trailing chunk is copied behind the leading part.
    fn maybe_signal_merge_done(&self) {
        let done = {
            let slots = lock(&self.slots);
            !slots.is_empty()
                && slots.iter().all(|s| s.finished)
                && slots.iter().enumerate().all(|(i, s)| i == 0 || s.copied)
        };
        if done {
            self.merge_done.send_replace(true);
        }
    }

    /// Signals the merge latch directly (single-chunk edge cases).
    pub(crate) fn signal_merge_done(&self) {
        self.merge_done.send_replace(true);
    }

    /// `true` once every chunk is merged behind the leading part (and the
    /// family neither aborted nor fell back).
    pub(crate) fn merge_complete(&self) -> bool {
        !self.aborted() && !self.fallback_started() && *self.merge_done.subscribe().borrow()
    }

    /// Resolves once all chunks are merged, or the family aborted.
    pub(crate) async fn wait_merge_done(&self) {
        let mut rx = self.merge_done.subscribe();
        while !*rx.borrow_and_update() {
            if self.aborted() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// One-shot switch into the server-does-not-support-ranges fallback.
    pub(crate) fn begin_fallback(&self) -> bool {
        self.fallback
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn fallback_started(&self) -> bool {
        self.fallback.load(Ordering::Acquire)
    }

    /// Marks the family broken (a sibling failed or was cancelled outside
    /// a fallback); wakes the merge waiter so the root can settle.
    pub(crate) fn mark_aborted(&self) {
        self.aborted.store(true, Ordering::Release);
        self.merge_done.send_replace(true);
    }

    pub(crate) fn aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    /// Captures the root request's original callbacks.
    pub(crate) fn capture_callbacks(
        &self,
        progress: Option<ProgressCallback>,
        on_completed: Option<CompletedCallback<PathBuf>>,
    ) {
        *lock(&self.progress) = progress;
        *lock(&self.on_completed) = on_completed;
    }

    /// Returns the captured callbacks to the (recycled) root request.
    pub(crate) fn restore_callbacks(
        &self,
    ) -> (Option<ProgressCallback>, Option<CompletedCallback<PathBuf>>) {
        (lock(&self.progress).take(), lock(&self.on_completed).take())
    }

    /// Fires the captured completion callback exactly once.
    pub(crate) fn fire_completed(&self, path: &PathBuf) {
        self.forward_progress(1.0);
        if let Some(callback) = lock(&self.on_completed).take() {
            callback(path);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

impl std::fmt::Debug for ChunkCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkCoordinator")
            .field("chunks", &self.chunk_count)
            .field("bytes_written", &self.bytes_written())
            .field("fallback", &self.fallback_started())
            .finish_non_exhaustive()
    }
}
