//! Multi-producer multi-consumer priority channel.
//!
//! Items are delivered to readers in strict priority order (lowest level
//! first) with FIFO ordering within a level. Readers can suspend until data
//! arrives, observers can wait for readability without consuming, and the
//! channel supports orderly shutdown: after [`PriorityChannel::complete`]
//! writes fail, remaining items drain, and further reads fail with
//! [`ChannelClosed`].
//!
//! A single monitor guards the level queues, the blocked-reader deque, and
//! the wait-for-data observer list. Blocked readers are woken in FIFO order;
//! a reader whose future was dropped is skipped on the next wake, so a
//! concurrent write never loses its item.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use thiserror::Error;
use tokio::sync::{oneshot, watch};

/// Error returned by reads on a completed, drained channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("channel closed")]
pub struct ChannelClosed;

/// Error returned by writes after [`PriorityChannel::complete`]; carries the
/// rejected item back to the caller.
pub struct WriteFailed<T>(pub T);

impl<T> fmt::Debug for WriteFailed<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("WriteFailed(..)")
    }
}

impl<T> fmt::Display for WriteFailed<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("write to completed channel")
    }
}

impl<T> std::error::Error for WriteFailed<T> {}

struct State<T> {
    /// One FIFO queue per priority level, index 0 = highest priority.
    queues: Vec<VecDeque<T>>,
    /// Readers suspended in `read`, woken in registration order.
    blocked_readers: VecDeque<oneshot::Sender<()>>,
    /// `wait_to_read` observers; drained in a single pass on every write.
    waiters: Vec<oneshot::Sender<bool>>,
    /// Done-writing sentinel; set once by `complete`.
    done: bool,
}

/// K-level priority async queue (see module docs).
pub struct PriorityChannel<T> {
    state: Mutex<State<T>>,
    len: AtomicUsize,
    completion_tx: watch::Sender<bool>,
    levels: usize,
}

impl<T> PriorityChannel<T> {
    /// Creates a channel with `levels` priority levels (at least 1).
    #[must_use]
    pub fn new(levels: usize) -> Self {
        let levels = levels.max(1);
        let (completion_tx, _) = watch::channel(false);
        Self {
            state: Mutex::new(State {
                queues: (0..levels).map(|_| VecDeque::new()).collect(),
                blocked_readers: VecDeque::new(),
                waiters: Vec::new(),
                done: false,
            }),
            len: AtomicUsize::new(0),
            completion_tx,
            levels,
        }
    }

    /// Number of priority levels.
    #[must_use]
    pub fn levels(&self) -> usize {
        self.levels
    }

    /// Number of items currently queued across all levels.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    /// Returns `true` when no items are queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Enqueues `item` at `priority` without blocking.
    ///
    /// Priorities above the highest level are clamped to the lowest level.
    ///
    /// # Errors
    ///
    /// Fails only after [`complete`](Self::complete) was called; the item is
    /// handed back inside the error.
    pub fn try_write(&self, priority: usize, item: T) -> Result<(), WriteFailed<T>> {
        let mut state = self.lock_state();
        if state.done {
            return Err(WriteFailed(item));
        }
        let level = priority.min(self.levels - 1);
        state.queues[level].push_back(item);
        self.len.fetch_add(1, Ordering::Release);

        // Wake the head blocked reader; skip readers whose future was
        // dropped. The item stays queued until the woken reader (or any
        // other consumer) dequeues it, so nothing is lost on a race.
        while let Some(reader) = state.blocked_readers.pop_front() {
            if reader.send(()).is_ok() {
                break;
            }
        }
        // Single-pass wake of every wait-for-data observer.
        for waiter in state.waiters.drain(..) {
            let _ = waiter.send(true);
        }
        Ok(())
    }

    /// Enqueues `item` at `priority`, awaiting channel availability.
    ///
    /// The channel is unbounded, so this completes synchronously; the async
    /// form exists for call sites that treat the channel as a sink.
    ///
    /// # Errors
    ///
    /// Fails only after [`complete`](Self::complete) was called.
    pub async fn write(&self, priority: usize, item: T) -> Result<(), WriteFailed<T>> {
        self.try_write(priority, item)
    }

    /// Dequeues the highest-priority item without blocking.
    ///
    /// Remaining items stay readable after completion; `None` means the
    /// channel is currently empty.
    pub fn try_read(&self) -> Option<(usize, T)> {
        let mut state = self.lock_state();
        self.dequeue_locked(&mut state)
    }

    /// Dequeues the highest-priority item, suspending until one is
    /// available.
    ///
    /// Dropping the returned future deregisters the reader; an item written
    /// concurrently is re-offered to the next blocked reader or left
    /// queued.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelClosed`] once the channel is completed and drained.
    pub async fn read(&self) -> Result<(usize, T), ChannelClosed> {
        loop {
            let rx = {
                let mut state = self.lock_state();
                if let Some(found) = self.dequeue_locked(&mut state) {
                    return Ok(found);
                }
                if state.done {
                    return Err(ChannelClosed);
                }
                let (tx, rx) = oneshot::channel();
                state.blocked_readers.push_back(tx);
                rx
            };
            // Err means the channel completed while we were parked; loop to
            // drain leftovers or observe the sentinel.
            let _ = rx.await;
        }
    }

    /// Waits until data is available (`true`) or the channel was completed
    /// empty (`false`). Does not consume.
    pub async fn wait_to_read(&self) -> bool {
        loop {
            let rx = {
                let mut state = self.lock_state();
                if state.queues.iter().any(|q| !q.is_empty()) {
                    return true;
                }
                if state.done {
                    return false;
                }
                let (tx, rx) = oneshot::channel();
                state.waiters.push(tx);
                rx
            };
            match rx.await {
                Ok(readable) => return readable,
                // Waiter dropped without a signal; re-examine the state.
                Err(_) => continue,
            }
        }
    }

    /// Returns a clone of the highest-priority item without consuming it.
    pub fn try_peek(&self) -> Option<(usize, T)>
    where
        T: Clone,
    {
        let state = self.lock_state();
        for (level, queue) in state.queues.iter().enumerate() {
            if let Some(front) = queue.front() {
                return Some((level, front.clone()));
            }
        }
        None
    }

    /// Marks the channel done-writing. Idempotent; returns `true` on the
    /// call that performed the transition.
    ///
    /// Subsequent writes fail; reads drain remaining items, then fail with
    /// [`ChannelClosed`]. Blocked readers are woken to drain or observe the
    /// sentinel; observers are woken with the current readability.
    pub fn complete(&self) -> bool {
        let mut state = self.lock_state();
        if state.done {
            return false;
        }
        state.done = true;

        while let Some(reader) = state.blocked_readers.pop_front() {
            let _ = reader.send(());
        }
        let has_items = state.queues.iter().any(|q| !q.is_empty());
        for waiter in state.waiters.drain(..) {
            let _ = waiter.send(has_items);
        }
        if !has_items {
            self.completion_tx.send_replace(true);
        }
        true
    }

    /// Returns `true` once [`complete`](Self::complete) was called.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.lock_state().done
    }

    /// Resolves when the channel is completed **and** fully drained.
    pub async fn completion(&self) {
        let mut rx = self.completion_tx.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    fn dequeue_locked(&self, state: &mut State<T>) -> Option<(usize, T)> {
        for level in 0..self.levels {
            if let Some(item) = state.queues[level].pop_front() {
                self.len.fetch_sub(1, Ordering::Release);
                if state.done && state.queues.iter().all(VecDeque::is_empty) {
                    self.completion_tx.send_replace(true);
                }
                return Some((level, item));
            }
        }
        None
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, State<T>> {
        // Lock is only held for short critical sections without awaits;
        // a poisoned lock means a panicked writer, recover the state.
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl<T> fmt::Debug for PriorityChannel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PriorityChannel")
            .field("levels", &self.levels)
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}
