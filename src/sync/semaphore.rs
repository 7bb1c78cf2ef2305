//! Counting semaphore with runtime-adjustable capacity.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::debug;

/// A counting semaphore whose capacity can shrink or grow at runtime.
///
/// Growing by Δ releases Δ permits immediately. Shrinking by Δ consumes as
/// many free permits as possible right away; the remainder is recorded as
/// debt and swallowed as outstanding permits are returned. Permits are RAII
/// guards released on every exit path.
#[derive(Clone, Debug)]
pub struct DynamicSemaphore {
    shared: Arc<Shared>,
}

#[derive(Debug)]
struct Shared {
    semaphore: Semaphore,
    capacity: AtomicUsize,
    debt: AtomicUsize,
}

/// RAII permit handle; dropping it returns (or swallows) the permit.
#[derive(Debug)]
pub struct DynamicPermit {
    shared: Arc<Shared>,
}

impl DynamicSemaphore {
    /// Creates a semaphore with `capacity` permits (at least 1).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            shared: Arc::new(Shared {
                semaphore: Semaphore::new(capacity),
                capacity: AtomicUsize::new(capacity),
                debt: AtomicUsize::new(0),
            }),
        }
    }

    /// Current configured capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.shared.capacity.load(Ordering::Acquire)
    }

    /// Permits currently available for acquisition.
    #[must_use]
    pub fn available(&self) -> usize {
        self.shared.semaphore.available_permits()
    }

    /// Acquires one permit, suspending until one is available.
    ///
    /// Returns `None` only if the underlying semaphore was closed, which
    /// this type never does itself.
    pub async fn acquire(&self) -> Option<DynamicPermit> {
        match self.shared.semaphore.acquire().await {
            Ok(permit) => {
                permit.forget();
                Some(DynamicPermit {
                    shared: Arc::clone(&self.shared),
                })
            }
            Err(_) => None,
        }
    }

    /// Acquires one permit without waiting.
    pub fn try_acquire(&self) -> Option<DynamicPermit> {
        self.shared.semaphore.try_acquire().ok().map(|permit| {
            permit.forget();
            DynamicPermit {
                shared: Arc::clone(&self.shared),
            }
        })
    }

    /// Adjusts capacity to `new_capacity` (clamped to at least 1).
    pub fn resize(&self, new_capacity: usize) {
        let new_capacity = new_capacity.max(1);
        let old = self.shared.capacity.swap(new_capacity, Ordering::AcqRel);
        if new_capacity == old {
            return;
        }
        debug!(old, new = new_capacity, "resizing semaphore capacity");
        if new_capacity > old {
            self.shared.grow(new_capacity - old);
        } else {
            self.shared.shrink(old - new_capacity);
        }
    }
}

impl Shared {
    fn grow(&self, mut delta: usize) {
        // Pay down shrink debt before minting fresh permits.
        while delta > 0 {
            let paid = self
                .debt
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |debt| {
                    debt.checked_sub(1)
                });
            if paid.is_ok() {
                delta -= 1;
            } else {
                break;
            }
        }
        if delta > 0 {
            self.semaphore.add_permits(delta);
        }
    }

    fn shrink(&self, delta: usize) {
        let mut remaining = delta;
        while remaining > 0 {
            match self.semaphore.try_acquire() {
                Ok(permit) => {
                    permit.forget();
                    remaining -= 1;
                }
                Err(_) => break,
            }
        }
        if remaining > 0 {
            // Outstanding permits cover the rest; swallow them on release.
            self.debt.fetch_add(remaining, Ordering::AcqRel);
        }
    }
}

impl Drop for DynamicPermit {
    fn drop(&mut self) {
        let swallowed = self
            .shared
            .debt
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |debt| {
                debt.checked_sub(1)
            })
            .is_ok();
        if !swallowed {
            self.shared.semaphore.add_permits(1);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_acquire_up_to_capacity() {
        let semaphore = DynamicSemaphore::new(2);
        let first = semaphore.acquire().await.unwrap();
        let _second = semaphore.acquire().await.unwrap();
        assert!(semaphore.try_acquire().is_none());

        drop(first);
        assert!(semaphore.try_acquire().is_some());
    }

    #[tokio::test]
    async fn test_grow_releases_permits() {
        let semaphore = DynamicSemaphore::new(1);
        let _held = semaphore.acquire().await.unwrap();
        assert!(semaphore.try_acquire().is_none());

        semaphore.resize(3);
        assert_eq!(semaphore.capacity(), 3);
        let _a = semaphore.try_acquire().unwrap();
        let _b = semaphore.try_acquire().unwrap();
        assert!(semaphore.try_acquire().is_none());
    }

    #[tokio::test]
    async fn test_shrink_consumes_free_permits() {
        let semaphore = DynamicSemaphore::new(3);
        semaphore.resize(1);
        let _held = semaphore.try_acquire().unwrap();
        assert!(semaphore.try_acquire().is_none());
    }

    #[tokio::test]
    async fn test_shrink_below_outstanding_swallows_released_permits() {
        let semaphore = DynamicSemaphore::new(2);
        let first = semaphore.acquire().await.unwrap();
        let second = semaphore.acquire().await.unwrap();

        semaphore.resize(1);
        // Both permits are out; the first release pays the debt.
        drop(first);
        assert!(semaphore.try_acquire().is_none());
        drop(second);
        assert!(semaphore.try_acquire().is_some());
    }

    #[tokio::test]
    async fn test_resize_to_zero_clamps_to_one() {
        let semaphore = DynamicSemaphore::new(2);
        semaphore.resize(0);
        assert_eq!(semaphore.capacity(), 1);
    }

    #[tokio::test]
    async fn test_shrink_then_grow_cancels_debt() {
        let semaphore = DynamicSemaphore::new(2);
        let held = semaphore.acquire().await.unwrap();
        let _other = semaphore.acquire().await.unwrap();
        semaphore.resize(1);
        semaphore.resize(2);
        // Debt was cancelled by the grow; a release frees a usable permit.
        drop(held);
        assert!(semaphore.try_acquire().is_some());
    }
}
