//! Throughput meter feeding the auto-parallelism loop.

use std::collections::VecDeque;
use std::sync::Mutex;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Ring of recent bytes/sec samples.
///
/// Fewer than `min_samples` observations fall back to the configured
/// default throughput so a cold engine does not over- or under-shoot.
#[derive(Debug)]
pub(crate) struct SpeedMeter {
    samples: Mutex<VecDeque<f64>>,
    max_samples: usize,
    min_samples: usize,
    default_mbps: f64,
}

impl SpeedMeter {
    pub(crate) fn new(max_samples: usize, min_samples: usize, default_mbps: f64) -> Self {
        Self {
            samples: Mutex::new(VecDeque::with_capacity(max_samples.max(1))),
            max_samples: max_samples.max(1),
            min_samples,
            default_mbps,
        }
    }

    /// Records one bytes/sec observation, evicting the oldest past the cap.
    pub(crate) fn push(&self, bytes_per_sec: f64) {
        if !bytes_per_sec.is_finite() || bytes_per_sec < 0.0 {
            return;
        }
        let mut samples = self.lock_samples();
        if samples.len() == self.max_samples {
            samples.pop_front();
        }
        samples.push_back(bytes_per_sec);
    }

    /// Mean throughput in MB/s over the current window.
    pub(crate) fn mean_mbps(&self) -> f64 {
        let samples = self.lock_samples();
        if samples.len() < self.min_samples {
            return self.default_mbps;
        }
        let sum: f64 = samples.iter().sum();
        sum / samples.len() as f64 / BYTES_PER_MB
    }

    fn lock_samples(&self) -> std::sync::MutexGuard<'_, VecDeque<f64>> {
        self.samples
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
