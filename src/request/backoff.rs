//! Exponential back-off with jitter for retryable failures.

use std::time::Duration;

use rand::Rng;

/// Default base delay for the first retry.
const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

/// Default delay cap.
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(32);

/// Default multiplier (doubles each attempt).
const DEFAULT_MULTIPLIER: f64 = 2.0;

/// Maximum jitter added to every delay.
const MAX_JITTER: Duration = Duration::from_millis(500);

/// Back-off schedule applied between attempts when the request options do
/// not fix a delay.
///
/// Delay formula: `min(base * multiplier^(attempt - 1), max) + jitter`.
#[derive(Debug, Clone, Copy)]
pub struct RetryBackoff {
    base_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
}

impl Default for RetryBackoff {
    fn default() -> Self {
        Self {
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            multiplier: DEFAULT_MULTIPLIER,
        }
    }
}

impl RetryBackoff {
    /// Creates a schedule with custom settings.
    #[must_use]
    pub fn new(base_delay: Duration, max_delay: Duration, multiplier: f64) -> Self {
        Self {
            base_delay,
            max_delay,
            multiplier,
        }
    }

    /// Delay before the retry following failed attempt `attempt`
    /// (1-indexed).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = f64::from(attempt.saturating_sub(1));
        let delay_ms = self.base_delay.as_millis() as f64 * self.multiplier.powf(exponent);
        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);

        let jitter_ms = rand::thread_rng().gen_range(0..=MAX_JITTER.as_millis() as u64);
        Duration::from_millis(capped_ms as u64) + Duration::from_millis(jitter_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_grows_with_attempts() {
        let backoff = RetryBackoff::default();
        let first = backoff.delay_for(1);
        let third = backoff.delay_for(3);
        assert!(first >= Duration::from_secs(1));
        assert!(first <= Duration::from_millis(1500));
        assert!(third >= Duration::from_secs(4));
        assert!(third <= Duration::from_millis(4500));
    }

    #[test]
    fn test_delay_respects_cap() {
        let backoff = RetryBackoff::new(Duration::from_secs(1), Duration::from_secs(5), 2.0);
        let delay = backoff.delay_for(10);
        assert!(delay >= Duration::from_secs(5));
        assert!(delay <= Duration::from_millis(5500));
    }
}
