//! Request scheduler.
//!
//! Each scheduler owns a priority channel, a dynamically-sized semaphore, a
//! pause token, a re-armable cancellation source, and a throughput meter.
//! One logical worker loop drains the channel in priority order and
//! dispatches request bodies under the current parallelism limit, which
//! follows observed throughput unless the caller pins it.
//!
//! Two process-wide instances exist: [`Scheduler::main`] for lightweight
//! requests (status probes, user bodies) and [`Scheduler::download`] for
//! file downloads.

mod speed;

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock, Mutex, Weak};

use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::channel::PriorityChannel;
use crate::request::{Priority, Request};
use crate::sync::{DynamicSemaphore, PauseToken};

use speed::SpeedMeter;

static MAIN: LazyLock<Arc<Scheduler>> = LazyLock::new(Scheduler::new_standalone);
static DOWNLOAD: LazyLock<Arc<Scheduler>> = LazyLock::new(Scheduler::new_standalone);

/// Tuning knobs for the auto-parallelism feedback loop.
///
/// `auto = clamp(CPU * throughput_MBps, min_parallelism, floor(CPU * cpu_factor))`
#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    /// Lower bound of the automatic degree of parallelism.
    pub min_parallelism: usize,
    /// Upper bound factor applied to the CPU count.
    pub cpu_factor: f64,
    /// Assumed throughput (MB/s) while fewer than `min_speed_samples`
    /// observations exist.
    pub default_throughput_mbps: f64,
    /// Sample count below which the default throughput applies.
    pub min_speed_samples: usize,
    /// Size of the throughput sample window.
    pub max_speed_samples: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            min_parallelism: 2,
            cpu_factor: 1.7,
            default_throughput_mbps: 1.0,
            min_speed_samples: 10,
            max_speed_samples: 20,
        }
    }
}

/// Multiplexes in-flight requests onto a bounded worker pool (see module
/// docs).
#[derive(Debug)]
pub struct Scheduler {
    channel: PriorityChannel<Arc<dyn Request>>,
    semaphore: DynamicSemaphore,
    cancel: Mutex<CancellationToken>,
    pause: PauseToken,
    speed: SpeedMeter,
    config: SchedulerConfig,
    max_override: Mutex<Option<usize>>,
    is_running: AtomicBool,
    weak_self: Weak<Scheduler>,
}

impl Scheduler {
    /// The process-wide scheduler for lightweight requests.
    #[must_use]
    pub fn main() -> &'static Arc<Scheduler> {
        &MAIN
    }

    /// The process-wide scheduler for file downloads.
    #[must_use]
    pub fn download() -> &'static Arc<Scheduler> {
        &DOWNLOAD
    }

    /// Creates an independent scheduler with `config`.
    #[must_use]
    pub fn new(config: SchedulerConfig) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            channel: PriorityChannel::new(Priority::LEVELS),
            semaphore: DynamicSemaphore::new(config.min_parallelism),
            cancel: Mutex::new(CancellationToken::new()),
            pause: PauseToken::new(),
            speed: SpeedMeter::new(
                config.max_speed_samples,
                config.min_speed_samples,
                config.default_throughput_mbps,
            ),
            config,
            max_override: Mutex::new(None),
            is_running: AtomicBool::new(false),
            weak_self: weak_self.clone(),
        })
    }

    /// Creates an independent scheduler with the default configuration.
    #[must_use]
    pub fn new_standalone() -> Arc<Self> {
        Self::new(SchedulerConfig::default())
    }

    /// Queues a request at its priority and makes sure the worker loop is
    /// running. Called by the request driver; completed schedulers drop the
    /// request.
    pub(crate) fn enqueue(&self, request: Arc<dyn Request>) {
        let level = request.core().priority().level();
        if self.channel.try_write(level, request).is_err() {
            warn!("scheduler is shut down; dropping request");
            return;
        }
        self.ensure_running();
    }

    /// Number of queued (not yet dispatched) requests.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.channel.len()
    }

    /// The scheduler-wide cancellation token in effect.
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.lock_cancel().clone()
    }

    /// Cancels every in-flight and queued request linked to the current
    /// source; the worker loop exits.
    pub fn cancel_all(&self) {
        self.lock_cancel().cancel();
    }

    /// Replaces a fired cancellation source, re-arming the scheduler for
    /// subsequent use. Queued items are kept and draining resumes.
    pub fn create_new_cancellation_source(&self) {
        {
            let mut cancel = self.lock_cancel();
            if !cancel.is_cancelled() {
                return;
            }
            *cancel = CancellationToken::new();
        }
        if !self.channel.is_empty() {
            self.ensure_running();
        }
    }

    /// Stops reading new items; in-flight request bodies run to completion.
    pub fn pause(&self) {
        self.pause.pause();
    }

    /// Resumes draining after [`pause`](Self::pause).
    pub fn resume(&self) {
        self.pause.resume();
        if !self.channel.is_empty() {
            self.ensure_running();
        }
    }

    /// Returns `true` while paused.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.pause.is_paused()
    }

    /// Records a throughput observation (bytes/sec) and lets the automatic
    /// parallelism follow it.
    pub fn add_speed(&self, bytes_per_sec: f64) {
        self.speed.push(bytes_per_sec);
        self.apply_parallelism();
    }

    /// Pins the degree of parallelism, or clears the pin (`None`) so the
    /// automatic value resumes.
    pub fn set_max_parallelism(&self, max: Option<usize>) {
        *self
            .max_override
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = max;
        self.apply_parallelism();
    }

    /// Current capacity of the worker pool.
    #[must_use]
    pub fn max_parallelism(&self) -> usize {
        self.semaphore.capacity()
    }

    /// The automatic degree of parallelism for current throughput.
    #[must_use]
    pub fn auto_parallelism(&self) -> usize {
        let cpus = std::thread::available_parallelism()
            .map(NonZeroUsize::get)
            .unwrap_or(1);
        let upper = ((cpus as f64) * self.config.cpu_factor).floor() as usize;
        let upper = upper.max(self.config.min_parallelism);
        let auto = ((cpus as f64) * self.speed.mean_mbps()).round() as usize;
        auto.clamp(self.config.min_parallelism, upper)
    }

    /// Completes the channel: no further enqueues; queued items drain, then
    /// the worker loop exits.
    pub fn shutdown(&self) {
        self.channel.complete();
    }

    /// Resolves once the scheduler is shut down and fully drained.
    pub async fn completion(&self) {
        self.channel.completion().await;
    }

    fn apply_parallelism(&self) {
        let target = self
            .max_override
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .unwrap_or_else(|| self.auto_parallelism());
        self.semaphore.resize(target);
    }

    fn ensure_running(&self) {
        let Some(scheduler) = self.weak_self.upgrade() else {
            return;
        };
        if self.is_running.swap(true, Ordering::AcqRel) {
            return;
        }
        tokio::spawn(async move {
            scheduler.run_loop().await;
        });
    }

    #[instrument(level = "debug", skip(self))]
    async fn run_loop(self: Arc<Self>) {
        debug!("scheduler loop started");
        loop {
            // Cooperative checkpoint between items.
            self.pause.wait_if_paused().await;
            let cancel = self.cancel_token();
            let request = tokio::select! {
                () = cancel.cancelled() => break,
                read = self.channel.read() => match read {
                    Ok((_, request)) => request,
                    Err(_) => break,
                },
            };
            let Some(permit) = self.semaphore.acquire().await else {
                break;
            };

            let scheduler = Arc::clone(&self);
            tokio::spawn(async move {
                // Permit is dropped when this block exits (RAII).
                let _permit = permit;
                let handle = Arc::clone(&request);
                request.execute().await;
                if handle.core().state().is_terminal() {
                    handle.dispose();
                }
                scheduler.apply_parallelism();
            });
        }
        self.is_running.store(false, Ordering::Release);
        debug!("scheduler loop stopped");
    }

    fn lock_cancel(&self) -> std::sync::MutexGuard<'_, CancellationToken> {
        self.cancel
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults_match_documented_values() {
        let config = SchedulerConfig::default();
        assert_eq!(config.min_parallelism, 2);
        assert!((config.cpu_factor - 1.7).abs() < f64::EPSILON);
        assert!((config.default_throughput_mbps - 1.0).abs() < f64::EPSILON);
        assert_eq!(config.min_speed_samples, 10);
        assert_eq!(config.max_speed_samples, 20);
    }

    #[tokio::test]
    async fn test_auto_parallelism_stays_within_bounds() {
        let scheduler = Scheduler::new_standalone();
        let cpus = std::thread::available_parallelism().map(NonZeroUsize::get).unwrap_or(1);
        let upper = (((cpus as f64) * 1.7).floor() as usize).max(2);

        // Cold engine: defaults apply.
        let auto = scheduler.auto_parallelism();
        assert!((2..=upper).contains(&auto));

        // Saturate the window with a huge throughput; still clamped.
        for _ in 0..20 {
            scheduler.add_speed(500.0 * 1024.0 * 1024.0);
        }
        assert_eq!(scheduler.auto_parallelism(), upper);
        assert_eq!(scheduler.max_parallelism(), upper);
    }

    #[tokio::test]
    async fn test_explicit_parallelism_overrides_auto() {
        let scheduler = Scheduler::new_standalone();
        scheduler.set_max_parallelism(Some(7));
        assert_eq!(scheduler.max_parallelism(), 7);

        for _ in 0..20 {
            scheduler.add_speed(1.0);
        }
        assert_eq!(scheduler.max_parallelism(), 7, "override must stick");

        scheduler.set_max_parallelism(None);
        assert_eq!(scheduler.max_parallelism(), scheduler.auto_parallelism());
    }

    #[tokio::test]
    async fn test_create_new_cancellation_source_rearms() {
        let scheduler = Scheduler::new_standalone();
        let old = scheduler.cancel_token();
        scheduler.cancel_all();
        assert!(old.is_cancelled());

        scheduler.create_new_cancellation_source();
        let fresh = scheduler.cancel_token();
        assert!(!fresh.is_cancelled());

        // Re-arming without a fired source is a no-op.
        scheduler.create_new_cancellation_source();
        assert!(!scheduler.cancel_token().is_cancelled());
    }

    #[tokio::test]
    async fn test_main_and_download_are_distinct() {
        assert!(!Arc::ptr_eq(Scheduler::main(), Scheduler::download()));
    }
}
