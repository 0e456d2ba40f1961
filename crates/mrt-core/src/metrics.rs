//! Suspension metrics and statistics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Statistics from the most recent stop-the-world suspension.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SuspendMetrics {
    /// Time from `SuspendEE` entry to `SuspendComplete`.
    pub duration: Duration,
    /// Number of hijack attempts made by the coordinator.
    pub hijack_attempts: u64,
    /// Number of return addresses actually redirected.
    pub hijacks_installed: u64,
    /// Attempts abandoned because the module registry was write-locked.
    pub lock_busy_retries: u64,
    /// Attempts abandoned because the captured context was not stable.
    pub unstable_contexts: u64,
    /// Passes over the thread list before every thread was parked.
    pub polling_rounds: u64,
    /// Threads that had to reach a safe point (excludes the coordinator).
    pub threads_scanned: u64,
}

impl SuspendMetrics {
    /// Create a new `SuspendMetrics` with all fields set to zero.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            duration: Duration::from_secs(0),
            hijack_attempts: 0,
            hijacks_installed: 0,
            lock_busy_retries: 0,
            unstable_contexts: 0,
            polling_rounds: 0,
            threads_scanned: 0,
        }
    }
}

/// Lifetime counters, updated lock-free.
#[derive(Debug, Default)]
pub struct GlobalMetrics {
    suspensions: AtomicU64,
    total_suspend_nanos: AtomicU64,
    hijacks_installed: AtomicU64,
    threads_attached: AtomicU64,
    threads_detached: AtomicU64,
    stack_walks: AtomicU64,
}

impl GlobalMetrics {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            suspensions: AtomicU64::new(0),
            total_suspend_nanos: AtomicU64::new(0),
            hijacks_installed: AtomicU64::new(0),
            threads_attached: AtomicU64::new(0),
            threads_detached: AtomicU64::new(0),
            stack_walks: AtomicU64::new(0),
        }
    }

    pub(crate) fn record_suspension(&self, metrics: &SuspendMetrics) {
        self.suspensions.fetch_add(1, Ordering::Relaxed);
        let nanos = u64::try_from(metrics.duration.as_nanos()).unwrap_or(u64::MAX);
        self.total_suspend_nanos.fetch_add(nanos, Ordering::Relaxed);
        self.hijacks_installed
            .fetch_add(metrics.hijacks_installed, Ordering::Relaxed);
    }

    pub(crate) fn record_attach(&self) {
        self.threads_attached.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_detach(&self) {
        self.threads_detached.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_stack_walk(&self) {
        self.stack_walks.fetch_add(1, Ordering::Relaxed);
    }

    /// Completed suspensions since the runtime was created.
    pub fn suspensions(&self) -> u64 {
        self.suspensions.load(Ordering::Relaxed)
    }

    /// Sum of all suspension durations.
    pub fn total_suspend_time(&self) -> Duration {
        Duration::from_nanos(self.total_suspend_nanos.load(Ordering::Relaxed))
    }

    pub fn hijacks_installed(&self) -> u64 {
        self.hijacks_installed.load(Ordering::Relaxed)
    }

    pub fn threads_attached(&self) -> u64 {
        self.threads_attached.load(Ordering::Relaxed)
    }

    pub fn threads_detached(&self) -> u64 {
        self.threads_detached.load(Ordering::Relaxed)
    }

    /// Stacks walked for root enumeration.
    pub fn stack_walks(&self) -> u64 {
        self.stack_walks.load(Ordering::Relaxed)
    }
}
