//! Runtime configuration.

use std::time::Duration;

/// Default initial spin count of the reader-writer lock backoff.
pub const DEFAULT_SPIN_INITIAL_DELAY: u32 = 50;

/// Default multiplier applied to the spin count per backoff round.
pub const DEFAULT_SPIN_BACKOFF_FACTOR: u32 = 3;

/// Default spin count at which the lock gives up spinning and yields.
pub const DEFAULT_SPIN_MAX_DELAY: u32 = 40_000;

/// Default busy-wait iterations between suspension polling rounds.
pub const DEFAULT_SUSPEND_POLL_SPIN: u32 = 10_000;

/// Default cap on array element counts.
pub const DEFAULT_MAX_ARRAY_LENGTH: usize = 0x7FEF_FFFF;

/// Largest object the allocation front accepts on this target.
#[must_use]
pub fn default_max_object_size() -> usize {
    #[cfg(target_pointer_width = "64")]
    {
        i32::MAX as usize
    }
    #[cfg(not(target_pointer_width = "64"))]
    {
        0x7FFF_FFFF - sys_pal::page_size()
    }
}

/// Tunables of the execution core.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use mrt_core::RuntimeConfig;
///
/// let config = RuntimeConfig::default()
///     .with_suspend_watchdog(Some(Duration::from_secs(30)))
///     .with_conservative_stack_reporting(true);
/// assert!(config.conservative_stack_reporting);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// First spin count of the reader-writer lock backoff.
    pub spin_initial_delay: u32,
    /// Multiplier applied to the spin count per round.
    pub spin_backoff_factor: u32,
    /// Spin count that ends a spinning round.
    pub spin_max_delay: u32,
    /// Abort the process if a suspension takes longer than this.
    pub suspend_watchdog: Option<Duration>,
    /// Busy-wait iterations between polling rounds on multi-CPU machines.
    pub suspend_poll_spin: u32,
    /// Largest accepted object size in bytes.
    pub max_object_size: usize,
    /// Largest accepted array element count.
    pub max_array_length: usize,
    /// Report each stack conservatively instead of walking it precisely.
    pub conservative_stack_reporting: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            spin_initial_delay: DEFAULT_SPIN_INITIAL_DELAY,
            spin_backoff_factor: DEFAULT_SPIN_BACKOFF_FACTOR,
            spin_max_delay: DEFAULT_SPIN_MAX_DELAY,
            suspend_watchdog: None,
            suspend_poll_spin: DEFAULT_SUSPEND_POLL_SPIN,
            max_object_size: default_max_object_size(),
            max_array_length: DEFAULT_MAX_ARRAY_LENGTH,
            conservative_stack_reporting: false,
        }
    }
}

impl RuntimeConfig {
    #[must_use]
    pub const fn with_spin_backoff(mut self, initial: u32, factor: u32, max: u32) -> Self {
        self.spin_initial_delay = initial;
        self.spin_backoff_factor = factor;
        self.spin_max_delay = max;
        self
    }

    #[must_use]
    pub const fn with_suspend_watchdog(mut self, watchdog: Option<Duration>) -> Self {
        self.suspend_watchdog = watchdog;
        self
    }

    #[must_use]
    pub const fn with_suspend_poll_spin(mut self, spin: u32) -> Self {
        self.suspend_poll_spin = spin;
        self
    }

    #[must_use]
    pub const fn with_max_object_size(mut self, bytes: usize) -> Self {
        self.max_object_size = bytes;
        self
    }

    #[must_use]
    pub const fn with_max_array_length(mut self, length: usize) -> Self {
        self.max_array_length = length;
        self
    }

    #[must_use]
    pub const fn with_conservative_stack_reporting(mut self, enabled: bool) -> Self {
        self.conservative_stack_reporting = enabled;
        self
    }
}
