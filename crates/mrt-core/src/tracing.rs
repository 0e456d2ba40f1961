//! Runtime tracing support.
//!
//! When the `tracing` feature is enabled, this module provides structured
//! spans and events for suspensions, root scans and hijacks.

#[cfg(feature = "tracing")]
pub mod internal {
    use std::sync::atomic::{AtomicU64, Ordering};
    use tracing::{span, Level};

    /// Identifier of one stop-the-world suspension.
    ///
    /// Monotonically increasing from 1; correlates the `suspend_ee`,
    /// `scan_stack_roots` and `restart_ee` spans of the same pause.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SuspendId(pub u64);

    static NEXT_SUSPEND_ID: AtomicU64 = AtomicU64::new(1);

    pub fn next_suspend_id() -> SuspendId {
        SuspendId(NEXT_SUSPEND_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn trace_suspend_ee(reason: &str, id: SuspendId) -> span::EnteredSpan {
        span!(Level::DEBUG, "suspend_ee", reason = reason, suspend_id = id.0).entered()
    }

    pub fn trace_restart_ee(id: SuspendId) -> span::EnteredSpan {
        span!(Level::DEBUG, "restart_ee", suspend_id = id.0).entered()
    }

    pub fn trace_scan_stack_roots(os_thread_id: u64) -> span::EnteredSpan {
        span!(Level::TRACE, "scan_stack_roots", os_thread_id).entered()
    }

    pub fn log_hijack_outcome(os_thread_id: u64, outcome: &str) {
        tracing::trace!(os_thread_id, outcome, "hijack");
    }

    pub fn log_suspend_complete(rounds: u64, hijacks: u64) {
        tracing::debug!(rounds, hijacks, "suspend_complete");
    }

    pub fn log_thread_event(event: &str, os_thread_id: u64) {
        tracing::debug!(os_thread_id, event, "thread");
    }

    pub fn log_module_event(event: &str, code_start: usize, code_len: usize) {
        tracing::debug!(code_start, code_len, event, "module");
    }
}

#[cfg(not(feature = "tracing"))]
pub mod internal {
    /// Stub type when tracing is disabled.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SuspendId(pub u64);

    /// Stub function when tracing is disabled.
    pub const fn next_suspend_id() -> SuspendId {
        SuspendId(0)
    }
}

pub use internal::SuspendId;
