//! Fast-fail.
//!
//! Nothing inside the core unwinds: runtime corruption and environmental
//! failures end the process through [`fatal`], which records what happened
//! and aborts.

use std::fmt;

/// Classification of an unrecoverable condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FatalKind {
    /// Malformed GC-info, EH-info or method-info bytes.
    GcInfoCorrupt,
    /// The stack walker produced a stack pointer outside the thread's stack.
    StackWalkOutOfBounds,
    /// Unbalanced or illegal cooperative/preemptive transition.
    BadTransition,
    /// A second attach of the same OS thread to the same store.
    DoubleAttach,
    /// A thread tried to detach while a suspension was in progress.
    DetachDuringSuspension,
    /// The iterator reached a runtime stub it does not know how to unwind.
    UnknownStub,
    /// A reader-writer lock was released in the wrong state.
    LockMisuse,
    /// Allocation of runtime bookkeeping failed.
    OutOfMemory,
    /// The OS refused to suspend or interrupt a thread.
    ThreadSuspendFailed,
    /// The OS would not hand out a thread's register context.
    ThreadContextUnavailable,
    /// The OS would not report the stack range of an attaching thread.
    StackBoundsUnavailable,
    /// A suspension did not complete within the configured watchdog window.
    SuspendTimeout,
    /// An allocation request exceeded the object size or element-count limits.
    ObjectTooLarge,
    /// A hardware fault was raised by runtime code itself.
    HardwareFaultInRuntime,
    /// A hardware fault was raised while the thread had GC triggering disabled.
    HardwareFaultWithGcDisabled,
    /// Managed code overflowed its stack.
    StackOverflow,
    /// The exception-info chain was popped out of order.
    InvalidExInfoChain,
}

impl fmt::Display for FatalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::GcInfoCorrupt => "gc-info corrupt",
            Self::StackWalkOutOfBounds => "stack walk out of bounds",
            Self::BadTransition => "bad mode transition",
            Self::DoubleAttach => "double attach",
            Self::DetachDuringSuspension => "detach during suspension",
            Self::UnknownStub => "unknown runtime stub",
            Self::LockMisuse => "lock misuse",
            Self::OutOfMemory => "out of memory",
            Self::ThreadSuspendFailed => "thread suspend failed",
            Self::ThreadContextUnavailable => "thread context unavailable",
            Self::SuspendTimeout => "suspend timeout",
            Self::ObjectTooLarge => "object too large",
            Self::HardwareFaultInRuntime => "hardware fault in runtime",
            Self::HardwareFaultWithGcDisabled => "hardware fault with gc disabled",
            Self::StackOverflow => "stack overflow",
            Self::InvalidExInfoChain => "invalid exinfo chain",
            Self::StackBoundsUnavailable => "stack bounds unavailable",
        };
        f.write_str(name)
    }
}

/// Structured crash record emitted before the process goes down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FatalRecord {
    pub kind: FatalKind,
    pub context: String,
    pub thread_id: u64,
}

impl fmt::Display for FatalRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "fatal runtime error: {} (thread {}): {}",
            self.kind, self.thread_id, self.context
        )
    }
}

/// Records `kind` and aborts the process.
///
/// Under the test hook installed by `test_util::catch_fatal` the record is
/// raised as a panic payload instead, so tests can observe it.
#[cold]
#[inline(never)]
pub fn fatal(kind: FatalKind, context: &str) -> ! {
    let record = FatalRecord {
        kind,
        context: context.to_owned(),
        thread_id: sys_pal::current_thread_id(),
    };

    #[cfg(feature = "tracing")]
    tracing::error!(kind = %record.kind, thread_id = record.thread_id, context = %record.context, "fatal");

    #[cfg(any(test, feature = "test-util"))]
    if hook::is_catching() {
        std::panic::panic_any(record);
    }

    eprintln!("{record}");
    std::process::abort()
}

#[cfg(any(test, feature = "test-util"))]
pub(crate) mod hook {
    use std::cell::Cell;

    thread_local! {
        static CATCHING: Cell<u32> = const { Cell::new(0) };
    }

    pub fn is_catching() -> bool {
        CATCHING.with(Cell::get) > 0
    }

    pub struct CatchScope(());

    impl CatchScope {
        pub fn enter() -> Self {
            CATCHING.with(|c| c.set(c.get() + 1));
            Self(())
        }
    }

    impl Drop for CatchScope {
        fn drop(&mut self) {
            CATCHING.with(|c| c.set(c.get().saturating_sub(1)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_is_catchable_under_hook() {
        let record = crate::test_util::catch_fatal(|| fatal(FatalKind::LockMisuse, "release-read at zero"))
            .expect_err("fatal must not return");
        assert_eq!(record.kind, FatalKind::LockMisuse);
        assert_eq!(record.context, "release-read at zero");
        assert_eq!(record.thread_id, sys_pal::current_thread_id());
    }

    #[test]
    fn test_record_display() {
        let record = FatalRecord {
            kind: FatalKind::GcInfoCorrupt,
            context: "unknown opcode 0xc5".into(),
            thread_id: 7,
        };
        assert_eq!(
            record.to_string(),
            "fatal runtime error: gc-info corrupt (thread 7): unknown opcode 0xc5"
        );
    }
}
