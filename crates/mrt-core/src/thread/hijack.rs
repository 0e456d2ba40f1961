//! Return-address hijacking.
//!
//! A thread running managed code cannot be parked where it stands: it may
//! be between safe points. Instead the coordinator interrupts it, finds the
//! return-address slot of its topmost managed frame, and points that slot at
//! a `GcHijack` stub. When the method returns, the stub publishes a
//! transition frame and the thread parks itself.

use std::sync::atomic::Ordering;

use sys_pal::{LimitedContext, PalError};

use super::Thread;
use crate::fatal::{fatal, FatalKind};
use crate::module::code_manager;
use crate::regdisplay::RegDisplay;
use crate::runtime::Runtime;

/// Result of one attempt to interrupt a cooperative thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HijackOutcome {
    Installed,
    /// The registry lock was held; the target may own it.
    LockBusy,
    /// The OS could not give a reliable snapshot of the registers.
    UnstableContext,
    /// The thread was interrupted outside managed code.
    NotManaged,
    /// The frame is in a prolog, a funclet, or a reverse P/Invoke method.
    NotHijackable,
    /// The thread reached a safe point by itself.
    AlreadyPreemptive,
    DoNotTriggerGc,
    /// An activation was queued; its handler runs asynchronously.
    Pending,
    Unsupported,
}

impl HijackOutcome {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Installed => "installed",
            Self::LockBusy => "lock_busy",
            Self::UnstableContext => "unstable_context",
            Self::NotManaged => "not_managed",
            Self::NotHijackable => "not_hijackable",
            Self::AlreadyPreemptive => "already_preemptive",
            Self::DoNotTriggerGc => "do_not_trigger_gc",
            Self::Pending => "pending",
            Self::Unsupported => "unsupported",
        }
    }
}

/// How the coordinator reaches a thread that is still cooperative.
pub trait Interrupter: Send + Sync {
    /// Attempts to redirect `thread` to a safe point. Called once per
    /// polling round while the thread stays cooperative.
    fn interrupt(&self, runtime: &Runtime, thread: &Thread) -> HijackOutcome;
}

/// Interrupts threads through the platform layer: a synchronous
/// suspend-and-inspect where the OS offers one, an activation signal
/// otherwise.
#[derive(Debug)]
pub struct OsInterrupter {
    _private: (),
}

impl OsInterrupter {
    #[must_use]
    pub fn new() -> Self {
        // Without activations the coordinator only waits for polls.
        let _ = sys_pal::register_activation_handler(activation_handler);
        Self { _private: () }
    }
}

impl Default for OsInterrupter {
    fn default() -> Self {
        Self::new()
    }
}

impl Interrupter for OsInterrupter {
    #[cfg(windows)]
    fn interrupt(&self, runtime: &Runtime, thread: &Thread) -> HijackOutcome {
        let mut outcome = HijackOutcome::UnstableContext;
        match sys_pal::suspend_and_inspect(thread.handle(), |context| {
            outcome = hijack_callback(runtime, thread, context);
        }) {
            Ok(()) => outcome,
            Err(PalError::UnstableContext) => HijackOutcome::UnstableContext,
            Err(PalError::Unsupported) => HijackOutcome::Unsupported,
            Err(err) => fatal(FatalKind::ThreadSuspendFailed, &format!("thread {}: {err}", thread.os_id())),
        }
    }

    #[cfg(not(windows))]
    fn interrupt(&self, _runtime: &Runtime, thread: &Thread) -> HijackOutcome {
        if thread.activation_pending.swap(true, Ordering::AcqRel) {
            return HijackOutcome::Pending;
        }
        match sys_pal::inject_activation(thread.handle()) {
            Ok(()) => HijackOutcome::Pending,
            Err(PalError::Unsupported) => {
                thread.activation_pending.store(false, Ordering::Release);
                HijackOutcome::Unsupported
            }
            Err(err) => fatal(FatalKind::ThreadSuspendFailed, &format!("thread {}: {err}", thread.os_id())),
        }
    }
}

/// Runs on the interrupted thread, in signal context.
fn activation_handler(context: &LimitedContext) {
    let thread = Thread::current_ptr();
    // SAFETY: the record outlives its binding to this OS thread.
    let Some(thread) = (unsafe { thread.as_ref() }) else {
        return;
    };
    thread.activation_pending.store(false, Ordering::Release);
    if !thread.shared().is_trap_threads_requested() {
        return;
    }
    // The coordinator holds its own reference for the whole suspension, so
    // this never drops the last one.
    let Some(runtime) = thread.runtime() else {
        return;
    };
    let _ = hijack_callback(&runtime, thread, context);
}

/// Inspects the interrupted registers of `thread` and hijacks its topmost
/// managed frame if possible.
///
/// Must not block: the target may hold any lock. Registry lookups use the
/// try-variants and give up with [`HijackOutcome::LockBusy`].
pub(crate) fn hijack_callback(runtime: &Runtime, thread: &Thread, context: &LimitedContext) -> HijackOutcome {
    if thread.is_do_not_trigger_gc_set() {
        return HijackOutcome::DoNotTriggerGc;
    }
    if !thread.is_cooperative() {
        return HijackOutcome::AlreadyPreemptive;
    }
    // A hijack left from an earlier round is replaced, never stacked.
    thread.unhijack();

    let mut context = *context;
    if runtime.thunks().is_write_barrier_location(context.ip) {
        // Barrier helpers have no frame: the return address is on top.
        if !thread.is_within_stack_bounds(context.sp) {
            return HijackOutcome::NotManaged;
        }
        // SAFETY: `sp` is inside the interrupted thread's stack.
        context.ip = unsafe { (context.sp as *const usize).read() };
        context.sp += crate::regdisplay::POINTER_SIZE;
    }

    let modules = runtime.modules();
    if !modules.dangerous_try_pulse_read_lock() {
        return HijackOutcome::LockBusy;
    }
    let Some((method, offset)) = modules.try_find_method_info(context.ip) else {
        return if modules.dangerous_try_pulse_read_lock() {
            HijackOutcome::NotManaged
        } else {
            HijackOutcome::LockBusy
        };
    };

    let regs = RegDisplay::from_context(&mut context);
    // SAFETY: `regs` describes the interrupted frame of `method`.
    let Some((location, kind)) = (unsafe { code_manager::hijack_info(&method, offset, &regs) }) else {
        return HijackOutcome::NotHijackable;
    };
    if !thread.is_within_stack_bounds(location as usize) {
        return HijackOutcome::NotHijackable;
    }
    let Some(stub) = runtime.thunks().hijack_stub(kind) else {
        return HijackOutcome::Unsupported;
    };

    // SAFETY: `location` is the frame's return-address slot on the
    // target's stack, and the target is interrupted.
    unsafe { thread.install_hijack(location, stub, kind) };
    HijackOutcome::Installed
}
