//! Mutator threads.
//!
//! A [`Thread`] is the runtime's record of one OS thread that has run managed
//! code. Its mode is encoded in a single word: a null transition frame means
//! the thread is in cooperative mode and may touch the GC heap; any other
//! value is the frame the stack walker starts from.
//!
//! Almost every field is written only by the owning thread. The exceptions
//! are the cached transition frame, which the suspending thread owns for the
//! duration of a suspension, and the hijack slots, which the suspending
//! thread may write while the owner is frozen.

mod exinfo;
mod frame;
pub(crate) mod hijack;
mod hijack_stub;
mod store;
mod tls;
mod transition;

use std::cell::{Cell, RefCell, UnsafeCell};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use bitflags::bitflags;
use sys_pal::{PalError, StackBounds, ThreadHandle};

pub use exinfo::{ExInfo, ExKind, NO_CLAUSE};
pub use frame::{FrameFlags, ReversePInvokeFrame, TransitionFrame, TOP_OF_STACK_MARKER};
pub use hijack::{HijackOutcome, Interrupter, OsInterrupter};
pub(crate) use hijack_stub::register as register_hijack_stubs;
pub use store::{SuspendState, ThreadStore, TrapFlags};
pub use transition::TransitionOutcome;

use crate::alloc::AllocContext;
use crate::fatal::{fatal, FatalKind};
use crate::gcinfo::GcRefKind;
use crate::module::ModuleId;
use crate::runtime::Runtime;

bitflags! {
    /// State bits of a [`Thread`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ThreadFlags: u32 {
        const ATTACHED = 0x1;
        const DETACHED = 0x2;
        const SUPPRESS_GC_STRESS = 0x4;
        /// Set around callbacks whose re-entry into the allocator would deadlock.
        const DO_NOT_TRIGGER_GC = 0x8;
        /// A collector-owned thread that suspensions skip.
        const IS_GC_SPECIAL = 0x10;
    }
}

/// Per-thread storage owned exclusively by the thread.
#[derive(Default)]
struct LocalData {
    dynamic_tls: Vec<Option<Box<[u8]>>>,
    thread_statics: HashMap<ModuleId, Box<[usize]>>,
}

/// One attached OS thread.
pub struct Thread {
    runtime: Weak<Runtime>,
    shared: Arc<SuspendState>,
    os_id: u64,
    handle: ThreadHandle,
    stack: StackBounds,
    flags: AtomicU32,

    transition_frame: AtomicUsize,
    cached_transition_frame: AtomicUsize,
    pinvoke_tunnel: AtomicUsize,

    hijack_location: AtomicUsize,
    hijacked_return_address: AtomicUsize,
    hijack_kind: AtomicU8,
    activation_pending: AtomicBool,

    exinfo_head: AtomicUsize,
    abort_exception: AtomicUsize,

    alloc_context: UnsafeCell<AllocContext>,
    local: UnsafeCell<LocalData>,
}

// SAFETY: the cells are touched only by the owning thread, or by the
// suspending thread while the owner is parked in preemptive mode.
unsafe impl Sync for Thread {}
// SAFETY: see above.
unsafe impl Send for Thread {}

impl fmt::Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Thread")
            .field("os_id", &self.os_id)
            .field("flags", &self.flags())
            .field("transition_frame", &format_args!("{:#x}", self.raw_transition_frame()))
            .finish_non_exhaustive()
    }
}

thread_local! {
    /// The calling thread's record; plain `Cell` so signal handlers can read it.
    static CURRENT: Cell<*const Thread> = const { Cell::new(std::ptr::null()) };
    static HOME: RefCell<Option<HomeGuard>> = const { RefCell::new(None) };
}

/// Detaches the thread when its OS thread exits.
struct HomeGuard(Arc<Thread>);

impl Drop for HomeGuard {
    fn drop(&mut self) {
        let thread = &self.0;
        // A thread dying in cooperative mode must not stall a suspension
        // waiting for it.
        thread.transition_frame.store(TOP_OF_STACK_MARKER, Ordering::Release);
        std::sync::atomic::fence(Ordering::SeqCst);
        thread.unhijack();
        let _ = CURRENT.try_with(|current| current.set(std::ptr::null()));
        if let Some(runtime) = thread.runtime.upgrade() {
            runtime.detach_thread(thread);
        }
    }
}

impl Thread {
    pub(crate) fn new(runtime: &Arc<Runtime>) -> Self {
        let stack = checked_stack_bounds(sys_pal::current_stack_bounds());
        Self {
            runtime: Arc::downgrade(runtime),
            shared: Arc::clone(runtime.threads().shared()),
            os_id: sys_pal::current_thread_id(),
            handle: ThreadHandle::current(),
            stack,
            flags: AtomicU32::new(0),
            transition_frame: AtomicUsize::new(TOP_OF_STACK_MARKER),
            cached_transition_frame: AtomicUsize::new(0),
            pinvoke_tunnel: AtomicUsize::new(TOP_OF_STACK_MARKER),
            hijack_location: AtomicUsize::new(0),
            hijacked_return_address: AtomicUsize::new(0),
            hijack_kind: AtomicU8::new(GcRefKind::Scalar as u8),
            activation_pending: AtomicBool::new(false),
            exinfo_head: AtomicUsize::new(0),
            abort_exception: AtomicUsize::new(0),
            alloc_context: UnsafeCell::new(AllocContext::default()),
            local: UnsafeCell::new(LocalData::default()),
        }
    }

    /// The calling thread's record, if it is attached.
    #[must_use]
    pub fn current() -> Option<Arc<Self>> {
        HOME.try_with(|home| home.borrow().as_ref().map(|guard| Arc::clone(&guard.0)))
            .ok()
            .flatten()
    }

    /// Raw pointer to the calling thread's record, or null. Signal-safe.
    pub(crate) fn current_ptr() -> *const Self {
        CURRENT.try_with(Cell::get).unwrap_or(std::ptr::null())
    }

    /// Binds `thread` to the calling OS thread, dropping any stale binding.
    pub(crate) fn bind_current(thread: &Arc<Self>) {
        Self::unbind_current();
        HOME.with(|home| *home.borrow_mut() = Some(HomeGuard(Arc::clone(thread))));
        CURRENT.with(|current| current.set(Arc::as_ptr(thread)));
    }

    /// Unbinds the calling OS thread, detaching it from its store.
    pub(crate) fn unbind_current() {
        let guard = HOME.try_with(|home| home.borrow_mut().take()).ok().flatten();
        drop(guard);
    }

    #[must_use]
    pub fn is_current(&self) -> bool {
        std::ptr::eq(Self::current_ptr(), self)
    }

    pub(crate) fn runtime(&self) -> Option<Arc<Runtime>> {
        self.runtime.upgrade()
    }

    pub(crate) fn belongs_to(&self, runtime: &Runtime) -> bool {
        std::ptr::eq(self.runtime.as_ptr(), runtime)
    }

    pub(crate) const fn shared(&self) -> &Arc<SuspendState> {
        &self.shared
    }

    pub(crate) const fn handle(&self) -> &ThreadHandle {
        &self.handle
    }

    #[must_use]
    pub const fn os_id(&self) -> u64 {
        self.os_id
    }

    #[must_use]
    pub const fn stack_bounds(&self) -> StackBounds {
        self.stack
    }

    #[must_use]
    pub const fn is_within_stack_bounds(&self, addr: usize) -> bool {
        self.stack.contains(addr)
    }

    #[must_use]
    pub fn flags(&self) -> ThreadFlags {
        ThreadFlags::from_bits_retain(self.flags.load(Ordering::Acquire))
    }

    fn set_flag(&self, flag: ThreadFlags) {
        self.flags.fetch_or(flag.bits(), Ordering::AcqRel);
    }

    fn clear_flag(&self, flag: ThreadFlags) {
        self.flags.fetch_and(!flag.bits(), Ordering::AcqRel);
    }

    pub(crate) fn mark_attached(&self) {
        self.set_flag(ThreadFlags::ATTACHED);
    }

    pub(crate) fn mark_detached(&self) {
        self.set_flag(ThreadFlags::DETACHED);
    }

    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.flags().contains(ThreadFlags::ATTACHED)
    }

    #[must_use]
    pub fn is_detached(&self) -> bool {
        self.flags().contains(ThreadFlags::DETACHED)
    }

    pub fn set_suppress_gc_stress(&self) {
        self.set_flag(ThreadFlags::SUPPRESS_GC_STRESS);
    }

    pub fn clear_suppress_gc_stress(&self) {
        self.clear_flag(ThreadFlags::SUPPRESS_GC_STRESS);
    }

    #[must_use]
    pub fn is_suppress_gc_stress_set(&self) -> bool {
        self.flags().contains(ThreadFlags::SUPPRESS_GC_STRESS)
    }

    pub fn set_do_not_trigger_gc(&self) {
        self.set_flag(ThreadFlags::DO_NOT_TRIGGER_GC);
    }

    /// Clearing an already clear flag is allowed.
    pub fn clear_do_not_trigger_gc(&self) {
        self.clear_flag(ThreadFlags::DO_NOT_TRIGGER_GC);
    }

    #[must_use]
    pub fn is_do_not_trigger_gc_set(&self) -> bool {
        self.flags().contains(ThreadFlags::DO_NOT_TRIGGER_GC)
    }

    /// Marks a collector-owned thread that suspensions do not wait for.
    pub fn set_gc_special(&self) {
        self.set_flag(ThreadFlags::IS_GC_SPECIAL);
    }

    #[must_use]
    pub fn is_gc_special(&self) -> bool {
        self.flags().contains(ThreadFlags::IS_GC_SPECIAL)
    }

    /// The published transition frame: null in cooperative mode.
    #[must_use]
    pub fn raw_transition_frame(&self) -> usize {
        self.transition_frame.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_cooperative(&self) -> bool {
        self.raw_transition_frame() == 0
    }

    #[must_use]
    pub fn cached_transition_frame(&self) -> usize {
        self.cached_transition_frame.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn pinvoke_tunnel(&self) -> usize {
        self.pinvoke_tunnel.load(Ordering::Acquire)
    }

    /// Location of the redirected return address and the original value,
    /// if a hijack is installed.
    #[must_use]
    pub fn hijack_state(&self) -> Option<(*mut usize, usize)> {
        let location = self.hijack_location.load(Ordering::Acquire);
        (location != 0).then(|| {
            (
                location as *mut usize,
                self.hijacked_return_address.load(Ordering::Acquire),
            )
        })
    }

    #[must_use]
    pub fn is_hijacked(&self) -> bool {
        self.hijack_location.load(Ordering::Acquire) != 0
    }

    pub(crate) fn hijack_kind(&self) -> GcRefKind {
        match self.hijack_kind.load(Ordering::Acquire) {
            1 => GcRefKind::Object,
            2 => GcRefKind::Byref,
            _ => GcRefKind::Scalar,
        }
    }

    /// Requests an abort; observed by the thread's next trapped transition.
    pub(crate) fn set_abort_exception(&self, exception: usize) {
        self.abort_exception.store(exception, Ordering::Release);
    }

    #[must_use]
    pub fn abort_exception(&self) -> Option<usize> {
        match self.abort_exception.load(Ordering::Acquire) {
            0 => None,
            exception => Some(exception),
        }
    }

    /// The thread's allocation window.
    ///
    /// # Safety
    ///
    /// Only the owning thread, or the suspending thread while the owner is
    /// parked, may call this, and not re-entrantly.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn alloc_context(&self) -> &mut AllocContext {
        // SAFETY: guaranteed by the caller.
        unsafe { &mut *self.alloc_context.get() }
    }

    #[allow(clippy::mut_from_ref)]
    unsafe fn local(&self) -> &mut LocalData {
        // SAFETY: guaranteed by the caller.
        unsafe { &mut *self.local.get() }
    }
}

/// Stack walks and root reporting trust these bounds, so an attach without
/// them cannot proceed.
fn checked_stack_bounds(bounds: Result<StackBounds, PalError>) -> StackBounds {
    match bounds {
        Ok(bounds) if bounds.low < bounds.high => bounds,
        Ok(bounds) => fatal(
            FatalKind::StackBoundsUnavailable,
            &format!("empty stack range {:#x}..{:#x}", bounds.low, bounds.high),
        ),
        Err(err) => fatal(FatalKind::StackBoundsUnavailable, &format!("querying the stack range: {err}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_stack_bounds_is_fatal() {
        let record = crate::test_util::catch_fatal(|| checked_stack_bounds(Err(PalError::Unsupported))).unwrap_err();
        assert_eq!(record.kind, FatalKind::StackBoundsUnavailable);

        let empty = StackBounds { low: 0x2000, high: 0x2000 };
        let record = crate::test_util::catch_fatal(|| checked_stack_bounds(Ok(empty))).unwrap_err();
        assert_eq!(record.kind, FatalKind::StackBoundsUnavailable);

        let real = StackBounds { low: 0x1000, high: 0x9000 };
        assert_eq!(checked_stack_bounds(Ok(real)), real);
    }
    use crate::test_util::{fake_runtime, run_attached};

    #[test]
    fn test_new_thread_is_preemptive_without_frames() {
        let rt = fake_runtime();
        run_attached(&rt, |thread| {
            assert!(thread.is_attached());
            assert!(!thread.is_cooperative());
            assert_eq!(thread.raw_transition_frame(), TOP_OF_STACK_MARKER);
            assert_eq!(thread.pinvoke_tunnel(), TOP_OF_STACK_MARKER);
            assert!(thread.is_current());
            assert!(!thread.is_hijacked());
        });
    }

    #[test]
    fn test_stack_bounds_cover_locals() {
        let rt = fake_runtime();
        run_attached(&rt, |thread| {
            let local = 0usize;
            assert!(thread.is_within_stack_bounds((&raw const local) as usize));
            assert!(!thread.is_within_stack_bounds(0));
        });
    }

    #[test]
    fn test_diagnostic_flags() {
        let rt = fake_runtime();
        run_attached(&rt, |thread| {
            thread.clear_do_not_trigger_gc();
            assert!(!thread.is_do_not_trigger_gc_set());
            thread.set_do_not_trigger_gc();
            assert!(thread.is_do_not_trigger_gc_set());
            thread.clear_do_not_trigger_gc();
            assert!(!thread.is_do_not_trigger_gc_set());

            thread.set_suppress_gc_stress();
            assert!(thread.is_suppress_gc_stress_set());
            thread.clear_suppress_gc_stress();
            assert!(!thread.flags().contains(ThreadFlags::SUPPRESS_GC_STRESS));
        });
    }

    #[test]
    fn test_current_is_none_when_unattached() {
        std::thread::spawn(|| {
            assert!(Thread::current().is_none());
            assert!(Thread::current_ptr().is_null());
        })
        .join()
        .unwrap();
    }
}
