//! The surface a collector drives.
//!
//! The collector plugs in through two traits: [`GcHeap`] allocates and
//! retires allocation windows, and [`HandleTable`] owns the handle table.
//! In return it calls the root enumerators here from inside
//! [`Runtime::suspend_ee`]/[`Runtime::restart_ee`]. Every root is reported
//! as the address of a word holding a reference, plus [`GcFlags`].

use std::ptr::NonNull;
use std::sync::Arc;

use crate::alloc::{AllocContext, AllocFlags};
use crate::fatal::{fatal, FatalKind};
use crate::gcinfo::GcFlags;
use crate::module::code_manager;
use crate::object;
use crate::runtime::Runtime;
use crate::stackwalk::{report_conservative_range, validate_region, StackFrameIterator};
use crate::thread::Thread;

/// The collector's heap, as the allocation front sees it.
pub trait GcHeap: Send + Sync {
    /// Allocates `size` zeroed bytes, typically by handing `context` a new
    /// window. May run a collection. `None` when the heap is exhausted.
    fn alloc(&self, context: &mut AllocContext, size: usize, flags: AllocFlags) -> Option<NonNull<u8>>;

    /// Makes a freshly initialized large object visible to the collector.
    fn publish_object(&self, object: NonNull<u8>);

    /// Retires the unused part of `context`.
    fn fix_alloc_context(&self, context: &mut AllocContext);
}

impl<H: GcHeap + ?Sized> GcHeap for Arc<H> {
    fn alloc(&self, context: &mut AllocContext, size: usize, flags: AllocFlags) -> Option<NonNull<u8>> {
        (**self).alloc(context, size, flags)
    }

    fn publish_object(&self, object: NonNull<u8>) {
        (**self).publish_object(object);
    }

    fn fix_alloc_context(&self, context: &mut AllocContext) {
        (**self).fix_alloc_context(context);
    }
}

/// Strength of a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandleKind {
    WeakShort,
    WeakLong,
    Strong,
    Pinned,
    /// Keeps a secondary object alive while the primary is.
    Dependent,
}

/// A handle: the address of the slot that holds the object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectHandle(NonNull<usize>);

// SAFETY: a handle is an identity; the table synchronizes slot access.
unsafe impl Send for ObjectHandle {}
// SAFETY: see above.
unsafe impl Sync for ObjectHandle {}

impl ObjectHandle {
    #[must_use]
    pub const fn from_slot(slot: NonNull<usize>) -> Self {
        Self(slot)
    }

    #[must_use]
    pub const fn slot(self) -> NonNull<usize> {
        self.0
    }

    /// The referenced object, or 0.
    ///
    /// # Safety
    ///
    /// The handle must not have been destroyed.
    #[must_use]
    pub unsafe fn object(self) -> usize {
        // SAFETY: guaranteed by the caller.
        unsafe { self.0.as_ptr().read() }
    }
}

/// The collector's handle table.
pub trait HandleTable: Send + Sync {
    fn create(&self, kind: HandleKind, object: usize) -> Option<ObjectHandle>;

    fn create_dependent(&self, primary: usize, secondary: usize) -> Option<ObjectHandle>;

    fn destroy(&self, handle: ObjectHandle);

    fn store(&self, handle: ObjectHandle, object: usize);

    fn dependent_secondary(&self, handle: ObjectHandle) -> usize;

    /// Reports the slots of the handles that keep objects alive.
    fn scan(&self, sc: &ScanContext, report: &mut dyn FnMut(*mut usize, GcFlags));
}

impl<T: HandleTable + ?Sized> HandleTable for Arc<T> {
    fn create(&self, kind: HandleKind, object: usize) -> Option<ObjectHandle> {
        (**self).create(kind, object)
    }

    fn create_dependent(&self, primary: usize, secondary: usize) -> Option<ObjectHandle> {
        (**self).create_dependent(primary, secondary)
    }

    fn destroy(&self, handle: ObjectHandle) {
        (**self).destroy(handle);
    }

    fn store(&self, handle: ObjectHandle, object: usize) {
        (**self).store(handle, object);
    }

    fn dependent_secondary(&self, handle: ObjectHandle) -> usize {
        (**self).dependent_secondary(handle)
    }

    fn scan(&self, sc: &ScanContext, report: &mut dyn FnMut(*mut usize, GcFlags)) {
        (**self).scan(sc, report);
    }
}

/// Per-scan parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScanContext {
    /// Marking rather than relocating. Explicit conservative regions are
    /// only honoured while promoting.
    pub promotion: bool,
    pub condemned_generation: u32,
}

impl ScanContext {
    #[must_use]
    pub const fn promotion() -> Self {
        Self {
            promotion: true,
            condemned_generation: 0,
        }
    }

    #[must_use]
    pub const fn relocation() -> Self {
        Self {
            promotion: false,
            condemned_generation: 0,
        }
    }
}

/// Filters stack roots before they reach the collector.
struct StackReporter<'r> {
    thread: &'r Thread,
    sc: &'r ScanContext,
    heap_low: usize,
    heap_high: usize,
    report: &'r mut dyn FnMut(*mut usize, GcFlags),
}

impl StackReporter<'_> {
    /// Reports `slot`, except interior pointers into the thread's own stack:
    /// those are dropped, or expanded if they name a conservative region.
    fn root(&mut self, slot: *mut usize, flags: GcFlags) {
        if flags.contains(GcFlags::INTERIOR) {
            // SAFETY: enumerated slots are readable.
            let value = unsafe { slot.read() };
            if self.thread.is_within_stack_bounds(value) {
                if self.sc.promotion {
                    if let Some((low, high)) = validate_region(self.thread, value) {
                        self.range(low, high);
                    }
                }
                return;
            }
        }
        (self.report)(slot, flags);
    }

    fn range(&mut self, low: usize, high: usize) {
        // SAFETY: callers pass ranges inside the thread's stack.
        unsafe { report_conservative_range(low, high, self.heap_low, self.heap_high, self.report) };
    }
}

/// Reports every root on `thread`'s stack: live slots of each managed frame,
/// the conservative ranges of managed callouts, a hijacked return value,
/// and the exception objects of its in-flight exceptions.
///
/// # Safety
///
/// The world must be stopped by the caller's [`Runtime::suspend_ee`], or
/// `thread` must be the caller.
pub unsafe fn scan_stack_roots(
    runtime: &Runtime,
    thread: &Thread,
    sc: &ScanContext,
    report: &mut dyn FnMut(*mut usize, GcFlags),
) {
    #[cfg(feature = "tracing")]
    let _span = crate::tracing::internal::trace_scan_stack_roots(thread.os_id());

    let frame = thread.transition_frame();
    if frame == 0 {
        fatal(
            FatalKind::BadTransition,
            &format!("stack scan of thread {} without a transition frame", thread.os_id()),
        );
    }
    let bounds = thread.stack_bounds();
    let barrier = runtime.write_barrier().snapshot();
    let mut reporter = StackReporter {
        thread,
        sc,
        heap_low: barrier.lowest_address,
        heap_high: barrier.highest_address,
        report,
    };

    // SAFETY: the thread is parked or is the caller, per the contract.
    let mut iter = unsafe { StackFrameIterator::new(runtime, thread, frame) };
    if runtime.config().conservative_stack_reporting {
        if let Some((slot, kind)) = iter.hijacked_return_value() {
            if let Some(flags) = kind.report_flags() {
                reporter.root(slot, flags);
            }
        }
        if iter.is_valid() {
            reporter.range(iter.regs().sp(), bounds.high);
        }
    } else {
        loop {
            if let Some((slot, kind)) = iter.hijacked_return_value() {
                if let Some(flags) = kind.report_flags() {
                    reporter.root(slot, flags);
                }
            }
            if let Some((low, high)) = iter.conservative_range() {
                if sc.promotion {
                    reporter.range(low, high);
                }
            }
            let Some(method) = iter.method() else {
                break;
            };
            // SAFETY: the iterator's registers describe the current frame.
            unsafe {
                code_manager::enum_gc_refs(method, iter.code_offset(), iter.regs(), &mut |slot, flags| {
                    reporter.root(slot, flags);
                });
            }
            iter.next_frame();
        }
        // A callout at the base of the walk leaves its range open-ended.
        if let Some(low) = iter.pending_conservative_lower() {
            if sc.promotion {
                reporter.range(low, bounds.high);
            }
        }
    }

    // SAFETY: the chain is stable while the thread is parked.
    unsafe { thread.for_each_exception_slot(&mut |slot| (reporter.report)(slot, GcFlags::empty())) };
    runtime.global_metrics().record_stack_walk();
}

/// Reports the static reference fields of every module and the
/// thread-static fields of every attached thread.
///
/// # Safety
///
/// The world must be stopped by the caller's [`Runtime::suspend_ee`].
pub unsafe fn scan_static_roots(runtime: &Runtime, report: &mut dyn FnMut(*mut usize, GcFlags)) {
    let modules = runtime.modules();
    modules.for_each_module(|module| {
        // SAFETY: registered modules keep their data mapped.
        unsafe { module.enum_static_gc_refs(&mut |slot| report(slot, GcFlags::empty())) };
    });
    for thread in runtime.threads().snapshot() {
        // SAFETY: every other thread is parked.
        unsafe { thread.enum_thread_static_roots(modules, &mut |slot| report(slot, GcFlags::empty())) };
    }
}

/// Forwards to the collector's handle table, if one is installed.
pub fn scan_handle_table_roots(runtime: &Runtime, sc: &ScanContext, report: &mut dyn FnMut(*mut usize, GcFlags)) {
    if let Some(table) = runtime.handle_table() {
        table.scan(sc, report);
    }
}

/// Reports every reference field of `object`.
///
/// # Safety
///
/// `object` must be a live, initialized object.
pub unsafe fn scan_object(object: usize, report: &mut dyn FnMut(*mut usize)) {
    // SAFETY: forwarded from the caller.
    unsafe { object::enum_object_refs(object, report) };
}

/// Retires every thread's allocation window.
///
/// # Safety
///
/// The world must be stopped by the caller's [`Runtime::suspend_ee`].
pub unsafe fn fix_alloc_contexts(runtime: &Runtime) {
    let Some(heap) = runtime.heap() else {
        return;
    };
    // SAFETY: forwarded from the caller.
    unsafe { enum_alloc_contexts(runtime, &mut |context| heap.fix_alloc_context(context)) };
}

/// Calls `f` with every attached thread's allocation window.
///
/// # Safety
///
/// As for [`fix_alloc_contexts`].
pub unsafe fn enum_alloc_contexts(runtime: &Runtime, f: &mut dyn FnMut(&mut AllocContext)) {
    for thread in runtime.threads().snapshot() {
        // SAFETY: the owner is parked, or is the caller.
        f(unsafe { thread.alloc_context() });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::{GcSeries, ModuleDescriptor, Region, StaticGcDesc};
    use crate::regdisplay::POINTER_SIZE;
    use crate::stackwalk::ConservativeRegion;
    use crate::test_util::{fake_runtime, run_attached, RootRecorder};

    fn report_one(thread: &Thread, sc: ScanContext, heap: (usize, usize), slot: *mut usize, flags: GcFlags) -> Vec<(usize, GcFlags)> {
        let mut roots = Vec::new();
        let mut record = |slot: *mut usize, flags: GcFlags| roots.push((slot as usize, flags));
        let mut reporter = StackReporter {
            thread,
            sc: &sc,
            heap_low: heap.0,
            heap_high: heap.1,
            report: &mut record,
        };
        reporter.root(slot, flags);
        roots
    }

    #[test]
    fn test_explicit_region_expands_during_promotion() {
        let rt = fake_runtime();
        run_attached(&rt, |thread| {
            let words = [0x10usize, 0x10_0200, 0x30_0000];
            let base = words.as_ptr() as usize;
            let desc = ConservativeRegion::new(base, base + 3 * POINTER_SIZE);
            let mut root = (&raw const desc) as usize;

            let pinned_interior = GcFlags::INTERIOR | GcFlags::PINNED;
            let roots = report_one(thread, ScanContext::promotion(), (0x10_0000, 0x20_0000), &raw mut root, pinned_interior);
            assert_eq!(roots, vec![(base + POINTER_SIZE, pinned_interior)]);
        });
    }

    #[test]
    fn test_explicit_region_ignored_unless_valid_and_promoting() {
        let rt = fake_runtime();
        run_attached(&rt, |thread| {
            let words = [0x10_0200usize; 2];
            let base = words.as_ptr() as usize;
            let mut desc = ConservativeRegion::new(base, base + 2 * POINTER_SIZE);
            let mut root = (&raw const desc) as usize;
            let heap = (0x10_0000, 0x20_0000);

            assert!(report_one(thread, ScanContext::relocation(), heap, &raw mut root, GcFlags::INTERIOR).is_empty());
            desc.high -= POINTER_SIZE;
            assert!(report_one(thread, ScanContext::promotion(), heap, &raw mut root, GcFlags::INTERIOR).is_empty());
            desc.initialize(base, base + 2 * POINTER_SIZE);
            desc.disable();
            assert!(report_one(thread, ScanContext::promotion(), heap, &raw mut root, GcFlags::INTERIOR).is_empty());
        });
    }

    #[test]
    fn test_heap_interior_pointers_pass_through() {
        let rt = fake_runtime();
        run_attached(&rt, |thread| {
            let mut slot = 0x10_0208usize;
            let location = &raw mut slot;
            let roots = report_one(thread, ScanContext::promotion(), (0, 0), location, GcFlags::INTERIOR);
            assert_eq!(roots, vec![(location as usize, GcFlags::INTERIOR)]);
        });
    }

    #[test]
    fn test_static_roots_cover_modules_and_threads() {
        let rt = fake_runtime();
        let mut data = [0usize; 4];
        let data_start = data.as_mut_ptr() as usize;
        rt.modules()
            .register(ModuleDescriptor::new(Region::new(0x90_0000, 0x100)).with_statics(
                Region::new(data_start, 4 * POINTER_SIZE),
                StaticGcDesc::new(vec![GcSeries { start_offset: 16, size: 16 }]),
            ))
            .unwrap();
        let mut recorder = RootRecorder::default();
        unsafe { scan_static_roots(&rt, &mut recorder.callback()) };
        assert_eq!(
            recorder.slots(),
            vec![data_start + 2 * POINTER_SIZE, data_start + 3 * POINTER_SIZE]
        );
    }

    #[test]
    fn test_handle_scan_without_table_is_empty() {
        let rt = fake_runtime();
        let mut recorder = RootRecorder::default();
        scan_handle_table_roots(&rt, &ScanContext::promotion(), &mut recorder.callback());
        assert!(recorder.roots.is_empty());
    }
}
