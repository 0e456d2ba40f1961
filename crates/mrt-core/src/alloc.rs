//! The allocation front.
//!
//! Small objects are bump-allocated from the calling thread's
//! [`AllocContext`], a window of the heap the collector handed to the
//! thread. Anything else goes to the collector's [`GcHeap`], which may
//! trigger a collection; the caller's frame is published as the thread's
//! tunnel first so the collection can walk the caller's stack.

use std::ptr::NonNull;

use bitflags::bitflags;

use crate::fatal::{fatal, FatalKind};
use crate::gc_interface::GcHeap;
use crate::object::{self, TypeDescriptor};
use crate::runtime::Runtime;
use crate::thread::{Thread, TransitionFrame, TOP_OF_STACK_MARKER};

/// Objects at least this large are allocated in the large object heap.
pub const LARGE_OBJECT_SIZE: usize = 85_000;

bitflags! {
    /// Requests passed to [`GcHeap::alloc`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct AllocFlags: u32 {
        const FINALIZE = 0x1;
        const CONTAINS_REF = 0x2;
        const ALIGN8_BIAS = 0x4;
        const ALIGN8 = 0x8;
    }
}

/// A thread's private allocation window.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AllocContext {
    pub alloc_ptr: usize,
    pub alloc_limit: usize,
    /// Bytes allocated on the small object heap through this context.
    pub alloc_bytes: u64,
    /// Bytes allocated on the large object heap through this context.
    pub alloc_bytes_loh: u64,
    pub alloc_count: u32,
}

impl AllocContext {
    /// Bump-allocates `size` bytes, if the window has room.
    pub fn try_bump(&mut self, size: usize) -> Option<usize> {
        let result = self.alloc_ptr;
        let advance = result.checked_add(size)?;
        if result == 0 || advance > self.alloc_limit {
            return None;
        }
        self.alloc_ptr = advance;
        self.alloc_bytes += size as u64;
        Some(result)
    }

    /// Bytes left in the window.
    #[must_use]
    pub const fn remaining(&self) -> usize {
        self.alloc_limit.saturating_sub(self.alloc_ptr)
    }

    /// Forgets the window; the collector has retired it.
    pub fn clear(&mut self) {
        self.alloc_ptr = 0;
        self.alloc_limit = 0;
    }
}

/// Allocates an instance of `ty` with `element_count` elements for arrays.
///
/// `frame` must describe the caller's registers: it becomes the thread's
/// tunnel frame for the duration of a slow-path allocation. Returns `None`
/// when the heap is exhausted; the caller raises the out-of-memory
/// exception.
///
/// Requests beyond the configured object-size or element-count limits are
/// fatal.
///
/// # Safety
///
/// `thread` must be the calling thread, in cooperative mode, and `frame`
/// must stay live until the call returns.
pub unsafe fn gc_alloc(
    runtime: &Runtime,
    thread: &Thread,
    ty: &'static TypeDescriptor,
    flags: AllocFlags,
    element_count: usize,
    frame: *mut TransitionFrame,
) -> Option<NonNull<u8>> {
    let config = runtime.config();
    if ty.is_array() && element_count > config.max_array_length {
        fatal(
            FatalKind::ObjectTooLarge,
            &format!("array of {element_count} elements exceeds {}", config.max_array_length),
        );
    }
    let size = match ty.instance_size(element_count) {
        Some(size) if size < config.max_object_size => size,
        _ => fatal(
            FatalKind::ObjectTooLarge,
            &format!("{element_count} elements of {} bytes", ty.component_size),
        ),
    };

    let mut flags = flags;
    if ty.has_finalizer() {
        flags |= AllocFlags::FINALIZE;
    }
    if ty.has_reference_fields() {
        flags |= AllocFlags::CONTAINS_REF;
    }
    if ty.requires_align8() {
        flags |= AllocFlags::ALIGN8;
    }

    // SAFETY: the caller is the owning thread.
    let context = unsafe { thread.alloc_context() };
    if !flags.intersects(AllocFlags::FINALIZE | AllocFlags::ALIGN8) && size < LARGE_OBJECT_SIZE {
        if let Some(object) = context.try_bump(size) {
            // SAFETY: the window belongs to this thread and covers `size` bytes.
            unsafe { object::init_object(object, ty, element_count) };
            return NonNull::new(object as *mut u8);
        }
    }

    let heap = runtime.heap()?;
    let object = alloc_slow(heap, thread, context, size, flags, frame)?;
    let address = object.as_ptr() as usize;
    // SAFETY: the heap returned `size` writable bytes.
    unsafe { object::init_object(address, ty, element_count) };
    if size >= LARGE_OBJECT_SIZE {
        context.alloc_bytes_loh += size as u64;
        heap.publish_object(object);
    }
    Some(object)
}

fn alloc_slow(
    heap: &dyn GcHeap,
    thread: &Thread,
    context: &mut AllocContext,
    size: usize,
    flags: AllocFlags,
    frame: *mut TransitionFrame,
) -> Option<NonNull<u8>> {
    if thread.is_do_not_trigger_gc_set() {
        fatal(FatalKind::BadTransition, "allocation slow path with gc triggering disabled");
    }
    let previous = thread.pinvoke_tunnel();
    // SAFETY: the caller keeps `frame` live across this call.
    unsafe { thread.set_pinvoke_tunnel(frame) };
    context.alloc_count += 1;
    let object = heap.alloc(context, size, flags);
    let previous = if previous == TOP_OF_STACK_MARKER {
        std::ptr::null_mut()
    } else {
        previous as *mut TransitionFrame
    };
    // SAFETY: the previous tunnel was live when published and still is.
    unsafe { thread.set_pinvoke_tunnel(previous) };
    object
}
