//! Platform primitives used by the managed runtime core.
//!
//! Everything the core needs from the operating system goes through this
//! crate: page-granular mappings, the current thread's stack bounds, thread
//! handles, the cross-CPU write-buffer flush, and the activation primitive the
//! hijack engine uses to look at a thread that is running managed code.

use std::fmt;
use std::io;

mod context;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use unix as os;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
use windows as os;

pub use context::LimitedContext;
pub use os::{
    current_stack_bounds, current_thread_id, flush_process_write_buffers, page_size,
    processor_count, switch_to_thread, ThreadHandle,
};

/// Errors reported by platform calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PalError {
    /// The primitive is not available on this target.
    Unsupported,
    /// The OS handed back a context that may not reflect a stable user-mode
    /// state (the thread was inside a kernel transition). Callers retry.
    UnstableContext,
    /// The OS call failed with the given error code.
    Os(i32),
}

impl PalError {
    pub(crate) fn last_os_error() -> Self {
        Self::Os(io::Error::last_os_error().raw_os_error().unwrap_or(-1))
    }
}

impl fmt::Display for PalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unsupported => f.write_str("operation not supported on this platform"),
            Self::UnstableContext => f.write_str("thread context is not a stable snapshot"),
            Self::Os(code) => write!(f, "os error {code}"),
        }
    }
}

impl std::error::Error for PalError {}

/// Bounds of a thread's stack. The stack grows down from `high` towards `low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackBounds {
    /// Lowest usable address.
    pub low: usize,
    /// One past the highest address (the stack base).
    pub high: usize,
}

impl StackBounds {
    /// Returns true if `addr` lies inside `[low, high)`.
    #[must_use]
    pub const fn contains(&self, addr: usize) -> bool {
        self.low <= addr && addr < self.high
    }
}

/// Function run on a thread that received an activation.
///
/// Runs in signal context on Unix, so it must restrict itself to atomics and
/// plain memory accesses.
pub type ActivationHandler = fn(&LimitedContext);

/// Installs the process-wide activation handler.
///
/// The first registration wins; later calls are no-ops returning `Ok`.
///
/// # Errors
///
/// Returns [`PalError::Unsupported`] where activations are not implemented and
/// [`PalError::Os`] if the handler could not be installed.
pub fn register_activation_handler(handler: ActivationHandler) -> Result<(), PalError> {
    os::register_activation_handler(handler)
}

/// Interrupts `thread` and runs the registered activation handler on it with
/// the interrupted register state.
///
/// The call returns as soon as the activation is queued; it does not wait for
/// the handler to run.
///
/// # Errors
///
/// Returns [`PalError::Unsupported`] on targets without asynchronous
/// activations, or [`PalError::Os`] if the OS refused the request.
pub fn inject_activation(thread: &ThreadHandle) -> Result<(), PalError> {
    os::inject_activation(thread)
}

/// Suspends `thread`, hands its register context to `inspect` on the calling
/// thread, and resumes it.
///
/// # Errors
///
/// Returns [`PalError::UnstableContext`] if the captured context is not a
/// reliable user-mode snapshot, [`PalError::Unsupported`] on targets that
/// only offer asynchronous activations, and [`PalError::Os`] on failures.
pub fn suspend_and_inspect<F>(thread: &ThreadHandle, inspect: F) -> Result<(), PalError>
where
    F: FnOnce(&LimitedContext),
{
    os::suspend_and_inspect(thread, inspect)
}

/// A handle to a memory mapped region.
///
/// The region is automatically unmapped when this handle is dropped.
pub struct Mmap {
    inner: os::MmapInner,
}

impl Mmap {
    /// Returns a pointer to the start of the memory mapping.
    #[must_use]
    pub fn ptr(&self) -> *mut u8 {
        self.inner.ptr()
    }

    /// Returns the length of the memory mapping in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns true if the mapping is empty. Mappings are never empty once created.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.len() == 0
    }
}

unsafe impl Send for Mmap {}
unsafe impl Sync for Mmap {}

/// Configuration for creating a memory mapping.
#[derive(Debug, Clone, Default)]
pub struct MmapOptions {
    len: usize,
    populate: bool,
}

impl MmapOptions {
    /// Creates a new `MmapOptions` with length 0. A length must be set before mapping.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            len: 0,
            populate: false,
        }
    }

    /// Sets the length of the mapping in bytes.
    #[must_use]
    pub const fn len(mut self, len: usize) -> Self {
        self.len = len;
        self
    }

    /// Sets whether to prefault the page tables (`MAP_POPULATE` on Linux).
    #[must_use]
    pub const fn populate(mut self, populate: bool) -> Self {
        self.populate = populate;
        self
    }

    /// Creates an anonymous read-write mapping.
    ///
    /// # Errors
    ///
    /// Fails with `InvalidInput` for a zero length, or with the OS error.
    ///
    /// # Safety
    ///
    /// The returned pointer is valid only while the `Mmap` is alive.
    pub unsafe fn map_anon(&self) -> io::Result<Mmap> {
        if self.len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "length must be greater than 0",
            ));
        }

        let inner = unsafe { os::MmapInner::map_anon(self.len, self.populate)? };

        Ok(Mmap { inner })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ptr;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_page_size() {
        let ps = page_size();
        assert!(ps > 0);
        assert_eq!(ps & (ps - 1), 0, "Page size should be power of 2");
    }

    #[test]
    fn test_basic_map() {
        let len = page_size();
        let mmap = unsafe {
            MmapOptions::new()
                .len(len)
                .map_anon()
                .expect("failed to map")
        };

        let ptr = mmap.ptr();
        assert!(!ptr.is_null());
        assert_eq!(ptr as usize % page_size(), 0);
        assert_eq!(mmap.len(), len);

        unsafe {
            ptr::write_volatile(ptr, 42);
            assert_eq!(ptr::read_volatile(ptr), 42);
        }
    }

    #[test]
    fn test_zero_length_map_is_rejected() {
        let err = unsafe { MmapOptions::new().map_anon() }.err().expect("zero length");
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_stack_bounds_contain_local() {
        let Ok(bounds) = current_stack_bounds() else {
            return;
        };
        let local = 0usize;
        let addr = ptr::addr_of!(local) as usize;
        assert!(bounds.low < bounds.high);
        assert!(bounds.contains(addr), "{addr:#x} not in {bounds:?}");
    }

    #[test]
    fn test_stack_bounds_on_spawned_thread() {
        let handle = std::thread::spawn(|| {
            let local = 7u64;
            let addr = ptr::addr_of!(local) as usize;
            current_stack_bounds().map(|b| b.contains(addr))
        });
        if let Ok(contained) = handle.join().unwrap() {
            assert!(contained);
        }
    }

    #[test]
    fn test_processor_count() {
        assert!(processor_count() >= 1);
    }

    #[test]
    fn test_thread_ids_differ() {
        let here = current_thread_id();
        let there = std::thread::spawn(current_thread_id).join().unwrap();
        assert_ne!(here, there);
        assert_eq!(here, current_thread_id());
    }

    #[test]
    fn test_flush_process_write_buffers_is_repeatable() {
        for _ in 0..4 {
            flush_process_write_buffers();
        }
    }

    #[test]
    fn test_flush_with_concurrent_writer() {
        let stop = Arc::new(AtomicBool::new(false));
        let writer = {
            let stop = Arc::clone(&stop);
            std::thread::spawn(move || {
                let mut n = 0u64;
                while !stop.load(Ordering::Relaxed) {
                    n = n.wrapping_add(1);
                    std::hint::black_box(n);
                }
            })
        };
        for _ in 0..16 {
            flush_process_write_buffers();
        }
        stop.store(true, Ordering::Relaxed);
        writer.join().unwrap();
    }

    #[test]
    fn test_switch_to_thread_does_not_block() {
        let _ = switch_to_thread();
    }
}
