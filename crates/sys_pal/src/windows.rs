use std::io::{self, Error};
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::OnceLock;

use windows_sys::Win32::Foundation::{CloseHandle, DuplicateHandle, DUPLICATE_SAME_ACCESS, HANDLE};
use windows_sys::Win32::System::Memory::{
    VirtualAlloc, VirtualFree, MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_READWRITE,
};
use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};
use windows_sys::Win32::System::Threading::{
    FlushProcessWriteBuffers, GetCurrentProcess, GetCurrentThread, GetCurrentThreadId,
    GetCurrentThreadStackLimits, ResumeThread, SuspendThread, SwitchToThread,
};

use crate::{ActivationHandler, LimitedContext, PalError, StackBounds};

fn system_info() -> SYSTEM_INFO {
    unsafe {
        let mut info: SYSTEM_INFO = mem::zeroed();
        GetSystemInfo(&mut info);
        info
    }
}

pub fn page_size() -> usize {
    static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

    match PAGE_SIZE.load(Ordering::Relaxed) {
        0 => {
            let size = match system_info().dwPageSize as usize {
                0 => 4096,
                size => size,
            };
            PAGE_SIZE.store(size, Ordering::Relaxed);
            size
        }
        size => size,
    }
}

pub fn processor_count() -> usize {
    (system_info().dwNumberOfProcessors as usize).max(1)
}

pub fn switch_to_thread() -> bool {
    unsafe { SwitchToThread() != 0 }
}

pub fn current_thread_id() -> u64 {
    u64::from(unsafe { GetCurrentThreadId() })
}

pub fn current_stack_bounds() -> Result<StackBounds, PalError> {
    let mut low = 0usize;
    let mut high = 0usize;
    unsafe { GetCurrentThreadStackLimits(&mut low, &mut high) };
    Ok(StackBounds { low, high })
}

pub fn flush_process_write_buffers() {
    unsafe { FlushProcessWriteBuffers() };
}

/// Real (non-pseudo) handle to an OS thread.
#[derive(Debug)]
pub struct ThreadHandle {
    raw: HANDLE,
}

impl ThreadHandle {
    /// Handle of the calling thread.
    ///
    /// # Panics
    ///
    /// Panics if the pseudo handle cannot be duplicated, which only happens
    /// when the process is out of handles.
    #[must_use]
    pub fn current() -> Self {
        let mut raw: HANDLE = ptr::null_mut();
        let ok = unsafe {
            DuplicateHandle(
                GetCurrentProcess(),
                GetCurrentThread(),
                GetCurrentProcess(),
                &mut raw,
                0,
                0,
                DUPLICATE_SAME_ACCESS,
            )
        };
        assert!(ok != 0, "DuplicateHandle failed for the current thread");
        Self { raw }
    }
}

impl Drop for ThreadHandle {
    fn drop(&mut self) {
        unsafe { CloseHandle(self.raw) };
    }
}

unsafe impl Send for ThreadHandle {}
unsafe impl Sync for ThreadHandle {}

static ACTIVATION_HANDLER: OnceLock<ActivationHandler> = OnceLock::new();

pub fn register_activation_handler(handler: ActivationHandler) -> Result<(), PalError> {
    let _ = ACTIVATION_HANDLER.set(handler);
    Err(PalError::Unsupported)
}

pub const fn inject_activation(_thread: &ThreadHandle) -> Result<(), PalError> {
    Err(PalError::Unsupported)
}

#[cfg(target_arch = "x86_64")]
pub fn suspend_and_inspect<F>(thread: &ThreadHandle, inspect: F) -> Result<(), PalError>
where
    F: FnOnce(&LimitedContext),
{
    use windows_sys::Win32::System::Diagnostics::Debug::{
        GetThreadContext, CONTEXT, CONTEXT_CONTROL_AMD64, CONTEXT_EXCEPTION_ACTIVE,
        CONTEXT_EXCEPTION_REPORTING, CONTEXT_EXCEPTION_REQUEST, CONTEXT_INTEGER_AMD64,
        CONTEXT_SERVICE_ACTIVE,
    };

    if unsafe { SuspendThread(thread.raw) } == u32::MAX {
        return Err(PalError::last_os_error());
    }

    let mut ctx: CONTEXT = unsafe { mem::zeroed() };
    ctx.ContextFlags = CONTEXT_CONTROL_AMD64 | CONTEXT_INTEGER_AMD64 | CONTEXT_EXCEPTION_REQUEST;

    let result = if unsafe { GetThreadContext(thread.raw, &mut ctx) } == 0 {
        Err(PalError::last_os_error())
    } else if (ctx.ContextFlags & CONTEXT_EXCEPTION_REPORTING) == 0
        || (ctx.ContextFlags & (CONTEXT_SERVICE_ACTIVE | CONTEXT_EXCEPTION_ACTIVE)) != 0
    {
        Err(PalError::UnstableContext)
    } else {
        #[allow(clippy::cast_possible_truncation)]
        let limited = LimitedContext {
            ip: ctx.Rip as usize,
            sp: ctx.Rsp as usize,
            rbp: ctx.Rbp as usize,
            rbx: ctx.Rbx as usize,
            rsi: ctx.Rsi as usize,
            rdi: ctx.Rdi as usize,
            r12: ctx.R12 as usize,
            r13: ctx.R13 as usize,
            r14: ctx.R14 as usize,
            r15: ctx.R15 as usize,
            rax: ctx.Rax as usize,
            rcx: ctx.Rcx as usize,
            rdx: ctx.Rdx as usize,
            r8: ctx.R8 as usize,
            r9: ctx.R9 as usize,
            r10: ctx.R10 as usize,
            r11: ctx.R11 as usize,
        };
        inspect(&limited);
        Ok(())
    };

    unsafe { ResumeThread(thread.raw) };
    result
}

#[cfg(not(target_arch = "x86_64"))]
pub fn suspend_and_inspect<F>(_thread: &ThreadHandle, _inspect: F) -> Result<(), PalError>
where
    F: FnOnce(&LimitedContext),
{
    Err(PalError::Unsupported)
}

pub struct MmapInner {
    ptr: *mut std::ffi::c_void,
    len: usize,
}

impl MmapInner {
    /// Creates a new anonymous memory mapping.
    pub unsafe fn map_anon(len: usize, _populate: bool) -> io::Result<Self> {
        let ptr = unsafe { VirtualAlloc(ptr::null(), len, MEM_COMMIT | MEM_RESERVE, PAGE_READWRITE) };

        if ptr.is_null() {
            return Err(Error::last_os_error());
        }

        Ok(Self { ptr, len })
    }

    pub const fn ptr(&self) -> *mut u8 {
        self.ptr.cast::<u8>()
    }

    pub const fn len(&self) -> usize {
        self.len
    }
}

impl Drop for MmapInner {
    fn drop(&mut self) {
        if self.len > 0 {
            // MEM_RELEASE requires dwSize to be 0
            unsafe { VirtualFree(self.ptr, 0, MEM_RELEASE) };
        }
    }
}

unsafe impl Send for MmapInner {}
unsafe impl Sync for MmapInner {}
