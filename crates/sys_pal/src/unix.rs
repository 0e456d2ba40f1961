use std::io::{self, Error};
use std::ptr;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Mutex, OnceLock};

use crate::{ActivationHandler, LimitedContext, PalError, StackBounds};

#[cfg(any(target_os = "linux", target_os = "android"))]
const MAP_POPULATE: libc::c_int = libc::MAP_POPULATE;

#[cfg(not(any(target_os = "linux", target_os = "android")))]
const MAP_POPULATE: libc::c_int = 0;

/// Returns the system page size, cached atomically.
pub fn page_size() -> usize {
    static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

    match PAGE_SIZE.load(Ordering::Relaxed) {
        0 => {
            #[allow(clippy::cast_sign_loss)]
            let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize };
            PAGE_SIZE.store(page_size, Ordering::Relaxed);
            page_size
        }
        page_size => page_size,
    }
}

/// Number of online processors, at least 1.
pub fn processor_count() -> usize {
    static COUNT: AtomicUsize = AtomicUsize::new(0);

    match COUNT.load(Ordering::Relaxed) {
        0 => {
            let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
            let n = usize::try_from(n).unwrap_or(1).max(1);
            COUNT.store(n, Ordering::Relaxed);
            n
        }
        n => n,
    }
}

/// Gives up the rest of the time slice. Returns true if another thread ran.
pub fn switch_to_thread() -> bool {
    unsafe { libc::sched_yield() == 0 }
}

/// OS-level id of the calling thread.
pub fn current_thread_id() -> u64 {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        #[allow(clippy::cast_sign_loss)]
        let tid = unsafe { libc::syscall(libc::SYS_gettid) } as u64;
        tid
    }
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    {
        unsafe { libc::pthread_self() as usize as u64 }
    }
}

/// Stack bounds of the calling thread.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub fn current_stack_bounds() -> Result<StackBounds, PalError> {
    use libc::{
        pthread_attr_destroy, pthread_attr_getstack, pthread_attr_t, pthread_getattr_np,
        pthread_self,
    };

    unsafe {
        let mut attr: pthread_attr_t = std::mem::zeroed();
        let ret = pthread_getattr_np(pthread_self(), &raw mut attr);
        if ret != 0 {
            return Err(PalError::Os(ret));
        }

        let mut stackaddr: *mut libc::c_void = ptr::null_mut();
        let mut stacksize: libc::size_t = 0;
        let ret = pthread_attr_getstack(&raw const attr, &raw mut stackaddr, &raw mut stacksize);
        pthread_attr_destroy(&raw mut attr);
        if ret != 0 {
            return Err(PalError::Os(ret));
        }

        let low = stackaddr as usize;
        Ok(StackBounds {
            low,
            high: low + stacksize,
        })
    }
}

/// Stack bounds of the calling thread.
#[cfg(target_vendor = "apple")]
pub fn current_stack_bounds() -> Result<StackBounds, PalError> {
    unsafe {
        let this = libc::pthread_self();
        let high = libc::pthread_get_stackaddr_np(this) as usize;
        let size = libc::pthread_get_stacksize_np(this);
        Ok(StackBounds {
            low: high - size,
            high,
        })
    }
}

/// Stack bounds of the calling thread.
#[cfg(not(any(target_os = "linux", target_os = "android", target_vendor = "apple")))]
pub fn current_stack_bounds() -> Result<StackBounds, PalError> {
    Err(PalError::Unsupported)
}

/// Handle naming an OS thread, usable from other threads.
#[derive(Debug, Clone, Copy)]
pub struct ThreadHandle {
    raw: libc::pthread_t,
}

impl ThreadHandle {
    /// Handle of the calling thread.
    #[must_use]
    pub fn current() -> Self {
        Self {
            raw: unsafe { libc::pthread_self() },
        }
    }
}

unsafe impl Send for ThreadHandle {}
unsafe impl Sync for ThreadHandle {}

// ---------------------------------------------------------------------------
// Cross-CPU write-buffer flush
// ---------------------------------------------------------------------------

const MEMBARRIER_CMD_PRIVATE_EXPEDITED: libc::c_int = 1 << 3;
const MEMBARRIER_CMD_REGISTER_PRIVATE_EXPEDITED: libc::c_int = 1 << 4;

const MEMBARRIER_UNKNOWN: u8 = 0;
const MEMBARRIER_READY: u8 = 1;
const MEMBARRIER_UNAVAILABLE: u8 = 2;

static MEMBARRIER_STATE: AtomicU8 = AtomicU8::new(MEMBARRIER_UNKNOWN);

#[cfg(any(target_os = "linux", target_os = "android"))]
fn membarrier(cmd: libc::c_int) -> bool {
    unsafe { libc::syscall(libc::SYS_membarrier, cmd, 0, 0) == 0 }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
const fn membarrier(_cmd: libc::c_int) -> bool {
    false
}

struct HelperPage {
    map: crate::Mmap,
    lock: Mutex<()>,
}

fn helper_page() -> Option<&'static HelperPage> {
    static PAGE: OnceLock<Option<HelperPage>> = OnceLock::new();
    PAGE.get_or_init(|| {
        let map = unsafe {
            crate::MmapOptions::new()
                .len(page_size())
                .populate(true)
                .map_anon()
                .ok()?
        };
        Some(HelperPage {
            map,
            lock: Mutex::new(()),
        })
    })
    .as_ref()
}

/// Forces every CPU running a thread of this process to drain its store buffer.
///
/// Uses the expedited `membarrier` command where the kernel offers it and
/// falls back to changing the protection of a private page, which makes the
/// kernel interrupt every CPU that may cache a translation for it.
pub fn flush_process_write_buffers() {
    match MEMBARRIER_STATE.load(Ordering::Acquire) {
        MEMBARRIER_READY => {
            if membarrier(MEMBARRIER_CMD_PRIVATE_EXPEDITED) {
                return;
            }
        }
        MEMBARRIER_UNKNOWN => {
            let state = if membarrier(MEMBARRIER_CMD_REGISTER_PRIVATE_EXPEDITED) {
                MEMBARRIER_READY
            } else {
                MEMBARRIER_UNAVAILABLE
            };
            MEMBARRIER_STATE.store(state, Ordering::Release);
            if state == MEMBARRIER_READY && membarrier(MEMBARRIER_CMD_PRIVATE_EXPEDITED) {
                return;
            }
        }
        _ => {}
    }

    let Some(page) = helper_page() else {
        std::sync::atomic::fence(Ordering::SeqCst);
        return;
    };

    let _guard = page
        .lock
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    unsafe {
        let addr = page.map.ptr().cast::<libc::c_void>();
        libc::mprotect(addr, page.map.len(), libc::PROT_READ | libc::PROT_WRITE);
        let cell = &*page.map.ptr().cast::<AtomicUsize>();
        cell.fetch_add(1, Ordering::SeqCst);
        libc::mprotect(addr, page.map.len(), libc::PROT_NONE);
    }
}

// ---------------------------------------------------------------------------
// Activations
// ---------------------------------------------------------------------------

static ACTIVATION_HANDLER: OnceLock<ActivationHandler> = OnceLock::new();

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
fn activation_signal() -> libc::c_int {
    libc::SIGRTMIN()
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
extern "C" fn activation_signal_handler(
    _sig: libc::c_int,
    _info: *mut libc::siginfo_t,
    ucontext: *mut libc::c_void,
) {
    let Some(handler) = ACTIVATION_HANDLER.get() else {
        return;
    };

    unsafe {
        let saved_errno = *libc::__errno_location();

        let uc = &*ucontext.cast::<libc::ucontext_t>();
        let gregs = &uc.uc_mcontext.gregs;
        #[allow(clippy::cast_sign_loss)]
        let reg = |index: libc::c_int| gregs[index as usize] as usize;
        let ctx = LimitedContext {
            ip: reg(libc::REG_RIP),
            sp: reg(libc::REG_RSP),
            rbp: reg(libc::REG_RBP),
            rbx: reg(libc::REG_RBX),
            rsi: reg(libc::REG_RSI),
            rdi: reg(libc::REG_RDI),
            r12: reg(libc::REG_R12),
            r13: reg(libc::REG_R13),
            r14: reg(libc::REG_R14),
            r15: reg(libc::REG_R15),
            rax: reg(libc::REG_RAX),
            rcx: reg(libc::REG_RCX),
            rdx: reg(libc::REG_RDX),
            r8: reg(libc::REG_R8),
            r9: reg(libc::REG_R9),
            r10: reg(libc::REG_R10),
            r11: reg(libc::REG_R11),
        };
        handler(&ctx);

        *libc::__errno_location() = saved_errno;
    }
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub fn register_activation_handler(handler: ActivationHandler) -> Result<(), PalError> {
    static INSTALLED: OnceLock<Result<(), PalError>> = OnceLock::new();

    let _ = ACTIVATION_HANDLER.set(handler);
    *INSTALLED.get_or_init(|| unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = activation_signal_handler as usize;
        action.sa_flags = libc::SA_SIGINFO | libc::SA_RESTART;
        libc::sigemptyset(&raw mut action.sa_mask);
        if libc::sigaction(activation_signal(), &raw const action, ptr::null_mut()) != 0 {
            return Err(PalError::last_os_error());
        }
        Ok(())
    })
}

#[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
pub fn register_activation_handler(handler: ActivationHandler) -> Result<(), PalError> {
    let _ = ACTIVATION_HANDLER.set(handler);
    Err(PalError::Unsupported)
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub fn inject_activation(thread: &ThreadHandle) -> Result<(), PalError> {
    if ACTIVATION_HANDLER.get().is_none() {
        return Err(PalError::Unsupported);
    }
    match unsafe { libc::pthread_kill(thread.raw, activation_signal()) } {
        0 => Ok(()),
        err => Err(PalError::Os(err)),
    }
}

#[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
pub const fn inject_activation(_thread: &ThreadHandle) -> Result<(), PalError> {
    Err(PalError::Unsupported)
}

pub fn suspend_and_inspect<F>(_thread: &ThreadHandle, _inspect: F) -> Result<(), PalError>
where
    F: FnOnce(&LimitedContext),
{
    Err(PalError::Unsupported)
}

// ---------------------------------------------------------------------------
// Mappings
// ---------------------------------------------------------------------------

pub struct MmapInner {
    ptr: *mut libc::c_void,
    len: usize,
}

impl MmapInner {
    /// Creates a new anonymous memory mapping.
    ///
    /// # Safety
    ///
    /// This function is unsafe because it calls `mmap`.
    pub unsafe fn map_anon(len: usize, populate: bool) -> io::Result<Self> {
        let populate = if populate { MAP_POPULATE } else { 0 };

        let flags = libc::MAP_PRIVATE | libc::MAP_ANON | populate;
        let prot = libc::PROT_READ | libc::PROT_WRITE;

        let ptr = unsafe { libc::mmap(ptr::null_mut(), len, prot, flags, -1, 0) };

        if ptr == libc::MAP_FAILED {
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
            unsafe {
                libc::munmap(self.ptr, self.len);
            }
        }
    }
}

unsafe impl Send for MmapInner {}
unsafe impl Sync for MmapInner {}
