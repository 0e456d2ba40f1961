//! The set of attached threads and the stop-the-world coordinator.
//!
//! Suspension is a two-phase handshake. The coordinator sets
//! [`TrapFlags::TRAP_THREADS`], flushes every CPU's write buffer, and then
//! reads each thread's transition frame. A mutator publishes its frame, issues
//! a full fence, and then reads the trap word. One of the two always sees the
//! other's write, so every mutator either published a frame the coordinator
//! caches, or observed the trap and parks itself.

use std::sync::atomic::{fence, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bitflags::bitflags;
use crossbeam::utils::CachePadded;
use parking_lot::lock_api::RawMutex as _;
use parking_lot::{Mutex, RawMutex};

use super::{FrameFlags, Thread, TransitionFrame, TOP_OF_STACK_MARKER};
use crate::fatal::{fatal, FatalKind};
use crate::metrics::SuspendMetrics;
use crate::runtime::Runtime;
use crate::sync::lock_order::{LockGuard, LockOrder};
use crate::sync::{Event, RwLock};
use crate::thread::hijack::HijackOutcome;

bitflags! {
    /// Bits of the process-wide trap word every safe point checks.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct TrapFlags: u32 {
        /// A suspension is in progress; cooperative threads must park.
        const TRAP_THREADS = 0x1;
        /// Some thread has a pending abort request.
        const ABORT_IN_PROGRESS = 0x2;
    }
}

/// State a mutator consults on every mode transition.
#[derive(Debug)]
pub struct SuspendState {
    trap_threads: CachePadded<AtomicU32>,
    suspending_thread: AtomicUsize,
    suspend_complete: Event,
    gc_complete: Event,
}

impl SuspendState {
    fn new() -> Self {
        Self {
            trap_threads: CachePadded::new(AtomicU32::new(0)),
            suspending_thread: AtomicUsize::new(0),
            suspend_complete: Event::new_manual(true),
            gc_complete: Event::new_manual(true),
        }
    }

    #[must_use]
    pub fn trap_flags(&self) -> TrapFlags {
        TrapFlags::from_bits_retain(self.trap_threads.load(Ordering::Acquire))
    }

    /// Whether any trap bit is set; the fast paths of the transition helpers
    /// bail out on this.
    #[inline]
    pub(crate) fn is_trapped(&self) -> bool {
        self.trap_threads.load(Ordering::Acquire) != 0
    }

    #[must_use]
    pub fn is_trap_threads_requested(&self) -> bool {
        self.trap_flags().contains(TrapFlags::TRAP_THREADS)
    }

    pub(crate) fn is_suspending(&self, thread: &Thread) -> bool {
        self.suspending_thread.load(Ordering::Acquire) == std::ptr::from_ref(thread) as usize
    }

    /// Blocks until the coordinator has parked every thread.
    pub fn wait_for_suspend_complete(&self) {
        self.suspend_complete.wait(None);
    }

    /// Blocks until the current collection has resumed the world.
    pub fn wait_for_gc_completion(&self) {
        self.gc_complete.wait(None);
    }
}

/// All attached threads of a runtime.
pub struct ThreadStore {
    shared: Arc<SuspendState>,
    /// Read side held for a whole suspension, write side to attach or detach.
    lock: RwLock,
    threads: Mutex<Vec<Arc<Thread>>>,
    suspend_lock: RawMutex,
    suspend_order: Mutex<Option<LockGuard>>,
}

impl std::fmt::Debug for ThreadStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadStore")
            .field("threads", &self.thread_count())
            .field("trap", &self.shared.trap_flags())
            .finish_non_exhaustive()
    }
}

impl ThreadStore {
    pub(crate) fn new(spin_initial_delay: u32, spin_backoff_factor: u32, spin_max_delay: u32) -> Self {
        Self {
            shared: Arc::new(SuspendState::new()),
            lock: RwLock::with_backoff(spin_initial_delay, spin_backoff_factor, spin_max_delay),
            threads: Mutex::new(Vec::new()),
            suspend_lock: RawMutex::INIT,
            suspend_order: Mutex::new(None),
        }
    }

    pub(crate) const fn shared(&self) -> &Arc<SuspendState> {
        &self.shared
    }

    #[must_use]
    pub fn trap_flags(&self) -> TrapFlags {
        self.shared.trap_flags()
    }

    #[must_use]
    pub fn suspend_state(&self) -> &SuspendState {
        &self.shared
    }

    /// Registers the calling OS thread with `runtime`.
    ///
    /// `lock_held` is for threads started by the suspending thread while it
    /// holds the store lock; they must not wait for it.
    pub(crate) fn attach_current_thread(&self, runtime: &Arc<Runtime>, lock_held: bool) -> Arc<Thread> {
        if let Some(existing) = Thread::current() {
            if !existing.is_detached() {
                if existing.belongs_to(runtime) {
                    return existing;
                }
                if existing.runtime().is_some() {
                    fatal(
                        FatalKind::DoubleAttach,
                        &format!("os thread {} is attached to another runtime", existing.os_id()),
                    );
                }
            }
        }

        let thread = Arc::new(Thread::new(runtime));
        if lock_held {
            self.threads.lock().push(Arc::clone(&thread));
        } else {
            // Joining during a suspension would hand the coordinator a thread
            // it has not trapped.
            if self.shared.is_trap_threads_requested() {
                self.shared.wait_for_gc_completion();
            }
            let _order = LockGuard::new(LockOrder::ThreadStore);
            let _guard = self.lock.write();
            self.threads.lock().push(Arc::clone(&thread));
        }
        thread.mark_attached();
        Thread::bind_current(&thread);

        #[cfg(feature = "tracing")]
        crate::tracing::internal::log_thread_event("attach", thread.os_id());

        thread
    }

    /// Unlinks `thread`. Detaching twice is silent.
    pub(crate) fn detach(&self, thread: &Arc<Thread>) -> bool {
        if thread.is_detached() {
            return false;
        }
        if self.shared.is_suspending(thread) {
            fatal(
                FatalKind::DetachDuringSuspension,
                &format!("os thread {} exited while suspending the runtime", thread.os_id()),
            );
        }
        {
            let _order = LockGuard::new(LockOrder::ThreadStore);
            let _guard = self.lock.write();
            self.threads.lock().retain(|t| !Arc::ptr_eq(t, thread));
        }
        thread.free_thread_local_storage();
        thread.mark_detached();

        #[cfg(feature = "tracing")]
        crate::tracing::internal::log_thread_event("detach", thread.os_id());

        true
    }

    #[must_use]
    pub fn thread_count(&self) -> usize {
        self.threads.lock().len()
    }

    /// The attached threads at this instant.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<Thread>> {
        self.threads.lock().clone()
    }

    /// The calling thread's record, if it is attached to this store.
    #[must_use]
    pub fn get_current_thread_if_available(&self) -> Option<Arc<Thread>> {
        Thread::current().filter(|t| Arc::ptr_eq(t.shared(), &self.shared) && !t.is_detached())
    }

    fn acquire_suspend_lock(&self, current: Option<&Thread>) {
        loop {
            if self.suspend_lock.try_lock() {
                return;
            }
            // Another collector is suspending. A cooperative caller would
            // stall it, so park in preemptive mode on the tunnel frame.
            if let Some(thread) = current.filter(|t| t.is_cooperative()) {
                let tunnel = thread.pinvoke_tunnel();
                if tunnel == TOP_OF_STACK_MARKER {
                    fatal(
                        FatalKind::BadTransition,
                        "suspension requested in cooperative mode without a tunnel frame",
                    );
                }
                // SAFETY: the tunnel was published by this thread and is live
                // for as long as it stays cooperative.
                unsafe { thread.wait_for_gc(tunnel as *mut TransitionFrame) };
                continue;
            }
            sys_pal::switch_to_thread();
        }
    }

    /// Brings every other thread to a safe point.
    ///
    /// Returns once each thread has a cached transition frame, is flagged
    /// [`IS_GC_SPECIAL`](super::ThreadFlags::IS_GC_SPECIAL), or is detached.
    pub(crate) fn suspend_all_threads(&self, runtime: &Runtime, wait_for_gc_event: bool) -> SuspendMetrics {
        let start = Instant::now();
        let current_ptr = Thread::current_ptr();
        // SAFETY: the calling thread's record outlives this call.
        let current = unsafe { current_ptr.as_ref() };

        self.acquire_suspend_lock(current);
        *self.suspend_order.lock() = Some(LockGuard::new(LockOrder::ThreadStore));
        self.lock.acquire_read();

        self.shared.suspending_thread.store(current_ptr as usize, Ordering::Release);
        if wait_for_gc_event {
            self.shared.gc_complete.reset();
        }
        self.shared.suspend_complete.reset();

        self.shared
            .trap_threads
            .fetch_or(TrapFlags::TRAP_THREADS.bits(), Ordering::SeqCst);
        sys_pal::flush_process_write_buffers();
        fence(Ordering::SeqCst);

        let targets: Vec<Arc<Thread>> = self
            .snapshot()
            .into_iter()
            .filter(|t| !std::ptr::eq(Arc::as_ptr(t), current_ptr) && !t.is_gc_special() && !t.is_detached())
            .collect();

        let mut metrics = SuspendMetrics::new();
        metrics.threads_scanned = targets.len() as u64;
        let config = runtime.config();

        loop {
            metrics.polling_rounds += 1;
            let mut keep_waiting = false;
            for thread in &targets {
                if thread.cache_transition_frame_for_suspend() {
                    // The stack walker must not find a hijack still installed
                    // on a parked thread; it removes it itself on the way out.
                    if thread.is_hijacked() {
                        keep_waiting = true;
                    }
                    continue;
                }
                keep_waiting = true;
                metrics.hijack_attempts += 1;
                let outcome = runtime.interrupter().interrupt(runtime, thread);
                match outcome {
                    HijackOutcome::Installed => metrics.hijacks_installed += 1,
                    HijackOutcome::LockBusy => metrics.lock_busy_retries += 1,
                    HijackOutcome::UnstableContext => metrics.unstable_contexts += 1,
                    _ => {}
                }
                #[cfg(feature = "tracing")]
                crate::tracing::internal::log_hijack_outcome(thread.os_id(), outcome.as_str());
            }

            if !keep_waiting {
                break;
            }
            if let Some(limit) = config.suspend_watchdog {
                if start.elapsed() > limit {
                    fatal(
                        FatalKind::SuspendTimeout,
                        &format!("threads did not reach a safe point within {limit:?}"),
                    );
                }
            }
            if !sys_pal::switch_to_thread() && sys_pal::processor_count() > 1 {
                for _ in 0..config.suspend_poll_spin {
                    std::hint::spin_loop();
                }
            }
        }

        self.shared.suspend_complete.set();
        metrics.duration = start.elapsed();

        #[cfg(feature = "tracing")]
        crate::tracing::internal::log_suspend_complete(metrics.polling_rounds, metrics.hijacks_installed);

        metrics
    }

    /// Releases the threads parked by [`suspend_all_threads`](Self::suspend_all_threads).
    pub(crate) fn resume_all_threads(&self, wait_for_gc_event: bool) {
        if !self.suspend_lock.is_locked() {
            fatal(FatalKind::LockMisuse, "resume without a suspension in progress");
        }
        for thread in self.snapshot() {
            thread.reset_cached_transition_frame();
        }
        self.shared
            .trap_threads
            .fetch_and(!TrapFlags::TRAP_THREADS.bits(), Ordering::SeqCst);
        self.shared.suspending_thread.store(0, Ordering::Release);
        if wait_for_gc_event {
            self.shared.gc_complete.set();
        }
        self.shared.suspend_complete.set();
        self.lock.release_read();
        self.suspend_order.lock().take();
        // SAFETY: locked by the matching suspension, checked above.
        unsafe { self.suspend_lock.unlock() };
    }

    /// Asks `target` to abort: its next trapped transition returns
    /// [`TransitionOutcome::AbortRequested`](super::TransitionOutcome::AbortRequested).
    pub(crate) fn initiate_thread_abort(&self, runtime: &Runtime, target: &Thread, exception: usize) {
        self.suspend_all_threads(runtime, false);
        self.shared
            .trap_threads
            .fetch_or(TrapFlags::ABORT_IN_PROGRESS.bits(), Ordering::SeqCst);
        target.set_abort_exception(exception);
        mark_frame(target, |frame| frame.insert_flags(FrameFlags::THREAD_ABORT));
        self.resume_all_threads(false);
    }

    pub(crate) fn cancel_thread_abort(&self, runtime: &Runtime, target: &Thread) {
        self.suspend_all_threads(runtime, false);
        target.set_abort_exception(0);
        mark_frame(target, |frame| {
            let flags = frame.flags() - FrameFlags::THREAD_ABORT;
            frame.set_flags(flags);
        });
        if self.snapshot().iter().all(|t| t.abort_exception().is_none()) {
            self.shared
                .trap_threads
                .fetch_and(!TrapFlags::ABORT_IN_PROGRESS.bits(), Ordering::SeqCst);
        }
        self.resume_all_threads(false);
    }
}

fn mark_frame(target: &Thread, update: impl FnOnce(&mut TransitionFrame)) {
    let frame = target.raw_transition_frame();
    if frame != 0 && frame != TOP_OF_STACK_MARKER && !target.is_current() {
        // SAFETY: the target is parked in preemptive mode, so its published
        // frame is live and nobody else writes it.
        update(unsafe { &mut *(frame as *mut TransitionFrame) });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;
    use std::sync::Barrier;
    use std::time::Duration;

    use super::*;
    use crate::test_util::{catch_fatal, fake_runtime, run_attached, FakeInterrupter};

    #[test]
    fn test_attach_is_idempotent() {
        let rt = fake_runtime();
        run_attached(&rt, |thread| {
            let again = rt.attach_current_thread();
            assert!(Arc::ptr_eq(&again, thread));
            assert_eq!(rt.threads().thread_count(), 1);
            assert!(Arc::ptr_eq(
                &rt.threads().get_current_thread_if_available().unwrap(),
                thread
            ));
        });
        assert_eq!(rt.threads().thread_count(), 0);
    }

    #[test]
    fn test_attach_to_second_runtime_is_fatal() {
        let first = fake_runtime();
        let second = fake_runtime();
        run_attached(&first, |_| {
            let record = catch_fatal(|| second.attach_current_thread()).unwrap_err();
            assert_eq!(record.kind, FatalKind::DoubleAttach);
        });
    }

    #[test]
    fn test_detach_twice_is_silent() {
        let rt = fake_runtime();
        let thread = std::thread::scope(|s| {
            s.spawn(|| {
                let thread = rt.attach_current_thread();
                rt.detach_current_thread();
                thread
            })
            .join()
            .unwrap()
        });
        assert!(thread.is_detached());
        assert!(!rt.threads().detach(&thread));
        assert_eq!(rt.threads().thread_count(), 0);
    }

    #[test]
    fn test_thread_exit_detaches() {
        let rt = fake_runtime();
        let attached = Arc::clone(&rt);
        std::thread::spawn(move || {
            attached.attach_current_thread();
        })
        .join()
        .unwrap();
        assert_eq!(rt.threads().thread_count(), 0);
        assert_eq!(rt.global_metrics().threads_detached(), 1);
    }

    #[test]
    fn test_suspend_caches_preemptive_threads() {
        let rt = fake_runtime();
        let ready = Barrier::new(2);
        let done = AtomicBool::new(false);
        std::thread::scope(|s| {
            s.spawn(|| {
                let thread = rt.attach_current_thread();
                assert!(!thread.is_cooperative());
                ready.wait();
                while !done.load(Ordering::Acquire) {
                    std::thread::yield_now();
                }
                rt.detach_current_thread();
            });
            ready.wait();
            let metrics = rt.suspend_ee("test");
            assert_eq!(metrics.threads_scanned, 1);
            assert_eq!(metrics.hijack_attempts, 0);
            for thread in rt.threads().snapshot() {
                assert_eq!(thread.cached_transition_frame(), TOP_OF_STACK_MARKER);
            }
            assert!(rt.threads().trap_flags().contains(TrapFlags::TRAP_THREADS));
            rt.restart_ee();
            assert!(rt.threads().trap_flags().is_empty());
            for thread in rt.threads().snapshot() {
                assert_eq!(thread.cached_transition_frame(), 0);
            }
            done.store(true, Ordering::Release);
        });
    }

    #[test]
    fn test_gc_special_threads_are_skipped() {
        let rt = fake_runtime_with_interrupter(FakeInterrupter::never());
        let ready = Barrier::new(2);
        let done = AtomicBool::new(false);
        std::thread::scope(|s| {
            s.spawn(|| {
                let thread = rt.attach_current_thread();
                thread.set_gc_special();
                let mut frame = TransitionFrame::new(0, 0);
                let _ = unsafe { thread.enter_cooperative(&raw mut frame) };
                ready.wait();
                while !done.load(Ordering::Acquire) {
                    std::thread::yield_now();
                }
                unsafe { thread.leave_cooperative(&raw mut frame) };
                rt.detach_current_thread();
            });
            ready.wait();
            let metrics = rt.suspend_ee("special");
            assert_eq!(metrics.threads_scanned, 0);
            rt.restart_ee();
            done.store(true, Ordering::Release);
        });
    }

    #[test]
    fn test_watchdog_fires_on_stuck_thread() {
        let config = crate::config::RuntimeConfig::default().with_suspend_watchdog(Some(Duration::from_millis(20)));
        let rt = crate::test_util::runtime_with(config, Box::new(FakeInterrupter::never()));
        let ready = Barrier::new(2);
        let done = AtomicBool::new(false);
        std::thread::scope(|s| {
            s.spawn(|| {
                let thread = rt.attach_current_thread();
                let mut frame = TransitionFrame::new(0, 0);
                let _ = unsafe { thread.enter_cooperative(&raw mut frame) };
                ready.wait();
                // Cooperative and never polling.
                while !done.load(Ordering::Acquire) {
                    std::hint::spin_loop();
                }
                unsafe { thread.leave_cooperative(&raw mut frame) };
                rt.detach_current_thread();
            });
            ready.wait();
            let record = catch_fatal(|| rt.suspend_ee("stuck")).unwrap_err();
            assert_eq!(record.kind, FatalKind::SuspendTimeout);
            // The coordinator unwound out of the suspension; release it.
            rt.restart_ee();
            done.store(true, Ordering::Release);
        });
    }

    #[test]
    fn test_resume_without_suspend_is_fatal() {
        let rt = fake_runtime();
        let record = catch_fatal(|| rt.restart_ee()).unwrap_err();
        assert_eq!(record.kind, FatalKind::LockMisuse);
    }

    fn fake_runtime_with_interrupter(interrupter: FakeInterrupter) -> Arc<Runtime> {
        crate::test_util::runtime_with(crate::config::RuntimeConfig::default(), Box::new(interrupter))
    }
}
