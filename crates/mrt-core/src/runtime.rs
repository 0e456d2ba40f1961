//! The runtime instance.
//!
//! One [`Runtime`] owns everything the execution core shares between
//! threads: the module registry, the thread store, the thunk table, the
//! write-barrier globals and the collector's plug-ins. Threads hold a weak
//! reference to it, so dropping the last [`Arc`] tears the instance down.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::RuntimeConfig;
use crate::gc_interface::{GcHeap, HandleTable};
use crate::metrics::{GlobalMetrics, SuspendMetrics};
use crate::module::{ModuleRegistry, Region};
use crate::stubs::ThunkRegistry;
use crate::thread::{Interrupter, OsInterrupter, ReversePInvokeFrame, Thread, ThreadStore};
use crate::write_barrier::WriteBarrierGlobals;

/// Configures and creates a [`Runtime`].
///
/// # Example
///
/// ```
/// use mrt_core::{Runtime, RuntimeConfig};
///
/// let runtime = Runtime::builder()
///     .config(RuntimeConfig::default().with_conservative_stack_reporting(true))
///     .build();
/// assert_eq!(runtime.threads().thread_count(), 0);
/// ```
#[derive(Default)]
pub struct RuntimeBuilder {
    config: RuntimeConfig,
    interrupter: Option<Box<dyn Interrupter>>,
    heap: Option<Box<dyn GcHeap>>,
    handle_table: Option<Box<dyn HandleTable>>,
    runtime_code: Option<Region>,
}

impl RuntimeBuilder {
    #[must_use]
    pub const fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Replaces the platform [`OsInterrupter`].
    #[must_use]
    pub fn interrupter(mut self, interrupter: Box<dyn Interrupter>) -> Self {
        self.interrupter = Some(interrupter);
        self
    }

    #[must_use]
    pub fn heap(mut self, heap: impl GcHeap + 'static) -> Self {
        self.heap = Some(Box::new(heap));
        self
    }

    #[must_use]
    pub fn handle_table(mut self, table: impl HandleTable + 'static) -> Self {
        self.handle_table = Some(Box::new(table));
        self
    }

    /// The code range of the runtime itself. Hardware faults inside it are
    /// fatal.
    #[must_use]
    pub const fn runtime_code(mut self, code: Region) -> Self {
        self.runtime_code = Some(code);
        self
    }

    #[must_use]
    pub fn build(self) -> Arc<Runtime> {
        let config = self.config;
        let interrupter = self
            .interrupter
            .unwrap_or_else(|| Box::new(OsInterrupter::new()));
        let thunks = ThunkRegistry::new();
        crate::thread::register_hijack_stubs(&thunks);
        Arc::new(Runtime {
            config,
            modules: ModuleRegistry::new(&config),
            threads: ThreadStore::new(
                config.spin_initial_delay,
                config.spin_backoff_factor,
                config.spin_max_delay,
            ),
            thunks,
            interrupter,
            metrics: GlobalMetrics::new(),
            last_suspend: Mutex::new(SuspendMetrics::new()),
            last_suspend_id: AtomicU64::new(0),
            write_barrier: WriteBarrierGlobals::new(),
            heap: self.heap,
            handle_table: self.handle_table,
            runtime_code: self.runtime_code,
        })
    }
}

/// A runtime instance.
pub struct Runtime {
    config: RuntimeConfig,
    modules: ModuleRegistry,
    threads: ThreadStore,
    thunks: ThunkRegistry,
    interrupter: Box<dyn Interrupter>,
    metrics: GlobalMetrics,
    last_suspend: Mutex<SuspendMetrics>,
    last_suspend_id: AtomicU64,
    write_barrier: WriteBarrierGlobals,
    heap: Option<Box<dyn GcHeap>>,
    handle_table: Option<Box<dyn HandleTable>>,
    runtime_code: Option<Region>,
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("config", &self.config)
            .field("modules", &self.modules)
            .field("threads", &self.threads)
            .field("has_heap", &self.heap.is_some())
            .finish_non_exhaustive()
    }
}

impl Runtime {
    #[must_use]
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::default()
    }

    /// A runtime with `config`, the platform interrupter and no collector.
    #[must_use]
    pub fn new(config: RuntimeConfig) -> Arc<Self> {
        Self::builder().config(config).build()
    }

    #[must_use]
    pub const fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    #[must_use]
    pub const fn modules(&self) -> &ModuleRegistry {
        &self.modules
    }

    #[must_use]
    pub const fn threads(&self) -> &ThreadStore {
        &self.threads
    }

    #[must_use]
    pub const fn thunks(&self) -> &ThunkRegistry {
        &self.thunks
    }

    pub(crate) fn interrupter(&self) -> &dyn Interrupter {
        self.interrupter.as_ref()
    }

    #[must_use]
    pub const fn write_barrier(&self) -> &WriteBarrierGlobals {
        &self.write_barrier
    }

    #[must_use]
    pub fn heap(&self) -> Option<&dyn GcHeap> {
        self.heap.as_deref()
    }

    #[must_use]
    pub fn handle_table(&self) -> Option<&dyn HandleTable> {
        self.handle_table.as_deref()
    }

    #[must_use]
    pub const fn runtime_code(&self) -> Option<Region> {
        self.runtime_code
    }

    #[must_use]
    pub const fn global_metrics(&self) -> &GlobalMetrics {
        &self.metrics
    }

    /// Statistics of the most recent [`suspend_ee`](Self::suspend_ee).
    #[must_use]
    pub fn last_suspend_metrics(&self) -> SuspendMetrics {
        *self.last_suspend.lock()
    }

    /// Registers the calling OS thread, or returns its existing record.
    ///
    /// Attaching while a suspension is in progress waits for it to finish.
    /// A thread already attached to another runtime is fatal.
    pub fn attach_current_thread(self: &Arc<Self>) -> Arc<Thread> {
        if let Some(thread) = self.threads.get_current_thread_if_available() {
            return thread;
        }
        let thread = self.threads.attach_current_thread(self, false);
        self.metrics.record_attach();
        thread
    }

    /// Attaches a collector worker started by the thread that is currently
    /// suspending the runtime. The worker is never suspended itself.
    pub fn attach_gc_worker(self: &Arc<Self>) -> Arc<Thread> {
        let thread = self.threads.attach_current_thread(self, true);
        thread.set_gc_special();
        self.metrics.record_attach();
        thread
    }

    /// Detaches the calling OS thread. Does nothing if it is not attached
    /// to this runtime.
    pub fn detach_current_thread(&self) {
        if self.threads.get_current_thread_if_available().is_some() {
            Thread::unbind_current();
        }
    }

    /// Runs on the owning OS thread as it unbinds from `thread`.
    pub(crate) fn detach_thread(&self, thread: &Arc<Thread>) {
        if thread.is_detached() {
            return;
        }
        if let Some(heap) = self.heap() {
            // SAFETY: called on the owning thread, which no longer allocates.
            heap.fix_alloc_context(unsafe { thread.alloc_context() });
        }
        if self.threads.detach(thread) {
            self.metrics.record_detach();
        }
    }

    /// Stops every other attached thread at a safe point.
    ///
    /// Must be paired with [`restart_ee`](Self::restart_ee). The caller, if
    /// attached, must be in cooperative mode with its tunnel frame set, or
    /// in preemptive mode.
    pub fn suspend_ee(&self, reason: &str) -> SuspendMetrics {
        let id = crate::tracing::internal::next_suspend_id();
        self.last_suspend_id.store(id.0, Ordering::Relaxed);
        #[cfg(feature = "tracing")]
        let _span = crate::tracing::internal::trace_suspend_ee(reason, id);
        #[cfg(not(feature = "tracing"))]
        let _ = reason;

        let metrics = self.threads.suspend_all_threads(self, true);
        self.write_barrier.set_gc_in_progress(true);
        self.metrics.record_suspension(&metrics);
        *self.last_suspend.lock() = metrics;
        metrics
    }

    /// Releases the threads stopped by [`suspend_ee`](Self::suspend_ee).
    pub fn restart_ee(&self) {
        #[cfg(feature = "tracing")]
        let _span = crate::tracing::internal::trace_restart_ee(crate::tracing::SuspendId(
            self.last_suspend_id.load(Ordering::Relaxed),
        ));

        self.write_barrier.set_gc_in_progress(false);
        self.threads.resume_all_threads(true);
    }

    /// Native-to-managed entry: attaches the calling thread if needed and
    /// switches it to cooperative mode, waiting out a suspension.
    pub fn reverse_pinvoke(self: &Arc<Self>, frame: &mut ReversePInvokeFrame) {
        let thread = self.attach_current_thread();
        if !thread.try_fast_reverse_pinvoke(frame) {
            thread.reverse_pinvoke_slow(frame);
        }
    }

    /// Managed-to-native return matching [`reverse_pinvoke`](Self::reverse_pinvoke).
    pub fn reverse_pinvoke_return(&self, frame: &ReversePInvokeFrame) {
        // SAFETY: the entry stored the calling thread's record, which stays
        // alive while the thread is attached.
        if let Some(thread) = unsafe { frame.saved_thread.as_ref() } {
            thread.reverse_pinvoke_return(frame);
        }
    }

    /// Marks `target` for abort with `exception` as the exception to raise.
    /// Its next trapped mode transition reports the request.
    pub fn initiate_thread_abort(&self, target: &Thread, exception: usize) {
        self.threads.initiate_thread_abort(self, target, exception);
    }

    pub fn cancel_thread_abort(&self, target: &Thread) {
        self.threads.cancel_thread_abort(self, target);
    }
}
