//! The registry of loaded modules.
//!
//! Every address-to-method query of the stack walker goes through here, so
//! reads are cheap and never allocate. Registration is rare and takes the
//! write side of the lock.

use std::cell::UnsafeCell;
use std::fmt;
use std::sync::Arc;

use super::{ClasslibFunction, MethodInfo, Module, ModuleDescriptor, ModuleId, StaticGcDesc};
use crate::config::RuntimeConfig;
use crate::fatal::{fatal, FatalKind};
use crate::sync::lock_order::{LockGuard, LockOrder};
use crate::sync::RwLock;

/// Why a module could not be registered or unregistered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// The descriptor declares a layout version this runtime does not read.
    VersionMismatch { expected: u32, found: u32 },
    /// The code region overlaps an already registered module.
    OverlappingCode { existing: ModuleId },
    /// A table or region of the descriptor is inconsistent.
    MalformedHeader(&'static str),
    UnknownModule(ModuleId),
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::VersionMismatch { expected, found } => {
                write!(f, "module version {found} does not match runtime version {expected}")
            }
            Self::OverlappingCode { existing } => {
                write!(f, "code region overlaps module {}", existing.0)
            }
            Self::MalformedHeader(what) => write!(f, "malformed module header: {what}"),
            Self::UnknownModule(id) => write!(f, "module {} is not registered", id.0),
        }
    }
}

impl std::error::Error for RegistryError {}

/// Thread-static reference layout of a type created at run time. The
/// storage lives in each thread's dynamic TLS table at `tls_offset`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DynamicThreadStatics {
    pub tls_offset: u32,
    pub gc: StaticGcDesc,
}

#[derive(Debug, Default)]
struct Inner {
    modules: Vec<Arc<Module>>,
    next_id: u32,
    dynamic_thread_statics: Vec<DynamicThreadStatics>,
}

/// Loaded modules, guarded by the runtime's reader-writer lock.
///
/// The hijack engine tests the lock with
/// [`dangerous_try_pulse_read_lock`](Self::dangerous_try_pulse_read_lock)
/// before touching a frozen thread: if that thread holds the write side,
/// waiting for it would deadlock.
pub struct ModuleRegistry {
    lock: RwLock,
    inner: UnsafeCell<Inner>,
}

// SAFETY: `inner` is only read under the read side and only written under
// the write side of `lock`.
unsafe impl Sync for ModuleRegistry {}
// SAFETY: see above; the contents are `Arc`s and plain data.
unsafe impl Send for ModuleRegistry {}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self::new(&RuntimeConfig::default())
    }
}

impl fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleRegistry")
            .field("modules", &self.len())
            .finish_non_exhaustive()
    }
}

impl ModuleRegistry {
    #[must_use]
    pub fn new(config: &RuntimeConfig) -> Self {
        Self {
            lock: RwLock::with_backoff(
                config.spin_initial_delay,
                config.spin_backoff_factor,
                config.spin_max_delay,
            ),
            inner: UnsafeCell::new(Inner {
                next_id: 1,
                ..Inner::default()
            }),
        }
    }

    fn with_read<R>(&self, f: impl FnOnce(&Inner) -> R) -> R {
        let _order = LockGuard::new(LockOrder::ModuleRegistry);
        let _guard = self.lock.read();
        // SAFETY: the read side is held.
        f(unsafe { &*self.inner.get() })
    }

    fn with_write<R>(&self, f: impl FnOnce(&mut Inner) -> R) -> R {
        let _order = LockGuard::new(LockOrder::ModuleRegistry);
        let _guard = self.lock.write();
        // SAFETY: the write side is held, so no other reference exists.
        f(unsafe { &mut *self.inner.get() })
    }

    /// Validates and publishes a module.
    ///
    /// # Errors
    ///
    /// Fails if the descriptor is malformed, has the wrong version, or its
    /// code overlaps a registered module.
    pub fn register(&self, desc: ModuleDescriptor) -> Result<Arc<Module>, RegistryError> {
        let module = self.with_write(|inner| {
            if let Some(existing) = inner.modules.iter().find(|m| m.descriptor().text.overlaps(&desc.text)) {
                return Err(RegistryError::OverlappingCode {
                    existing: existing.id(),
                });
            }
            let module = Arc::new(Module::new(ModuleId(inner.next_id), desc)?);
            inner.next_id += 1;
            inner.modules.push(Arc::clone(&module));
            Ok(module)
        })?;

        #[cfg(feature = "tracing")]
        crate::tracing::internal::log_module_event(
            "register",
            module.descriptor().text.start,
            module.descriptor().text.len,
        );

        Ok(module)
    }

    /// Removes a module. Outstanding [`MethodInfo`]s keep it alive.
    ///
    /// # Errors
    ///
    /// Fails if `id` is not registered.
    pub fn unregister(&self, id: ModuleId) -> Result<Arc<Module>, RegistryError> {
        let module = self.with_write(|inner| {
            let index = inner
                .modules
                .iter()
                .position(|m| m.id() == id)
                .ok_or(RegistryError::UnknownModule(id))?;
            Ok(inner.modules.swap_remove(index))
        })?;

        #[cfg(feature = "tracing")]
        crate::tracing::internal::log_module_event(
            "unregister",
            module.descriptor().text.start,
            module.descriptor().text.len,
        );

        Ok(module)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.with_read(|inner| inner.modules.len())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn find_module_by_code_address(&self, addr: usize) -> Option<Arc<Module>> {
        self.with_read(|inner| find_by(inner, |m| m.contains_code_address(addr)))
    }

    #[must_use]
    pub fn find_module_by_data_address(&self, addr: usize) -> Option<Arc<Module>> {
        self.with_read(|inner| find_by(inner, |m| m.contains_data_address(addr)))
    }

    #[must_use]
    pub fn find_module_by_read_only_data_address(&self, addr: usize) -> Option<Arc<Module>> {
        self.with_read(|inner| find_by(inner, |m| m.contains_rdata_address(addr)))
    }

    /// Whether `addr` is in method code of some module.
    #[must_use]
    pub fn is_managed_code(&self, addr: usize) -> bool {
        self.with_read(|inner| inner.modules.iter().any(|m| m.contains_method_address(addr)))
    }

    /// Whether `addr` is in the runtime-stub area at the end of some module.
    #[must_use]
    pub fn contains_stub_address(&self, addr: usize) -> bool {
        self.with_read(|inner| inner.modules.iter().any(|m| m.contains_stub_address(addr)))
    }

    /// The method containing `addr` and the offset of `addr` in it.
    ///
    /// Malformed GC info is fatal.
    #[must_use]
    pub fn find_method_info(&self, addr: usize) -> Option<(MethodInfo, u32)> {
        self.with_read(|inner| lookup_method(inner, addr))
    }

    /// Like [`find_method_info`](Self::find_method_info), but gives up
    /// instead of waiting when a writer holds the lock. Used on frozen or
    /// interrupted threads, where it also skips lock-order tracking.
    #[must_use]
    pub fn try_find_method_info(&self, addr: usize) -> Option<(MethodInfo, u32)> {
        let _guard = self.lock.try_read()?;
        // SAFETY: the read side is held.
        lookup_method(unsafe { &*self.inner.get() }, addr)
    }

    /// See [`RwLock::dangerous_try_pulse_read_lock`].
    #[must_use]
    pub fn dangerous_try_pulse_read_lock(&self) -> bool {
        self.lock.dangerous_try_pulse_read_lock()
    }

    /// Calls `f` for every module with the read side held. `f` must not
    /// register or unregister modules.
    pub fn for_each_module(&self, mut f: impl FnMut(&Arc<Module>)) {
        self.with_read(|inner| inner.modules.iter().for_each(&mut f));
    }

    /// The registered modules at this instant.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<Module>> {
        self.with_read(|inner| inner.modules.clone())
    }

    /// The class-library function of the module that owns `code_address`.
    #[must_use]
    pub fn classlib_function(&self, code_address: usize, which: ClasslibFunction) -> Option<usize> {
        self.find_module_by_code_address(code_address)?.classlib_function(which)
    }

    /// Declares the thread-static references of a type created at run time.
    pub fn register_dynamic_thread_statics(&self, statics: DynamicThreadStatics) {
        self.with_write(|inner| inner.dynamic_thread_statics.push(statics));
    }

    /// Calls `f` for every dynamic thread-static descriptor with the read
    /// side held.
    pub fn for_each_dynamic_thread_statics(&self, mut f: impl FnMut(&DynamicThreadStatics)) {
        self.with_read(|inner| inner.dynamic_thread_statics.iter().for_each(&mut f));
    }
}

fn find_by(inner: &Inner, pred: impl Fn(&Module) -> bool) -> Option<Arc<Module>> {
    inner.modules.iter().find(|m| pred(m)).cloned()
}

fn lookup_method(inner: &Inner, addr: usize) -> Option<(MethodInfo, u32)> {
    let module = inner.modules.iter().find(|m| m.contains_code_address(addr))?;
    let (index, offset) = module.find_method_index(addr)?;
    match module.method_info(index, offset) {
        Ok(info) => Some((info, offset)),
        Err(err) => fatal(
            FatalKind::GcInfoCorrupt,
            &format!("method {index} of module {}: {err}", module.id().0),
        ),
    }
}
