//! Addresses of the runtime's assembly thunks.
//!
//! The stack walker recognises a handful of runtime stubs by comparing return
//! addresses against their known entry or return labels, and the hijack
//! engine redirects return addresses to the `GcHijack` stubs. Native
//! code registers those addresses once at startup; tests register fake ones.
//!
//! Every lookup here is a plain atomic load, because the hijack path can run
//! in signal context.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::gcinfo::GcRefKind;

/// Maximum number of code addresses that can fault inside write-barrier helpers.
pub const MAX_WRITE_BARRIER_LOCATIONS: usize = 16;

/// Runtime thunks the stack walker and hijack engine know by address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum Thunk {
    /// Return label of the thunk that calls managed code from the runtime.
    ManagedCalloutReturn = 0,
    /// Return label of the universal transition thunk; unwound like a callout.
    UniversalTransitionReturn,
    /// Return label of the generic-signature dispatch thunk.
    CallDescrReturn,
    ThrowExReturn,
    ThrowHwExReturn,
    RethrowReturn,
    CallCatchFuncletReturn,
    CallFinallyFuncletReturn,
    CallFilterFuncletReturn,
    /// Entry point that raises a managed exception for a hardware fault.
    ThrowHwExEntry,
    GcHijackScalar,
    GcHijackObject,
    GcHijackByref,
}

impl Thunk {
    const COUNT: usize = 13;

    pub const ALL: [Self; Self::COUNT] = [
        Self::ManagedCalloutReturn,
        Self::UniversalTransitionReturn,
        Self::CallDescrReturn,
        Self::ThrowExReturn,
        Self::ThrowHwExReturn,
        Self::RethrowReturn,
        Self::CallCatchFuncletReturn,
        Self::CallFinallyFuncletReturn,
        Self::CallFilterFuncletReturn,
        Self::ThrowHwExEntry,
        Self::GcHijackScalar,
        Self::GcHijackObject,
        Self::GcHijackByref,
    ];

    /// The hijack stub that preserves a return value of `kind`.
    #[must_use]
    pub const fn hijack_stub(kind: GcRefKind) -> Self {
        match kind {
            GcRefKind::Scalar => Self::GcHijackScalar,
            GcRefKind::Object => Self::GcHijackObject,
            GcRefKind::Byref => Self::GcHijackByref,
        }
    }

    #[must_use]
    pub const fn is_throw_site(self) -> bool {
        matches!(self, Self::ThrowExReturn | Self::ThrowHwExReturn | Self::RethrowReturn)
    }

    #[must_use]
    pub const fn is_funclet_invoke(self) -> bool {
        matches!(
            self,
            Self::CallCatchFuncletReturn | Self::CallFinallyFuncletReturn | Self::CallFilterFuncletReturn
        )
    }

    #[must_use]
    pub const fn is_managed_callout(self) -> bool {
        matches!(self, Self::ManagedCalloutReturn | Self::UniversalTransitionReturn)
    }
}

/// The table of registered thunk addresses.
#[derive(Debug)]
pub struct ThunkRegistry {
    thunks: [AtomicUsize; Thunk::COUNT],
    write_barrier_locations: [AtomicUsize; MAX_WRITE_BARRIER_LOCATIONS],
    write_barrier_count: AtomicUsize,
}

impl Default for ThunkRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ThunkRegistry {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            thunks: [const { AtomicUsize::new(0) }; Thunk::COUNT],
            write_barrier_locations: [const { AtomicUsize::new(0) }; MAX_WRITE_BARRIER_LOCATIONS],
            write_barrier_count: AtomicUsize::new(0),
        }
    }

    /// Records the address of `thunk`. A later registration replaces it.
    pub fn register(&self, thunk: Thunk, address: usize) {
        self.thunks[thunk as usize].store(address, Ordering::Release);
    }

    /// Records a code address inside a write-barrier helper that may fault
    /// on a bad destination.
    ///
    /// Returns `false` when the table is full.
    pub fn register_write_barrier_location(&self, address: usize) -> bool {
        let index = self.write_barrier_count.fetch_add(1, Ordering::AcqRel);
        if index >= MAX_WRITE_BARRIER_LOCATIONS {
            self.write_barrier_count.store(MAX_WRITE_BARRIER_LOCATIONS, Ordering::Release);
            return false;
        }
        self.write_barrier_locations[index].store(address, Ordering::Release);
        true
    }

    #[must_use]
    pub fn address(&self, thunk: Thunk) -> Option<usize> {
        match self.thunks[thunk as usize].load(Ordering::Acquire) {
            0 => None,
            address => Some(address),
        }
    }

    /// Which thunk, if any, `address` belongs to.
    #[must_use]
    pub fn classify(&self, address: usize) -> Option<Thunk> {
        if address == 0 {
            return None;
        }
        Thunk::ALL
            .into_iter()
            .find(|&thunk| self.thunks[thunk as usize].load(Ordering::Acquire) == address)
    }

    #[must_use]
    pub fn is(&self, address: usize, thunk: Thunk) -> bool {
        address != 0 && self.thunks[thunk as usize].load(Ordering::Acquire) == address
    }

    #[must_use]
    pub fn hijack_stub(&self, kind: GcRefKind) -> Option<usize> {
        self.address(Thunk::hijack_stub(kind))
    }

    /// The return kind a hijack stub preserves, if `address` is one.
    #[must_use]
    pub fn hijack_target_kind(&self, address: usize) -> Option<GcRefKind> {
        match self.classify(address)? {
            Thunk::GcHijackScalar => Some(GcRefKind::Scalar),
            Thunk::GcHijackObject => Some(GcRefKind::Object),
            Thunk::GcHijackByref => Some(GcRefKind::Byref),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_write_barrier_location(&self, address: usize) -> bool {
        if address == 0 {
            return false;
        }
        let count = self.write_barrier_count.load(Ordering::Acquire).min(MAX_WRITE_BARRIER_LOCATIONS);
        self.write_barrier_locations[..count]
            .iter()
            .any(|location| location.load(Ordering::Acquire) == address)
    }

    /// Return addresses into runtime code that calls managed code, which a
    /// hijacked frame may legitimately return to.
    #[must_use]
    pub fn is_runtime_return_address(&self, address: usize) -> bool {
        matches!(
            self.classify(address),
            Some(
                Thunk::ManagedCalloutReturn
                    | Thunk::UniversalTransitionReturn
                    | Thunk::CallDescrReturn
                    | Thunk::ThrowExReturn
                    | Thunk::ThrowHwExReturn
                    | Thunk::RethrowReturn
            )
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unregistered_thunks_never_match() {
        let thunks = ThunkRegistry::new();
        assert_eq!(thunks.address(Thunk::ThrowExReturn), None);
        assert_eq!(thunks.classify(0), None);
        assert!(!thunks.is(0, Thunk::ManagedCalloutReturn));
        assert!(!thunks.is_write_barrier_location(0));
    }

    #[test]
    fn test_classify_registered_addresses() {
        let thunks = ThunkRegistry::new();
        thunks.register(Thunk::CallCatchFuncletReturn, 0x9000);
        thunks.register(Thunk::GcHijackObject, 0x9100);
        thunks.register(Thunk::ThrowHwExReturn, 0x9200);

        assert_eq!(thunks.classify(0x9000), Some(Thunk::CallCatchFuncletReturn));
        assert!(thunks.classify(0x9000).unwrap().is_funclet_invoke());
        assert_eq!(thunks.hijack_stub(GcRefKind::Object), Some(0x9100));
        assert_eq!(thunks.hijack_stub(GcRefKind::Byref), None);
        assert_eq!(thunks.hijack_target_kind(0x9100), Some(GcRefKind::Object));
        assert_eq!(thunks.hijack_target_kind(0x9000), None);
        assert!(thunks.is_runtime_return_address(0x9200));
        assert!(!thunks.is_runtime_return_address(0x9000));
    }

    #[test]
    fn test_write_barrier_table_fills_up() {
        let thunks = ThunkRegistry::new();
        for i in 0..MAX_WRITE_BARRIER_LOCATIONS {
            assert!(thunks.register_write_barrier_location(0x1000 + i));
        }
        assert!(!thunks.register_write_barrier_location(0x2000));
        assert!(thunks.is_write_barrier_location(0x1000));
        assert!(thunks.is_write_barrier_location(0x1000 + MAX_WRITE_BARRIER_LOCATIONS - 1));
        assert!(!thunks.is_write_barrier_location(0x2000));
    }
}
