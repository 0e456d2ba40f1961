//! Per-method GC information.
//!
//! Every compiled method carries a small blob describing its frame layout
//! (the [`InfoHeader`]), an optional epilog table, and a call-site stream
//! that names, for each GC-safe call site, the registers and stack slots
//! that hold live references. EH clauses live in a separate table.
//!
//! Everything here decodes borrowed bytes and reports problems as
//! [`DecodeError`]; the module layer turns those into fatal errors.

mod callsite;
pub mod encode;
mod eh;
mod header;

use bitflags::bitflags;

pub use callsite::enum_gc_refs;
pub use eh::{EhClause, EhClauseKind, EhEnum};
pub use header::{Funclet, InfoHeader, ReturnKind, SavedRegs};

use crate::varint::Truncated;

bitflags! {
    /// Attributes of a reported root.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct GcFlags: u32 {
        /// The slot may point into the middle of an object.
        const INTERIOR = 0x1;
        /// The referenced object must not move.
        const PINNED = 0x2;
        /// The slot may not hold a reference at all.
        const CONSERVATIVE = 0x4;
    }
}

/// Reference kind of a register value, used for hijacked return values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum GcRefKind {
    #[default]
    Scalar = 0,
    Object = 1,
    Byref = 2,
}

impl GcRefKind {
    /// Flags to report a root of this kind with, or `None` for scalars.
    #[must_use]
    pub const fn report_flags(self) -> Option<GcFlags> {
        match self {
            Self::Scalar => None,
            Self::Object => Some(GcFlags::empty()),
            Self::Byref => Some(GcFlags::INTERIOR),
        }
    }
}

/// Malformed GC-info or EH-info.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    Truncated,
    /// A funclet header itself claimed to have funclets.
    NestedFunclets,
    /// A local-slot encoding was used inside a funclet.
    LocalSlotInFunclet,
    /// A code offset accumulated past the end of the method.
    OffsetOverflow,
    /// A call-site string offset points outside the blob.
    BadCallsiteOffset(u32),
}

impl From<Truncated> for DecodeError {
    fn from(_: Truncated) -> Self {
        Self::Truncated
    }
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Truncated => f.write_str("truncated GC info"),
            Self::NestedFunclets => f.write_str("funclet header declares funclets"),
            Self::LocalSlotInFunclet => f.write_str("local slot encoding used in a funclet"),
            Self::OffsetOverflow => f.write_str("code offset overflow in call-site stream"),
            Self::BadCallsiteOffset(off) => write!(f, "call-site string offset {off} out of range"),
        }
    }
}

impl std::error::Error for DecodeError {}
