//! EH clause table.
//!
//! ```text
//! {count}
//! per clause:
//!   {try_start} {(try_length << 2) | kind}
//!   typed:   {handler} {type_index}
//!   fault:   {handler}
//!   filter:  {handler} {filter}
//! ```
//!
//! Clauses are emitted inside-out: a clause nested in another appears first.

use super::DecodeError;
use crate::varint::Cursor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EhClauseKind {
    Typed = 0,
    Fault = 1,
    Filter = 2,
    FailFast = 3,
}

impl EhClauseKind {
    const fn from_bits(bits: u32) -> Self {
        match bits & 0x3 {
            0 => Self::Typed,
            1 => Self::Fault,
            2 => Self::Filter,
            _ => Self::FailFast,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EhClause {
    pub kind: EhClauseKind,
    pub try_start: u32,
    pub try_end: u32,
    pub handler_offset: u32,
    /// Filter funclet start, for [`EhClauseKind::Filter`].
    pub filter_offset: u32,
    /// Index into the module's EH type table, for [`EhClauseKind::Typed`].
    pub type_index: u32,
}

impl EhClause {
    /// Whether `offset` lies in the protected region.
    #[must_use]
    pub const fn covers(&self, offset: u32) -> bool {
        self.try_start <= offset && offset < self.try_end
    }
}

/// Enumerates the clauses of one method.
#[derive(Debug, Clone)]
pub struct EhEnum<'a> {
    cursor: Cursor<'a>,
    remaining: u32,
}

impl<'a> EhEnum<'a> {
    /// Starts enumeration at the clause count.
    ///
    /// # Errors
    ///
    /// Fails if the count itself is truncated.
    pub fn new(eh_info: &'a [u8]) -> Result<Self, DecodeError> {
        let mut cursor = Cursor::new(eh_info);
        let remaining = cursor.read_unsigned()?;
        Ok(Self { cursor, remaining })
    }

    /// An enumerator that yields nothing, for methods without EH info.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            cursor: Cursor::new(&[]),
            remaining: 0,
        }
    }

    fn read_clause(&mut self) -> Result<EhClause, DecodeError> {
        let try_start = self.cursor.read_unsigned()?;
        let length_and_kind = self.cursor.read_unsigned()?;
        let kind = EhClauseKind::from_bits(length_and_kind);
        let try_end = try_start
            .checked_add(length_and_kind >> 2)
            .ok_or(DecodeError::OffsetOverflow)?;

        let mut clause = EhClause {
            kind,
            try_start,
            try_end,
            handler_offset: 0,
            filter_offset: 0,
            type_index: 0,
        };
        match kind {
            EhClauseKind::Typed => {
                clause.handler_offset = self.cursor.read_unsigned()?;
                clause.type_index = self.cursor.read_unsigned()?;
            }
            EhClauseKind::Fault => {
                clause.handler_offset = self.cursor.read_unsigned()?;
            }
            EhClauseKind::Filter => {
                clause.handler_offset = self.cursor.read_unsigned()?;
                clause.filter_offset = self.cursor.read_unsigned()?;
            }
            EhClauseKind::FailFast => {}
        }
        Ok(clause)
    }
}

impl Iterator for EhEnum<'_> {
    type Item = Result<EhClause, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let clause = self.read_clause();
        if clause.is_err() {
            self.remaining = 0;
        }
        Some(clause)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.remaining as usize))
    }
}
