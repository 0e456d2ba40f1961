//! Fixed and optional fields of a method's GC-info header.
//!
//! Wire layout (little-endian, four fixed bytes):
//!
//! ```text
//! byte 0-1  prolog_size:6 | has_funclets:1 | fixed_epilog_size:6 | epilog_count_small:2 | dynamic_align:1
//! byte 2    return_kind:2 | ebp_frame:1 | epilog_at_end:1 | has_frame_size:1 | fp_offset_small:2 | has_xmm:1
//! byte 3    saved register mask
//! ```
//!
//! followed, in order, by the optional variable-length fields: frame size,
//! reverse-P/Invoke frame offset, frame-pointer offset, saved XMM mask,
//! dynamic alignment, epilog count and finally the funclet table with the
//! funclet headers. Nothing may follow the funclet headers.

use bitflags::bitflags;

use super::{DecodeError, GcRefKind};
use crate::regdisplay::POINTER_SIZE;
use crate::varint::{self, Cursor};

pub const SIZE_OF_FIXED_HEADER: usize = 4;
const MAX_EPILOG_COUNT_SMALL: u16 = 3;
const FP_OFFSET_VARIABLE: u8 = 3;
/// Skew applied to SP-relative frame-pointer offsets before encoding.
pub const SKEW_FOR_OFFSET_FROM_SP: u32 = 0x10;
const NO_PARAM_POINTER_REG: u8 = 16;

bitflags! {
    /// Callee-saved registers pushed by a method's prolog.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct SavedRegs: u8 {
        const RBX = 0x01;
        const RSI = 0x02;
        const RDI = 0x04;
        const RBP = 0x08;
        const R12 = 0x10;
        const R13 = 0x20;
        const R14 = 0x40;
        const R15 = 0x80;
    }
}

impl SavedRegs {
    /// Bytes occupied by the pushed registers.
    #[must_use]
    pub const fn save_size(self) -> u32 {
        self.bits().count_ones() * POINTER_SIZE as u32
    }
}

/// How a method returns, and what its return register holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ReturnKind {
    #[default]
    Scalar = 0,
    Object = 1,
    Byref = 2,
    /// Reverse-P/Invoke entry point that returns to native code.
    ToNative = 3,
}

impl ReturnKind {
    const fn from_bits(bits: u8) -> Self {
        match bits & 0x3 {
            0 => Self::Scalar,
            1 => Self::Object,
            2 => Self::Byref,
            _ => Self::ToNative,
        }
    }

    /// Kind of the value left in the return register.
    #[must_use]
    pub const fn gc_ref_kind(self) -> GcRefKind {
        match self {
            Self::Scalar | Self::ToNative => GcRefKind::Scalar,
            Self::Object => GcRefKind::Object,
            Self::Byref => GcRefKind::Byref,
        }
    }
}

/// A funclet body for [`InfoHeader::encode`]: its start offset within the
/// method and its own header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Funclet {
    pub start: u32,
    pub header: InfoHeader,
}

/// Decoded frame description of one code body (main body or funclet).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InfoHeader {
    prolog_size: u8,
    has_funclets: bool,
    fixed_epilog_size: u8,
    epilog_count: u16,
    epilog_at_end: bool,
    dynamic_align: bool,
    return_kind: ReturnKind,
    ebp_frame: bool,
    saved_regs: SavedRegs,
    /// Pointer-sized units.
    frame_size: u32,
    /// Pointer-sized units, sign in bit 0.
    reverse_pinvoke_frame_offset: u32,
    /// 16-byte units; 0 means RBP points at the pushed RBP.
    frame_ptr_offset: u8,
    saved_xmm_regs: u16,
    log_stack_alignment: u8,
    param_pointer_reg: u8,
    funclet_offset: u32,
}

impl Default for InfoHeader {
    fn default() -> Self {
        Self::new()
    }
}

impl InfoHeader {
    /// Header of a frameless method with no prolog, epilogs or saved registers.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            prolog_size: 0,
            has_funclets: false,
            fixed_epilog_size: 0,
            epilog_count: 0,
            epilog_at_end: false,
            dynamic_align: false,
            return_kind: ReturnKind::Scalar,
            ebp_frame: false,
            saved_regs: SavedRegs::empty(),
            frame_size: 0,
            reverse_pinvoke_frame_offset: 0,
            frame_ptr_offset: FP_OFFSET_VARIABLE,
            saved_xmm_regs: 0,
            log_stack_alignment: 0,
            param_pointer_reg: NO_PARAM_POINTER_REG,
            funclet_offset: 0,
        }
    }

    // Builders. Values that do not fit the encoding are truncated to their
    // field width, as the encoder would.

    #[must_use]
    pub const fn with_prolog_size(mut self, bytes: u8) -> Self {
        self.prolog_size = bytes & 0x3F;
        self
    }

    /// Epilogs of `size` bytes each; `0` means sizes vary and are listed in the epilog table.
    #[must_use]
    pub const fn with_epilogs(mut self, count: u16, size: u8, at_end: bool) -> Self {
        self.epilog_count = count;
        self.fixed_epilog_size = size & 0x3F;
        self.epilog_at_end = at_end;
        self
    }

    #[must_use]
    pub const fn with_return_kind(mut self, kind: ReturnKind) -> Self {
        self.return_kind = kind;
        self
    }

    /// RBP frame. `offset_from_sp` is `None` for a traditional frame where RBP
    /// points at the pushed RBP, otherwise the distance of RBP from the SP at
    /// the end of the prolog (a multiple of 16).
    #[must_use]
    pub const fn with_frame_pointer(mut self, offset_from_sp: Option<u32>) -> Self {
        self.ebp_frame = true;
        self.frame_ptr_offset = match offset_from_sp {
            None => 0,
            Some(bytes) => ((bytes + SKEW_FOR_OFFSET_FROM_SP) / 0x10) as u8,
        };
        self
    }

    #[must_use]
    pub const fn with_frame_size(mut self, bytes: u32) -> Self {
        self.frame_size = bytes / POINTER_SIZE as u32;
        self
    }

    #[must_use]
    pub const fn with_saved_regs(mut self, regs: SavedRegs) -> Self {
        self.saved_regs = regs;
        self
    }

    /// Offset of the reverse-P/Invoke frame pointer slot from the frame pointer.
    /// Implies [`ReturnKind::ToNative`].
    #[must_use]
    pub const fn with_reverse_pinvoke_frame_offset(mut self, bytes: i32) -> Self {
        let magnitude = bytes.unsigned_abs() / POINTER_SIZE as u32;
        self.reverse_pinvoke_frame_offset = (magnitude << 1) | (bytes < 0) as u32;
        self.return_kind = ReturnKind::ToNative;
        self
    }

    /// Saved XMM registers; only xmm6-xmm15 may be present.
    #[must_use]
    pub const fn with_saved_xmm_regs(mut self, mask: u16) -> Self {
        self.saved_xmm_regs = mask & 0xFFC0;
        self
    }

    #[must_use]
    pub const fn with_dynamic_alignment(mut self, log_alignment: u8) -> Self {
        self.dynamic_align = true;
        self.log_stack_alignment = log_alignment;
        self
    }

    pub const fn prolog_size(&self) -> u32 {
        self.prolog_size as u32
    }

    pub const fn has_funclets(&self) -> bool {
        self.has_funclets
    }

    pub const fn has_varying_epilog_sizes(&self) -> bool {
        self.fixed_epilog_size == 0
    }

    pub const fn fixed_epilog_size(&self) -> u32 {
        self.fixed_epilog_size as u32
    }

    pub const fn epilog_count(&self) -> u32 {
        self.epilog_count as u32
    }

    pub const fn is_epilog_at_end(&self) -> bool {
        self.epilog_at_end
    }

    pub const fn return_kind(&self) -> ReturnKind {
        self.return_kind
    }

    pub const fn returns_to_native(&self) -> bool {
        matches!(self.return_kind, ReturnKind::ToNative)
    }

    pub const fn has_frame_pointer(&self) -> bool {
        self.ebp_frame
    }

    pub const fn is_funclet(&self) -> bool {
        self.funclet_offset != 0
    }

    pub const fn funclet_offset(&self) -> u32 {
        self.funclet_offset
    }

    pub const fn saved_regs(&self) -> SavedRegs {
        self.saved_regs
    }

    pub const fn is_reg_saved(&self, reg: SavedRegs) -> bool {
        self.saved_regs.contains(reg)
    }

    /// Bytes of pushed callee-saved registers.
    #[allow(clippy::cast_possible_wrap)]
    pub const fn preserved_regs_save_size(&self) -> i32 {
        self.saved_regs.save_size() as i32
    }

    #[allow(clippy::cast_possible_wrap)]
    pub const fn frame_size(&self) -> i32 {
        (self.frame_size * POINTER_SIZE as u32) as i32
    }

    pub const fn has_dynamic_alignment(&self) -> bool {
        self.dynamic_align
    }

    pub const fn dynamic_alignment(&self) -> u32 {
        1 << self.log_stack_alignment
    }

    pub const fn param_pointer_reg(&self) -> u8 {
        self.param_pointer_reg
    }

    pub const fn has_saved_xmm_regs(&self) -> bool {
        self.saved_xmm_regs != 0
    }

    pub const fn saved_xmm_reg_mask(&self) -> u16 {
        self.saved_xmm_regs
    }

    pub const fn is_frame_pointer_offset_from_sp(&self) -> bool {
        self.frame_ptr_offset != 0
    }

    /// Distance of RBP from the SP at the end of the prolog.
    #[allow(clippy::cast_possible_wrap)]
    pub const fn frame_pointer_offset_from_sp(&self) -> i32 {
        self.frame_ptr_offset as i32 * 0x10 - SKEW_FOR_OFFSET_FROM_SP as i32
    }

    /// Offset of RBP relative to the slot the pushed RBP would occupy.
    ///
    /// Zero for traditional frames. The saved-register mask counts RBP for
    /// RBP frames, which is compensated for here.
    pub const fn frame_pointer_offset(&self) -> i32 {
        if self.frame_ptr_offset == 0 {
            return 0;
        }
        let mut preserved = self.preserved_regs_save_size();
        if self.is_reg_saved(SavedRegs::RBP) {
            preserved -= POINTER_SIZE as i32;
        }
        self.frame_pointer_offset_from_sp() - preserved - self.frame_size()
    }

    /// Offset of the reverse-P/Invoke frame slot from the frame pointer.
    #[allow(clippy::cast_possible_wrap)]
    pub const fn reverse_pinvoke_frame_offset(&self) -> i32 {
        let magnitude = ((self.reverse_pinvoke_frame_offset >> 1) * POINTER_SIZE as u32) as i32;
        if self.reverse_pinvoke_frame_offset & 1 == 1 {
            -magnitude
        } else {
            magnitude
        }
    }

    /// Whether `epilog_offset` lies inside an epilog of `epilog_size` bytes.
    pub const fn is_valid_epilog_offset(&self, epilog_offset: u32, epilog_size: u32) -> bool {
        if self.has_varying_epilog_sizes() {
            epilog_offset < epilog_size
        } else {
            epilog_offset < self.fixed_epilog_size as u32
        }
    }

    /// Decodes the header at the start of `bytes` for code at `method_offset`.
    ///
    /// When `method_offset` lies in a funclet, the funclet's header is
    /// returned with its funclet offset set; the epilog fields always
    /// describe the main body's epilog table. Returns the header and the
    /// encoded size of the whole header, funclets included.
    ///
    /// # Errors
    ///
    /// Fails on truncated input or nested funclet tables.
    pub fn decode(bytes: &[u8], method_offset: u32) -> Result<(Self, usize), DecodeError> {
        let mut cursor = Cursor::new(bytes);
        let header = Self::decode_at(&mut cursor, method_offset, true)?;
        Ok((header, cursor.position()))
    }

    fn decode_at(cursor: &mut Cursor<'_>, method_offset: u32, allow_funclets: bool) -> Result<Self, DecodeError> {
        let start = cursor.position();
        let Some(&[b0, b1, b2, b3]) = cursor.bytes().get(start..start + SIZE_OF_FIXED_HEADER) else {
            return Err(DecodeError::Truncated);
        };
        cursor.set_position(start + SIZE_OF_FIXED_HEADER);
        let lo = u16::from_le_bytes([b0, b1]);

        let epilog_count_small = (lo >> 13) & 0x3;
        let has_frame_size = b2 & 0x10 != 0;
        let fp_offset_small = (b2 >> 5) & 0x3;
        let has_xmm = b2 & 0x80 != 0;

        let mut header = Self {
            prolog_size: (lo & 0x3F) as u8,
            has_funclets: lo & 0x40 != 0,
            fixed_epilog_size: ((lo >> 7) & 0x3F) as u8,
            epilog_count: epilog_count_small,
            epilog_at_end: b2 & 0x08 != 0,
            dynamic_align: lo & 0x8000 != 0,
            return_kind: ReturnKind::from_bits(b2),
            ebp_frame: b2 & 0x04 != 0,
            saved_regs: SavedRegs::from_bits_retain(b3),
            frame_size: 0,
            reverse_pinvoke_frame_offset: 0,
            frame_ptr_offset: 0,
            saved_xmm_regs: 0,
            log_stack_alignment: 0,
            param_pointer_reg: NO_PARAM_POINTER_REG,
            funclet_offset: 0,
        };

        if has_frame_size {
            header.frame_size = cursor.read_unsigned()?;
        }
        if header.returns_to_native() {
            header.reverse_pinvoke_frame_offset = cursor.read_unsigned()?;
        }
        header.frame_ptr_offset = if fp_offset_small == FP_OFFSET_VARIABLE {
            u8::try_from(cursor.read_unsigned()?).map_err(|_| DecodeError::Truncated)?
        } else {
            fp_offset_small + 3
        };
        if has_xmm {
            let encoded = cursor.read_unsigned()? & 0x3FF;
            header.saved_xmm_regs = (encoded << 6) as u16;
        }
        if header.dynamic_align {
            header.log_stack_alignment = cursor.read_unsigned()? as u8;
            header.param_pointer_reg = cursor.read_unsigned()? as u8;
        }
        if epilog_count_small == MAX_EPILOG_COUNT_SMALL {
            header.epilog_count = cursor.read_unsigned()? as u16;
        }

        if header.has_funclets {
            if !allow_funclets {
                return Err(DecodeError::NestedFunclets);
            }
            header.decode_funclets(cursor, method_offset)?;
        }

        Ok(header)
    }

    fn decode_funclets(&mut self, cursor: &mut Cursor<'_>, method_offset: u32) -> Result<(), DecodeError> {
        let (epilog_at_end, epilog_count, fixed_epilog_size) =
            (self.epilog_at_end, self.epilog_count, self.fixed_epilog_size);

        let count = cursor.read_unsigned()?;
        let mut target: Option<(u32, u32)> = None;
        let mut prev_start = 0u32;
        let mut resolved = false;
        for i in 0..count {
            let start = prev_start
                .checked_add(cursor.read_unsigned()?)
                .ok_or(DecodeError::OffsetOverflow)?;
            if !resolved && method_offset < start {
                resolved = true;
                target = i.checked_sub(1).map(|idx| (idx, prev_start));
            }
            prev_start = start;
        }
        if !resolved && count > 0 {
            target = Some((count - 1, prev_start));
        }

        for i in 0..count {
            let funclet = Self::decode_at(cursor, method_offset, false)?;
            if let Some((idx, offset)) = target {
                if idx == i {
                    *self = funclet;
                    self.funclet_offset = offset;
                }
            }
        }

        self.epilog_at_end = epilog_at_end;
        self.epilog_count = epilog_count;
        self.fixed_epilog_size = fixed_epilog_size;
        Ok(())
    }

    /// Appends the encoded header to `out`. `funclets` must be sorted by
    /// start offset; their presence sets the has-funclets bit.
    pub fn encode(&self, out: &mut Vec<u8>, funclets: &[Funclet]) {
        let has_funclets = !funclets.is_empty();
        let epilog_count_small = self.epilog_count.min(MAX_EPILOG_COUNT_SMALL);
        let fp_offset_small = if (3..=5).contains(&self.frame_ptr_offset) {
            self.frame_ptr_offset - 3
        } else {
            FP_OFFSET_VARIABLE
        };

        let lo = u16::from(self.prolog_size & 0x3F)
            | (u16::from(has_funclets) << 6)
            | (u16::from(self.fixed_epilog_size & 0x3F) << 7)
            | (epilog_count_small << 13)
            | (u16::from(self.dynamic_align) << 15);
        let b2 = (self.return_kind as u8)
            | (u8::from(self.ebp_frame) << 2)
            | (u8::from(self.epilog_at_end) << 3)
            | (u8::from(self.frame_size != 0) << 4)
            | (fp_offset_small << 5)
            | (u8::from(self.saved_xmm_regs != 0) << 7);
        out.extend_from_slice(&lo.to_le_bytes());
        out.push(b2);
        out.push(self.saved_regs.bits());

        if self.frame_size != 0 {
            varint::write_unsigned(out, self.frame_size);
        }
        if self.returns_to_native() {
            varint::write_unsigned(out, self.reverse_pinvoke_frame_offset);
        }
        if fp_offset_small == FP_OFFSET_VARIABLE {
            varint::write_unsigned(out, u32::from(self.frame_ptr_offset));
        }
        if self.saved_xmm_regs != 0 {
            varint::write_unsigned(out, u32::from(self.saved_xmm_regs >> 6));
        }
        if self.dynamic_align {
            varint::write_unsigned(out, u32::from(self.log_stack_alignment));
            varint::write_unsigned(out, u32::from(self.param_pointer_reg));
        }
        if epilog_count_small == MAX_EPILOG_COUNT_SMALL {
            varint::write_unsigned(out, u32::from(self.epilog_count));
        }

        if has_funclets {
            varint::write_unsigned(out, funclets.len() as u32);
            let mut prev = 0;
            for funclet in funclets {
                varint::write_unsigned(out, funclet.start - prev);
                prev = funclet.start;
            }
            for funclet in funclets {
                funclet.header.encode(out, &[]);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(header: &InfoHeader, funclets: &[Funclet]) -> Vec<u8> {
        let mut out = Vec::new();
        header.encode(&mut out, funclets);
        out
    }

    #[test]
    fn test_minimal_header_is_four_bytes() {
        let bytes = encode(&InfoHeader::new(), &[]);
        assert_eq!(bytes.len(), SIZE_OF_FIXED_HEADER);
        let (decoded, size) = InfoHeader::decode(&bytes, 0).unwrap();
        assert_eq!(size, 4);
        assert_eq!(decoded, InfoHeader::new());
    }

    #[test]
    fn test_fixed_field_bits() {
        let header = InfoHeader::new()
            .with_prolog_size(9)
            .with_epilogs(1, 5, true)
            .with_return_kind(ReturnKind::Object)
            .with_saved_regs(SavedRegs::RBX | SavedRegs::R12);
        let bytes = encode(&header, &[]);
        // prolog 9, fixed epilog 5 at bit 7, one epilog at bit 13
        assert_eq!(u16::from_le_bytes([bytes[0], bytes[1]]), 9 | (5 << 7) | (1 << 13));
        assert_eq!(bytes[2] & 0x0F, 0x1 | 0x8);
        assert_eq!(bytes[3], 0x11);
    }

    #[test]
    fn test_optional_fields_decode() {
        let header = InfoHeader::new()
            .with_prolog_size(12)
            .with_frame_pointer(Some(0x40))
            .with_frame_size(0x30)
            .with_saved_regs(SavedRegs::RBP | SavedRegs::RBX | SavedRegs::RSI)
            .with_saved_xmm_regs(0x00C0)
            .with_dynamic_alignment(5)
            .with_epilogs(7, 0, false)
            .with_reverse_pinvoke_frame_offset(-16);
        let bytes = encode(&header, &[]);
        let (decoded, size) = InfoHeader::decode(&bytes, 0).unwrap();
        assert_eq!(size, bytes.len());
        assert_eq!(decoded.prolog_size(), 12);
        assert_eq!(decoded.frame_size(), 0x30);
        assert!(decoded.has_frame_pointer());
        assert!(decoded.is_frame_pointer_offset_from_sp());
        assert_eq!(decoded.frame_pointer_offset_from_sp(), 0x40);
        assert_eq!(decoded.saved_xmm_reg_mask(), 0x00C0);
        assert_eq!(decoded.dynamic_alignment(), 32);
        assert_eq!(decoded.epilog_count(), 7);
        assert!(decoded.has_varying_epilog_sizes());
        assert_eq!(decoded.return_kind(), ReturnKind::ToNative);
        assert_eq!(decoded.reverse_pinvoke_frame_offset(), -16);
    }

    #[test]
    fn test_frame_pointer_offset() {
        // Traditional frame: RBP points at the pushed RBP.
        let traditional = InfoHeader::new().with_frame_pointer(None);
        let bytes = encode(&traditional, &[]);
        let (decoded, _) = InfoHeader::decode(&bytes, 0).unwrap();
        assert_eq!(decoded.frame_pointer_offset(), 0);

        // RBP = SP_after_prolog + 0x40, two pushed regs besides RBP, 0x10 locals.
        let sp_relative = InfoHeader::new()
            .with_frame_pointer(Some(0x40))
            .with_frame_size(0x10)
            .with_saved_regs(SavedRegs::RBP | SavedRegs::RBX | SavedRegs::RSI);
        assert_eq!(sp_relative.frame_pointer_offset(), 0x20);
    }

    #[test]
    fn test_funclet_header_selected_by_offset() {
        let main = InfoHeader::new()
            .with_prolog_size(4)
            .with_epilogs(1, 3, true)
            .with_frame_pointer(None)
            .with_saved_regs(SavedRegs::RBP);
        let catch = InfoHeader::new().with_prolog_size(2).with_frame_size(8);
        let filter = InfoHeader::new().with_prolog_size(6);
        let funclets = [
            Funclet { start: 0x40, header: catch },
            Funclet { start: 0x60, header: filter },
        ];
        let bytes = encode(&main, &funclets);

        let (in_main, size) = InfoHeader::decode(&bytes, 0x10).unwrap();
        assert_eq!(size, bytes.len());
        assert!(!in_main.is_funclet());
        assert_eq!(in_main.prolog_size(), 4);

        let (in_catch, size) = InfoHeader::decode(&bytes, 0x45).unwrap();
        assert_eq!(size, bytes.len());
        assert!(in_catch.is_funclet());
        assert_eq!(in_catch.funclet_offset(), 0x40);
        assert_eq!(in_catch.prolog_size(), 2);
        // Epilog fields still describe the main body.
        assert!(in_catch.is_epilog_at_end());
        assert_eq!(in_catch.epilog_count(), 1);
        assert_eq!(in_catch.fixed_epilog_size(), 3);

        let (in_filter, _) = InfoHeader::decode(&bytes, 0x70).unwrap();
        assert_eq!(in_filter.funclet_offset(), 0x60);
        assert_eq!(in_filter.prolog_size(), 6);
    }

    #[test]
    fn test_nested_funclets_rejected() {
        let mut bytes = Vec::new();
        InfoHeader::new().encode(
            &mut bytes,
            &[Funclet {
                start: 0x10,
                header: InfoHeader::new(),
            }],
        );
        // Set the has-funclets bit of the funclet header (last four bytes).
        let funclet_at = bytes.len() - 4;
        bytes[funclet_at] |= 0x40;
        bytes.extend_from_slice(&[0x02, 0x02]);
        assert_eq!(
            InfoHeader::decode(&bytes, 0x12).unwrap_err(),
            DecodeError::NestedFunclets
        );
    }

    #[test]
    fn test_truncated_header() {
        let header = InfoHeader::new().with_frame_size(0x1000);
        let bytes = encode(&header, &[]);
        assert_eq!(
            InfoHeader::decode(&bytes[..bytes.len() - 1], 0).unwrap_err(),
            DecodeError::Truncated
        );
    }

    #[test]
    fn test_short_fixed_header() {
        for len in 0..SIZE_OF_FIXED_HEADER {
            assert_eq!(InfoHeader::decode(&[0; 4][..len], 0).unwrap_err(), DecodeError::Truncated);
        }
    }

    #[test]
    fn test_return_kind_mapping() {
        assert_eq!(ReturnKind::ToNative.gc_ref_kind(), GcRefKind::Scalar);
        assert_eq!(ReturnKind::Byref.gc_ref_kind(), GcRefKind::Byref);
    }
}
