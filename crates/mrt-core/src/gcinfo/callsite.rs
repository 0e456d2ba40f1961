//! Call-site stream lookup and call-site string decoding.
//!
//! The per-method stream maps code offsets to call-site strings:
//!
//! ```text
//! 0ddddccc            small: delta = shortcut[dddd], string at blob + ccc
//! 1ddddddd {off}      big: 7-bit delta, string at blob + off
//! 10000000 {delta}    forwarder: skip ahead without naming a call site
//! 11111111            end of stream
//! ```
//!
//! A call-site string is a run of descriptors, the last one flagged by bit 5:
//!
//! ```text
//! 00lRRRRR                      register set {rbx, rsi, rdi, rbp, r12}
//! 01liprrr                      one callee-saved register
//! 10l1SSSS                      local slots #0-#3
//! 10l0ssss                      local slot #(ssss + 4)
//! 11lipfsm {off} [mask]         stack slots relative to SP or FP
//! 11lip010 0RRRRRRR [I] [P]     scratch registers
//! ```

use super::{DecodeError, GcFlags, InfoHeader};
use crate::regdisplay::{CalleeSavedReg, RegDisplay, ScratchReg, POINTER_SIZE};
use crate::varint::Cursor;

const STREAM_END: u8 = 0xFF;
const LAST_DESCRIPTOR: u8 = 0x20;

enum StringOffset {
    Small(u8),
    /// Cursor position of the still-encoded offset.
    Big(usize),
}

/// Reports every live reference at `code_offset`.
///
/// `stream` starts at the method's call-site stream. Each root is passed to
/// `report` as the address of the slot holding it.
///
/// # Errors
///
/// Returns a [`DecodeError`] for malformed input. Roots reported before the
/// error was detected are not retracted.
///
/// # Safety
///
/// Every register location in `regs` that the encoding refers to must be
/// readable, and `regs` must describe the frame `header` belongs to.
pub unsafe fn enum_gc_refs(
    header: &InfoHeader,
    stream: &[u8],
    code_offset: u32,
    callsite_blob: &[u8],
    delta_table: &[u8; 16],
    regs: &RegDisplay,
    report: &mut dyn FnMut(*mut usize, GcFlags),
) -> Result<(), DecodeError> {
    let mut cursor = Cursor::new(stream);
    if code_offset == 0 || cursor.peek_u8()? == STREAM_END {
        return Ok(());
    }

    let mut current = 0u32;
    let mut string_offset = StringOffset::Small(0);
    'scan: while current < code_offset {
        loop {
            let b = cursor.read_u8()?;
            if b & 0x80 == 0 {
                string_offset = StringOffset::Small(b & 0x7);
                current = advance(current, u32::from(delta_table[usize::from(b >> 3)]))?;
                break;
            }
            let low = b & 0x7F;
            if low == 0 {
                // A forwarder lands on an intermediate offset that must not
                // be compared against the target.
                current = advance(current, cursor.read_unsigned()?)?;
                continue;
            }
            if low == 0x7F {
                break 'scan;
            }
            current = advance(current, u32::from(low))?;
            string_offset = StringOffset::Big(cursor.position());
            cursor.skip_unsigned()?;
            break;
        }
    }

    if current != code_offset {
        return Ok(());
    }

    let offset = match string_offset {
        StringOffset::Small(off) => u32::from(off),
        StringOffset::Big(pos) => Cursor::at(stream, pos).read_unsigned()?,
    };
    if offset as usize >= callsite_blob.len() {
        return Err(DecodeError::BadCallsiteOffset(offset));
    }

    let mut cursor = Cursor::at(callsite_blob, offset as usize);
    loop {
        let b = cursor.read_u8()?;
        match b & 0xC0 {
            0x00 => report_register_set(b, regs, report),
            0x40 => report_register(b, regs, report),
            // SAFETY: forwarded from the caller.
            0x80 => unsafe { report_local_slots(b, header, regs, report)? },
            _ if b & 0xC7 == 0xC2 => report_scratch_regs(b, &mut cursor, regs, report)?,
            // SAFETY: forwarded from the caller.
            _ => unsafe { report_stack_slots(b, &mut cursor, regs, report)? },
        }
        if b & LAST_DESCRIPTOR != 0 {
            return Ok(());
        }
    }
}

fn advance(current: u32, delta: u32) -> Result<u32, DecodeError> {
    current.checked_add(delta).ok_or(DecodeError::OffsetOverflow)
}

fn report_register_set(b: u8, regs: &RegDisplay, report: &mut dyn FnMut(*mut usize, GcFlags)) {
    for reg in [
        CalleeSavedReg::Rbx,
        CalleeSavedReg::Rsi,
        CalleeSavedReg::Rdi,
        CalleeSavedReg::Rbp,
        CalleeSavedReg::R12,
    ] {
        if b & reg.mask() != 0 {
            report(regs.callee_saved(reg), GcFlags::empty());
        }
    }
}

fn report_register(b: u8, regs: &RegDisplay, report: &mut dyn FnMut(*mut usize, GcFlags)) {
    let flags = attribute_flags(b);
    report(regs.callee_saved(CalleeSavedReg::from_index(b)), flags);
}

fn attribute_flags(b: u8) -> GcFlags {
    let mut flags = GcFlags::empty();
    if b & 0x08 != 0 {
        flags |= GcFlags::PINNED;
    }
    if b & 0x10 != 0 {
        flags |= GcFlags::INTERIOR;
    }
    flags
}

/// # Safety
///
/// The frame pointer location in `regs` must be readable.
unsafe fn report_local_slots(
    b: u8,
    header: &InfoHeader,
    regs: &RegDisplay,
    report: &mut dyn FnMut(*mut usize, GcFlags),
) -> Result<(), DecodeError> {
    // Local slots are relative to the main body's frame, which a funclet
    // header does not describe.
    if header.is_funclet() {
        return Err(DecodeError::LocalSlotInFunclet);
    }
    if b & 0x10 != 0 {
        for slot in 0..4 {
            if b & (1 << slot) != 0 {
                // SAFETY: forwarded from the caller.
                report(unsafe { local_slot_address(slot, header, regs) }, GcFlags::empty());
            }
        }
    } else {
        let slot = u32::from(b & 0xF) + 4;
        // SAFETY: forwarded from the caller.
        report(unsafe { local_slot_address(slot, header, regs) }, GcFlags::empty());
    }
    Ok(())
}

#[allow(clippy::cast_possible_wrap)]
unsafe fn local_slot_address(slot: u32, header: &InfoHeader, regs: &RegDisplay) -> *mut usize {
    let slot_bytes = (slot as usize * POINTER_SIZE) as isize;
    if header.has_frame_pointer() {
        let rbp_offset = if header.frame_pointer_offset() == 0 {
            -(header.preserved_regs_save_size() as isize) - slot_bytes
        } else {
            slot_bytes
        };
        // SAFETY: forwarded from the caller.
        let fp = unsafe { regs.fp() };
        fp.wrapping_add_signed(rbp_offset) as *mut usize
    } else {
        let rsp_offset = header.frame_size() as isize - slot_bytes - POINTER_SIZE as isize;
        regs.sp().wrapping_add_signed(rsp_offset) as *mut usize
    }
}

/// # Safety
///
/// The frame pointer location in `regs` must be readable.
unsafe fn report_stack_slots(
    b: u8,
    cursor: &mut Cursor<'_>,
    regs: &RegDisplay,
    report: &mut dyn FnMut(*mut usize, GcFlags),
) -> Result<(), DecodeError> {
    let flags = attribute_flags(b);
    let frame_pointer_based = b & 0x04 != 0;
    let negative = b & 0x02 != 0;
    let has_mask = b & 0x01 != 0;

    let base = if frame_pointer_based {
        // SAFETY: forwarded from the caller.
        unsafe { regs.fp() }
    } else {
        regs.sp()
    };
    let slot = |offset: usize| {
        let addr = if negative {
            base.wrapping_sub(offset)
        } else {
            base.wrapping_add(offset)
        };
        addr as *mut usize
    };

    let mut offset = cursor.read_unsigned()? as usize;
    report(slot(offset), flags);

    if has_mask {
        let mut mask = cursor.read_unsigned()?;
        while mask != 0 {
            offset += POINTER_SIZE;
            if mask & 1 != 0 {
                report(slot(offset), flags);
            }
            mask >>= 1;
        }
    }
    Ok(())
}

fn report_scratch_regs(
    b: u8,
    cursor: &mut Cursor<'_>,
    regs: &RegDisplay,
    report: &mut dyn FnMut(*mut usize, GcFlags),
) -> Result<(), DecodeError> {
    let live = cursor.read_u8()?;
    let interior = if b & 0x10 != 0 { cursor.read_u8()? } else { 0 };
    let pinned = if b & 0x08 != 0 { cursor.read_u8()? } else { 0 };

    for (i, reg) in ScratchReg::ALL.into_iter().enumerate() {
        let bit = 1u8 << i;
        if live & bit == 0 {
            continue;
        }
        let mut flags = GcFlags::empty();
        if pinned & bit != 0 {
            flags |= GcFlags::PINNED;
        }
        if interior & bit != 0 {
            flags |= GcFlags::INTERIOR;
        }
        let location = regs.scratch(reg);
        if !location.is_null() {
            report(location, flags);
        }
    }
    Ok(())
}
