//! Frame-level queries over decoded GC info: root enumeration, unwinding,
//! return-address location for hijacking, epilog lookup and fault remapping.
//!
//! All frame arithmetic follows the x64 frame shapes the GC-info header
//! describes.

use super::MethodInfo;
use crate::fatal::{fatal, FatalKind};
use crate::gcinfo::{self, DecodeError, EhClause, GcFlags, GcRefKind, InfoHeader, SavedRegs};
use crate::regdisplay::{CalleeSavedReg, RegDisplay, POINTER_SIZE};
use crate::varint::Cursor;

/// Result of unwinding one managed frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unwound {
    /// `regs` now describes the caller.
    Caller,
    /// The frame was a reverse-P/Invoke entry. Managed code continues below
    /// the native frames at this transition frame, which may be the
    /// top-of-stack marker.
    ReturnsToNative { previous_transition_frame: usize },
}

fn corrupt(method: &MethodInfo, err: DecodeError) -> ! {
    fatal(
        FatalKind::GcInfoCorrupt,
        &format!("method at {:#x}: {err}", method.code_start()),
    )
}

/// Reports the live references of `method` at `code_offset`.
///
/// # Safety
///
/// `regs` must describe a frame of `method` whose register locations and
/// stack are readable.
pub unsafe fn enum_gc_refs(
    method: &MethodInfo,
    code_offset: u32,
    regs: &RegDisplay,
    report: &mut dyn FnMut(*mut usize, GcFlags),
) {
    let desc = method.module().descriptor();
    // SAFETY: forwarded from the caller.
    let result = unsafe {
        gcinfo::enum_gc_refs(
            method.header(),
            method.callsite_stream(),
            code_offset,
            &desc.callsite_strings,
            &desc.delta_table,
            regs,
            report,
        )
    };
    if let Err(err) = result {
        corrupt(method, err);
    }
}

/// The frame pointer of the current frame, or 0 for frameless methods.
/// Funclets always run on their parent's frame pointer.
///
/// # Safety
///
/// The RBP location in `regs`, if set, must be readable.
#[must_use]
pub unsafe fn frame_pointer(method: &MethodInfo, regs: &RegDisplay) -> usize {
    let header = method.header();
    if header.has_frame_pointer() || header.is_funclet() {
        // SAFETY: forwarded from the caller.
        unsafe { regs.fp() }
    } else {
        0
    }
}

/// Unwinds `regs` from a frame of `method` to its caller.
///
/// # Safety
///
/// `regs` must describe a frame of `method` stopped outside its prolog and
/// epilogs, on a readable stack.
pub unsafe fn unwind_stack_frame(method: &MethodInfo, regs: &mut RegDisplay) -> Unwound {
    let header = method.header();
    if header.returns_to_native() {
        // SAFETY: reverse-P/Invoke methods always have a frame pointer.
        let fp = unsafe { regs.fp() };
        let slot = fp.wrapping_add_signed(header.reverse_pinvoke_frame_offset() as isize) as *const usize;
        // SAFETY: the slot lies in the method's frame.
        let previous_transition_frame = unsafe { slot.read() };
        return Unwound::ReturnsToNative {
            previous_transition_frame,
        };
    }

    let mut save_size = header.preserved_regs_save_size() as isize;
    let mut rsp = if header.has_frame_pointer() {
        save_size -= POINTER_SIZE as isize;
        // SAFETY: forwarded from the caller.
        let fp = unsafe { regs.fp() };
        fp.wrapping_add_signed(-save_size - header.frame_pointer_offset() as isize) as *mut usize
    } else {
        (regs.sp() + header.frame_size() as usize) as *mut usize
    };

    if save_size > 0 {
        let saved = header.saved_regs();
        for (flag, reg) in POP_ORDER {
            if saved.contains(flag) {
                regs.set_callee_saved(reg, rsp);
                // SAFETY: stays within the frame's register save area.
                rsp = unsafe { rsp.add(1) };
            }
        }
    }
    if header.has_frame_pointer() {
        regs.set_callee_saved(CalleeSavedReg::Rbp, rsp);
        // SAFETY: the pushed RBP sits just below the return address.
        rsp = unsafe { rsp.add(1) };
    }

    regs.set_addr_of_ip(rsp);
    // SAFETY: the return address slot of the frame.
    regs.set_ip(unsafe { rsp.read() });
    regs.set_sp(rsp as usize + POINTER_SIZE);
    regs.clear_scratch();
    Unwound::Caller
}

/// Registers in the order an x64 epilog pops them, with their instruction
/// length in bytes.
const POP_ORDER: [(SavedRegs, CalleeSavedReg); 7] = [
    (SavedRegs::R15, CalleeSavedReg::R15),
    (SavedRegs::R14, CalleeSavedReg::R14),
    (SavedRegs::R13, CalleeSavedReg::R13),
    (SavedRegs::R12, CalleeSavedReg::R12),
    (SavedRegs::RDI, CalleeSavedReg::Rdi),
    (SavedRegs::RSI, CalleeSavedReg::Rsi),
    (SavedRegs::RBX, CalleeSavedReg::Rbx),
];

const fn pop_len(reg: CalleeSavedReg) -> usize {
    match reg {
        CalleeSavedReg::R12 | CalleeSavedReg::R13 | CalleeSavedReg::R14 | CalleeSavedReg::R15 => 2,
        _ => 1,
    }
}

/// Kind of value `method` leaves in the return register.
#[must_use]
pub fn return_value_kind(method: &MethodInfo) -> GcRefKind {
    method.header().return_kind().gc_ref_kind()
}

/// Offset into, and size of, the epilog containing `code_offset`.
///
/// An offset at the very first epilog byte counts as method body.
#[must_use]
pub fn epilog_offset(method: &MethodInfo, code_offset: u32) -> Option<(u32, u32)> {
    let header = method.header();
    if header.is_epilog_at_end() {
        let size = header.fixed_epilog_size();
        let start = method.code_size().saturating_sub(size);
        return (code_offset > start).then(|| (code_offset - start, size));
    }

    let mut cursor = Cursor::new(method.epilog_table());
    let mut start = 0u32;
    for _ in 0..header.epilog_count() {
        let (delta, size) = match read_epilog(&mut cursor, header) {
            Ok(entry) => entry,
            Err(err) => corrupt(method, err),
        };
        start += delta;
        if start < code_offset && code_offset < start + size {
            return Some((code_offset - start, size));
        }
    }
    None
}

fn read_epilog(cursor: &mut Cursor<'_>, header: &InfoHeader) -> Result<(u32, u32), DecodeError> {
    let delta = cursor.read_unsigned()?;
    let size = if header.has_varying_epilog_sizes() {
        cursor.read_unsigned()?
    } else {
        header.fixed_epilog_size()
    };
    Ok((delta, size))
}

/// Location of the return address of the current frame, and the kind of
/// value the method returns, if the frame can be hijacked.
///
/// Funclets, reverse-P/Invoke methods and frames stopped in a prolog cannot.
///
/// # Safety
///
/// `regs` must describe a frame of `method` at `code_offset` on a readable
/// stack; `regs.ip()` must be the frame's actual instruction pointer.
#[must_use]
pub unsafe fn hijack_info(method: &MethodInfo, code_offset: u32, regs: &RegDisplay) -> Option<(*mut usize, GcRefKind)> {
    let header = method.header();
    if header.returns_to_native() || header.is_funclet() || code_offset < header.prolog_size() {
        return None;
    }

    let location = if let Some((offset, _)) = epilog_offset(method, code_offset) {
        // SAFETY: forwarded from the caller.
        unsafe { return_address_in_epilog(header, regs, offset as usize) }
    } else if header.has_frame_pointer() {
        // SAFETY: forwarded from the caller.
        let fp = unsafe { regs.fp() };
        fp.wrapping_add_signed(POINTER_SIZE as isize - header.frame_pointer_offset() as isize)
    } else {
        regs.sp() + header.frame_size() as usize + header.preserved_regs_save_size() as usize
    };
    Some((location as *mut usize, return_value_kind(method)))
}

/// Walks the instruction lengths of the canonical x64 epilog to find how
/// much of it has already run.
unsafe fn return_address_in_epilog(header: &InfoHeader, regs: &RegDisplay, epilog_offset: usize) -> usize {
    let ip = regs.ip();
    let mut pos = ip - epilog_offset;
    let frame_size = header.frame_size() as isize;

    if header.has_frame_pointer() {
        let preserved = header.preserved_regs_save_size() as isize;
        let fp_offset = if header.is_frame_pointer_offset_from_sp() {
            frame_size - header.frame_pointer_offset_from_sp() as isize
        } else {
            -preserved + POINTER_SIZE as isize
        };
        // lea rsp, [rbp + fp_offset]
        pos += if (-128..=127).contains(&fp_offset) { 4 } else { 7 };
        for (flag, reg) in POP_ORDER {
            if header.is_reg_saved(flag) {
                pos += pop_len(reg);
            }
        }
        if ip <= pos {
            // SAFETY: RBP has not been popped yet.
            let fp = unsafe { regs.fp() };
            return fp.wrapping_add_signed(fp_offset + preserved);
        }
        return regs.sp();
    }

    let mut rsp = regs.sp();
    if frame_size != 0 {
        if ip <= pos {
            rsp += frame_size as usize;
        }
        // add rsp, frame_size
        pos += if frame_size < 128 { 4 } else { 7 };
    }
    for (flag, reg) in POP_ORDER {
        if header.is_reg_saved(flag) {
            if ip <= pos {
                rsp += POINTER_SIZE;
            }
            pos += pop_len(reg);
        }
    }
    rsp
}

/// Maps a hardware fault at `code_offset` to the safe point the GC should
/// use for the frame: the post-prolog offset of the handler funclet that
/// would catch it.
///
/// A fault in a funclet escapes to the clause enclosing the funclet's own
/// try region; if there is none, the main body's post-prolog offset is used.
#[must_use]
pub fn remap_hardware_fault_to_gc_safe_point(method: &MethodInfo, code_offset: u32) -> u32 {
    if !method.has_eh_info() {
        return code_offset;
    }
    match remap_fault(method, code_offset) {
        Ok(remapped) => remapped,
        Err(err) => corrupt(method, err),
    }
}

fn remap_fault(method: &MethodInfo, code_offset: u32) -> Result<u32, DecodeError> {
    for clause in method.eh_clauses()? {
        let clause = clause?;
        if clause.covers(code_offset) {
            return post_prolog_offset(method, clause.handler_offset);
        }
    }

    let header = method.header();
    if !header.is_funclet() {
        return Ok(code_offset);
    }

    // Clauses are listed inside-out, so enclosing clauses follow the one
    // whose handler is this funclet.
    let this_funclet = header.funclet_offset();
    let mut own_try: Option<EhClause> = None;
    for clause in method.eh_clauses()? {
        let clause = clause?;
        if let Some(own) = own_try {
            let encloses = clause.try_start <= own.try_start && own.try_end <= clause.try_end;
            let same_range = clause.try_start == own.try_start && clause.try_end == own.try_end;
            if encloses && !same_range {
                return post_prolog_offset(method, clause.handler_offset);
            }
        }
        if clause.handler_offset == this_funclet {
            own_try = Some(clause);
        }
    }

    post_prolog_offset(method, 0)
}

fn post_prolog_offset(method: &MethodInfo, body_start: u32) -> Result<u32, DecodeError> {
    let at_start = method.at_offset(body_start)?;
    Ok(body_start + at_start.header().prolog_size())
}

/// Target type of a typed EH clause.
///
/// # Safety
///
/// An indirected type-table entry must point one past a readable cell.
#[must_use]
pub unsafe fn resolve_eh_type(method: &MethodInfo, clause: &EhClause) -> Option<usize> {
    let entry = *method
        .module()
        .descriptor()
        .eh_type_table
        .get(clause.type_index as usize)?;
    if entry & 1 == 1 {
        // SAFETY: guaranteed by the caller.
        Some(unsafe { ((entry - 1) as *const usize).read() })
    } else {
        Some(entry)
    }
}
