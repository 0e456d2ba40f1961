//! The stubs a hijacked method returns into.
//!
//! Each stub saves the return registers and the caller's callee-saved
//! registers into a [`TransitionFrame`] on the stack and hands it to
//! [`Thread::on_hijack_return`], which parks the thread if a suspension is
//! pending. The registers are then reloaded from the frame, since the
//! collector may have moved the objects they refer to, and the stub jumps to
//! the original return address.
//!
//! The stubs exist on x86-64 Linux and Windows. Elsewhere nothing is
//! registered and the hijack engine reports
//! [`HijackOutcome::Unsupported`](super::HijackOutcome::Unsupported).

use super::{Thread, TransitionFrame};
use crate::fatal::{fatal, FatalKind};
use crate::stubs::ThunkRegistry;

/// Entered from a stub with the frame it built. Returns where to resume.
///
/// # Safety
///
/// `frame` must be the calling stub's register save area.
#[cfg_attr(not(all(target_arch = "x86_64", any(target_os = "linux", windows), not(miri))), allow(dead_code))]
unsafe extern "C" fn hijack_return(frame: *mut TransitionFrame) -> usize {
    let thread = Thread::current_ptr();
    if thread.is_null() {
        fatal(FatalKind::UnknownStub, "hijack stub entered by an unattached thread");
    }
    // SAFETY: the record outlives its binding to this OS thread.
    let thread = unsafe { &*thread };
    if !thread.is_hijacked() {
        fatal(FatalKind::UnknownStub, "hijack stub entered without a hijack");
    }
    // SAFETY: guaranteed by the caller.
    unsafe { thread.on_hijack_return(frame) }
}

/// Records the stub addresses in `thunks`.
#[cfg(all(target_arch = "x86_64", any(target_os = "linux", windows), not(miri)))]
pub(crate) fn register(thunks: &ThunkRegistry) {
    use crate::stubs::Thunk;

    thunks.register(Thunk::GcHijackScalar, x86_64::hijack_stub_scalar as usize);
    thunks.register(Thunk::GcHijackObject, x86_64::hijack_stub_object as usize);
    thunks.register(Thunk::GcHijackByref, x86_64::hijack_stub_byref as usize);
}

#[cfg(not(all(target_arch = "x86_64", any(target_os = "linux", windows), not(miri))))]
pub(crate) const fn register(_thunks: &ThunkRegistry) {}

#[cfg(all(target_arch = "x86_64", any(target_os = "linux", windows), not(miri)))]
mod x86_64 {
    use std::mem::offset_of;

    use super::super::frame::{saved_slot_offset, FLAGS_OFFSET};
    use super::super::{FrameFlags, TransitionFrame};
    use super::hijack_return;

    /// Callee-saved registers of the platform ABI, plus RSP and both
    /// integer return registers.
    #[cfg(target_os = "linux")]
    const SAVES: FrameFlags = FrameFlags::from_bits_retain(
        FrameFlags::SAVE_RBX.bits()
            | FrameFlags::SAVE_RBP.bits()
            | FrameFlags::SAVE_R12.bits()
            | FrameFlags::SAVE_R13.bits()
            | FrameFlags::SAVE_R14.bits()
            | FrameFlags::SAVE_R15.bits()
            | FrameFlags::SAVE_RSP.bits()
            | FrameFlags::SAVE_RAX.bits()
            | FrameFlags::SAVE_RDX.bits(),
    );
    #[cfg(windows)]
    const SAVES: FrameFlags = FrameFlags::from_bits_retain(
        FrameFlags::SAVE_RBX.bits()
            | FrameFlags::SAVE_RSI.bits()
            | FrameFlags::SAVE_RDI.bits()
            | FrameFlags::SAVE_RBP.bits()
            | FrameFlags::SAVE_R12.bits()
            | FrameFlags::SAVE_R13.bits()
            | FrameFlags::SAVE_R14.bits()
            | FrameFlags::SAVE_R15.bits()
            | FrameFlags::SAVE_RSP.bits()
            | FrameFlags::SAVE_RAX.bits()
            | FrameFlags::SAVE_RDX.bits(),
    );

    /// Offset of the frame from the stub's stack pointer. Windows callees
    /// own 32 bytes of home space above the return address.
    #[cfg(target_os = "linux")]
    const FRAME: usize = 0;
    #[cfg(windows)]
    const FRAME: usize = 32;

    const RIP: usize = FRAME + offset_of!(TransitionFrame, rip);
    const FP: usize = FRAME + offset_of!(TransitionFrame, frame_pointer);
    const THREAD: usize = FRAME + offset_of!(TransitionFrame, thread);
    const FLAGS: usize = FRAME + FLAGS_OFFSET;
    const XMM0: usize = FRAME + size_of::<TransitionFrame>().next_multiple_of(16);
    const XMM1: usize = XMM0 + 16;
    const AREA: usize = XMM1 + 16;

    const fn slot(flag: FrameFlags) -> usize {
        FRAME + saved_slot_offset(SAVES, flag)
    }

    const SCALAR: u32 = SAVES.bits();
    const OBJECT: u32 = SAVES.bits() | FrameFlags::RAX_IS_GCREF.bits();
    const BYREF: u32 = SAVES.bits() | FrameFlags::RAX_IS_BYREF.bits();

    #[unsafe(naked)]
    pub(super) unsafe extern "C" fn hijack_stub_scalar() {
        std::arch::naked_asm!(
            "mov r10d, {flags}",
            "jmp {common}",
            flags = const SCALAR,
            common = sym hijack_stub_common,
        );
    }

    #[unsafe(naked)]
    pub(super) unsafe extern "C" fn hijack_stub_object() {
        std::arch::naked_asm!(
            "mov r10d, {flags}",
            "jmp {common}",
            flags = const OBJECT,
            common = sym hijack_stub_common,
        );
    }

    #[unsafe(naked)]
    pub(super) unsafe extern "C" fn hijack_stub_byref() {
        std::arch::naked_asm!(
            "mov r10d, {flags}",
            "jmp {common}",
            flags = const BYREF,
            common = sym hijack_stub_common,
        );
    }

    // Entered with R10D holding the frame flags and RSP at the caller's
    // stack pointer, just past the popped return slot.
    #[cfg(target_os = "linux")]
    #[unsafe(naked)]
    unsafe extern "C" fn hijack_stub_common() {
        std::arch::naked_asm!(
            "mov r11, rsp",
            "and rsp, -16",
            "sub rsp, {area}",
            "mov qword ptr [rsp + {rip}], 0",
            "mov [rsp + {fp}], rbp",
            "mov qword ptr [rsp + {thread}], 0",
            "mov dword ptr [rsp + {flags}], r10d",
            "mov dword ptr [rsp + {flags} + 4], 0",
            "mov [rsp + {rbx}], rbx",
            "mov [rsp + {r12}], r12",
            "mov [rsp + {r13}], r13",
            "mov [rsp + {r14}], r14",
            "mov [rsp + {r15}], r15",
            "mov [rsp + {sp}], r11",
            "mov [rsp + {rax}], rax",
            "mov [rsp + {rdx}], rdx",
            "movdqu [rsp + {xmm0}], xmm0",
            "movdqu [rsp + {xmm1}], xmm1",
            "lea rdi, [rsp + {frame}]",
            "call {on_return}",
            "mov r11, rax",
            "movdqu xmm0, [rsp + {xmm0}]",
            "movdqu xmm1, [rsp + {xmm1}]",
            "mov rbx, [rsp + {rbx}]",
            "mov r12, [rsp + {r12}]",
            "mov r13, [rsp + {r13}]",
            "mov r14, [rsp + {r14}]",
            "mov r15, [rsp + {r15}]",
            "mov rax, [rsp + {rax}]",
            "mov rdx, [rsp + {rdx}]",
            "mov rbp, [rsp + {fp}]",
            "mov rsp, [rsp + {sp}]",
            "jmp r11",
            area = const AREA,
            frame = const FRAME,
            rip = const RIP,
            fp = const FP,
            thread = const THREAD,
            flags = const FLAGS,
            rbx = const slot(FrameFlags::SAVE_RBX),
            r12 = const slot(FrameFlags::SAVE_R12),
            r13 = const slot(FrameFlags::SAVE_R13),
            r14 = const slot(FrameFlags::SAVE_R14),
            r15 = const slot(FrameFlags::SAVE_R15),
            sp = const slot(FrameFlags::SAVE_RSP),
            rax = const slot(FrameFlags::SAVE_RAX),
            rdx = const slot(FrameFlags::SAVE_RDX),
            xmm0 = const XMM0,
            xmm1 = const XMM1,
            on_return = sym hijack_return,
        );
    }

    #[cfg(windows)]
    #[unsafe(naked)]
    unsafe extern "C" fn hijack_stub_common() {
        std::arch::naked_asm!(
            "mov r11, rsp",
            "and rsp, -16",
            "sub rsp, {area}",
            "mov qword ptr [rsp + {rip}], 0",
            "mov [rsp + {fp}], rbp",
            "mov qword ptr [rsp + {thread}], 0",
            "mov dword ptr [rsp + {flags}], r10d",
            "mov dword ptr [rsp + {flags} + 4], 0",
            "mov [rsp + {rbx}], rbx",
            "mov [rsp + {rsi}], rsi",
            "mov [rsp + {rdi}], rdi",
            "mov [rsp + {r12}], r12",
            "mov [rsp + {r13}], r13",
            "mov [rsp + {r14}], r14",
            "mov [rsp + {r15}], r15",
            "mov [rsp + {sp}], r11",
            "mov [rsp + {rax}], rax",
            "mov [rsp + {rdx}], rdx",
            "movdqu [rsp + {xmm0}], xmm0",
            "movdqu [rsp + {xmm1}], xmm1",
            "lea rcx, [rsp + {frame}]",
            "call {on_return}",
            "mov r11, rax",
            "movdqu xmm0, [rsp + {xmm0}]",
            "movdqu xmm1, [rsp + {xmm1}]",
            "mov rbx, [rsp + {rbx}]",
            "mov rsi, [rsp + {rsi}]",
            "mov rdi, [rsp + {rdi}]",
            "mov r12, [rsp + {r12}]",
            "mov r13, [rsp + {r13}]",
            "mov r14, [rsp + {r14}]",
            "mov r15, [rsp + {r15}]",
            "mov rax, [rsp + {rax}]",
            "mov rdx, [rsp + {rdx}]",
            "mov rbp, [rsp + {fp}]",
            "mov rsp, [rsp + {sp}]",
            "jmp r11",
            area = const AREA,
            frame = const FRAME,
            rip = const RIP,
            fp = const FP,
            thread = const THREAD,
            flags = const FLAGS,
            rbx = const slot(FrameFlags::SAVE_RBX),
            rsi = const slot(FrameFlags::SAVE_RSI),
            rdi = const slot(FrameFlags::SAVE_RDI),
            r12 = const slot(FrameFlags::SAVE_R12),
            r13 = const slot(FrameFlags::SAVE_R13),
            r14 = const slot(FrameFlags::SAVE_R14),
            r15 = const slot(FrameFlags::SAVE_R15),
            sp = const slot(FrameFlags::SAVE_RSP),
            rax = const slot(FrameFlags::SAVE_RAX),
            rdx = const slot(FrameFlags::SAVE_RDX),
            xmm0 = const XMM0,
            xmm1 = const XMM1,
            on_return = sym hijack_return,
        );
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_save_area_layout() {
            assert_eq!(AREA % 16, 0);
            assert!(XMM0 >= FRAME + size_of::<TransitionFrame>());
            assert_eq!(slot(FrameFlags::SAVE_RBX), FRAME + 32);
            assert!(slot(FrameFlags::SAVE_RDX) + 8 <= FRAME + size_of::<TransitionFrame>());
            assert_eq!(SCALAR & FrameFlags::RAX_IS_GCREF.bits(), 0);
            assert_ne!(OBJECT, BYREF);
        }
    }
}
