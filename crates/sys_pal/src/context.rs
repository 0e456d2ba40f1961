/// Register state of an interrupted thread, as far as the stack walker needs it.
///
/// The layout mirrors the x86-64 integer register file: instruction and stack
/// pointers, the frame pointer, the callee-saved registers and the scratch
/// registers that can carry a return value or argument.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LimitedContext {
    pub ip: usize,
    pub sp: usize,
    pub rbp: usize,
    pub rbx: usize,
    pub rsi: usize,
    pub rdi: usize,
    pub r12: usize,
    pub r13: usize,
    pub r14: usize,
    pub r15: usize,
    pub rax: usize,
    pub rcx: usize,
    pub rdx: usize,
    pub r8: usize,
    pub r9: usize,
    pub r10: usize,
    pub r11: usize,
}

impl LimitedContext {
    /// A context with only the control registers set.
    #[must_use]
    pub const fn with_control(ip: usize, sp: usize, rbp: usize) -> Self {
        Self {
            ip,
            sp,
            rbp,
            rbx: 0,
            rsi: 0,
            rdi: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
            rax: 0,
            rcx: 0,
            rdx: 0,
            r8: 0,
            r9: 0,
            r10: 0,
            r11: 0,
        }
    }
}
