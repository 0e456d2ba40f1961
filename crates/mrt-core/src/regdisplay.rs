//! Virtual register set used while walking and unwinding managed frames.
//!
//! A [`RegDisplay`] does not hold register values. It holds the *locations*
//! where each register of the current frame was saved (a transition frame, a
//! captured context, or a callee's spill area), so that GC roots can be
//! reported by address and updated in place after relocation.

use sys_pal::LimitedContext;

pub const POINTER_SIZE: usize = size_of::<usize>();

/// Callee-saved registers, numbered as the GC-info encoding numbers them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CalleeSavedReg {
    Rbx = 0,
    Rsi = 1,
    Rdi = 2,
    Rbp = 3,
    R12 = 4,
    R13 = 5,
    R14 = 6,
    R15 = 7,
}

impl CalleeSavedReg {
    pub const ALL: [Self; 8] = [
        Self::Rbx,
        Self::Rsi,
        Self::Rdi,
        Self::Rbp,
        Self::R12,
        Self::R13,
        Self::R14,
        Self::R15,
    ];

    /// Register for the low three bits of `index`.
    #[must_use]
    pub const fn from_index(index: u8) -> Self {
        Self::ALL[(index & 0x7) as usize]
    }

    /// Bit of this register in a saved-register mask.
    #[must_use]
    pub const fn mask(self) -> u8 {
        1 << self as u8
    }
}

/// Scratch registers that may carry live references at a call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ScratchReg {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    R8 = 3,
    R9 = 4,
    R10 = 5,
    R11 = 6,
}

impl ScratchReg {
    pub const ALL: [Self; 7] = [
        Self::Rax,
        Self::Rcx,
        Self::Rdx,
        Self::R8,
        Self::R9,
        Self::R10,
        Self::R11,
    ];
}

/// Locations of the registers of one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegDisplay {
    callee_saved: [*mut usize; 8],
    scratch: [*mut usize; 7],
    sp: usize,
    ip: usize,
    addr_of_ip: *mut usize,
}

impl Default for RegDisplay {
    fn default() -> Self {
        Self::new()
    }
}

impl RegDisplay {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            callee_saved: [std::ptr::null_mut(); 8],
            scratch: [std::ptr::null_mut(); 7],
            sp: 0,
            ip: 0,
            addr_of_ip: std::ptr::null_mut(),
        }
    }

    /// Points every register location into `ctx`.
    ///
    /// The display borrows `ctx` by address; it must outlive every use of the
    /// returned value.
    #[must_use]
    pub fn from_context(ctx: &mut LimitedContext) -> Self {
        let mut regs = Self::new();
        regs.sp = ctx.sp;
        regs.ip = ctx.ip;
        regs.addr_of_ip = &raw mut ctx.ip;
        regs.callee_saved = [
            &raw mut ctx.rbx,
            &raw mut ctx.rsi,
            &raw mut ctx.rdi,
            &raw mut ctx.rbp,
            &raw mut ctx.r12,
            &raw mut ctx.r13,
            &raw mut ctx.r14,
            &raw mut ctx.r15,
        ];
        regs.scratch = [
            &raw mut ctx.rax,
            &raw mut ctx.rcx,
            &raw mut ctx.rdx,
            &raw mut ctx.r8,
            &raw mut ctx.r9,
            &raw mut ctx.r10,
            &raw mut ctx.r11,
        ];
        regs
    }

    #[must_use]
    pub const fn callee_saved(&self, reg: CalleeSavedReg) -> *mut usize {
        self.callee_saved[reg as usize]
    }

    pub const fn set_callee_saved(&mut self, reg: CalleeSavedReg, location: *mut usize) {
        self.callee_saved[reg as usize] = location;
    }

    #[must_use]
    pub const fn scratch(&self, reg: ScratchReg) -> *mut usize {
        self.scratch[reg as usize]
    }

    pub const fn set_scratch(&mut self, reg: ScratchReg, location: *mut usize) {
        self.scratch[reg as usize] = location;
    }

    /// Scratch registers do not survive a call; forget their locations.
    pub const fn clear_scratch(&mut self) {
        self.scratch = [std::ptr::null_mut(); 7];
    }

    #[must_use]
    pub const fn sp(&self) -> usize {
        self.sp
    }

    pub const fn set_sp(&mut self, sp: usize) {
        self.sp = sp;
    }

    #[must_use]
    pub const fn ip(&self) -> usize {
        self.ip
    }

    pub const fn set_ip(&mut self, ip: usize) {
        self.ip = ip;
    }

    /// Stack slot the current IP was loaded from, if it came from the stack.
    #[must_use]
    pub const fn addr_of_ip(&self) -> *mut usize {
        self.addr_of_ip
    }

    pub const fn set_addr_of_ip(&mut self, location: *mut usize) {
        self.addr_of_ip = location;
    }

    /// Current value of the frame pointer, or 0 when its location is unknown.
    ///
    /// # Safety
    ///
    /// The RBP location, if set, must be readable.
    #[must_use]
    pub unsafe fn fp(&self) -> usize {
        let location = self.callee_saved(CalleeSavedReg::Rbp);
        if location.is_null() {
            0
        } else {
            // SAFETY: guaranteed by the caller.
            unsafe { location.read() }
        }
    }
}
