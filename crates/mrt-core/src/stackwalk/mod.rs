//! Walking the managed frames of one thread.
//!
//! A [`StackFrameIterator`] starts from a published transition frame or a
//! captured register context and yields one logical managed frame at a time.
//! The runtime's own assembly thunks between managed frames are recognised by
//! their return addresses and unwound by their known layouts. During a GC
//! walk, funclets the exception dispatcher is running are collapsed into the
//! frame of their parent method by following the thread's [`ExInfo`] chain.

mod conservative;

use bitflags::bitflags;
use sys_pal::LimitedContext;

pub use conservative::{region_hash, report_conservative_range, ConservativeRegion, CONSERVATIVE_REGION_MAGIC};
pub(crate) use conservative::validate_region;

use crate::fatal::{fatal, FatalKind};
use crate::gcinfo::GcRefKind;
use crate::module::{code_manager, MethodInfo, Unwound};
use crate::regdisplay::{CalleeSavedReg, RegDisplay, ScratchReg, POINTER_SIZE};
use crate::runtime::Runtime;
use crate::stubs::Thunk;
use crate::thread::{ExInfo, ExKind, FrameFlags, Thread, TransitionFrame, NO_CLAUSE, TOP_OF_STACK_MARKER};

bitflags! {
    /// Walk options, plus the per-step state bits the iterator reports.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct WalkFlags: u8 {
        /// Report the parent of a dispatcher-invoked funclet instead of the funclet.
        const COLLAPSE_FUNCLETS = 0x1;
        const REMAP_HARDWARE_FAULTS_TO_SAFE_POINT = 0x2;
        /// Control PCs are return addresses moved back into their call.
        const APPLY_RETURN_ADDRESS_ADJUSTMENT = 0x4;
        /// The last step crossed an exception throw point.
        const EX_COLLIDE = 0x8;
        /// The last step left a reverse-P/Invoke method.
        const UNWOUND_REVERSE_PINVOKE = 0x10;
    }
}

const GC_WALK: WalkFlags = WalkFlags::COLLAPSE_FUNCLETS.union(WalkFlags::REMAP_HARDWARE_FAULTS_TO_SAFE_POINT);
const STEP_BITS: WalkFlags = WalkFlags::EX_COLLIDE.union(WalkFlags::UNWOUND_REVERSE_PINVOKE);

/// Offset from the frame pointer of a managed-callout thunk to the
/// transition frame it published on entry.
pub const MANAGED_CALLOUT_FRAME_OFFSET: isize = -(POINTER_SIZE as isize);

/// Offset from a throw thunk's SP to the context it captured: outgoing
/// scratch space, then the stack-aligned [`ExInfo`].
pub const THROW_SITE_CONTEXT_OFFSET: usize = 0x20 + size_of::<ExInfo>().next_multiple_of(16);

/// Offset from a funclet-invoke thunk's SP to its saved callee-saved registers.
pub const FUNCLET_THUNK_SAVE_OFFSET: usize = 0x28;

/// Frame the generic-signature dispatch thunk leaves at the address its
/// RBP holds.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct CallDescrContext {
    pub rbp: usize,
    pub rsi: usize,
    pub rbx: usize,
    pub ip: usize,
}

/// The copyable part of an iterator's state, as the exception dispatcher
/// stores it in an [`ExInfo`].
#[derive(Debug, Clone, Copy)]
pub struct IteratorSnapshot {
    regs: RegDisplay,
    control_pc: usize,
    flags: WalkFlags,
    next_exinfo: *mut ExInfo,
    /// Callee-saved locations as the funclet saw them, before unwinding
    /// through the thunk that invoked it. Indexed like [`CalleeSavedReg::ALL`].
    funclet_regs: [*mut usize; 8],
    conservative_lower: usize,
    conservative_upper: usize,
    hijacked_return: *mut usize,
    hijacked_kind: GcRefKind,
}

impl Default for IteratorSnapshot {
    fn default() -> Self {
        Self {
            regs: RegDisplay::new(),
            control_pc: 0,
            flags: WalkFlags::empty(),
            next_exinfo: std::ptr::null_mut(),
            funclet_regs: [std::ptr::null_mut(); 8],
            conservative_lower: 0,
            conservative_upper: 0,
            hijacked_return: std::ptr::null_mut(),
            hijacked_kind: GcRefKind::Scalar,
        }
    }
}

impl IteratorSnapshot {
    #[must_use]
    pub const fn control_pc(&self) -> usize {
        self.control_pc
    }

    #[must_use]
    pub const fn regs(&self) -> &RegDisplay {
        &self.regs
    }
}

/// Result of one [`StackFrameIterator::next_for_dispatch`] step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchStep {
    pub valid: bool,
    /// Clause of the exception whose throw point was crossed, if any.
    pub collided_clause: Option<u32>,
    pub unwound_reverse_pinvoke: bool,
}

/// Iterator over the managed frames of one thread.
pub struct StackFrameIterator<'a> {
    runtime: &'a Runtime,
    thread: &'a Thread,
    state: IteratorSnapshot,
    method: Option<MethodInfo>,
    code_offset: u32,
    frame_pointer: usize,
}

impl std::fmt::Debug for StackFrameIterator<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StackFrameIterator")
            .field("thread", &self.thread.os_id())
            .field("control_pc", &format_args!("{:#x}", self.state.control_pc))
            .field("code_offset", &self.code_offset)
            .field("flags", &self.state.flags)
            .finish_non_exhaustive()
    }
}

impl<'a> StackFrameIterator<'a> {
    fn blank(runtime: &'a Runtime, thread: &'a Thread, flags: WalkFlags) -> Self {
        Self {
            runtime,
            thread,
            state: IteratorSnapshot {
                flags,
                ..IteratorSnapshot::default()
            },
            method: None,
            code_offset: 0,
            frame_pointer: 0,
        }
    }

    /// Starts a GC walk at `transition_frame`, a frame published by
    /// `thread` or the top-of-stack marker.
    ///
    /// # Safety
    ///
    /// `thread` must be the caller or parked, and its stack, the frame and
    /// every [`ExInfo`] on its chain included, must stay unchanged while the
    /// iterator is in use.
    pub unsafe fn new(runtime: &'a Runtime, thread: &'a Thread, transition_frame: usize) -> Self {
        let mut iter = Self::blank(runtime, thread, GC_WALK);
        iter.init_from_transition_frame(transition_frame);
        iter.calculate_method_state();
        iter
    }

    /// Starts a walk at a captured register context. Used on interrupted
    /// threads, so a context outside managed code yields an empty walk.
    ///
    /// # Safety
    ///
    /// As for [`new`](Self::new); `context` must also stay live.
    pub unsafe fn from_context(runtime: &'a Runtime, thread: &'a Thread, context: *mut LimitedContext) -> Self {
        let mut iter = Self::blank(runtime, thread, WalkFlags::empty());
        iter.init_from_context(context, WalkFlags::empty());
        iter.calculate_method_state();
        iter
    }

    /// Starts the exception dispatcher's walk at the throw-site context.
    ///
    /// # Safety
    ///
    /// As for [`from_context`](Self::from_context).
    pub unsafe fn init_for_eh(runtime: &'a Runtime, thread: &'a Thread, context: *mut LimitedContext) -> Self {
        let mut iter = Self::blank(runtime, thread, WalkFlags::APPLY_RETURN_ADDRESS_ADJUSTMENT);
        iter.init_from_context(context, WalkFlags::APPLY_RETURN_ADDRESS_ADJUSTMENT);
        iter.calculate_method_state();
        iter
    }

    /// Starts a walk of the calling thread from its tunnel frame.
    ///
    /// # Safety
    ///
    /// `thread` must be the caller, and its tunnel frame must describe a
    /// managed caller.
    pub unsafe fn init_for_stack_trace(runtime: &'a Runtime, thread: &'a Thread) -> Self {
        debug_assert!(thread.is_current());
        // A stack trace walks through return addresses; none may be redirected.
        thread.unhijack();
        // SAFETY: forwarded from the caller.
        unsafe { Self::new(runtime, thread, thread.transition_frame_for_stack_trace()) }
    }

    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.state.control_pc != 0
    }

    #[must_use]
    pub const fn control_pc(&self) -> usize {
        self.state.control_pc
    }

    #[must_use]
    pub const fn regs(&self) -> &RegDisplay {
        &self.state.regs
    }

    /// The current frame's method. `None` once the walk is done.
    #[must_use]
    pub const fn method(&self) -> Option<&MethodInfo> {
        self.method.as_ref()
    }

    #[must_use]
    pub const fn code_offset(&self) -> u32 {
        self.code_offset
    }

    #[must_use]
    pub fn is_funclet(&self) -> bool {
        self.method.as_ref().is_some_and(MethodInfo::is_funclet)
    }

    #[must_use]
    pub const fn frame_pointer(&self) -> usize {
        self.frame_pointer
    }

    #[must_use]
    pub const fn flags(&self) -> WalkFlags {
        self.state.flags
    }

    /// Location and kind of a return value a hijack stub saved for the
    /// current frame.
    #[must_use]
    pub fn hijacked_return_value(&self) -> Option<(*mut usize, GcRefKind)> {
        let state = &self.state;
        (!state.hijacked_return.is_null() && state.hijacked_kind != GcRefKind::Scalar)
            .then_some((state.hijacked_return, state.hijacked_kind))
    }

    /// Stack range below the current frame that must be reported
    /// conservatively: the arguments a managed-callout thunk forwarded.
    #[must_use]
    pub const fn conservative_range(&self) -> Option<(usize, usize)> {
        if self.state.conservative_lower != 0 && self.state.conservative_upper != 0 {
            Some((self.state.conservative_lower, self.state.conservative_upper))
        } else {
            None
        }
    }

    /// A range whose lower bound is known but whose upper bound the next
    /// step has not produced yet.
    pub(crate) const fn pending_conservative_lower(&self) -> Option<usize> {
        if self.state.conservative_lower != 0 && self.state.conservative_upper == 0 {
            Some(self.state.conservative_lower)
        } else {
            None
        }
    }

    #[must_use]
    pub const fn collided_with_exinfo(&self) -> bool {
        self.state.flags.contains(WalkFlags::EX_COLLIDE)
    }

    #[must_use]
    pub const fn unwound_reverse_pinvoke(&self) -> bool {
        self.state.flags.contains(WalkFlags::UNWOUND_REVERSE_PINVOKE)
    }

    /// The state the exception dispatcher stores in its [`ExInfo`] before
    /// invoking a funclet.
    #[must_use]
    pub const fn snapshot(&self) -> IteratorSnapshot {
        self.state
    }

    /// Advances to the calling managed frame.
    pub fn next_frame(&mut self) {
        self.next_internal();
        self.calculate_method_state();
    }

    /// The exception dispatcher's step: removes any hijack, advances, and
    /// marks a collided exception as superseded.
    pub fn next_for_dispatch(&mut self) -> DispatchStep {
        self.thread.unhijack();
        let collided = self.state.next_exinfo;
        self.next_frame();

        let collided_clause = if self.collided_with_exinfo() && !collided.is_null() {
            // SAFETY: chain records are live while the walk runs.
            let record = unsafe { &mut *collided };
            record.kind |= ExKind::SUPERSEDED;
            Some(record.current_clause)
        } else {
            None
        };
        DispatchStep {
            valid: self.is_valid(),
            collided_clause,
            unwound_reverse_pinvoke: self.unwound_reverse_pinvoke(),
        }
    }

    /// Takes over the dispatcher's iterator state, keeping the callee-saved
    /// locations this iterator saw inside the funclet.
    ///
    /// # Safety
    ///
    /// `source` must describe frames of this iterator's thread that are
    /// still live.
    pub unsafe fn update_from_exception_dispatch(&mut self, source: &IteratorSnapshot) {
        let funclet_regs = self.state.funclet_regs;
        self.state = *source;
        for (reg, location) in CalleeSavedReg::ALL.into_iter().zip(funclet_regs) {
            self.state.regs.set_callee_saved(reg, location);
        }
        self.method = None;
    }

    fn reset_next_exinfo_for_sp(&mut self, sp: usize) {
        let mut next = self.state.next_exinfo;
        while !next.is_null() && sp > next as usize {
            // SAFETY: chain records are live while the walk runs.
            next = unsafe { (*next).prev };
        }
        self.state.next_exinfo = next;
    }

    fn reset_frame_state(&mut self, flags: WalkFlags) {
        let state = &mut self.state;
        state.flags = flags;
        state.control_pc = 0;
        state.hijacked_return = std::ptr::null_mut();
        state.hijacked_kind = GcRefKind::Scalar;
        state.conservative_lower = 0;
        state.conservative_upper = 0;
        state.next_exinfo = self.thread.exinfo_head();
        self.method = None;
    }

    /// Returns whether the frame's IP was a managed-callout thunk, in which
    /// case the iterator now stands on the frame that called into the runtime.
    fn init_from_transition_frame(&mut self, frame: usize) -> bool {
        self.reset_frame_state(GC_WALK);
        if frame == 0 || frame == TOP_OF_STACK_MARKER {
            return false;
        }
        self.reset_next_exinfo_for_sp(frame);

        let frame = frame as *mut TransitionFrame;
        let mut regs = RegDisplay::new();
        // SAFETY: the frame is live per the constructor's contract.
        let (flags, rip) = unsafe {
            regs.set_addr_of_ip(&raw mut (*frame).rip);
            regs.set_callee_saved(CalleeSavedReg::Rbp, &raw mut (*frame).frame_pointer);
            ((*frame).flags(), (*frame).rip)
        };
        regs.set_ip(rip);
        regs.set_sp(frame as usize);

        // SAFETY: as above.
        for (flag, location) in unsafe { TransitionFrame::saved_locations(frame) } {
            if flag == FrameFlags::SAVE_RSP {
                // SAFETY: `location` is inside the frame.
                regs.set_sp(unsafe { location.read() });
            } else if let Some(reg) = callee_saved_for(flag) {
                regs.set_callee_saved(reg, location);
            } else if let Some(reg) = scratch_for(flag) {
                regs.set_scratch(reg, location);
            }
        }

        let rax = regs.scratch(ScratchReg::Rax);
        if !rax.is_null() {
            if flags.contains(FrameFlags::RAX_IS_GCREF) {
                self.state.hijacked_return = rax;
                self.state.hijacked_kind = GcRefKind::Object;
            } else if flags.contains(FrameFlags::RAX_IS_BYREF) {
                self.state.hijacked_return = rax;
                self.state.hijacked_kind = GcRefKind::Byref;
            }
        }

        self.state.regs = regs;
        self.state.control_pc = rip;
        // SAFETY: the RBP location points into the live frame.
        let fp = unsafe { regs.fp() };
        self.handle_managed_callout_thunk(rip, fp)
    }

    fn init_from_context(&mut self, context: *mut LimitedContext, flags: WalkFlags) {
        self.reset_frame_state(flags);
        // SAFETY: the context is live per the constructor's contract.
        let ctx = unsafe { &mut *context };
        self.reset_next_exinfo_for_sp(ctx.sp);

        let mut pc = ctx.ip;
        if flags.contains(WalkFlags::APPLY_RETURN_ADDRESS_ADJUSTMENT) {
            pc = adjust_backward(pc);
        }
        let fp = ctx.rbp;
        let mut regs = RegDisplay::from_context(ctx);
        // Only RAX can carry a live value out of a faulting or throwing frame.
        let rax = regs.scratch(ScratchReg::Rax);
        regs.clear_scratch();
        regs.set_scratch(ScratchReg::Rax, rax);
        self.state.regs = regs;

        if self.handle_managed_callout_thunk(pc, fp) {
            return;
        }
        // Interrupted threads hand us arbitrary PCs.
        if self.runtime.modules().is_managed_code(pc) {
            self.state.control_pc = pc;
        }
    }

    fn handle_managed_callout_thunk(&mut self, pc: usize, fp: usize) -> bool {
        let thunks = self.runtime.thunks();
        match thunks.classify(pc) {
            Some(thunk) if thunk.is_managed_callout() => {
                let slot = fp.wrapping_add_signed(MANAGED_CALLOUT_FRAME_OFFSET) as *const usize;
                // SAFETY: the thunk keeps the transition frame it published
                // in its own frame, which is live.
                let entry_frame = unsafe { slot.read() };
                self.init_from_transition_frame(entry_frame);
                self.state.conservative_lower = entry_frame;
                true
            }
            Some(Thunk::CallDescrReturn) => {
                self.state.control_pc = pc;
                self.handle_call_descr_thunk();
                true
            }
            _ => false,
        }
    }

    fn handle_call_descr_thunk(&mut self) -> bool {
        if !self.runtime.thunks().is(self.state.control_pc, Thunk::CallDescrReturn) {
            return false;
        }
        let regs = &mut self.state.regs;
        // SAFETY: the thunk's RBP points at its saved context on the live stack.
        let new_sp = unsafe { regs.fp() };
        let context = new_sp as *mut CallDescrContext;
        // SAFETY: as above.
        unsafe {
            regs.set_callee_saved(CalleeSavedReg::Rbp, &raw mut (*context).rbp);
            regs.set_callee_saved(CalleeSavedReg::Rsi, &raw mut (*context).rsi);
            regs.set_callee_saved(CalleeSavedReg::Rbx, &raw mut (*context).rbx);
            regs.set_addr_of_ip(&raw mut (*context).ip);
            regs.set_ip((*context).ip);
        }
        regs.set_sp(new_sp + size_of::<CallDescrContext>());
        self.state.control_pc = regs.ip();
        true
    }

    fn handle_throw_site_thunk(&mut self) -> bool {
        let is_throw_site = self
            .runtime
            .thunks()
            .classify(self.state.control_pc)
            .is_some_and(Thunk::is_throw_site);
        if !is_throw_site {
            return false;
        }
        let regs = &mut self.state.regs;
        let context = (regs.sp() + THROW_SITE_CONTEXT_OFFSET) as *mut LimitedContext;
        // SAFETY: the throw thunk captured its caller's context at this
        // fixed offset of its live frame.
        unsafe {
            regs.set_callee_saved(CalleeSavedReg::Rbp, &raw mut (*context).rbp);
            regs.set_callee_saved(CalleeSavedReg::Rdi, &raw mut (*context).rdi);
            regs.set_callee_saved(CalleeSavedReg::Rsi, &raw mut (*context).rsi);
            regs.set_callee_saved(CalleeSavedReg::Rbx, &raw mut (*context).rbx);
            regs.set_callee_saved(CalleeSavedReg::R12, &raw mut (*context).r12);
            regs.set_callee_saved(CalleeSavedReg::R13, &raw mut (*context).r13);
            regs.set_callee_saved(CalleeSavedReg::R14, &raw mut (*context).r14);
            regs.set_callee_saved(CalleeSavedReg::R15, &raw mut (*context).r15);
            regs.set_addr_of_ip(&raw mut (*context).ip);
            regs.set_ip((*context).ip);
            regs.set_sp((*context).sp);
        }
        self.state.control_pc = regs.ip();
        true
    }

    /// Returns whether the funclet just unwound was invoked by the
    /// exception dispatcher.
    fn handle_funclet_invoke_thunk(&mut self) -> bool {
        let Some(thunk) = self
            .runtime
            .thunks()
            .classify(self.state.control_pc)
            .filter(|t| t.is_funclet_invoke())
        else {
            return false;
        };

        let regs = &mut self.state.regs;
        for (slot, reg) in self.state.funclet_regs.iter_mut().zip(CalleeSavedReg::ALL) {
            *slot = regs.callee_saved(reg);
        }

        let mut sp = (regs.sp() + FUNCLET_THUNK_SAVE_OFFSET) as *mut usize;
        for reg in [
            CalleeSavedReg::Rbp,
            CalleeSavedReg::Rdi,
            CalleeSavedReg::Rsi,
            CalleeSavedReg::Rbx,
            CalleeSavedReg::R12,
            CalleeSavedReg::R13,
            CalleeSavedReg::R14,
            CalleeSavedReg::R15,
        ] {
            regs.set_callee_saved(reg, sp);
            sp = sp.wrapping_add(1);
        }
        if thunk == Thunk::CallCatchFuncletReturn {
            // The catch thunk also keeps the exception object and ExInfo.
            sp = sp.wrapping_add(2);
        }
        regs.set_addr_of_ip(sp);
        // SAFETY: the thunk's return address slot on the live stack.
        regs.set_ip(unsafe { sp.read() });
        regs.set_sp(sp.wrapping_add(1) as usize);
        self.state.control_pc = regs.ip();
        true
    }

    fn next_internal(&mut self) {
        let mut collapsing_target = 0usize;
        loop {
            let state = &mut self.state;
            state.flags -= STEP_BITS;
            state.hijacked_return = std::ptr::null_mut();
            state.hijacked_kind = GcRefKind::Scalar;
            if state.conservative_lower != 0 && state.conservative_upper != 0 {
                state.conservative_lower = 0;
                state.conservative_upper = 0;
            }

            let Some(method) = self.method.take() else {
                return;
            };
            let mut just_computed_lower = false;
            let mut native_upper = 0usize;

            // SAFETY: the current frame belongs to `method` and the stack is
            // live per the constructor's contract.
            match unsafe { code_manager::unwind_stack_frame(&method, &mut self.state.regs) } {
                Unwound::ReturnsToNative {
                    previous_transition_frame,
                } => {
                    // SAFETY: reverse-P/Invoke frames have a readable RBP.
                    native_upper = unsafe { self.state.regs.fp() };
                    let pending_lower = self.state.conservative_lower;
                    if previous_transition_frame == TOP_OF_STACK_MARKER {
                        self.state.control_pc = 0;
                    } else {
                        let flags = self.state.flags;
                        just_computed_lower = self.init_from_transition_frame(previous_transition_frame);
                        self.state.flags = flags;
                    }
                    // Native frames follow, so the pending range ends at this frame.
                    if pending_lower != 0 && !just_computed_lower {
                        self.state.conservative_lower = pending_lower;
                        self.state.conservative_upper = native_upper;
                    }
                    self.state.flags |= WalkFlags::UNWOUND_REVERSE_PINVOKE;
                }
                Unwound::Caller => {
                    let addr_of_ip = self.state.regs.addr_of_ip();
                    // SAFETY: the return address slot the unwind just found.
                    let mut pc = unsafe { addr_of_ip.read() };
                    if let Some((location, original)) = self.thread.hijack_state() {
                        if location == addr_of_ip {
                            pc = original;
                            self.state.regs.set_ip(original);
                        }
                    }
                    self.state.control_pc = pc;

                    self.handle_call_descr_thunk();
                    let at_throw_site = self.handle_throw_site_thunk();
                    let exceptional_funclet = self.handle_funclet_invoke_thunk();
                    debug_assert!(!exceptional_funclet || method.is_funclet());

                    let post_unwind_sp = self.state.regs.sp();
                    let next_exinfo = self.state.next_exinfo;
                    let ex_collide = if self.state.flags.contains(WalkFlags::COLLAPSE_FUNCLETS) {
                        !next_exinfo.is_null() && post_unwind_sp > next_exinfo as usize
                    } else {
                        exceptional_funclet
                    };

                    // SAFETY: a callout thunk's RBP location is on the live stack.
                    let fp = unsafe { self.state.regs.fp() };
                    if self.handle_managed_callout_thunk(self.state.control_pc, fp) {
                        just_computed_lower = true;
                    } else if ex_collide {
                        debug_assert!(at_throw_site || exceptional_funclet);
                        collapsing_target = self.handle_ex_collide(next_exinfo, collapsing_target);
                        if collapsing_target != 0 {
                            continue;
                        }
                        self.state.flags |= WalkFlags::EX_COLLIDE;
                    } else if self.state.control_pc != 0 && !self.runtime.modules().is_managed_code(self.state.control_pc) {
                        fatal(
                            FatalKind::UnknownStub,
                            &format!("return address {:#x} is neither managed code nor a known thunk", self.state.control_pc),
                        );
                    }

                    if self.state.flags.contains(WalkFlags::APPLY_RETURN_ADDRESS_ADJUSTMENT) {
                        self.state.control_pc = adjust_backward(self.state.control_pc);
                    }
                }
            }

            let state = &mut self.state;
            if state.conservative_lower != 0 && state.conservative_upper == 0 && !just_computed_lower {
                state.conservative_upper = if state.control_pc != 0 {
                    state.regs.sp()
                } else {
                    native_upper
                };
            }
            return;
        }
    }

    /// Continues the walk at the throw point of `ex`. Returns the frame
    /// pointer of the parent method when the walk landed in a funclet that
    /// must be collapsed, or 0.
    fn handle_ex_collide(&mut self, ex: *mut ExInfo, collapsing_target: usize) -> usize {
        // SAFETY: chain records are live while the walk runs.
        let record = unsafe { &*ex };
        let cur_flags = self.state.flags;

        if record.pass_number == 1 || record.current_clause == NO_CLAUSE {
            debug_assert!(!cur_flags.contains(WalkFlags::APPLY_RETURN_ADDRESS_ADJUSTMENT));
            self.init_from_context(record.context, cur_flags);
            self.state.next_exinfo = record.prev;
            self.calculate_method_state();
            if record.kind.contains(ExKind::HARDWARE_FAULT)
                && cur_flags.contains(WalkFlags::REMAP_HARDWARE_FAULTS_TO_SAFE_POINT)
            {
                if let Some(method) = &self.method {
                    self.code_offset = code_manager::remap_hardware_fault_to_gc_safe_point(method, self.code_offset);
                }
            }
            return collapsing_target;
        }

        // SAFETY: the dispatcher's snapshot describes live frames below `ex`.
        unsafe { self.update_from_exception_dispatch(&record.frame_iter) };
        self.reset_next_exinfo_for_sp(self.state.regs.sp());
        if self.state.flags.contains(WalkFlags::APPLY_RETURN_ADDRESS_ADJUSTMENT)
            && cur_flags.contains(WalkFlags::APPLY_RETURN_ADDRESS_ADJUSTMENT)
        {
            // The caller adjusts again on return.
            self.state.control_pc = adjust_forward(self.state.control_pc);
        }
        self.state.flags = cur_flags;

        if self.state.control_pc == 0 || !cur_flags.contains(WalkFlags::COLLAPSE_FUNCLETS) {
            return collapsing_target;
        }
        self.calculate_method_state();
        if self.is_funclet() {
            return self.frame_pointer;
        }
        debug_assert!(collapsing_target == 0 || collapsing_target == self.frame_pointer);
        self.next_internal();
        self.calculate_method_state();
        0
    }

    fn calculate_method_state(&mut self) {
        if self.method.is_some() || self.state.control_pc == 0 {
            return;
        }
        let pc = self.state.control_pc;
        let Some((method, offset)) = self.runtime.modules().find_method_info(pc) else {
            fatal(FatalKind::UnknownStub, &format!("no managed method at {pc:#x}"));
        };
        let sp = self.state.regs.sp();
        if !self.thread.is_within_stack_bounds(sp) {
            fatal(
                FatalKind::StackWalkOutOfBounds,
                &format!("sp {sp:#x} outside the stack of thread {}", self.thread.os_id()),
            );
        }
        // SAFETY: the RBP location of a managed frame is readable.
        self.frame_pointer = unsafe { code_manager::frame_pointer(&method, &self.state.regs) };
        self.code_offset = offset;
        self.method = Some(method);
    }
}

const fn adjust_backward(pc: usize) -> usize {
    pc.wrapping_sub(1)
}

const fn adjust_forward(pc: usize) -> usize {
    pc.wrapping_add(1)
}

fn callee_saved_for(flag: FrameFlags) -> Option<CalleeSavedReg> {
    Some(match flag {
        FrameFlags::SAVE_RBX => CalleeSavedReg::Rbx,
        FrameFlags::SAVE_RSI => CalleeSavedReg::Rsi,
        FrameFlags::SAVE_RDI => CalleeSavedReg::Rdi,
        FrameFlags::SAVE_R12 => CalleeSavedReg::R12,
        FrameFlags::SAVE_R13 => CalleeSavedReg::R13,
        FrameFlags::SAVE_R14 => CalleeSavedReg::R14,
        FrameFlags::SAVE_R15 => CalleeSavedReg::R15,
        _ => return None,
    })
}

fn scratch_for(flag: FrameFlags) -> Option<ScratchReg> {
    Some(match flag {
        FrameFlags::SAVE_RAX => ScratchReg::Rax,
        FrameFlags::SAVE_RCX => ScratchReg::Rcx,
        FrameFlags::SAVE_RDX => ScratchReg::Rdx,
        FrameFlags::SAVE_R8 => ScratchReg::R8,
        FrameFlags::SAVE_R9 => ScratchReg::R9,
        FrameFlags::SAVE_R10 => ScratchReg::R10,
        FrameFlags::SAVE_R11 => ScratchReg::R11,
        _ => return None,
    })
}
