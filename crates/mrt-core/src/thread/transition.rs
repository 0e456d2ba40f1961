//! Cooperative/preemptive mode transitions.
//!
//! Every transition is a store to the thread's own transition-frame word,
//! a full fence, and a load of the trap word. The fence pairs with the
//! coordinator's write-buffer flush; without it a mutator could enter
//! cooperative mode after the coordinator already decided it was safe.

use std::sync::atomic::{fence, AtomicUsize, Ordering};
use std::time::Duration;

use super::{FrameFlags, ReversePInvokeFrame, Thread, TransitionFrame, TrapFlags, TOP_OF_STACK_MARKER};
use crate::fatal::{fatal, FatalKind};
use crate::gcinfo::GcRefKind;
use crate::sync::{Event, WaitResult};

/// How a blocking transition ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum TransitionOutcome {
    /// The thread is back in cooperative mode.
    Resumed,
    /// The thread is back in cooperative mode and must raise its pending
    /// abort exception.
    AbortRequested,
}

impl Thread {
    fn publish(&self, frame: usize) {
        self.transition_frame.store(frame, Ordering::Release);
        fence(Ordering::SeqCst);
    }

    fn debug_assert_owner(&self) {
        debug_assert!(self.is_current(), "mode transition on a foreign thread");
    }

    /// Publishes `frame` and switches to preemptive mode.
    ///
    /// If a suspension is in progress the thread removes its own hijack and
    /// waits for the suspension to finish parking the others.
    ///
    /// # Safety
    ///
    /// `frame` must stay live and describe the caller's registers until the
    /// matching [`enter_cooperative`](Self::enter_cooperative).
    pub unsafe fn leave_cooperative(&self, frame: *mut TransitionFrame) {
        self.debug_assert_owner();
        if !self.is_cooperative() {
            fatal(FatalKind::BadTransition, "leaving cooperative mode while preemptive");
        }
        // SAFETY: guaranteed by the caller.
        unsafe { (*frame).thread = std::ptr::from_ref(self) };
        self.publish(frame as usize);
        if self.shared.is_trap_threads_requested() {
            self.unhijack();
            self.shared.wait_for_suspend_complete();
        }
    }

    /// Fast path of [`enter_cooperative`](Self::enter_cooperative): returns
    /// `false`, still preemptive on `frame`, if any trap bit is set.
    ///
    /// # Safety
    ///
    /// As for [`enter_cooperative`](Self::enter_cooperative).
    pub unsafe fn try_enter_cooperative(&self, frame: *mut TransitionFrame) -> bool {
        self.debug_assert_owner();
        if self.is_cooperative() {
            fatal(FatalKind::BadTransition, "entering cooperative mode twice");
        }
        self.publish(0);
        if self.shared.is_trapped() && !self.shared.is_suspending(self) {
            self.publish(frame as usize);
            return false;
        }
        true
    }

    /// Switches back to cooperative mode, parking on `frame` while a
    /// suspension is in progress.
    ///
    /// # Safety
    ///
    /// `frame` must be a live frame describing the caller's registers; it is
    /// republished if the thread has to wait.
    pub unsafe fn enter_cooperative(&self, frame: *mut TransitionFrame) -> TransitionOutcome {
        // SAFETY: forwarded from the caller.
        if unsafe { self.try_enter_cooperative(frame) } {
            return TransitionOutcome::Resumed;
        }
        // SAFETY: forwarded from the caller.
        unsafe { self.wait_for_gc(frame) };
        self.abort_outcome()
    }

    fn abort_outcome(&self) -> TransitionOutcome {
        if self.shared.trap_flags().contains(TrapFlags::ABORT_IN_PROGRESS) && self.abort_exception().is_some() {
            TransitionOutcome::AbortRequested
        } else {
            TransitionOutcome::Resumed
        }
    }

    /// Parks in preemptive mode on `frame` until no suspension is pending,
    /// then returns in cooperative mode.
    ///
    /// # Safety
    ///
    /// `frame` must be a live frame describing the caller's registers.
    pub(crate) unsafe fn wait_for_gc(&self, frame: *mut TransitionFrame) {
        loop {
            self.publish(frame as usize);
            self.unhijack();
            while self.shared.is_trap_threads_requested() && !self.shared.is_suspending(self) {
                self.shared.wait_for_gc_completion();
                if self.shared.is_trap_threads_requested() {
                    // A suspension that does not use the GC event.
                    sys_pal::switch_to_thread();
                }
            }
            self.publish(0);
            if !self.shared.is_trap_threads_requested() || self.shared.is_suspending(self) {
                return;
            }
        }
    }

    /// Explicit safe point for loops in cooperative mode.
    ///
    /// # Safety
    ///
    /// As for [`enter_cooperative`](Self::enter_cooperative); the thread must
    /// be cooperative.
    pub unsafe fn gc_poll(&self, frame: *mut TransitionFrame) -> TransitionOutcome {
        if !self.shared.is_trapped() || self.shared.is_suspending(self) {
            return TransitionOutcome::Resumed;
        }
        // SAFETY: forwarded from the caller.
        unsafe {
            (*frame).thread = std::ptr::from_ref(self);
            self.wait_for_gc(frame);
        }
        self.abort_outcome()
    }

    /// Records the frame runtime helpers use to leave cooperative mode
    /// without a transition of their own.
    ///
    /// # Safety
    ///
    /// `frame` must stay live until replaced or cleared.
    pub unsafe fn set_pinvoke_tunnel(&self, frame: *mut TransitionFrame) {
        if !frame.is_null() {
            // SAFETY: guaranteed by the caller.
            unsafe { (*frame).thread = std::ptr::from_ref(self) };
        }
        let value = if frame.is_null() { TOP_OF_STACK_MARKER } else { frame as usize };
        self.pinvoke_tunnel.store(value, Ordering::Release);
    }

    fn tunnel_frame(&self) -> *mut TransitionFrame {
        let tunnel = self.pinvoke_tunnel();
        if tunnel == TOP_OF_STACK_MARKER {
            fatal(FatalKind::BadTransition, "preemptive switch without a tunnel frame");
        }
        tunnel as *mut TransitionFrame
    }

    /// Leaves cooperative mode through the tunnel frame.
    pub fn enable_preemptive(&self) {
        let frame = self.tunnel_frame();
        // SAFETY: the tunnel was published by this thread and is live.
        unsafe { self.leave_cooperative(frame) };
    }

    /// Returns to cooperative mode through the tunnel frame.
    pub fn disable_preemptive(&self) -> TransitionOutcome {
        let frame = self.tunnel_frame();
        // SAFETY: the tunnel was published by this thread and is live.
        unsafe { self.enter_cooperative(frame) }
    }

    /// Waits on `event` without blocking a collection.
    pub fn wait_on(&self, event: &Event, timeout: Option<Duration>) -> WaitResult {
        if !self.is_cooperative() {
            return event.wait(timeout);
        }
        self.enable_preemptive();
        let result = event.wait(timeout);
        let _ = self.disable_preemptive();
        result
    }

    /// Coordinator only: remembers the target's frame if it is preemptive.
    pub(crate) fn cache_transition_frame_for_suspend(&self) -> bool {
        if self.cached_transition_frame() != 0 {
            return true;
        }
        fence(Ordering::SeqCst);
        let frame = self.raw_transition_frame();
        if frame == 0 {
            return false;
        }
        self.cached_transition_frame.store(frame, Ordering::Release);
        true
    }

    pub(crate) fn reset_cached_transition_frame(&self) {
        self.cached_transition_frame.store(0, Ordering::Release);
    }

    /// The frame a GC stack walk of this thread starts from: the tunnel for
    /// the suspending thread itself, the cached frame for everyone else.
    #[must_use]
    pub fn transition_frame(&self) -> usize {
        if self.shared.is_suspending(self) {
            self.pinvoke_tunnel()
        } else {
            self.cached_transition_frame()
        }
    }

    /// The frame a stack trace of the calling thread starts from.
    #[must_use]
    pub fn transition_frame_for_stack_trace(&self) -> usize {
        self.pinvoke_tunnel()
    }

    /// Native-to-managed entry without attaching or waiting.
    ///
    /// Returns `false` if the slow path [`Runtime::reverse_pinvoke`](crate::Runtime::reverse_pinvoke)
    /// must run instead.
    pub fn try_fast_reverse_pinvoke(&self, frame: &mut ReversePInvokeFrame) -> bool {
        if !self.is_attached() || self.is_detached() {
            return false;
        }
        let saved = self.raw_transition_frame();
        if saved == 0 {
            return false;
        }
        frame.saved_thread = std::ptr::from_ref(self);
        frame.saved_transition_frame = saved;
        self.publish(0);
        if self.shared.is_trapped() && !self.shared.is_suspending(self) {
            self.publish(saved);
            return false;
        }
        true
    }

    /// Slow path of the native-to-managed entry, on an attached thread.
    pub(crate) fn reverse_pinvoke_slow(&self, frame: &mut ReversePInvokeFrame) {
        frame.saved_thread = std::ptr::from_ref(self);
        let saved = self.raw_transition_frame();
        if saved == 0 {
            if self.is_do_not_trigger_gc_set() {
                frame.saved_transition_frame = 0;
                return;
            }
            fatal(FatalKind::BadTransition, "reverse p/invoke while already cooperative");
        }
        frame.saved_transition_frame = saved;
        self.publish(0);
        if self.shared.is_trapped() && !self.shared.is_suspending(self) {
            self.publish(saved);
            self.unhijack();
            if self.is_do_not_trigger_gc_set() {
                self.publish(0);
            } else {
                // SAFETY: `saved` is the frame this thread published last, or
                // the top-of-stack marker, which is never dereferenced.
                unsafe { self.wait_for_gc(saved as *mut TransitionFrame) };
            }
        }
    }

    /// Managed-to-native return of a reverse P/Invoke: restores the frame
    /// saved on entry.
    pub fn reverse_pinvoke_return(&self, frame: &ReversePInvokeFrame) {
        self.publish(frame.saved_transition_frame);
        if self.shared.is_trap_threads_requested() {
            self.unhijack();
            self.shared.wait_for_suspend_complete();
        }
    }

    /// Called by the `GcHijack` stubs when a hijacked method returns.
    ///
    /// Removes the hijack, completes `frame` with the original return
    /// address and the kind of value in RAX, and parks the thread if a
    /// suspension is pending. Returns the address to resume at.
    ///
    /// # Safety
    ///
    /// `frame` must be the stub's live register save area, with RAX saved.
    pub unsafe fn on_hijack_return(&self, frame: *mut TransitionFrame) -> usize {
        let kind = self.hijack_kind();
        let original = self.hijacked_return_address.swap(0, Ordering::AcqRel);
        self.hijack_location.store(0, Ordering::Release);

        // SAFETY: guaranteed by the caller.
        let frame_ref = unsafe { &mut *frame };
        frame_ref.rip = original;
        frame_ref.thread = std::ptr::from_ref(self);
        match kind {
            GcRefKind::Object => frame_ref.insert_flags(FrameFlags::RAX_IS_GCREF),
            GcRefKind::Byref => frame_ref.insert_flags(FrameFlags::RAX_IS_BYREF),
            GcRefKind::Scalar => {}
        }

        if self.shared.is_trapped() && !self.shared.is_suspending(self) {
            // SAFETY: the completed frame describes the caller of the hijacked method.
            unsafe { self.wait_for_gc(frame) };
        }
        original
    }

    /// Installs a hijack. Only the hijack engine calls this, on a thread
    /// that is interrupted or frozen.
    ///
    /// # Safety
    ///
    /// `location` must be the live return-address slot of the target's
    /// topmost managed frame.
    pub(crate) unsafe fn install_hijack(&self, location: *mut usize, stub: usize, kind: GcRefKind) {
        // SAFETY: guaranteed by the caller; the slot is word-aligned stack memory.
        let slot = unsafe { AtomicUsize::from_ptr(location) };
        let original = slot.swap(stub, Ordering::AcqRel);
        self.hijack_kind.store(kind as u8, Ordering::Release);
        self.hijacked_return_address.store(original, Ordering::Release);
        self.hijack_location.store(location as usize, Ordering::Release);
    }

    /// Puts the original return address back.
    pub fn unhijack(&self) {
        let location = self.hijack_location.swap(0, Ordering::AcqRel);
        if location == 0 {
            return;
        }
        let original = self.hijacked_return_address.swap(0, Ordering::AcqRel);
        // SAFETY: the slot was live when the hijack was installed and the
        // owner has not returned through it, or it would have cleared the
        // location itself.
        let slot = unsafe { AtomicUsize::from_ptr(location as *mut usize) };
        slot.store(original, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::test_util::{catch_fatal, fake_runtime, run_attached};

    #[test]
    fn test_uncontended_cycle_leaves_no_trace() {
        let rt = fake_runtime();
        run_attached(&rt, |thread| {
            let mut entry = ReversePInvokeFrame::default();
            rt.reverse_pinvoke(&mut entry);
            let mut frame = TransitionFrame::new(0, 0);
            for _ in 0..10_000 {
                unsafe {
                    thread.leave_cooperative(&raw mut frame);
                    assert_eq!(thread.enter_cooperative(&raw mut frame), TransitionOutcome::Resumed);
                }
            }
            assert!(thread.is_cooperative());
            assert_eq!(thread.raw_transition_frame(), 0);
            assert!(rt.threads().trap_flags().is_empty());
            assert_eq!(rt.threads().thread_count(), 1);
            thread.reverse_pinvoke_return(&entry);
            assert_eq!(thread.raw_transition_frame(), TOP_OF_STACK_MARKER);
        });
    }

    #[test]
    fn test_unbalanced_transitions_are_fatal() {
        let rt = fake_runtime();
        run_attached(&rt, |thread| {
            let mut frame = TransitionFrame::new(0, 0);
            let record = catch_fatal(|| unsafe { thread.leave_cooperative(&raw mut frame) }).unwrap_err();
            assert_eq!(record.kind, FatalKind::BadTransition);

            assert_eq!(unsafe { thread.enter_cooperative(&raw mut frame) }, TransitionOutcome::Resumed);
            let record = catch_fatal(|| unsafe { thread.enter_cooperative(&raw mut frame) }).unwrap_err();
            assert_eq!(record.kind, FatalKind::BadTransition);
            unsafe { thread.leave_cooperative(&raw mut frame) };
        });
    }

    #[test]
    fn test_fast_reverse_pinvoke_requires_preemptive_thread() {
        let rt = fake_runtime();
        run_attached(&rt, |thread| {
            let mut outer = ReversePInvokeFrame::default();
            assert!(thread.try_fast_reverse_pinvoke(&mut outer));
            assert_eq!(outer.saved_transition_frame, TOP_OF_STACK_MARKER);
            assert!(thread.is_cooperative());

            let mut inner = ReversePInvokeFrame::default();
            assert!(!thread.try_fast_reverse_pinvoke(&mut inner));
            let record = catch_fatal(|| rt.reverse_pinvoke(&mut inner)).unwrap_err();
            assert_eq!(record.kind, FatalKind::BadTransition);

            thread.set_do_not_trigger_gc();
            rt.reverse_pinvoke(&mut inner);
            assert_eq!(inner.saved_transition_frame, 0);
            thread.reverse_pinvoke_return(&inner);
            thread.clear_do_not_trigger_gc();
            assert!(thread.is_cooperative());

            thread.reverse_pinvoke_return(&outer);
            assert!(!thread.is_cooperative());
        });
    }

    #[test]
    fn test_tunnel_drives_preemptive_switch() {
        let rt = fake_runtime();
        run_attached(&rt, |thread| {
            let mut entry = ReversePInvokeFrame::default();
            rt.reverse_pinvoke(&mut entry);

            let record = catch_fatal(|| thread.enable_preemptive()).unwrap_err();
            assert_eq!(record.kind, FatalKind::BadTransition);

            let mut tunnel = TransitionFrame::new(0x1234, 0);
            unsafe { thread.set_pinvoke_tunnel(&raw mut tunnel) };
            thread.enable_preemptive();
            assert_eq!(thread.raw_transition_frame(), (&raw mut tunnel) as usize);
            assert_eq!(thread.transition_frame_for_stack_trace(), (&raw mut tunnel) as usize);
            assert_eq!(thread.disable_preemptive(), TransitionOutcome::Resumed);
            assert!(thread.is_cooperative());

            let event = Event::new_manual(true);
            assert_eq!(thread.wait_on(&event, None), WaitResult::Signaled);
            assert!(thread.is_cooperative());

            unsafe { thread.set_pinvoke_tunnel(std::ptr::null_mut()) };
            thread.reverse_pinvoke_return(&entry);
        });
    }

    #[test]
    fn test_hijack_install_and_unhijack_restore_slot() {
        let rt = fake_runtime();
        run_attached(&rt, |thread| {
            let mut stack = [0x1111usize, 0x2222, 0x3333];
            let before = stack;
            unsafe { thread.install_hijack(&raw mut stack[1], 0xDEAD, GcRefKind::Byref) };
            assert!(thread.is_hijacked());
            assert_eq!(unsafe { (&raw const stack[1]).read_volatile() }, 0xDEAD);
            assert_eq!(thread.hijack_state(), Some((&raw mut stack[1], 0x2222)));
            thread.unhijack();
            assert!(!thread.is_hijacked());
            assert_eq!(unsafe { (&raw const stack).read_volatile() }, before);
        });
    }

    #[test]
    fn test_hijack_return_completes_frame() {
        let rt = fake_runtime();
        run_attached(&rt, |thread| {
            let mut slot = 0x4000_1234usize;
            unsafe { thread.install_hijack(&raw mut slot, 0xDEAD, GcRefKind::Object) };
            let mut frame = TransitionFrame::new(0, 0).with_saved(FrameFlags::SAVE_RAX, 0x5000);
            let resume_at = unsafe { thread.on_hijack_return(&raw mut frame) };
            assert_eq!(resume_at, 0x4000_1234);
            assert_eq!(frame.rip, 0x4000_1234);
            assert!(frame.flags().contains(FrameFlags::RAX_IS_GCREF));
            assert!(!thread.is_hijacked());
            assert!(std::ptr::eq(frame.thread, Arc::as_ptr(thread)));
        });
    }
}
