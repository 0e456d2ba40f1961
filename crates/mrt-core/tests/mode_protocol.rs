//! Cooperative/preemptive transitions seen from outside the crate.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Barrier;
use std::time::Duration;

use mrt_core::test_util::{fake_runtime, run_attached};
use mrt_core::thread::{ReversePInvokeFrame, TransitionOutcome, TOP_OF_STACK_MARKER};
use mrt_core::TransitionFrame;

#[test]
fn test_uncontended_cycle() {
    let rt = fake_runtime();
    run_attached(&rt, |thread| {
        let mut entry = ReversePInvokeFrame::default();
        rt.reverse_pinvoke(&mut entry);

        let mut frame_a = TransitionFrame::new(0x1000, 0);
        for _ in 0..10_000 {
            unsafe {
                thread.leave_cooperative(&raw mut frame_a);
                assert_eq!(thread.raw_transition_frame(), (&raw mut frame_a) as usize);
                assert_eq!(thread.enter_cooperative(&raw mut frame_a), TransitionOutcome::Resumed);
            }
        }

        assert!(!rt.threads().suspend_state().is_trap_threads_requested());
        assert_eq!(rt.threads().thread_count(), 1);
        assert_eq!(thread.raw_transition_frame(), 0);
        rt.reverse_pinvoke_return(&entry);
    });
}

#[test]
fn test_suspend_while_preemptive() {
    let rt = fake_runtime();
    let published = AtomicUsize::new(0);
    let suspended = Barrier::new(2);
    let entered = AtomicBool::new(false);

    std::thread::scope(|s| {
        s.spawn(|| {
            let mut entry = ReversePInvokeFrame::default();
            rt.reverse_pinvoke(&mut entry);
            let thread = rt.attach_current_thread();

            let mut frame_a = TransitionFrame::new(0x2000, 0);
            unsafe { thread.leave_cooperative(&raw mut frame_a) };
            published.store((&raw mut frame_a) as usize, Ordering::Release);

            suspended.wait();
            // Blocks until the collector restarts the world.
            let outcome = unsafe { thread.enter_cooperative(&raw mut frame_a) };
            assert_eq!(outcome, TransitionOutcome::Resumed);
            entered.store(true, Ordering::Release);
            assert_eq!(thread.cached_transition_frame(), 0);

            unsafe { thread.leave_cooperative(&raw mut frame_a) };
            let _ = unsafe { thread.enter_cooperative(&raw mut frame_a) };
            rt.reverse_pinvoke_return(&entry);
            rt.detach_current_thread();
        });

        while published.load(Ordering::Acquire) == 0 {
            std::thread::yield_now();
        }
        let metrics = rt.suspend_ee("preemptive");
        assert_eq!(metrics.threads_scanned, 1);
        assert_eq!(metrics.hijack_attempts, 0);
        let target = rt.threads().snapshot().pop().unwrap();
        assert_eq!(target.cached_transition_frame(), published.load(Ordering::Acquire));

        suspended.wait();
        std::thread::sleep(Duration::from_millis(50));
        assert!(!entered.load(Ordering::Acquire));
        rt.restart_ee();
    });

    assert!(entered.load(Ordering::Acquire));
    assert_eq!(rt.threads().thread_count(), 0);
}

#[test]
fn test_reverse_pinvoke_attaches_and_joins_suspension() {
    let rt = fake_runtime();
    let polling = Barrier::new(2);
    let done = AtomicBool::new(false);
    let tunnel_addr = AtomicUsize::new(0);

    std::thread::scope(|s| {
        s.spawn(|| {
            assert!(rt.threads().get_current_thread_if_available().is_none());
            let mut entry = ReversePInvokeFrame::default();
            rt.reverse_pinvoke(&mut entry);
            let thread = rt.attach_current_thread();
            assert!(thread.is_cooperative());
            assert_eq!(entry.saved_transition_frame, TOP_OF_STACK_MARKER);

            let mut frame = TransitionFrame::new(0x3000, 0);
            tunnel_addr.store((&raw mut frame) as usize, Ordering::Release);
            polling.wait();
            while !done.load(Ordering::Acquire) {
                let _ = unsafe { thread.gc_poll(&raw mut frame) };
                std::hint::spin_loop();
            }
            rt.reverse_pinvoke_return(&entry);
            assert!(!thread.is_cooperative());
            rt.detach_current_thread();
        });

        polling.wait();
        assert_eq!(rt.threads().thread_count(), 1);
        let metrics = rt.suspend_ee("new thread");
        assert_eq!(metrics.threads_scanned, 1);
        let target = rt.threads().snapshot().pop().unwrap();
        assert_eq!(target.cached_transition_frame(), tunnel_addr.load(Ordering::Acquire));
        done.store(true, Ordering::Release);
        rt.restart_ee();
    });

    assert_eq!(rt.threads().thread_count(), 0);
    assert_eq!(rt.global_metrics().threads_attached(), 1);
}

#[test]
fn test_do_not_trigger_gc_flag_is_tolerant() {
    let rt = fake_runtime();
    run_attached(&rt, |thread| {
        thread.clear_do_not_trigger_gc();
        assert!(!thread.is_do_not_trigger_gc_set());
        thread.set_do_not_trigger_gc();
        assert!(thread.is_do_not_trigger_gc_set());
        thread.clear_do_not_trigger_gc();

        thread.set_suppress_gc_stress();
        assert!(thread.is_suppress_gc_stress_set());
        thread.clear_suppress_gc_stress();
        assert!(!thread.is_suppress_gc_stress_set());

        let local = 0usize;
        assert!(thread.is_within_stack_bounds((&raw const local) as usize));
    });
}
