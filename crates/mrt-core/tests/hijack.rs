//! Suspending a thread that is running managed code.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier, Mutex};

use mrt_core::gc_interface::scan_stack_roots;
use mrt_core::gcinfo::encode::{CallsiteEncoder, LiveSlot, MethodEncoding};
use mrt_core::gcinfo::{InfoHeader, ReturnKind};
use mrt_core::test_util::{fake_runtime, hijack_at, run_attached, runtime_with, FakeInterrupter, ImageBuilder, RootRecorder, SimStack};
use mrt_core::thread::{FrameFlags, HijackOutcome, ReversePInvokeFrame};
use mrt_core::{GcFlags, Runtime, RuntimeConfig, ScanContext, Thunk, TransitionFrame};
use sys_pal::LimitedContext;

const TEXT: usize = 0x10_0000;
const OBJECT_STUB: usize = 0x7F_1000;
const RETURNED_OBJECT: usize = 0x5_0000;
const LIVE_LOCAL: usize = 0x5_0100;

/// A leaf returning an object, called from a method with one live stack slot
/// at the call site.
struct Image {
    leaf: usize,
    caller: usize,
}

fn register_image(rt: &Runtime) -> Image {
    let mut image = ImageBuilder::new(TEXT, 0x1000);
    let leaf_header = InfoHeader::new()
        .with_prolog_size(4)
        .with_frame_size(0x10)
        .with_return_kind(ReturnKind::Object);
    let leaf = image.method(
        0x40,
        &MethodEncoding {
            header: leaf_header,
            ..Default::default()
        },
    );

    let mut callsites = CallsiteEncoder::new();
    callsites.add_callsite(
        0x20,
        &[LiveSlot::Stack {
            fp_based: false,
            offset: 8,
            flags: GcFlags::empty(),
        }],
    );
    let caller = image.method(
        0x40,
        &MethodEncoding {
            header: InfoHeader::new().with_prolog_size(4).with_frame_size(0x10),
            callsites: Some(&callsites),
            ..Default::default()
        },
    );
    image.register(rt).unwrap();
    rt.thunks().register(Thunk::GcHijackObject, OBJECT_STUB);
    Image { leaf, caller }
}

#[test]
fn test_suspend_while_cooperative_hijacks_return_address() {
    let context = Arc::new(Mutex::new(LimitedContext::default()));
    let outcomes = Arc::new(Mutex::new(Vec::new()));
    let fired = Arc::new(AtomicBool::new(false));
    let interrupter = {
        let context = Arc::clone(&context);
        let outcomes = Arc::clone(&outcomes);
        FakeInterrupter::new(move |rt, thread| {
            // A real interrupter freezes the target; hijack once and let the
            // target run into the stub.
            if fired.swap(true, Ordering::AcqRel) {
                return HijackOutcome::Pending;
            }
            let ctx = *context.lock().unwrap();
            let outcome = hijack_at(rt, thread, &ctx);
            outcomes.lock().unwrap().push(outcome);
            outcome
        })
    };
    let rt = runtime_with(RuntimeConfig::default(), Box::new(interrupter));
    let image = register_image(&rt);
    let ready = Barrier::new(2);

    std::thread::scope(|s| {
        s.spawn(|| {
            // leaf frame (2 words), return into caller, caller frame (2 words), end of stack
            let mut stack = SimStack::<8>::new();
            stack.set(2, image.caller + 0x20);
            stack.set(4, LIVE_LOCAL);
            stack.set(5, 0);

            let mut entry = ReversePInvokeFrame::default();
            rt.reverse_pinvoke(&mut entry);
            let thread = rt.attach_current_thread();
            *context.lock().unwrap() = LimitedContext::with_control(image.leaf + 0x10, stack.addr(0), 0);
            ready.wait();

            while !thread.is_hijacked() {
                std::hint::spin_loop();
            }
            assert_eq!(stack.get(2), OBJECT_STUB);

            // What the object stub does on return.
            let mut frame = TransitionFrame::new(0, 0)
                .with_saved(FrameFlags::SAVE_RAX, RETURNED_OBJECT)
                .with_saved(FrameFlags::SAVE_RSP, stack.addr(3));
            let resume_at = unsafe { thread.on_hijack_return(&raw mut frame) };
            assert_eq!(resume_at, image.caller + 0x20);
            assert!(frame.flags().contains(FrameFlags::RAX_IS_GCREF));
            assert!(thread.is_cooperative());

            rt.reverse_pinvoke_return(&entry);
            rt.detach_current_thread();
        });

        ready.wait();
        let metrics = rt.suspend_ee("hijack");
        assert_eq!(metrics.hijacks_installed, 1);
        assert_eq!(*outcomes.lock().unwrap(), vec![HijackOutcome::Installed]);

        let target = rt.threads().snapshot().pop().unwrap();
        assert!(!target.is_hijacked());
        let mut recorder = RootRecorder::default();
        unsafe { scan_stack_roots(&rt, &target, &ScanContext::promotion(), &mut recorder.callback()) };
        assert_eq!(unsafe { recorder.values() }, vec![RETURNED_OBJECT, LIVE_LOCAL]);
        assert!(recorder.roots.iter().all(|&(_, flags)| flags.is_empty()));

        rt.restart_ee();
    });
    assert_eq!(rt.global_metrics().hijacks_installed(), 1);
}

#[test]
fn test_hijack_then_unhijack_restores_stack() {
    let rt = fake_runtime();
    let image = register_image(&rt);
    run_attached(&rt, |thread| {
        let mut entry = ReversePInvokeFrame::default();
        rt.reverse_pinvoke(&mut entry);

        let mut stack = SimStack::<6>::new();
        for i in 0..6 {
            stack.set(i, 0x100 + i);
        }
        stack.set(2, image.caller + 0x20);
        let before: Vec<usize> = (0..6).map(|i| stack.get(i)).collect();

        let ctx = LimitedContext::with_control(image.leaf + 0x10, stack.addr(0), 0);
        assert_eq!(hijack_at(&rt, thread, &ctx), HijackOutcome::Installed);
        assert_eq!(stack.get(2), OBJECT_STUB);
        assert_eq!(thread.hijack_state(), Some((stack.addr(2) as *mut usize, image.caller + 0x20)));

        // A second interruption replaces the hijack rather than stacking it.
        assert_eq!(hijack_at(&rt, thread, &ctx), HijackOutcome::Installed);
        assert_eq!(thread.hijack_state().map(|(_, original)| original), Some(image.caller + 0x20));

        thread.unhijack();
        let after: Vec<usize> = (0..6).map(|i| stack.get(i)).collect();
        assert_eq!(after, before);
        rt.reverse_pinvoke_return(&entry);
    });
}

#[test]
fn test_hijack_refusals() {
    let rt = fake_runtime();
    let image = register_image(&rt);
    run_attached(&rt, |thread| {
        let stack = SimStack::<4>::new();
        let in_body = LimitedContext::with_control(image.leaf + 0x10, stack.addr(0), 0);
        assert_eq!(hijack_at(&rt, thread, &in_body), HijackOutcome::AlreadyPreemptive);

        let mut entry = ReversePInvokeFrame::default();
        rt.reverse_pinvoke(&mut entry);

        let in_prolog = LimitedContext::with_control(image.leaf + 2, stack.addr(0), 0);
        assert_eq!(hijack_at(&rt, thread, &in_prolog), HijackOutcome::NotHijackable);

        let foreign = LimitedContext::with_control(0x90_0000, stack.addr(0), 0);
        assert_eq!(hijack_at(&rt, thread, &foreign), HijackOutcome::NotManaged);

        // The caller returns a scalar; drop the built-in scalar stub.
        rt.thunks().register(Thunk::GcHijackScalar, 0);
        let in_caller = LimitedContext::with_control(image.caller + 0x10, stack.addr(0), 0);
        assert_eq!(hijack_at(&rt, thread, &in_caller), HijackOutcome::Unsupported);

        thread.set_do_not_trigger_gc();
        assert_eq!(hijack_at(&rt, thread, &in_body), HijackOutcome::DoNotTriggerGc);
        thread.clear_do_not_trigger_gc();

        assert!(!thread.is_hijacked());
        rt.reverse_pinvoke_return(&entry);
    });
}

#[test]
fn test_hijack_through_write_barrier_helper() {
    let rt = fake_runtime();
    let image = register_image(&rt);
    let barrier_ip = 0x7E_0010;
    assert!(rt.thunks().register_write_barrier_location(barrier_ip));
    run_attached(&rt, |thread| {
        let mut entry = ReversePInvokeFrame::default();
        rt.reverse_pinvoke(&mut entry);

        // Return into the leaf, then the leaf's frame and its return slot.
        let mut stack = SimStack::<6>::new();
        stack.set(0, image.leaf + 0x18);
        stack.set(3, image.caller + 0x20);
        let ctx = LimitedContext::with_control(barrier_ip, stack.addr(0), 0);
        assert_eq!(hijack_at(&rt, thread, &ctx), HijackOutcome::Installed);
        assert_eq!(thread.hijack_state().map(|(slot, _)| slot as usize), Some(stack.addr(3)));
        thread.unhijack();
        assert_eq!(stack.get(3), image.caller + 0x20);

        rt.reverse_pinvoke_return(&entry);
    });
}

#[cfg(all(target_arch = "x86_64", target_os = "linux"))]
mod native {
    /// Stores the address of its own return slot in `*slot`, spins until
    /// `*release` is non-zero, then returns `value`.
    #[unsafe(naked)]
    pub unsafe extern "C" fn return_after_release(slot: *mut usize, release: *const u8, value: usize) -> usize {
        std::arch::naked_asm!(
            "mov [rdi], rsp",
            "2:",
            "pause",
            "cmp byte ptr [rsi], 0",
            "je 2b",
            "mov rax, rdx",
            "ret",
        );
    }
}

#[cfg(all(target_arch = "x86_64", target_os = "linux"))]
#[test]
fn test_return_through_object_stub_parks_and_reloads_rax() {
    use std::sync::atomic::AtomicUsize;

    use mrt_core::gcinfo::GcRefKind;
    use mrt_core::test_util::hijack_return_slot;

    const MOVED_OBJECT: usize = 0x6_0000;

    let slot = Arc::new(AtomicUsize::new(0));
    let release = Arc::new(AtomicBool::new(false));
    let interrupter = {
        let release = Arc::clone(&release);
        FakeInterrupter::new(move |_, _| {
            // The trap is raised by now: let the target return into the stub.
            release.store(true, Ordering::Release);
            HijackOutcome::Pending
        })
    };
    let rt = runtime_with(RuntimeConfig::default(), Box::new(interrupter));
    let stub = rt.thunks().hijack_stub(GcRefKind::Object).unwrap();

    std::thread::scope(|s| {
        let target = s.spawn(|| {
            let mut entry = ReversePInvokeFrame::default();
            rt.reverse_pinvoke(&mut entry);
            let thread = rt.attach_current_thread();
            let value =
                unsafe { native::return_after_release(slot.as_ptr(), release.as_ptr().cast::<u8>(), RETURNED_OBJECT) };
            assert!(!thread.is_hijacked());
            assert!(thread.is_cooperative());
            rt.reverse_pinvoke_return(&entry);
            rt.detach_current_thread();
            value
        });

        while slot.load(Ordering::Acquire) == 0 {
            std::hint::spin_loop();
        }
        let location = slot.load(Ordering::Acquire);
        let thread = rt.threads().snapshot().pop().unwrap();
        assert!(unsafe { hijack_return_slot(&rt, &thread, location as *mut usize, GcRefKind::Object) });
        let (_, original) = thread.hijack_state().unwrap();
        assert_eq!(unsafe { (location as *const usize).read() }, stub);

        rt.suspend_ee("stub return");
        assert!(!thread.is_hijacked());
        assert_eq!(unsafe { (location as *const usize).read() }, original);

        let published = thread.raw_transition_frame() as *mut TransitionFrame;
        let frame = unsafe { published.read() };
        assert_eq!(frame.rip, original);
        assert_eq!(frame.thread, Arc::as_ptr(&thread));
        assert!(frame.flags().contains(FrameFlags::RAX_IS_GCREF));
        assert_eq!(frame.saved(FrameFlags::SAVE_RAX), Some(RETURNED_OBJECT));
        assert_eq!(frame.saved(FrameFlags::SAVE_RSP), Some(location + 8));

        // Relocate the returned object, as a compacting collector would.
        unsafe { published.write(frame.with_saved(FrameFlags::SAVE_RAX, MOVED_OBJECT)) };
        rt.restart_ee();

        assert_eq!(target.join().unwrap(), MOVED_OBJECT);
    });
}
