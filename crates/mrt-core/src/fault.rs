//! Hardware faults raised by managed code.
//!
//! The platform's fault handler hands every synchronous fault to
//! [`classify_hardware_fault`]. Faults in managed code, and access
//! violations at the known faulting instructions of the write-barrier
//! helpers, are turned into managed exceptions by resuming the thread at the
//! `ThrowHwExEntry` thunk with the exception code in RCX and the faulting IP
//! in RDX. Everything else is left to the next handler.

use sys_pal::LimitedContext;

use crate::fatal::{fatal, FatalKind};
use crate::regdisplay::POINTER_SIZE;
use crate::runtime::Runtime;
use crate::stubs::Thunk;
use crate::thread::Thread;

/// Faulting addresses below this are null dereferences.
pub const NULL_AREA_SIZE: usize = 64 * 1024;

/// Size of the call instruction a write-barrier helper is reached through,
/// minus one: the caller's IP is reported inside the call.
const WRITE_BARRIER_CALL_ADJUST: usize = 5;

/// An exception code, as the platform reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FaultCode(pub u32);

impl FaultCode {
    /// An access violation below [`NULL_AREA_SIZE`], after remapping.
    pub const NULL_REFERENCE: Self = Self(0x0000_0000);
    pub const DATATYPE_MISALIGNMENT: Self = Self(0x8000_0002);
    pub const ACCESS_VIOLATION: Self = Self(0xC000_0005);
    pub const INTEGER_DIVIDE_BY_ZERO: Self = Self(0xC000_0094);
    pub const STACK_OVERFLOW: Self = Self(0xC000_00FD);
}

/// A synchronous fault delivered by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HardwareFault {
    pub code: FaultCode,
    /// The inaccessible address, for access violations.
    pub address: usize,
}

/// What the platform handler should do with a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum FaultDisposition {
    /// The context now resumes at the throw thunk.
    Redirect { code: FaultCode, faulting_ip: usize },
    /// Not ours; let the next handler look at it.
    ContinueSearch,
}

/// Decides whether `fault`, raised at `context`, becomes a managed
/// exception, and if so rewrites `context` to raise it.
///
/// Stack overflows in managed code, faults inside the runtime's own code,
/// and faults while the current thread has forbidden collections are fatal.
pub fn classify_hardware_fault(runtime: &Runtime, context: &mut LimitedContext, fault: HardwareFault) -> FaultDisposition {
    let current = Thread::current_ptr();
    // SAFETY: the record outlives its binding to this OS thread.
    if let Some(thread) = unsafe { current.as_ref() } {
        if thread.is_do_not_trigger_gc_set() {
            fatal(
                FatalKind::HardwareFaultWithGcDisabled,
                &format!("fault {:#x} at {:#x} with gc triggering disabled", fault.code.0, context.ip),
            );
        }
    }

    let mut faulting_ip = context.ip;
    let in_managed_code = runtime.modules().is_managed_code(faulting_ip);
    let in_write_barrier =
        fault.code == FaultCode::ACCESS_VIOLATION && runtime.thunks().is_write_barrier_location(faulting_ip);

    if in_managed_code || in_write_barrier {
        let mut code = fault.code;
        if code == FaultCode::ACCESS_VIOLATION {
            if fault.address < NULL_AREA_SIZE {
                code = FaultCode::NULL_REFERENCE;
            }
            if !in_managed_code {
                faulting_ip = unwind_write_barrier_to_caller(context);
            }
        } else if code == FaultCode::STACK_OVERFLOW {
            fatal(FatalKind::StackOverflow, &format!("managed stack overflow at {faulting_ip:#x}"));
        }

        let Some(entry) = runtime.thunks().address(Thunk::ThrowHwExEntry) else {
            fatal(FatalKind::UnknownStub, "hardware exception thunk is not registered");
        };
        context.ip = entry;
        context.rcx = code.0 as usize;
        context.rdx = faulting_ip;
        return FaultDisposition::Redirect { code, faulting_ip };
    }

    if runtime.runtime_code().is_some_and(|code| code.contains(faulting_ip)) {
        fatal(
            FatalKind::HardwareFaultInRuntime,
            &format!("fault {:#x} at {faulting_ip:#x} inside the runtime", fault.code.0),
        );
    }
    FaultDisposition::ContinueSearch
}

/// Pops the helper's return address, as a `ret` would, and reports a
/// faulting IP inside the caller's call instruction.
fn unwind_write_barrier_to_caller(context: &mut LimitedContext) -> usize {
    // SAFETY: a write-barrier helper is a leaf entered by a call, so the
    // interrupted SP points at its return address on the live stack.
    let return_address = unsafe { (context.sp as *const usize).read() };
    context.sp += POINTER_SIZE;
    return_address - WRITE_BARRIER_CALL_ADJUST
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::{ModuleDescriptor, Region};
    use crate::test_util::{catch_fatal, fake_runtime, run_attached};
    use crate::Runtime;

    const CODE: usize = 0x40_0000;
    const THROW_HW_EX: usize = 0x7F_0000;

    fn runtime_with_code() -> std::sync::Arc<Runtime> {
        let rt = Runtime::builder().runtime_code(Region::new(0x60_0000, 0x1000)).build();
        rt.modules().register(ModuleDescriptor::new(Region::new(CODE, 0x1000))).unwrap();
        rt.thunks().register(Thunk::ThrowHwExEntry, THROW_HW_EX);
        rt
    }

    fn av(address: usize) -> HardwareFault {
        HardwareFault {
            code: FaultCode::ACCESS_VIOLATION,
            address,
        }
    }

    #[test]
    fn test_null_dereference_in_managed_code_is_redirected() {
        let rt = runtime_with_code();
        let mut ctx = LimitedContext::with_control(CODE + 0x40, 0x1000, 0);
        let disposition = classify_hardware_fault(&rt, &mut ctx, av(0x10));
        assert_eq!(
            disposition,
            FaultDisposition::Redirect {
                code: FaultCode::NULL_REFERENCE,
                faulting_ip: CODE + 0x40,
            }
        );
        assert_eq!(ctx.ip, THROW_HW_EX);
        assert_eq!(ctx.rcx, 0);
        assert_eq!(ctx.rdx, CODE + 0x40);

        let mut ctx = LimitedContext::with_control(CODE + 0x40, 0x1000, 0);
        let disposition = classify_hardware_fault(&rt, &mut ctx, av(0x10_0000));
        assert!(matches!(
            disposition,
            FaultDisposition::Redirect {
                code: FaultCode::ACCESS_VIOLATION,
                ..
            }
        ));
    }

    #[test]
    fn test_write_barrier_fault_unwinds_to_caller() {
        let rt = runtime_with_code();
        let barrier_ip = 0x50_0010;
        assert!(rt.thunks().register_write_barrier_location(barrier_ip));
        let stack = [CODE + 0x85, 0];
        let sp = stack.as_ptr() as usize;
        let mut ctx = LimitedContext::with_control(barrier_ip, sp, 0);

        let disposition = classify_hardware_fault(&rt, &mut ctx, av(0x8));
        assert_eq!(
            disposition,
            FaultDisposition::Redirect {
                code: FaultCode::NULL_REFERENCE,
                faulting_ip: CODE + 0x80,
            }
        );
        assert_eq!(ctx.sp, sp + POINTER_SIZE);
        assert_eq!(ctx.rdx, CODE + 0x80);

        // Only access violations are expected there.
        let mut ctx = LimitedContext::with_control(barrier_ip, sp, 0);
        let divide = HardwareFault {
            code: FaultCode::INTEGER_DIVIDE_BY_ZERO,
            address: 0,
        };
        assert_eq!(classify_hardware_fault(&rt, &mut ctx, divide), FaultDisposition::ContinueSearch);
    }

    #[test]
    fn test_fatal_faults() {
        let rt = runtime_with_code();
        let overflow = HardwareFault {
            code: FaultCode::STACK_OVERFLOW,
            address: 0,
        };
        let mut ctx = LimitedContext::with_control(CODE + 0x10, 0x1000, 0);
        let record = catch_fatal(|| classify_hardware_fault(&rt, &mut ctx, overflow)).unwrap_err();
        assert_eq!(record.kind, FatalKind::StackOverflow);

        let mut ctx = LimitedContext::with_control(0x60_0100, 0x1000, 0);
        let record = catch_fatal(|| classify_hardware_fault(&rt, &mut ctx, av(0))).unwrap_err();
        assert_eq!(record.kind, FatalKind::HardwareFaultInRuntime);
    }

    #[test]
    fn test_foreign_fault_continues_search() {
        let rt = fake_runtime();
        let mut ctx = LimitedContext::with_control(0x90_0000, 0x1000, 0);
        let before = ctx;
        assert_eq!(classify_hardware_fault(&rt, &mut ctx, av(0)), FaultDisposition::ContinueSearch);
        assert_eq!(ctx, before);
    }

    #[test]
    fn test_fault_with_gc_disabled_is_fatal() {
        let rt = fake_runtime();
        run_attached(&rt, |thread| {
            thread.set_do_not_trigger_gc();
            let mut ctx = LimitedContext::with_control(0x90_0000, 0x1000, 0);
            let record = catch_fatal(|| classify_hardware_fault(&rt, &mut ctx, av(0))).unwrap_err();
            assert_eq!(record.kind, FatalKind::HardwareFaultWithGcDisabled);
            thread.clear_do_not_trigger_gc();
        });
    }
}
