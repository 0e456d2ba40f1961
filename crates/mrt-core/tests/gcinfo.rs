//! GC and EH info from encoding through module registration to lookup by
//! return address.

use mrt_core::gcinfo::encode::{CallsiteEncoder, LiveSlot, MethodEncoding};
use mrt_core::gcinfo::{EhClause, EhClauseKind, InfoHeader, ReturnKind};
use mrt_core::module::{enum_gc_refs, resolve_eh_type, return_value_kind};
use mrt_core::regdisplay::{CalleeSavedReg, RegDisplay};
use mrt_core::test_util::{fake_runtime, ImageBuilder};
use mrt_core::GcFlags;
use sys_pal::LimitedContext;

const TEXT: usize = 0x40_0000;
const EXCEPTION_TYPE: usize = 0x7700;

fn roots_at(rt: &mrt_core::Runtime, pc: usize, regs: &RegDisplay) -> Vec<(usize, GcFlags)> {
    let (method, offset) = rt.modules().find_method_info(pc).unwrap();
    let mut roots = Vec::new();
    unsafe { enum_gc_refs(&method, offset, regs, &mut |slot, flags| roots.push((slot as usize, flags))) };
    roots
}

#[test]
fn test_callsites_resolved_through_registry() {
    let rt = fake_runtime();
    let mut image = ImageBuilder::new(TEXT, 0x4000);

    let mut callsites = CallsiteEncoder::new();
    callsites.add_callsite(0x10, &[LiveSlot::Register(CalleeSavedReg::Rbx, GcFlags::empty())]);
    callsites.add_callsite(0x30, &[LiveSlot::Register(CalleeSavedReg::Rsi, GcFlags::INTERIOR)]);
    // Far enough from the previous call site to need a forwarder.
    callsites.add_callsite(
        0x1400,
        &[
            LiveSlot::Register(CalleeSavedReg::R12, GcFlags::PINNED),
            LiveSlot::Stack {
                fp_based: false,
                offset: 16,
                flags: GcFlags::empty(),
            },
        ],
    );
    let header = InfoHeader::new()
        .with_prolog_size(6)
        .with_frame_size(0x20)
        .with_return_kind(ReturnKind::Byref);
    let method = image.method(
        0x2000,
        &MethodEncoding {
            header,
            callsites: Some(&callsites),
            ..Default::default()
        },
    );
    let plain = image.method(
        0x40,
        &MethodEncoding {
            header: InfoHeader::new().with_prolog_size(2),
            ..Default::default()
        },
    );
    image.register(&rt).unwrap();

    let stack = [0usize; 6];
    let mut ctx = LimitedContext::with_control(0, stack.as_ptr() as usize, 0);
    let regs = RegDisplay::from_context(&mut ctx);
    let rbx = regs.callee_saved(CalleeSavedReg::Rbx) as usize;
    let rsi = regs.callee_saved(CalleeSavedReg::Rsi) as usize;
    let r12 = regs.callee_saved(CalleeSavedReg::R12) as usize;

    assert_eq!(roots_at(&rt, method + 0x10, &regs), vec![(rbx, GcFlags::empty())]);
    assert_eq!(roots_at(&rt, method + 0x30, &regs), vec![(rsi, GcFlags::INTERIOR)]);
    assert_eq!(
        roots_at(&rt, method + 0x1400, &regs),
        vec![(r12, GcFlags::PINNED), (stack.as_ptr() as usize + 16, GcFlags::empty())]
    );
    // Not a call site.
    assert!(roots_at(&rt, method + 0x20, &regs).is_empty());
    assert!(roots_at(&rt, plain + 0x10, &regs).is_empty());

    let (info, offset) = rt.modules().find_method_info(method + 0x1400).unwrap();
    assert_eq!(offset, 0x1400);
    assert_eq!(info.code_start(), method);
    assert_eq!(info.code_size(), 0x2000);
    assert_eq!(info.header().frame_size(), 0x20);
    assert_eq!(return_value_kind(&info), mrt_core::gcinfo::GcRefKind::Byref);
    assert!(rt.modules().find_method_info(TEXT + 0x3F00).is_none());
}

#[test]
fn test_eh_clauses_through_module() {
    let rt = fake_runtime();
    let mut image = ImageBuilder::new(TEXT, 0x1000);
    let clauses = [
        EhClause {
            kind: EhClauseKind::Typed,
            try_start: 0x08,
            try_end: 0x30,
            handler_offset: 0x60,
            filter_offset: 0,
            type_index: 0,
        },
        EhClause {
            kind: EhClauseKind::Fault,
            try_start: 0x08,
            try_end: 0x50,
            handler_offset: 0x70,
            filter_offset: 0,
            type_index: 0,
        },
    ];
    let with_eh = image.method_with_eh(
        0x80,
        &MethodEncoding {
            header: InfoHeader::new().with_prolog_size(4),
            ..Default::default()
        },
        &clauses,
    );
    let without_eh = image.method(
        0x40,
        &MethodEncoding {
            header: InfoHeader::new().with_prolog_size(4),
            ..Default::default()
        },
    );
    image.with_eh_types(vec![EXCEPTION_TYPE]).register(&rt).unwrap();

    let (method, _) = rt.modules().find_method_info(with_eh + 0x10).unwrap();
    assert!(method.has_eh_info());
    let decoded: Vec<EhClause> = method.eh_clauses().unwrap().map(Result::unwrap).collect();
    assert_eq!(decoded, clauses);
    assert!(decoded[0].covers(0x10));
    assert!(!decoded[0].covers(0x30));
    assert_eq!(unsafe { resolve_eh_type(&method, &decoded[0]) }, Some(EXCEPTION_TYPE));

    let (method, _) = rt.modules().find_method_info(without_eh + 0x10).unwrap();
    assert!(!method.has_eh_info());
    assert_eq!(method.eh_clauses().unwrap().count(), 0);
}
