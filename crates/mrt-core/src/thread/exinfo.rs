//! In-flight exception records.
//!
//! The exception dispatcher keeps one [`ExInfo`] on the stack per exception
//! it is handling, chained from the thread newest first. The stack walker
//! uses the chain to bridge the gap between a funclet and the frame that
//! threw, and the collector reports each record's exception object.

use std::sync::atomic::Ordering;

use bitflags::bitflags;
use sys_pal::LimitedContext;

use super::Thread;
use crate::fatal::{fatal, FatalKind};
use crate::stackwalk::IteratorSnapshot;

/// `current_clause` of a record that has not started running handlers.
pub const NO_CLAUSE: u32 = u32::MAX;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ExKind: u8 {
        const THROW = 0x1;
        const HARDWARE_FAULT = 0x2;
        /// A newer exception escaped a handler of this one.
        const SUPERSEDED = 0x8;
    }
}

/// One in-flight exception.
#[repr(C)]
#[derive(Debug)]
pub struct ExInfo {
    pub prev: *mut ExInfo,
    /// Register state at the throw site.
    pub context: *mut LimitedContext,
    pub exception: usize,
    pub kind: ExKind,
    /// 1 while searching for a handler, 2 while unwinding.
    pub pass_number: u8,
    pub current_clause: u32,
    /// The dispatcher's iterator, as of the funclet it is running.
    pub frame_iter: IteratorSnapshot,
    pub notify_debugger_sp: usize,
}

impl ExInfo {
    #[must_use]
    pub fn new(context: *mut LimitedContext, exception: usize, kind: ExKind) -> Self {
        Self {
            prev: std::ptr::null_mut(),
            context,
            exception,
            kind,
            pass_number: 1,
            current_clause: NO_CLAUSE,
            frame_iter: IteratorSnapshot::default(),
            notify_debugger_sp: 0,
        }
    }

    #[must_use]
    pub fn is_hardware_fault(&self) -> bool {
        self.kind.contains(ExKind::HARDWARE_FAULT)
    }
}

impl Thread {
    #[must_use]
    pub fn exinfo_head(&self) -> *mut ExInfo {
        self.exinfo_head.load(Ordering::Acquire) as *mut ExInfo
    }

    /// Links `node` as the newest exception.
    ///
    /// # Safety
    ///
    /// `node` must stay live until popped, and the caller must be the owner.
    pub unsafe fn push_exinfo(&self, node: *mut ExInfo) {
        // SAFETY: guaranteed by the caller.
        unsafe { (*node).prev = self.exinfo_head() };
        self.exinfo_head.store(node as usize, Ordering::Release);
    }

    /// Unlinks `node` together with the records below `limit_sp` it
    /// superseded.
    ///
    /// # Safety
    ///
    /// Every record on the chain must still be live.
    pub unsafe fn pop_exinfo(&self, node: *mut ExInfo, limit_sp: usize) {
        if self.exinfo_head() != node {
            fatal(
                FatalKind::InvalidExInfoChain,
                &format!("popping {node:p}, head is {:p}", self.exinfo_head()),
            );
        }
        // SAFETY: guaranteed by the caller.
        let mut next = unsafe { (*node).prev };
        while !next.is_null() && (next as usize) < limit_sp {
            // SAFETY: guaranteed by the caller.
            let skipped = unsafe { &*next };
            if !skipped.kind.contains(ExKind::SUPERSEDED) {
                fatal(
                    FatalKind::InvalidExInfoChain,
                    &format!("dead record {next:p} was never superseded"),
                );
            }
            next = skipped.prev;
        }
        self.exinfo_head.store(next as usize, Ordering::Release);
    }

    /// Calls `report` with the exception slot of every record, newest first.
    ///
    /// # Safety
    ///
    /// Every record on the chain must be live: the caller is the owner, or
    /// the owner is parked.
    pub unsafe fn for_each_exception_slot(&self, report: &mut dyn FnMut(*mut usize)) {
        let mut node = self.exinfo_head();
        while !node.is_null() {
            // SAFETY: guaranteed by the caller.
            unsafe {
                report(&raw mut (*node).exception);
                node = (*node).prev;
            }
        }
    }

    /// The exception objects of the chain, newest first.
    #[must_use]
    pub fn exception_objects(&self) -> Vec<usize> {
        let mut objects = Vec::new();
        // SAFETY: records are live while linked, and reading a slot is a
        // plain word load.
        unsafe {
            self.for_each_exception_slot(&mut |slot| {
                let object = slot.read();
                if object != 0 {
                    objects.push(object);
                }
            });
        }
        objects
    }
}
