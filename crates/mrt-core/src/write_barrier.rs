//! Globals shared by the write-barrier helpers and the collector.
//!
//! The helpers read the card table and the heap bounds on every reference
//! store. The collector replaces them through
//! [`WriteBarrierGlobals::stomp`] only while the world is stopped or while
//! the new values are a superset of the old ones. A sequence word lets
//! readers outside the barrier take a consistent [`snapshot`](WriteBarrierGlobals::snapshot).

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use crossbeam::utils::CachePadded;
use parking_lot::{Mutex, MutexGuard};

use crate::sync::lock_order::{LockGuard, LockOrder};

/// Values the collector installs with [`WriteBarrierGlobals::stomp`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteBarrierParams {
    pub card_table: usize,
    pub card_bundle_table: usize,
    pub lowest_address: usize,
    pub highest_address: usize,
    pub ephemeral_low: usize,
    pub ephemeral_high: usize,
}

/// A consistent view of the globals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteBarrierSnapshot {
    pub card_table: usize,
    pub card_bundle_table: usize,
    pub lowest_address: usize,
    pub highest_address: usize,
    pub ephemeral_low: usize,
    pub ephemeral_high: usize,
    pub gc_in_progress: bool,
}

impl WriteBarrierSnapshot {
    /// Whether `addr` lies in `[lowest_address, highest_address)`.
    #[must_use]
    pub const fn is_heap_address(&self, addr: usize) -> bool {
        addr >= self.lowest_address && addr < self.highest_address
    }

    #[must_use]
    pub const fn is_ephemeral(&self, addr: usize) -> bool {
        addr >= self.ephemeral_low && addr < self.ephemeral_high
    }
}

/// Writers are serialized; the odd/even sequence word brackets each update.
struct WriteSection<'a> {
    _writer: MutexGuard<'a, ()>,
    _order: LockGuard,
}

#[derive(Debug, Default)]
pub struct WriteBarrierGlobals {
    writer: Mutex<()>,
    sequence: CachePadded<AtomicU64>,
    card_table: AtomicUsize,
    card_bundle_table: AtomicUsize,
    lowest_address: AtomicUsize,
    highest_address: AtomicUsize,
    ephemeral_low: AtomicUsize,
    ephemeral_high: AtomicUsize,
    gc_in_progress: AtomicBool,
}

impl WriteBarrierGlobals {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn begin_write(&self) -> WriteSection<'_> {
        let order = LockGuard::new(LockOrder::WriteBarrier);
        let writer = self.writer.lock();
        self.sequence.fetch_add(1, Ordering::AcqRel);
        WriteSection {
            _writer: writer,
            _order: order,
        }
    }

    fn end_write(&self, section: WriteSection<'_>) {
        self.sequence.fetch_add(1, Ordering::Release);
        drop(section);
    }

    /// Installs new barrier parameters.
    ///
    /// The card tables are published first and every CPU's write buffer is
    /// flushed before the heap bounds change, so no mutator pairs the new
    /// bounds with a stale card table.
    pub fn stomp(&self, params: &WriteBarrierParams) {
        let section = self.begin_write();
        self.card_table.store(params.card_table, Ordering::Release);
        self.card_bundle_table.store(params.card_bundle_table, Ordering::Release);
        sys_pal::flush_process_write_buffers();
        self.lowest_address.store(params.lowest_address, Ordering::Release);
        self.highest_address.store(params.highest_address, Ordering::Release);
        self.ephemeral_low.store(params.ephemeral_low, Ordering::Release);
        self.ephemeral_high.store(params.ephemeral_high, Ordering::Release);
        self.end_write(section);
    }

    /// Moves the ephemeral range alone, after a promotion.
    pub fn stomp_ephemeral(&self, low: usize, high: usize) {
        let section = self.begin_write();
        self.ephemeral_low.store(low, Ordering::Release);
        self.ephemeral_high.store(high, Ordering::Release);
        self.end_write(section);
    }

    pub(crate) fn set_gc_in_progress(&self, in_progress: bool) {
        let section = self.begin_write();
        self.gc_in_progress.store(in_progress, Ordering::Release);
        self.end_write(section);
    }

    #[must_use]
    pub fn is_gc_in_progress(&self) -> bool {
        self.gc_in_progress.load(Ordering::Acquire)
    }

    /// All globals as of one instant between updates.
    #[must_use]
    pub fn snapshot(&self) -> WriteBarrierSnapshot {
        loop {
            let before = self.sequence.load(Ordering::Acquire);
            if before % 2 == 1 {
                std::hint::spin_loop();
                continue;
            }
            let snapshot = WriteBarrierSnapshot {
                card_table: self.card_table.load(Ordering::Acquire),
                card_bundle_table: self.card_bundle_table.load(Ordering::Acquire),
                lowest_address: self.lowest_address.load(Ordering::Acquire),
                highest_address: self.highest_address.load(Ordering::Acquire),
                ephemeral_low: self.ephemeral_low.load(Ordering::Acquire),
                ephemeral_high: self.ephemeral_high.load(Ordering::Acquire),
                gc_in_progress: self.gc_in_progress.load(Ordering::Acquire),
            };
            if self.sequence.load(Ordering::Acquire) == before {
                return snapshot;
            }
        }
    }
}
