//! Conservative reporting of stack ranges.
//!
//! Words in a range whose contents the runtime cannot type are reported as
//! pinned interior references when they fall inside the GC heap. Managed
//! code can ask for the same treatment of a stack buffer by publishing a
//! [`ConservativeRegion`] descriptor and reporting an interior pointer to it.

use crate::gcinfo::GcFlags;
use crate::regdisplay::POINTER_SIZE;
use crate::thread::Thread;

#[cfg(target_pointer_width = "64")]
pub const CONSERVATIVE_REGION_MAGIC: usize = 0x87DF_7A10_4F09_E0A9;
#[cfg(not(target_pointer_width = "64"))]
pub const CONSERVATIVE_REGION_MAGIC: usize = 0x4F09_E0A9;

/// Descriptor of a stack buffer to report conservatively.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConservativeRegion {
    pub magic: usize,
    pub low: usize,
    pub high: usize,
    pub hash: usize,
}

impl ConservativeRegion {
    /// A descriptor covering `[low, high)`.
    #[must_use]
    pub fn new(low: usize, high: usize) -> Self {
        let mut region = Self::default();
        region.initialize(low, high);
        region
    }

    pub fn initialize(&mut self, low: usize, high: usize) {
        self.magic = CONSERVATIVE_REGION_MAGIC;
        self.low = low;
        self.high = high;
        self.hash = region_hash(CONSERVATIVE_REGION_MAGIC, low, high);
    }

    /// Makes the descriptor fail validation from now on.
    pub fn disable(&mut self) {
        self.magic = 0;
        self.hash = 0;
    }
}

/// Checksum stored in a [`ConservativeRegion`].
#[must_use]
pub fn region_hash(magic: usize, low: usize, high: usize) -> usize {
    const MULTIPLIER: u64 = 0x9E37_79B9_7F4A_7C15;
    let mut hash = magic as u64;
    for word in [low, high] {
        hash = (hash.rotate_left(23) ^ word as u64).wrapping_mul(MULTIPLIER);
    }
    #[allow(clippy::cast_possible_truncation)]
    let folded = (hash ^ (hash >> 32)) as usize;
    folded
}

/// The range a descriptor at `candidate` on `thread`'s stack covers, if
/// the descriptor is genuine. Never reads outside the thread's stack.
pub(crate) fn validate_region(thread: &Thread, candidate: usize) -> Option<(usize, usize)> {
    let bounds = thread.stack_bounds();
    let size = size_of::<ConservativeRegion>();
    if candidate % POINTER_SIZE != 0 || candidate < bounds.low || candidate.checked_add(size)? > bounds.high {
        return None;
    }
    // SAFETY: aligned and entirely inside the thread's stack, which stays
    // mapped while the thread is attached.
    let region = unsafe { (candidate as *const ConservativeRegion).read() };
    if region.magic != CONSERVATIVE_REGION_MAGIC {
        return None;
    }
    let (low, high) = (region.low, region.high);
    if low >= high || low % POINTER_SIZE != 0 || high % POINTER_SIZE != 0 {
        return None;
    }
    if low < bounds.low || high > bounds.high {
        return None;
    }
    (region.hash == region_hash(region.magic, low, high)).then_some((low, high))
}

/// Reports every word in `[lower, upper)` whose value lies in
/// `[heap_low, heap_high]` as a pinned interior reference.
///
/// # Safety
///
/// The range must be readable.
pub unsafe fn report_conservative_range(
    lower: usize,
    upper: usize,
    heap_low: usize,
    heap_high: usize,
    report: &mut dyn FnMut(*mut usize, GcFlags),
) {
    if heap_high == 0 {
        return;
    }
    let mut slot = lower.next_multiple_of(POINTER_SIZE);
    while slot + POINTER_SIZE <= upper {
        let location = slot as *mut usize;
        // SAFETY: guaranteed by the caller.
        let value = unsafe { location.read() };
        if (heap_low..=heap_high).contains(&value) {
            report(location, GcFlags::INTERIOR | GcFlags::PINNED);
        }
        slot += POINTER_SIZE;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_heap_words_are_reported() {
        let words = [0x10usize, 0x10_0200, 0x20_0000, 0x10_0000, 0];
        let base = words.as_ptr() as usize;
        let mut seen = Vec::new();
        unsafe {
            report_conservative_range(base, base + words.len() * POINTER_SIZE, 0x10_0000, 0x1F_FFFF, &mut |slot, flags| {
                seen.push((slot as usize, flags));
            });
        }
        let pinned_interior = GcFlags::INTERIOR | GcFlags::PINNED;
        assert_eq!(
            seen,
            vec![(base + POINTER_SIZE, pinned_interior), (base + 3 * POINTER_SIZE, pinned_interior)]
        );
    }

    #[test]
    fn test_unset_heap_bounds_report_nothing() {
        let words = [0usize, 1, 2];
        let base = words.as_ptr() as usize;
        let mut count = 0;
        unsafe { report_conservative_range(base, base + 24, 0, 0, &mut |_, _| count += 1) };
        assert_eq!(count, 0);
    }

    #[test]
    fn test_hash_depends_on_every_field() {
        let base = region_hash(CONSERVATIVE_REGION_MAGIC, 0x1000, 0x2000);
        assert_ne!(base, region_hash(CONSERVATIVE_REGION_MAGIC, 0x1008, 0x2000));
        assert_ne!(base, region_hash(CONSERVATIVE_REGION_MAGIC, 0x1000, 0x2008));
        assert_ne!(base, region_hash(0, 0x1000, 0x2000));
        assert_eq!(base, ConservativeRegion::new(0x1000, 0x2000).hash);
    }
}
