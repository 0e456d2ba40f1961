//! Frames published at mode boundaries.

use bitflags::bitflags;

use super::Thread;

/// Transition-frame value meaning "no managed frames below this point".
pub const TOP_OF_STACK_MARKER: usize = usize::MAX;

bitflags! {
    /// Which registers a [`TransitionFrame`] saved, and how to treat RAX.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct FrameFlags: u32 {
        const SAVE_RBX = 0x1;
        const SAVE_RSI = 0x2;
        const SAVE_RDI = 0x4;
        /// RBP is always saved in `frame_pointer`; the flag only documents it.
        const SAVE_RBP = 0x8;
        const SAVE_R12 = 0x10;
        const SAVE_R13 = 0x20;
        const SAVE_R14 = 0x40;
        const SAVE_R15 = 0x80;
        const SAVE_RAX = 0x100;
        const SAVE_RCX = 0x200;
        const SAVE_RDX = 0x400;
        const SAVE_R8 = 0x800;
        const SAVE_R9 = 0x1000;
        const SAVE_R10 = 0x2000;
        const SAVE_R11 = 0x4000;
        const SAVE_RSP = 0x8000;
        /// The saved RAX is a hijacked object return value.
        const RAX_IS_GCREF = 0x1_0000;
        /// The saved RAX is a hijacked interior-pointer return value.
        const RAX_IS_BYREF = 0x2_0000;
        /// The frame was published by a thread being aborted.
        const THREAD_ABORT = 0x4_0000;
    }
}

/// Order in which saved registers are packed into [`TransitionFrame::saved`].
pub(crate) const SAVE_ORDER: [FrameFlags; 15] = [
    FrameFlags::SAVE_RBX,
    FrameFlags::SAVE_RSI,
    FrameFlags::SAVE_RDI,
    FrameFlags::SAVE_R12,
    FrameFlags::SAVE_R13,
    FrameFlags::SAVE_R14,
    FrameFlags::SAVE_R15,
    FrameFlags::SAVE_RSP,
    FrameFlags::SAVE_RAX,
    FrameFlags::SAVE_RCX,
    FrameFlags::SAVE_RDX,
    FrameFlags::SAVE_R8,
    FrameFlags::SAVE_R9,
    FrameFlags::SAVE_R10,
    FrameFlags::SAVE_R11,
];

/// Byte offset of the saved slot for `flag` in a frame that saves exactly
/// `flags`. Evaluated at compile time for the hijack stubs.
pub(crate) const fn saved_slot_offset(flags: FrameFlags, flag: FrameFlags) -> usize {
    let mut offset = std::mem::offset_of!(TransitionFrame, saved);
    let mut i = 0;
    while i < SAVE_ORDER.len() {
        let bit = SAVE_ORDER[i].bits();
        if bit == flag.bits() {
            return offset;
        }
        if flags.bits() & bit != 0 {
            offset += size_of::<usize>();
        }
        i += 1;
    }
    panic!("not a saved register")
}

/// Byte offset of the frame's flag word.
pub(crate) const FLAGS_OFFSET: usize = std::mem::offset_of!(TransitionFrame, flags);

/// Register save area a thread publishes when it leaves cooperative mode.
///
/// `rip` is the return address into managed code and `frame_pointer` the
/// caller's RBP. Saved registers follow, packed in [`SAVE_ORDER`] for every
/// bit set in `flags`.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct TransitionFrame {
    pub rip: usize,
    pub frame_pointer: usize,
    pub thread: *const Thread,
    flags: u32,
    _pad: u32,
    saved: [usize; 15],
}

impl TransitionFrame {
    #[must_use]
    pub const fn new(rip: usize, frame_pointer: usize) -> Self {
        Self {
            rip,
            frame_pointer,
            thread: std::ptr::null(),
            flags: FrameFlags::SAVE_RBP.bits(),
            _pad: 0,
            saved: [0; 15],
        }
    }

    /// Saves `value` for the register `flag` names, keeping the packed order.
    ///
    /// # Panics
    ///
    /// Panics if `flag` is not exactly one register bit.
    #[must_use]
    pub fn with_saved(mut self, flag: FrameFlags, value: usize) -> Self {
        let position = SAVE_ORDER
            .iter()
            .position(|&f| f == flag)
            .unwrap_or_else(|| panic!("{flag:?} is not a saved register"));
        let index = self.packed_index(position);
        if self.flags().contains(flag) {
            self.saved[index] = value;
        } else {
            let count = self.saved_count();
            self.saved.copy_within(index..count, index + 1);
            self.saved[index] = value;
            self.flags |= flag.bits();
        }
        self
    }

    #[must_use]
    pub const fn flags(&self) -> FrameFlags {
        FrameFlags::from_bits_retain(self.flags)
    }

    pub(crate) fn set_flags(&mut self, flags: FrameFlags) {
        self.flags = flags.bits();
    }

    pub(crate) fn insert_flags(&mut self, flags: FrameFlags) {
        self.flags |= flags.bits();
    }

    fn saved_count(&self) -> usize {
        SAVE_ORDER.iter().filter(|&&f| self.flags().contains(f)).count()
    }

    fn packed_index(&self, position: usize) -> usize {
        SAVE_ORDER[..position]
            .iter()
            .filter(|&&f| self.flags().contains(f))
            .count()
    }

    /// The saved value of the register `flag` names, if it was saved.
    #[must_use]
    pub fn saved(&self, flag: FrameFlags) -> Option<usize> {
        let position = SAVE_ORDER.iter().position(|&f| f == flag)?;
        self.flags()
            .contains(flag)
            .then(|| self.saved[self.packed_index(position)])
    }

    /// Locations of the saved registers, in [`SAVE_ORDER`], for every saved
    /// register.
    ///
    /// # Safety
    ///
    /// `frame` must point to a live frame.
    pub(crate) unsafe fn saved_locations(frame: *mut Self) -> impl Iterator<Item = (FrameFlags, *mut usize)> {
        // SAFETY: guaranteed by the caller.
        let flags = unsafe { (*frame).flags() };
        // SAFETY: `saved` is inside the frame.
        let base = unsafe { (&raw mut (*frame).saved).cast::<usize>() };
        SAVE_ORDER
            .into_iter()
            .filter(move |&f| flags.contains(f))
            .enumerate()
            // SAFETY: at most 15 saved registers, the length of `saved`.
            .map(move |(i, f)| (f, unsafe { base.add(i) }))
    }
}

/// Two-slot frame of a native-to-managed call.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ReversePInvokeFrame {
    pub saved_thread: *const Thread,
    pub saved_transition_frame: usize,
}

impl Default for ReversePInvokeFrame {
    fn default() -> Self {
        Self {
            saved_thread: std::ptr::null(),
            saved_transition_frame: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_saved_registers_pack_in_order() {
        let frame = TransitionFrame::new(0x1000, 0x2000)
            .with_saved(FrameFlags::SAVE_RAX, 0xAA)
            .with_saved(FrameFlags::SAVE_RBX, 0xBB)
            .with_saved(FrameFlags::SAVE_RSP, 0x5000);
        assert_eq!(frame.saved(FrameFlags::SAVE_RBX), Some(0xBB));
        assert_eq!(frame.saved(FrameFlags::SAVE_RSP), Some(0x5000));
        assert_eq!(frame.saved(FrameFlags::SAVE_RAX), Some(0xAA));
        assert_eq!(frame.saved(FrameFlags::SAVE_R12), None);
        assert_eq!(frame.saved[..3], [0xBB, 0x5000, 0xAA]);

        let frame = frame.with_saved(FrameFlags::SAVE_RBX, 0xCC);
        assert_eq!(frame.saved[..3], [0xCC, 0x5000, 0xAA]);
    }

    #[test]
    fn test_saved_locations_follow_flags() {
        let mut frame = TransitionFrame::new(0, 0)
            .with_saved(FrameFlags::SAVE_R15, 15)
            .with_saved(FrameFlags::SAVE_RSI, 2);
        let locations: Vec<_> = unsafe { TransitionFrame::saved_locations(&raw mut frame) }
            .map(|(f, p)| (f, unsafe { *p }))
            .collect();
        assert_eq!(locations, vec![(FrameFlags::SAVE_RSI, 2), (FrameFlags::SAVE_R15, 15)]);
    }

    #[test]
    fn test_layout_matches_stub_expectations() {
        assert_eq!(std::mem::offset_of!(TransitionFrame, rip), 0);
        assert_eq!(std::mem::offset_of!(TransitionFrame, frame_pointer), 8);
        assert_eq!(std::mem::offset_of!(TransitionFrame, flags), 24);
        assert_eq!(std::mem::offset_of!(TransitionFrame, saved), 32);
        assert_eq!(size_of::<ReversePInvokeFrame>(), 16);
    }

    #[test]
    fn test_saved_slot_offset_matches_packing() {
        let flags = FrameFlags::SAVE_RBX | FrameFlags::SAVE_RSP | FrameFlags::SAVE_RAX;
        let mut frame = TransitionFrame::new(0, 0)
            .with_saved(FrameFlags::SAVE_RBX, 1)
            .with_saved(FrameFlags::SAVE_RSP, 2)
            .with_saved(FrameFlags::SAVE_RAX, 3);
        let base = (&raw mut frame).cast::<u8>();
        for (flag, location) in unsafe { TransitionFrame::saved_locations(&raw mut frame) } {
            let offset = saved_slot_offset(flags, flag);
            assert_eq!(unsafe { base.add(offset) }.cast::<usize>(), location, "{flag:?}");
        }
        assert_eq!(saved_slot_offset(flags, FrameFlags::SAVE_RAX), 48);
    }
}
