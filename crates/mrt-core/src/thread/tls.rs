//! Thread-static storage.
//!
//! Each module with thread statics gets one lazily allocated block per
//! thread. Types created at run time get a slot in a per-thread table
//! indexed by their TLS offset. Both are freed when the thread detaches.

use super::Thread;
use crate::module::{Module, ModuleRegistry};
use crate::regdisplay::POINTER_SIZE;

impl Thread {
    fn assert_owner(&self) {
        assert!(self.is_current(), "thread-static storage touched from a foreign thread");
    }

    /// The calling thread's block for `module`, allocated zeroed on first use.
    /// `None` if the module has no thread statics.
    ///
    /// # Panics
    ///
    /// Panics if `self` is not the calling thread's record.
    #[must_use]
    pub fn thread_static_block(&self, module: &Module) -> Option<*mut u8> {
        self.assert_owner();
        let desc = module.thread_statics()?;
        // SAFETY: owner checked above.
        let local = unsafe { self.local() };
        let block = local.thread_statics.entry(module.id()).or_insert_with(|| {
            let cells = desc.block_size.max(desc.gc.extent()).div_ceil(POINTER_SIZE);
            vec![0usize; cells].into_boxed_slice()
        });
        Some(block.as_mut_ptr().cast())
    }

    /// Storage of the dynamic type at `tls_offset`, allocated zeroed with
    /// `size` bytes on first use. A full table grows to at least `num_cells`
    /// entries and at least double its length.
    ///
    /// # Panics
    ///
    /// Panics if `self` is not the calling thread's record.
    pub fn allocate_thread_local_storage_for_dynamic_type(
        &self,
        tls_offset: u32,
        size: usize,
        num_cells: usize,
    ) -> *mut u8 {
        self.assert_owner();
        // SAFETY: owner checked above.
        let table = &mut unsafe { self.local() }.dynamic_tls;
        let index = tls_offset as usize;
        if table.len() <= index {
            let len = num_cells.max(index + 1).max(table.len() * 2);
            table.resize_with(len, || None);
        }
        table[index]
            .get_or_insert_with(|| vec![0u8; size.next_multiple_of(POINTER_SIZE)].into_boxed_slice())
            .as_mut_ptr()
    }

    /// Storage of the dynamic type at `tls_offset`, if allocated.
    ///
    /// # Panics
    ///
    /// Panics if `self` is not the calling thread's record.
    #[must_use]
    pub fn dynamic_tls_slot(&self, tls_offset: u32) -> Option<*mut u8> {
        self.assert_owner();
        // SAFETY: owner checked above.
        let table = &mut unsafe { self.local() }.dynamic_tls;
        table
            .get_mut(tls_offset as usize)
            .and_then(Option::as_mut)
            .map(|slot| slot.as_mut_ptr())
    }

    /// Reports every reference cell of the thread's static storage.
    ///
    /// # Safety
    ///
    /// The caller is the owner, or the owner is parked.
    pub(crate) unsafe fn enum_thread_static_roots(&self, modules: &ModuleRegistry, report: &mut dyn FnMut(*mut usize)) {
        // SAFETY: guaranteed by the caller.
        let local = unsafe { self.local() };
        modules.for_each_module(|module| {
            let (Some(desc), Some(block)) = (module.thread_statics(), local.thread_statics.get_mut(&module.id()))
            else {
                return;
            };
            // SAFETY: the block covers the descriptor's extent.
            unsafe { desc.gc.enum_slots(block.as_mut_ptr() as usize, report) };
        });
        modules.for_each_dynamic_thread_statics(|statics| {
            let Some(Some(slot)) = local.dynamic_tls.get_mut(statics.tls_offset as usize) else {
                return;
            };
            if slot.len() < statics.gc.extent() {
                return;
            }
            // SAFETY: length checked above.
            unsafe { statics.gc.enum_slots(slot.as_mut_ptr() as usize, report) };
        });
    }

    /// Drops all thread-static storage. Called on detach.
    pub(crate) fn free_thread_local_storage(&self) {
        // SAFETY: the thread is leaving the store; nothing else reads its
        // storage once it is unlinked.
        let local = unsafe { self.local() };
        local.dynamic_tls.clear();
        local.thread_statics.clear();
    }
}
