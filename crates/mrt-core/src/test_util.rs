//! Test support: fatal-error capture, fake collector plug-ins, module image
//! and simulated-stack builders.

use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::ptr::NonNull;
use std::sync::Arc;

use parking_lot::Mutex;
use sys_pal::{LimitedContext, Mmap, MmapOptions};

use crate::alloc::{AllocContext, AllocFlags, LARGE_OBJECT_SIZE};
use crate::config::RuntimeConfig;
use crate::fatal::{hook::CatchScope, FatalRecord};
use crate::gc_interface::{GcHeap, HandleKind, HandleTable, ObjectHandle, ScanContext};
use crate::gcinfo::encode::{encode_eh_clauses, GcInfoBuilder, MethodEncoding};
use crate::gcinfo::{EhClause, GcFlags, GcRefKind};
use crate::module::{MethodEntry, Module, ModuleDescriptor, Region, RegistryError};
use crate::regdisplay::POINTER_SIZE;
use crate::runtime::Runtime;
use crate::thread::{hijack, HijackOutcome, Interrupter, Thread};

/// Runs `f`, turning a fatal error raised inside it into `Err`.
///
/// Other panics propagate unchanged.
pub fn catch_fatal<R>(f: impl FnOnce() -> R) -> Result<R, FatalRecord> {
    let _scope = CatchScope::enter();
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => Ok(value),
        Err(payload) => match payload.downcast::<FatalRecord>() {
            Ok(record) => Err(*record),
            Err(other) => panic::resume_unwind(other),
        },
    }
}

/// A runtime whose interrupter never reaches cooperative threads.
#[must_use]
pub fn fake_runtime() -> Arc<Runtime> {
    runtime_with(RuntimeConfig::default(), Box::new(FakeInterrupter::never()))
}

#[must_use]
pub fn runtime_with(config: RuntimeConfig, interrupter: Box<dyn Interrupter>) -> Arc<Runtime> {
    Runtime::builder().config(config).interrupter(interrupter).build()
}

/// Attaches the calling thread for the duration of `f`.
pub fn run_attached<R>(runtime: &Arc<Runtime>, f: impl FnOnce(&Arc<Thread>) -> R) -> R {
    let thread = runtime.attach_current_thread();
    let result = f(&thread);
    runtime.detach_current_thread();
    result
}

type Respond = dyn Fn(&Runtime, &Thread) -> HijackOutcome + Send + Sync;

/// An [`Interrupter`] driven by a closure instead of the OS.
pub struct FakeInterrupter {
    respond: Box<Respond>,
}

impl FakeInterrupter {
    pub fn new(respond: impl Fn(&Runtime, &Thread) -> HijackOutcome + Send + Sync + 'static) -> Self {
        Self {
            respond: Box::new(respond),
        }
    }

    /// Fails every attempt, leaving cooperative threads to poll.
    #[must_use]
    pub fn never() -> Self {
        Self::new(|_, _| HijackOutcome::NotHijackable)
    }
}

impl std::fmt::Debug for FakeInterrupter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeInterrupter").finish_non_exhaustive()
    }
}

impl Interrupter for FakeInterrupter {
    fn interrupt(&self, runtime: &Runtime, thread: &Thread) -> HijackOutcome {
        (self.respond)(runtime, thread)
    }
}

/// Runs the hijack engine against `thread` as if it had been interrupted
/// with `context`.
pub fn hijack_at(runtime: &Runtime, thread: &Thread, context: &LimitedContext) -> HijackOutcome {
    hijack::hijack_callback(runtime, thread, context)
}

/// Points the return-address slot `location` of `thread` at the registered
/// stub for `kind`, skipping the frame lookup. Returns `false` if no stub is
/// registered.
///
/// # Safety
///
/// `location` must be a return-address slot on `thread`'s stack that stays
/// live until the thread returns through it or is unhijacked.
pub unsafe fn hijack_return_slot(runtime: &Runtime, thread: &Thread, location: *mut usize, kind: GcRefKind) -> bool {
    let Some(stub) = runtime.thunks().hijack_stub(kind) else {
        return false;
    };
    // SAFETY: guaranteed by the caller.
    unsafe { thread.install_hijack(location, stub, kind) };
    true
}

/// A call the collector received.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapCall {
    Alloc { size: usize, flags: AllocFlags },
    Publish(usize),
    FixAllocContext,
}

/// A bump-pointer [`GcHeap`] over one mapping that never collects.
pub struct FakeHeap {
    mapping: Mmap,
    next: Mutex<usize>,
    window: usize,
    calls: Mutex<Vec<HeapCall>>,
}

impl std::fmt::Debug for FakeHeap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeHeap")
            .field("bounds", &self.bounds())
            .field("calls", &self.calls.lock().len())
            .finish_non_exhaustive()
    }
}

impl FakeHeap {
    /// A heap of `len` bytes handing out windows of `window` bytes.
    ///
    /// # Errors
    ///
    /// Fails if the mapping cannot be created.
    pub fn new(len: usize, window: usize) -> io::Result<Self> {
        // SAFETY: the pointer is only used while `mapping` is alive.
        let mapping = unsafe { MmapOptions::new().len(len).map_anon()? };
        let start = mapping.ptr() as usize;
        Ok(Self {
            mapping,
            next: Mutex::new(start),
            window,
            calls: Mutex::new(Vec::new()),
        })
    }

    /// `[start, end)` of the mapping.
    #[must_use]
    pub fn bounds(&self) -> (usize, usize) {
        let start = self.mapping.ptr() as usize;
        (start, start + self.mapping.len())
    }

    #[must_use]
    pub fn contains(&self, addr: usize) -> bool {
        let (start, end) = self.bounds();
        (start..end).contains(&addr)
    }

    #[must_use]
    pub fn calls(&self) -> Vec<HeapCall> {
        self.calls.lock().clone()
    }

    fn carve(&self, size: usize) -> Option<usize> {
        let size = size.next_multiple_of(POINTER_SIZE);
        let mut next = self.next.lock();
        let start = *next;
        let end = start.checked_add(size)?;
        if end > self.bounds().1 {
            return None;
        }
        *next = end;
        Some(start)
    }
}

impl GcHeap for FakeHeap {
    fn alloc(&self, context: &mut AllocContext, size: usize, flags: AllocFlags) -> Option<NonNull<u8>> {
        self.calls.lock().push(HeapCall::Alloc { size, flags });
        if size >= LARGE_OBJECT_SIZE || flags.intersects(AllocFlags::FINALIZE | AllocFlags::ALIGN8) {
            return NonNull::new(self.carve(size)? as *mut u8);
        }
        let window = self.window.max(size);
        let start = self.carve(window)?;
        context.alloc_ptr = start + size;
        context.alloc_limit = start + window;
        context.alloc_bytes += size as u64;
        NonNull::new(start as *mut u8)
    }

    fn publish_object(&self, object: NonNull<u8>) {
        self.calls.lock().push(HeapCall::Publish(object.as_ptr() as usize));
    }

    fn fix_alloc_context(&self, context: &mut AllocContext) {
        self.calls.lock().push(HeapCall::FixAllocContext);
        context.clear();
    }
}

/// A [`HandleTable`] of boxed cells.
#[derive(Debug, Default)]
pub struct FakeHandleTable {
    cells: Mutex<Vec<(HandleKind, Box<[usize; 2]>)>>,
}

impl FakeHandleTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&self, kind: HandleKind, primary: usize, secondary: usize) -> Option<ObjectHandle> {
        let mut cell = Box::new([primary, secondary]);
        let slot = NonNull::from(&mut cell[0]);
        self.cells.lock().push((kind, cell));
        Some(ObjectHandle::from_slot(slot))
    }

    fn with_cell<R>(&self, handle: ObjectHandle, f: impl FnOnce(HandleKind, &mut [usize; 2]) -> R) -> Option<R> {
        let mut cells = self.cells.lock();
        let (kind, cell) = cells
            .iter_mut()
            .find(|(_, cell)| std::ptr::eq(&cell[0], handle.slot().as_ptr()))?;
        Some(f(*kind, cell))
    }
}

impl HandleTable for FakeHandleTable {
    fn create(&self, kind: HandleKind, object: usize) -> Option<ObjectHandle> {
        self.insert(kind, object, 0)
    }

    fn create_dependent(&self, primary: usize, secondary: usize) -> Option<ObjectHandle> {
        self.insert(HandleKind::Dependent, primary, secondary)
    }

    fn destroy(&self, handle: ObjectHandle) {
        self.cells
            .lock()
            .retain(|(_, cell)| !std::ptr::eq(&cell[0], handle.slot().as_ptr()));
    }

    fn store(&self, handle: ObjectHandle, object: usize) {
        self.with_cell(handle, |_, cell| cell[0] = object);
    }

    fn dependent_secondary(&self, handle: ObjectHandle) -> usize {
        self.with_cell(handle, |kind, cell| if kind == HandleKind::Dependent { cell[1] } else { 0 })
            .unwrap_or(0)
    }

    fn scan(&self, sc: &ScanContext, report: &mut dyn FnMut(*mut usize, GcFlags)) {
        let mut cells = self.cells.lock();
        for (kind, cell) in cells.iter_mut() {
            match kind {
                HandleKind::Strong => report(&raw mut cell[0], GcFlags::empty()),
                HandleKind::Pinned => report(&raw mut cell[0], GcFlags::PINNED),
                HandleKind::Dependent if cell[0] != 0 => {
                    report(&raw mut cell[1], GcFlags::empty());
                    if !sc.promotion {
                        report(&raw mut cell[0], GcFlags::empty());
                    }
                }
                HandleKind::WeakShort | HandleKind::WeakLong if !sc.promotion => {
                    report(&raw mut cell[0], GcFlags::empty());
                }
                _ => {}
            }
        }
    }
}

/// Records every reported root.
#[derive(Debug, Default)]
pub struct RootRecorder {
    pub roots: Vec<(usize, GcFlags)>,
}

impl RootRecorder {
    pub fn callback(&mut self) -> impl FnMut(*mut usize, GcFlags) + '_ {
        |slot, flags| self.roots.push((slot as usize, flags))
    }

    /// Reported slot addresses, in report order.
    #[must_use]
    pub fn slots(&self) -> Vec<usize> {
        self.roots.iter().map(|&(slot, _)| slot).collect()
    }

    /// Values held by the reported slots.
    ///
    /// # Safety
    ///
    /// Every recorded slot must still be readable.
    #[must_use]
    pub unsafe fn values(&self) -> Vec<usize> {
        self.roots
            .iter()
            // SAFETY: guaranteed by the caller.
            .map(|&(slot, _)| unsafe { (slot as *const usize).read() })
            .collect()
    }
}

/// Lays out the methods of one fake module.
#[derive(Debug)]
pub struct ImageBuilder {
    text: Region,
    gc_info: GcInfoBuilder,
    methods: Vec<MethodEntry>,
    eh_info: Vec<u8>,
    eh_type_table: Vec<usize>,
    next_offset: u32,
}

impl ImageBuilder {
    /// An image whose code occupies `[start, start + len)`.
    #[must_use]
    pub fn new(start: usize, len: usize) -> Self {
        Self {
            text: Region::new(start, len),
            gc_info: GcInfoBuilder::new(),
            methods: Vec::new(),
            eh_info: Vec::new(),
            eh_type_table: Vec::new(),
            next_offset: 0,
        }
    }

    /// Appends a method of `code_size` bytes and returns its start address.
    pub fn method(&mut self, code_size: u32, encoding: &MethodEncoding<'_>) -> usize {
        self.method_with_eh(code_size, encoding, &[])
    }

    /// As [`method`](Self::method), with EH clauses.
    pub fn method_with_eh(&mut self, code_size: u32, encoding: &MethodEncoding<'_>, clauses: &[EhClause]) -> usize {
        let gc_info_offset = self.gc_info.add_method(encoding);
        let eh_info_offset = if clauses.is_empty() {
            None
        } else {
            #[allow(clippy::cast_possible_truncation)]
            let offset = self.eh_info.len() as u32;
            self.eh_info.extend(encode_eh_clauses(clauses));
            Some(offset)
        };
        let start_offset = self.next_offset;
        self.methods.push(MethodEntry {
            start_offset,
            code_size,
            gc_info_offset,
            eh_info_offset,
        });
        // Keep methods apart so return addresses never alias a neighbour.
        self.next_offset = (start_offset + code_size).next_multiple_of(0x10);
        self.text.start + start_offset as usize
    }

    /// Sets the type table the EH clauses' type indices refer to.
    #[must_use]
    pub fn with_eh_types(mut self, types: Vec<usize>) -> Self {
        self.eh_type_table = types;
        self
    }

    #[must_use]
    pub fn descriptor(self) -> ModuleDescriptor {
        let mut desc = ModuleDescriptor::new(self.text)
            .with_gc_info(self.gc_info.finish())
            .with_eh_info(self.eh_info, self.eh_type_table);
        desc.methods = self.methods;
        desc
    }

    /// Registers the image with `runtime`.
    ///
    /// # Errors
    ///
    /// Fails as [`ModuleRegistry::register`](crate::module::ModuleRegistry::register) does.
    pub fn register(self, runtime: &Runtime) -> Result<Arc<Module>, RegistryError> {
        runtime.modules().register(self.descriptor())
    }
}

/// A block of stack memory to lay fake frames out in.
///
/// Must live on the walking thread's stack, since the walker rejects frames
/// outside the stack bounds. Words are addressed by index, lowest address
/// first, as a stack grows towards index 0.
#[derive(Debug)]
#[repr(C, align(16))]
pub struct SimStack<const N: usize> {
    words: [usize; N],
}

impl<const N: usize> Default for SimStack<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> SimStack<N> {
    #[must_use]
    pub const fn new() -> Self {
        Self { words: [0; N] }
    }

    /// Address of word `index`.
    #[must_use]
    pub fn addr(&self, index: usize) -> usize {
        assert!(index <= N, "index {index} past the simulated stack");
        self.words.as_ptr() as usize + index * POINTER_SIZE
    }

    /// Index of the word at `addr`.
    #[must_use]
    pub fn index_of(&self, addr: usize) -> usize {
        (addr - self.addr(0)) / POINTER_SIZE
    }

    pub fn set(&mut self, index: usize, value: usize) {
        assert!(index < N, "index {index} past the simulated stack");
        // Volatile: the walker and hijack engine hold raw addresses into
        // the block.
        // SAFETY: bounds-checked above.
        unsafe { self.words.as_mut_ptr().add(index).write_volatile(value) };
    }

    #[must_use]
    pub fn get(&self, index: usize) -> usize {
        assert!(index < N, "index {index} past the simulated stack");
        // SAFETY: bounds-checked above.
        unsafe { self.words.as_ptr().add(index).read_volatile() }
    }

    /// Moves `value` into the words starting at `index` and returns where
    /// it lives. For frames and records the walker finds by address.
    pub fn place<T>(&mut self, index: usize, value: T) -> *mut T {
        const { assert!(align_of::<T>() <= POINTER_SIZE) };
        let words = size_of::<T>().div_ceil(POINTER_SIZE);
        assert!(index + words <= N, "{words} words at {index} past the simulated stack");
        // SAFETY: in bounds, and word alignment suffices for `T`.
        unsafe {
            let slot = self.words.as_mut_ptr().add(index).cast::<T>();
            slot.write(value);
            slot
        }
    }
}
