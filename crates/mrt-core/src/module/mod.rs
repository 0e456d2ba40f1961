//! Compiled modules.
//!
//! A [`Module`] is one loaded compilation unit: its code region, the GC-info
//! and EH tables of every method in it, and the descriptors of its static and
//! thread-static reference fields. Modules are immutable once registered and
//! are shared through `Arc`.

pub(crate) mod code_manager;
mod registry;

use std::sync::Arc;

pub use code_manager::{
    enum_gc_refs, epilog_offset, frame_pointer, hijack_info, remap_hardware_fault_to_gc_safe_point,
    resolve_eh_type, return_value_kind, unwind_stack_frame, Unwound,
};
pub use registry::{DynamicThreadStatics, ModuleRegistry, RegistryError};

use crate::gcinfo::encode::GcInfoBlobs;
use crate::gcinfo::{DecodeError, EhEnum, InfoHeader};
use crate::regdisplay::POINTER_SIZE;
use crate::varint::Cursor;

/// Layout version a module descriptor must declare.
pub const MODULE_VERSION: u32 = 2;

/// An address range `[start, start + len)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Region {
    pub start: usize,
    pub len: usize,
}

impl Region {
    #[must_use]
    pub const fn new(start: usize, len: usize) -> Self {
        Self { start, len }
    }

    #[must_use]
    pub const fn end(&self) -> usize {
        self.start + self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub const fn contains(&self, addr: usize) -> bool {
        self.start <= addr && addr < self.end()
    }

    #[must_use]
    pub const fn overlaps(&self, other: &Self) -> bool {
        !self.is_empty() && !other.is_empty() && self.start < other.end() && other.start < self.end()
    }
}

/// One method of a module's method list, sorted by `start_offset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodEntry {
    /// Offset of the first instruction from the start of the text region.
    pub start_offset: u32,
    pub code_size: u32,
    /// Offset of the method's GC info within the GC-info blob.
    pub gc_info_offset: u32,
    /// Offset of the method's EH clauses within the EH-info blob.
    pub eh_info_offset: Option<u32>,
}

/// A run of contiguous reference cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcSeries {
    pub start_offset: u32,
    /// Bytes, a multiple of the pointer size.
    pub size: u32,
}

/// Reference layout of a static data block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StaticGcDesc {
    pub series: Vec<GcSeries>,
}

impl StaticGcDesc {
    #[must_use]
    pub fn new(series: Vec<GcSeries>) -> Self {
        Self { series }
    }

    /// Bytes of the block the series cover.
    #[must_use]
    pub fn extent(&self) -> usize {
        self.series
            .iter()
            .map(|s| s.start_offset as usize + s.size as usize)
            .max()
            .unwrap_or(0)
    }

    fn is_aligned(&self) -> bool {
        self.series
            .iter()
            .all(|s| s.start_offset as usize % POINTER_SIZE == 0 && s.size as usize % POINTER_SIZE == 0)
    }

    /// Reports every reference cell of the block at `base`.
    ///
    /// # Safety
    ///
    /// `base` must point at a block at least [`extent`](Self::extent) bytes long.
    pub unsafe fn enum_slots(&self, base: usize, report: &mut dyn FnMut(*mut usize)) {
        for series in &self.series {
            let first = (base + series.start_offset as usize) as *mut usize;
            for i in 0..series.size as usize / POINTER_SIZE {
                // SAFETY: within the block, guaranteed by the caller.
                report(unsafe { first.add(i) });
            }
        }
    }
}

/// Per-thread static block of a module.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ThreadStaticDesc {
    pub block_size: usize,
    pub gc: StaticGcDesc,
}

/// Named slots of a module's class-library function table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum ClasslibFunction {
    GetRuntimeException = 0,
    AppendExceptionStackFrame = 1,
    FailFast = 2,
    UnhandledExceptionHandler = 3,
    CheckStaticClassConstruction = 4,
    OnFirstChanceException = 5,
}

/// Everything the runtime reads out of a module image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleDescriptor {
    pub version: u32,
    pub text: Region,
    /// Bytes at the end of `text` holding runtime stubs rather than methods.
    pub stub_code_size: usize,
    pub rdata: Region,
    pub data: Region,
    pub iat: Region,
    pub methods: Vec<MethodEntry>,
    pub gc_info: Vec<u8>,
    pub unwind_info: Vec<u8>,
    pub callsite_strings: Vec<u8>,
    pub delta_table: [u8; 16],
    pub eh_info: Vec<u8>,
    /// Target type of each typed EH clause. An entry with its low bit set
    /// points one byte past an indirection cell.
    pub eh_type_table: Vec<usize>,
    /// Static reference fields, relative to the start of `data`.
    pub statics: Option<StaticGcDesc>,
    pub thread_statics: Option<ThreadStaticDesc>,
    pub classlib_functions: [usize; 6],
}

impl ModuleDescriptor {
    /// An empty descriptor for a module whose code lives in `text`.
    #[must_use]
    pub fn new(text: Region) -> Self {
        Self {
            version: MODULE_VERSION,
            text,
            stub_code_size: 0,
            rdata: Region::default(),
            data: Region::default(),
            iat: Region::default(),
            methods: Vec::new(),
            gc_info: Vec::new(),
            unwind_info: Vec::new(),
            callsite_strings: Vec::new(),
            delta_table: [0; 16],
            eh_info: Vec::new(),
            eh_type_table: Vec::new(),
            statics: None,
            thread_statics: None,
            classlib_functions: [0; 6],
        }
    }

    #[must_use]
    pub fn with_gc_info(mut self, blobs: GcInfoBlobs) -> Self {
        self.gc_info = blobs.gc_info;
        self.unwind_info = blobs.unwind_info;
        self.callsite_strings = blobs.callsite_strings;
        self.delta_table = blobs.delta_table;
        self
    }

    #[must_use]
    pub fn with_method(mut self, entry: MethodEntry) -> Self {
        self.methods.push(entry);
        self
    }

    #[must_use]
    pub fn with_eh_info(mut self, eh_info: Vec<u8>, type_table: Vec<usize>) -> Self {
        self.eh_info = eh_info;
        self.eh_type_table = type_table;
        self
    }

    #[must_use]
    pub fn with_statics(mut self, data: Region, desc: StaticGcDesc) -> Self {
        self.data = data;
        self.statics = Some(desc);
        self
    }

    #[must_use]
    pub fn with_thread_statics(mut self, desc: ThreadStaticDesc) -> Self {
        self.thread_statics = Some(desc);
        self
    }

    #[must_use]
    pub const fn with_stub_code_size(mut self, bytes: usize) -> Self {
        self.stub_code_size = bytes;
        self
    }

    #[must_use]
    pub const fn with_classlib_function(mut self, which: ClasslibFunction, address: usize) -> Self {
        self.classlib_functions[which as usize] = address;
        self
    }

    fn validate(&self) -> Result<(), RegistryError> {
        if self.version != MODULE_VERSION {
            return Err(RegistryError::VersionMismatch {
                expected: MODULE_VERSION,
                found: self.version,
            });
        }
        if self.text.is_empty() || self.stub_code_size > self.text.len {
            return Err(RegistryError::MalformedHeader("text region"));
        }
        let method_limit = self.text.len - self.stub_code_size;
        let mut prev_end = 0usize;
        for method in &self.methods {
            let start = method.start_offset as usize;
            let end = start + method.code_size as usize;
            if start < prev_end || end > method_limit || method.code_size == 0 {
                return Err(RegistryError::MalformedHeader("method list"));
            }
            if method.gc_info_offset as usize >= self.gc_info.len() {
                return Err(RegistryError::MalformedHeader("gc info offset"));
            }
            if method.eh_info_offset.is_some_and(|off| off as usize >= self.eh_info.len()) {
                return Err(RegistryError::MalformedHeader("eh info offset"));
            }
            prev_end = end;
        }
        if let Some(statics) = &self.statics {
            if !statics.is_aligned() || statics.extent() > self.data.len {
                return Err(RegistryError::MalformedHeader("static gc descriptor"));
            }
        }
        if let Some(thread_statics) = &self.thread_statics {
            if !thread_statics.gc.is_aligned() || thread_statics.gc.extent() > thread_statics.block_size {
                return Err(RegistryError::MalformedHeader("thread static gc descriptor"));
            }
        }
        Ok(())
    }
}

/// Identifier of a registered module, never reused within a registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleId(pub(crate) u32);

/// A registered module.
#[derive(Debug)]
pub struct Module {
    id: ModuleId,
    desc: ModuleDescriptor,
}

impl Module {
    pub(crate) fn new(id: ModuleId, desc: ModuleDescriptor) -> Result<Self, RegistryError> {
        desc.validate()?;
        Ok(Self { id, desc })
    }

    #[must_use]
    pub const fn id(&self) -> ModuleId {
        self.id
    }

    #[must_use]
    pub const fn descriptor(&self) -> &ModuleDescriptor {
        &self.desc
    }

    /// Whether `addr` lies in the text region, short of the stub area at its
    /// end.
    #[must_use]
    pub const fn contains_code_address(&self, addr: usize) -> bool {
        let text = &self.desc.text;
        text.start <= addr && addr < text.end() - self.desc.stub_code_size
    }

    /// Whether `addr` lies inside one of this module's methods. Padding
    /// between methods is text but not method code.
    #[must_use]
    pub fn contains_method_address(&self, addr: usize) -> bool {
        self.find_method_index(addr).is_some()
    }

    #[must_use]
    pub const fn contains_stub_address(&self, addr: usize) -> bool {
        let text = &self.desc.text;
        text.end() - self.desc.stub_code_size <= addr && addr < text.end()
    }

    #[must_use]
    pub const fn contains_data_address(&self, addr: usize) -> bool {
        self.desc.data.contains(addr)
    }

    #[must_use]
    pub const fn contains_rdata_address(&self, addr: usize) -> bool {
        self.desc.rdata.contains(addr)
    }

    /// Index of the method containing `addr`, and the offset of `addr` in it.
    #[must_use]
    pub fn find_method_index(&self, addr: usize) -> Option<(usize, u32)> {
        if !self.contains_code_address(addr) {
            return None;
        }
        let text_offset = u32::try_from(addr - self.desc.text.start).ok()?;
        let methods = &self.desc.methods;
        let index = methods
            .partition_point(|m| m.start_offset <= text_offset)
            .checked_sub(1)?;
        let method = &methods[index];
        let method_offset = text_offset - method.start_offset;
        (method_offset < method.code_size).then_some((index, method_offset))
    }

    /// Decodes the GC info of method `index` as seen from `method_offset`.
    ///
    /// # Errors
    ///
    /// Fails on malformed GC info.
    pub fn method_info(self: &Arc<Self>, index: usize, method_offset: u32) -> Result<MethodInfo, DecodeError> {
        let entry = self.desc.methods.get(index).ok_or(DecodeError::Truncated)?;
        let gc_info = &self.desc.gc_info;
        let mut cursor = Cursor::at(gc_info, entry.gc_info_offset as usize);

        let unwind_offset = cursor.read_unsigned()?;
        let header = if unwind_offset == 0 {
            let inline = gc_info.get(cursor.position()..).ok_or(DecodeError::Truncated)?;
            let (header, len) = InfoHeader::decode(inline, method_offset)?;
            cursor.set_position(cursor.position() + len);
            header
        } else {
            let shared = self
                .desc
                .unwind_info
                .get(unwind_offset as usize - 1..)
                .ok_or(DecodeError::Truncated)?;
            InfoHeader::decode(shared, method_offset)?.0
        };

        let epilog_table = cursor.position();
        if !header.is_epilog_at_end() {
            for _ in 0..header.epilog_count() {
                cursor.skip_unsigned()?;
                if header.has_varying_epilog_sizes() {
                    cursor.skip_unsigned()?;
                }
            }
        }

        Ok(MethodInfo {
            module: Arc::clone(self),
            index,
            header,
            epilog_table,
            stream: cursor.position(),
        })
    }

    /// Address registered for a class-library function, if any.
    #[must_use]
    pub const fn classlib_function(&self, which: ClasslibFunction) -> Option<usize> {
        match self.desc.classlib_functions[which as usize] {
            0 => None,
            address => Some(address),
        }
    }

    /// Reports the static reference cells of this module.
    ///
    /// # Safety
    ///
    /// The data region of the descriptor must be mapped.
    pub unsafe fn enum_static_gc_refs(&self, report: &mut dyn FnMut(*mut usize)) {
        if let Some(statics) = &self.desc.statics {
            // SAFETY: validated against the data region, which the caller vouches for.
            unsafe { statics.enum_slots(self.desc.data.start, report) };
        }
    }

    #[must_use]
    pub const fn thread_statics(&self) -> Option<&ThreadStaticDesc> {
        self.desc.thread_statics.as_ref()
    }
}

/// One method, decoded for a particular code offset.
///
/// When the offset lies in a funclet, [`header`](Self::header) is the
/// funclet's header.
#[derive(Debug, Clone)]
pub struct MethodInfo {
    module: Arc<Module>,
    index: usize,
    header: InfoHeader,
    epilog_table: usize,
    stream: usize,
}

impl MethodInfo {
    #[must_use]
    pub const fn module(&self) -> &Arc<Module> {
        &self.module
    }

    #[must_use]
    pub const fn index(&self) -> usize {
        self.index
    }

    fn entry(&self) -> &MethodEntry {
        &self.module.desc.methods[self.index]
    }

    #[must_use]
    pub fn code_start(&self) -> usize {
        self.module.desc.text.start + self.entry().start_offset as usize
    }

    #[must_use]
    pub fn code_size(&self) -> u32 {
        self.entry().code_size
    }

    #[must_use]
    pub const fn header(&self) -> &InfoHeader {
        &self.header
    }

    #[must_use]
    pub const fn is_funclet(&self) -> bool {
        self.header.is_funclet()
    }

    /// Whether the two infos describe the same method, funclets included.
    #[must_use]
    pub fn is_same_method(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.module, &other.module) && self.index == other.index
    }

    /// Re-decodes this method's header as seen from `method_offset`.
    ///
    /// # Errors
    ///
    /// Fails on malformed GC info.
    pub fn at_offset(&self, method_offset: u32) -> Result<Self, DecodeError> {
        self.module.method_info(self.index, method_offset)
    }

    pub(crate) fn callsite_stream(&self) -> &[u8] {
        &self.module.desc.gc_info[self.stream..]
    }

    pub(crate) fn epilog_table(&self) -> &[u8] {
        &self.module.desc.gc_info[self.epilog_table..]
    }

    /// The method's EH clauses; empty when it has none.
    ///
    /// # Errors
    ///
    /// Fails if the clause count is truncated.
    pub fn eh_clauses(&self) -> Result<EhEnum<'_>, DecodeError> {
        match self.entry().eh_info_offset {
            None => Ok(EhEnum::empty()),
            Some(offset) => EhEnum::new(&self.module.desc.eh_info[offset as usize..]),
        }
    }

    #[must_use]
    pub fn has_eh_info(&self) -> bool {
        self.entry().eh_info_offset.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gcinfo::encode::{GcInfoBuilder, MethodEncoding};
    use crate::gcinfo::{Funclet, ReturnKind};

    fn module_with(methods: &[(u32, u32, MethodEncoding<'_>)]) -> Arc<Module> {
        let mut builder = GcInfoBuilder::new();
        let mut desc = ModuleDescriptor::new(Region::new(0x10_000, 0x1000)).with_stub_code_size(0x100);
        for (start, size, encoding) in methods {
            let gc_info_offset = builder.add_method(encoding);
            desc = desc.with_method(MethodEntry {
                start_offset: *start,
                code_size: *size,
                gc_info_offset,
                eh_info_offset: None,
            });
        }
        Arc::new(Module::new(ModuleId(0), desc.with_gc_info(builder.finish())).unwrap())
    }

    #[test]
    fn test_region_bounds() {
        let r = Region::new(0x100, 0x10);
        assert!(r.contains(0x100));
        assert!(!r.contains(0x110));
        assert!(r.overlaps(&Region::new(0x10F, 1)));
        assert!(!r.overlaps(&Region::new(0x110, 8)));
        assert!(!r.overlaps(&Region::new(0x100, 0)));
    }

    #[test]
    fn test_find_method_index() {
        let enc = MethodEncoding::default();
        let module = module_with(&[(0, 0x40, enc), (0x80, 0x20, enc)]);
        assert_eq!(module.find_method_index(0x10_010), Some((0, 0x10)));
        assert_eq!(module.find_method_index(0x10_080), Some((1, 0)));
        // Padding between methods.
        assert_eq!(module.find_method_index(0x10_050), None);
        assert!(module.contains_code_address(0x10_050));
        assert!(!module.contains_method_address(0x10_050));
        assert!(module.contains_method_address(0x10_080));
        // Stub area and outside.
        assert_eq!(module.find_method_index(0x10_F00), None);
        assert!(module.contains_stub_address(0x10_F00));
        assert!(!module.contains_code_address(0x10_F00));
        assert_eq!(module.find_method_index(0x20_000), None);
    }

    #[test]
    fn test_method_info_selects_funclet_header() {
        let main = InfoHeader::new().with_prolog_size(4).with_return_kind(ReturnKind::Object);
        let funclets = [Funclet {
            start: 0x30,
            header: InfoHeader::new().with_prolog_size(2),
        }];
        let enc = MethodEncoding {
            header: main,
            funclets: &funclets,
            ..MethodEncoding::default()
        };
        let module = module_with(&[(0, 0x40, enc)]);

        let body = module.method_info(0, 0x10).unwrap();
        assert!(!body.is_funclet());
        assert_eq!(body.header().return_kind(), ReturnKind::Object);

        let funclet = body.at_offset(0x32).unwrap();
        assert!(funclet.is_funclet());
        assert_eq!(funclet.header().funclet_offset(), 0x30);
        assert_eq!(funclet.header().prolog_size(), 2);
        assert!(funclet.is_same_method(&body));
    }

    #[test]
    fn test_descriptor_validation() {
        let text = Region::new(0x1000, 0x100);
        let mut desc = ModuleDescriptor::new(text);
        desc.version = 1;
        assert_eq!(
            Module::new(ModuleId(0), desc).unwrap_err(),
            RegistryError::VersionMismatch {
                expected: MODULE_VERSION,
                found: 1
            }
        );

        let desc = ModuleDescriptor::new(text).with_method(MethodEntry {
            start_offset: 0,
            code_size: 0x10,
            gc_info_offset: 0,
            eh_info_offset: None,
        });
        assert_eq!(
            Module::new(ModuleId(0), desc).unwrap_err(),
            RegistryError::MalformedHeader("gc info offset")
        );

        let desc = ModuleDescriptor::new(text).with_statics(
            Region::new(0x8000, 8),
            StaticGcDesc::new(vec![GcSeries { start_offset: 0, size: 16 }]),
        );
        assert!(Module::new(ModuleId(0), desc).is_err());
    }

    #[test]
    fn test_static_slots() {
        let mut block = [0usize; 6];
        let base = block.as_mut_ptr() as usize;
        let p = POINTER_SIZE as u32;
        let desc = StaticGcDesc::new(vec![
            GcSeries { start_offset: p, size: 2 * p },
            GcSeries { start_offset: 4 * p, size: p },
        ]);
        assert_eq!(desc.extent(), 5 * POINTER_SIZE);
        let mut seen = Vec::new();
        unsafe { desc.enum_slots(base, &mut |slot| seen.push((slot as usize - base) / POINTER_SIZE)) };
        assert_eq!(seen, vec![1, 2, 4]);
    }
}
