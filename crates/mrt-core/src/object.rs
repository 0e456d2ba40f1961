//! The parts of the managed object layout the core reads.
//!
//! An object reference points at a word holding its [`TypeDescriptor`].
//! Arrays follow it with a 32-bit element count and then the elements. The
//! word before the type pointer is the object header, which belongs to the
//! allocation of the previous object; every base size counts it.

use bitflags::bitflags;

use crate::module::GcSeries;
use crate::regdisplay::POINTER_SIZE;

/// Offset of the element count in an array.
pub const ARRAY_LENGTH_OFFSET: usize = POINTER_SIZE;

/// Base size of an array: object header, type pointer, padded length.
pub const ARRAY_BASE_SIZE: usize = 3 * POINTER_SIZE;

/// Smallest object the allocator hands out.
pub const MIN_OBJECT_SIZE: usize = 3 * POINTER_SIZE;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct TypeFlags: u32 {
        const HAS_REFERENCE_FIELDS = 0x1;
        const HAS_FINALIZER = 0x2;
        const IS_ARRAY = 0x4;
        /// Arrays, pointers and byrefs: the element type is meaningful.
        const IS_PARAMETERIZED_TYPE = 0x8;
        const REQUIRES_ALIGN8 = 0x10;
        const IS_VALUE_TYPE = 0x20;
        const IS_NULLABLE = 0x40;
    }
}

/// Element-type tag of a type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum ElementType {
    #[default]
    Unknown,
    Void,
    Boolean,
    Char,
    Int8,
    UInt8,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    IntPtr,
    UIntPtr,
    Single,
    Double,
    ValueType,
    Class,
    Interface,
    Array,
    SzArray,
    ByRef,
    Pointer,
}

/// Where an object's reference fields are.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum GcDesc {
    #[default]
    None,
    /// Series at fixed offsets from the object reference.
    Fixed(Vec<GcSeries>),
    /// Series relative to the start of each array element.
    Repeating(Vec<GcSeries>),
}

/// Runtime type descriptor of a managed object.
#[derive(Debug, Clone, Default)]
pub struct TypeDescriptor {
    /// Bytes of a non-array instance, or of an empty array, header included.
    pub base_size: u32,
    /// Bytes per array element; 0 for non-arrays.
    pub component_size: u16,
    pub element_type: ElementType,
    pub flags: TypeFlags,
    /// The element type of a parameterized type.
    pub related_parameter_type: Option<&'static TypeDescriptor>,
    pub gc_desc: GcDesc,
}

impl TypeDescriptor {
    /// A plain class of `base_size` bytes with references at `series`.
    #[must_use]
    pub fn class(base_size: u32, series: Vec<GcSeries>) -> Self {
        let mut flags = TypeFlags::empty();
        if !series.is_empty() {
            flags |= TypeFlags::HAS_REFERENCE_FIELDS;
        }
        Self {
            base_size,
            element_type: ElementType::Class,
            flags,
            gc_desc: if series.is_empty() { GcDesc::None } else { GcDesc::Fixed(series) },
            ..Self::default()
        }
    }

    /// A single-dimensional array of `element`.
    #[must_use]
    pub fn sz_array(element: &'static TypeDescriptor) -> Self {
        let reference_elements = !element.flags.contains(TypeFlags::IS_VALUE_TYPE);
        let (component_size, series) = if reference_elements {
            (
                POINTER_SIZE,
                vec![GcSeries {
                    start_offset: 0,
                    size: POINTER_SIZE as u32,
                }],
            )
        } else {
            let payload = element.base_size as usize - 2 * POINTER_SIZE;
            let series = match &element.gc_desc {
                // Value-type series are relative to the boxed form.
                GcDesc::Fixed(series) => series
                    .iter()
                    .map(|s| GcSeries {
                        start_offset: s.start_offset - POINTER_SIZE as u32,
                        size: s.size,
                    })
                    .collect(),
                GcDesc::None | GcDesc::Repeating(_) => Vec::new(),
            };
            (payload, series)
        };
        let mut flags = TypeFlags::IS_ARRAY | TypeFlags::IS_PARAMETERIZED_TYPE;
        if !series.is_empty() {
            flags |= TypeFlags::HAS_REFERENCE_FIELDS;
        }
        #[allow(clippy::cast_possible_truncation)]
        Self {
            base_size: ARRAY_BASE_SIZE as u32,
            component_size: component_size as u16,
            element_type: ElementType::SzArray,
            flags,
            related_parameter_type: Some(element),
            gc_desc: if series.is_empty() { GcDesc::None } else { GcDesc::Repeating(series) },
        }
    }

    #[must_use]
    pub const fn with_flags(mut self, flags: TypeFlags) -> Self {
        self.flags = self.flags.union(flags);
        self
    }

    #[must_use]
    pub const fn is_array(&self) -> bool {
        self.flags.contains(TypeFlags::IS_ARRAY)
    }

    #[must_use]
    pub const fn has_reference_fields(&self) -> bool {
        self.flags.contains(TypeFlags::HAS_REFERENCE_FIELDS)
    }

    #[must_use]
    pub const fn has_finalizer(&self) -> bool {
        self.flags.contains(TypeFlags::HAS_FINALIZER)
    }

    #[must_use]
    pub const fn requires_align8(&self) -> bool {
        self.flags.contains(TypeFlags::REQUIRES_ALIGN8)
    }

    /// Allocation size of an instance with `element_count` elements, or
    /// `None` on overflow.
    #[must_use]
    pub fn instance_size(&self, element_count: usize) -> Option<usize> {
        let base = self.base_size as usize;
        if !self.is_array() {
            return Some(base);
        }
        let payload = element_count.checked_mul(self.component_size as usize)?;
        base.checked_add(payload)?.checked_next_multiple_of(POINTER_SIZE)
    }
}

/// Reads the type of the object at `object`.
///
/// # Safety
///
/// `object` must be a live, initialized object reference.
#[must_use]
pub unsafe fn type_of(object: usize) -> &'static TypeDescriptor {
    // SAFETY: guaranteed by the caller; the type word of an initialized
    // object always holds a descriptor that outlives it.
    unsafe { &*((object as *const usize).read() as *const TypeDescriptor) }
}

/// Element count of the array at `object`.
///
/// # Safety
///
/// `object` must be a live array reference.
#[must_use]
pub unsafe fn array_length(object: usize) -> usize {
    // SAFETY: guaranteed by the caller.
    unsafe { ((object + ARRAY_LENGTH_OFFSET) as *const u32).read() as usize }
}

/// Writes the header words of a freshly allocated object.
///
/// # Safety
///
/// `object` must point at writable memory of the instance size.
pub(crate) unsafe fn init_object(object: usize, ty: &'static TypeDescriptor, element_count: usize) {
    // SAFETY: guaranteed by the caller.
    unsafe {
        (object as *mut usize).write(std::ptr::from_ref(ty) as usize);
        if ty.is_array() {
            #[allow(clippy::cast_possible_truncation)]
            ((object + ARRAY_LENGTH_OFFSET) as *mut u32).write(element_count as u32);
        }
    }
}

/// Size in bytes of the object at `object`.
///
/// # Safety
///
/// As for [`type_of`].
#[must_use]
pub unsafe fn object_size(object: usize) -> usize {
    // SAFETY: forwarded from the caller.
    let ty = unsafe { type_of(object) };
    let count = if ty.is_array() {
        // SAFETY: forwarded from the caller.
        unsafe { array_length(object) }
    } else {
        0
    };
    ty.instance_size(count).unwrap_or(usize::MAX)
}

/// Reports every reference field of the object at `object`.
///
/// # Safety
///
/// As for [`type_of`].
pub unsafe fn enum_object_refs(object: usize, report: &mut dyn FnMut(*mut usize)) {
    // SAFETY: forwarded from the caller.
    let ty = unsafe { type_of(object) };
    if !ty.has_reference_fields() {
        return;
    }
    let report_series = |base: usize, series: &[GcSeries], report: &mut dyn FnMut(*mut usize)| {
        for s in series {
            let first = base + s.start_offset as usize;
            for i in 0..s.size as usize / POINTER_SIZE {
                report((first + i * POINTER_SIZE) as *mut usize);
            }
        }
    };
    match &ty.gc_desc {
        GcDesc::None => {}
        GcDesc::Fixed(series) => report_series(object, series, report),
        GcDesc::Repeating(series) => {
            // SAFETY: repeating descriptors belong to arrays.
            let count = unsafe { array_length(object) };
            let first = object + ty.base_size as usize - POINTER_SIZE;
            for i in 0..count {
                report_series(first + i * ty.component_size as usize, series, report);
            }
        }
    }
}
