//! Encoders for the GC-info, call-site and EH formats.
//!
//! The runtime only ever decodes these formats; the encoders exist so that
//! tests, benchmarks and tooling can produce well-formed method images
//! without a compiler in the loop.

use std::collections::HashMap;

use super::{EhClause, EhClauseKind, Funclet, GcFlags, InfoHeader};
use crate::regdisplay::{CalleeSavedReg, ScratchReg, POINTER_SIZE};
use crate::varint;

/// Delta table used when none is given: deltas 1 through 16.
pub const DEFAULT_DELTA_TABLE: [u8; 16] = [1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16];

const MAX_BIG_DELTA: u32 = 0x7E;
const FORWARDER: u8 = 0x80;
const STREAM_END: u8 = 0xFF;
const LAST_DESCRIPTOR: u8 = 0x20;
const MAX_LOCAL_SLOT: u32 = 19;
const MAX_MASKED_SLOTS: usize = 32;

/// A slot holding a live reference at a call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveSlot {
    Register(CalleeSavedReg, GcFlags),
    /// Byte offset from SP (or FP when `fp_based`).
    Stack { fp_based: bool, offset: i32, flags: GcFlags },
    /// Frame-relative local slot #n; only for main method bodies.
    Local(u32),
    Scratch(ScratchReg, GcFlags),
}

/// Builds one method's call-site stream.
#[derive(Debug, Clone, Default)]
pub struct CallsiteEncoder {
    sites: Vec<(u32, Vec<u8>)>,
    last_offset: u32,
}

impl CallsiteEncoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the live slots at `offset`. A call site with nothing live is
    /// not recorded.
    ///
    /// # Panics
    ///
    /// Panics if `offset` does not increase strictly from the previous call
    /// site (offset 0 is never a call site), or if a local slot number is
    /// too large to encode.
    pub fn add_callsite(&mut self, offset: u32, live: &[LiveSlot]) {
        assert!(
            offset > self.last_offset,
            "call sites must be added in increasing offset order"
        );
        self.last_offset = offset;
        if !live.is_empty() {
            self.sites.push((offset, encode_callsite_string(live)));
        }
    }

    /// Returns `(stream, string blob, delta table)` for a single method.
    #[must_use]
    pub fn finish_parts(&self) -> (Vec<u8>, Vec<u8>, [u8; 16]) {
        let mut stream = Vec::new();
        let mut pool = StringPool::default();
        self.write_stream(&mut stream, &mut pool, &DEFAULT_DELTA_TABLE);
        (stream, pool.bytes, DEFAULT_DELTA_TABLE)
    }

    fn write_stream(&self, out: &mut Vec<u8>, pool: &mut StringPool, table: &[u8; 16]) {
        let mut prev = 0u32;
        for (offset, string) in &self.sites {
            let string_offset = pool.intern(string);
            write_entry(out, offset - prev, string_offset, table);
            prev = *offset;
        }
        out.push(STREAM_END);
    }
}

fn write_entry(out: &mut Vec<u8>, delta: u32, string_offset: u32, table: &[u8; 16]) {
    let mut remaining = delta;
    loop {
        if string_offset < 8 {
            let shortcut = table
                .iter()
                .position(|&d| d != 0 && u32::from(d) == remaining);
            if let Some(index) = shortcut {
                #[allow(clippy::cast_possible_truncation)]
                out.push(((index as u8) << 3) | string_offset as u8);
                return;
            }
        }
        if remaining <= MAX_BIG_DELTA {
            #[allow(clippy::cast_possible_truncation)]
            out.push(FORWARDER | remaining as u8);
            varint::write_unsigned(out, string_offset);
            return;
        }
        out.push(FORWARDER);
        varint::write_unsigned(out, remaining - MAX_BIG_DELTA);
        remaining = MAX_BIG_DELTA;
    }
}

#[derive(Debug, Default)]
struct StringPool {
    bytes: Vec<u8>,
    offsets: HashMap<Vec<u8>, u32>,
}

impl StringPool {
    fn intern(&mut self, string: &[u8]) -> u32 {
        if let Some(&offset) = self.offsets.get(string) {
            return offset;
        }
        #[allow(clippy::cast_possible_truncation)]
        let offset = self.bytes.len() as u32;
        self.bytes.extend_from_slice(string);
        self.offsets.insert(string.to_vec(), offset);
        offset
    }
}

fn attribute_bits(flags: GcFlags) -> u8 {
    let mut bits = 0;
    if flags.contains(GcFlags::INTERIOR) {
        bits |= 0x10;
    }
    if flags.contains(GcFlags::PINNED) {
        bits |= 0x08;
    }
    bits
}

fn encode_callsite_string(live: &[LiveSlot]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut last_start = 0;
    let mut begin = |out: &mut Vec<u8>| {
        last_start = out.len();
    };

    let register_set = live.iter().fold(0u8, |set, slot| match slot {
        LiveSlot::Register(reg, flags) if flags.is_empty() && (*reg as u8) <= CalleeSavedReg::R12 as u8 => {
            set | reg.mask()
        }
        _ => set,
    });
    if register_set != 0 {
        begin(&mut out);
        out.push(register_set);
    }

    for slot in live {
        if let LiveSlot::Register(reg, flags) = slot {
            if register_set & reg.mask() != 0 && flags.is_empty() {
                continue;
            }
            begin(&mut out);
            out.push(0x40 | attribute_bits(*flags) | *reg as u8);
        }
    }

    let mut packed_locals = 0u8;
    let mut wide_locals = Vec::new();
    for slot in live {
        if let LiveSlot::Local(n) = *slot {
            assert!(n <= MAX_LOCAL_SLOT, "local slot #{n} cannot be encoded");
            if n < 4 {
                packed_locals |= 1 << n;
            } else {
                wide_locals.push(n);
            }
        }
    }
    if packed_locals != 0 {
        begin(&mut out);
        out.push(0x90 | packed_locals);
    }
    for n in wide_locals {
        begin(&mut out);
        #[allow(clippy::cast_possible_truncation)]
        out.push(0x80 | (n - 4) as u8);
    }

    for group in stack_groups(live) {
        begin(&mut out);
        let mut b = 0xC0 | attribute_bits(group.flags);
        if group.fp_based {
            b |= 0x04;
        }
        if group.negative {
            b |= 0x02;
        }
        // SP-relative negative slots always carry a mask so they cannot be
        // mistaken for the scratch-register descriptor.
        let with_mask = group.mask != 0 || (group.negative && !group.fp_based);
        if with_mask {
            b |= 0x01;
        }
        out.push(b);
        varint::write_unsigned(&mut out, group.first);
        if with_mask {
            varint::write_unsigned(&mut out, group.mask);
        }
    }

    let (mut scratch_live, mut interior, mut pinned) = (0u8, 0u8, 0u8);
    for slot in live {
        if let LiveSlot::Scratch(reg, flags) = slot {
            let bit = 1 << *reg as u8;
            scratch_live |= bit;
            if flags.contains(GcFlags::INTERIOR) {
                interior |= bit;
            }
            if flags.contains(GcFlags::PINNED) {
                pinned |= bit;
            }
        }
    }
    if scratch_live != 0 {
        begin(&mut out);
        let mut b = 0xC2;
        if interior != 0 {
            b |= 0x10;
        }
        if pinned != 0 {
            b |= 0x08;
        }
        out.push(b);
        out.push(scratch_live);
        if interior != 0 {
            out.push(interior);
        }
        if pinned != 0 {
            out.push(pinned);
        }
    }

    if !out.is_empty() {
        out[last_start] |= LAST_DESCRIPTOR;
    }
    out
}

struct StackGroup {
    fp_based: bool,
    negative: bool,
    flags: GcFlags,
    first: u32,
    mask: u32,
}

fn stack_groups(live: &[LiveSlot]) -> Vec<StackGroup> {
    let mut slots: Vec<(bool, bool, u32, u32)> = live
        .iter()
        .filter_map(|slot| match *slot {
            LiveSlot::Stack {
                fp_based,
                offset,
                flags,
            } => Some((fp_based, offset < 0, flags.bits(), offset.unsigned_abs())),
            _ => None,
        })
        .collect();
    slots.sort_unstable();
    slots.dedup();

    let mut groups: Vec<StackGroup> = Vec::new();
    for (fp_based, negative, flag_bits, offset) in slots {
        let flags = GcFlags::from_bits_retain(flag_bits);
        if let Some(group) = groups.last_mut() {
            let same_kind = group.fp_based == fp_based && group.negative == negative && group.flags == flags;
            let distance = offset - group.first;
            #[allow(clippy::cast_possible_truncation)]
            let step = POINTER_SIZE as u32;
            if same_kind && distance % step == 0 && (distance / step) as usize <= MAX_MASKED_SLOTS {
                group.mask |= 1 << (distance / step - 1);
                continue;
            }
        }
        groups.push(StackGroup {
            fp_based,
            negative,
            flags,
            first: offset,
            mask: 0,
        });
    }
    groups
}

/// Start offset and size of one epilog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Epilog {
    pub start: u32,
    pub size: u32,
}

/// Everything needed to encode one method's GC info.
#[derive(Debug, Clone, Copy, Default)]
pub struct MethodEncoding<'a> {
    pub header: InfoHeader,
    /// Funclets sorted by start offset.
    pub funclets: &'a [Funclet],
    /// Epilogs sorted by start offset. Ignored when the header places its
    /// single epilog at the end of the method.
    pub epilogs: &'a [Epilog],
    pub callsites: Option<&'a CallsiteEncoder>,
    /// Store the header in the GC-info blob itself instead of sharing it
    /// through the unwind blob.
    pub inline_header: bool,
}

/// The GC-related blobs of one module.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcInfoBlobs {
    pub gc_info: Vec<u8>,
    pub unwind_info: Vec<u8>,
    pub callsite_strings: Vec<u8>,
    pub delta_table: [u8; 16],
}

/// Accumulates the GC info of every method of a module.
///
/// Identical headers stored in the unwind blob are shared, and identical
/// call-site strings are stored once.
#[derive(Debug)]
pub struct GcInfoBuilder {
    gc_info: Vec<u8>,
    unwind_info: Vec<u8>,
    headers: HashMap<Vec<u8>, u32>,
    strings: StringPool,
    delta_table: [u8; 16],
}

impl Default for GcInfoBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl GcInfoBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::with_delta_table(DEFAULT_DELTA_TABLE)
    }

    #[must_use]
    pub fn with_delta_table(delta_table: [u8; 16]) -> Self {
        Self {
            gc_info: Vec::new(),
            unwind_info: Vec::new(),
            headers: HashMap::new(),
            strings: StringPool::default(),
            delta_table,
        }
    }

    /// Appends one method and returns its offset in the GC-info blob.
    #[allow(clippy::cast_possible_truncation)]
    pub fn add_method(&mut self, method: &MethodEncoding<'_>) -> u32 {
        let gc_info_offset = self.gc_info.len() as u32;

        let mut header_bytes = Vec::new();
        method.header.encode(&mut header_bytes, method.funclets);
        if method.inline_header {
            varint::write_unsigned(&mut self.gc_info, 0);
            self.gc_info.extend_from_slice(&header_bytes);
        } else {
            let unwind_offset = match self.headers.get(&header_bytes) {
                Some(&offset) => offset,
                None => {
                    let offset = self.unwind_info.len() as u32;
                    self.unwind_info.extend_from_slice(&header_bytes);
                    self.headers.insert(header_bytes, offset);
                    offset
                }
            };
            varint::write_unsigned(&mut self.gc_info, unwind_offset + 1);
        }

        if !method.header.is_epilog_at_end() {
            let varying = method.header.has_varying_epilog_sizes();
            let mut prev = 0;
            for epilog in method.epilogs {
                varint::write_unsigned(&mut self.gc_info, epilog.start - prev);
                if varying {
                    varint::write_unsigned(&mut self.gc_info, epilog.size);
                }
                prev = epilog.start;
            }
        }

        match method.callsites {
            Some(callsites) => callsites.write_stream(&mut self.gc_info, &mut self.strings, &self.delta_table),
            None => self.gc_info.push(STREAM_END),
        }
        gc_info_offset
    }

    #[must_use]
    pub fn finish(self) -> GcInfoBlobs {
        GcInfoBlobs {
            gc_info: self.gc_info,
            unwind_info: self.unwind_info,
            callsite_strings: self.strings.bytes,
            delta_table: self.delta_table,
        }
    }
}

/// Encodes an EH clause table. Nested clauses must precede the clauses that
/// enclose them.
#[must_use]
pub fn encode_eh_clauses(clauses: &[EhClause]) -> Vec<u8> {
    let mut out = Vec::new();
    #[allow(clippy::cast_possible_truncation)]
    varint::write_unsigned(&mut out, clauses.len() as u32);
    for clause in clauses {
        varint::write_unsigned(&mut out, clause.try_start);
        let length = clause.try_end - clause.try_start;
        varint::write_unsigned(&mut out, (length << 2) | clause.kind as u32);
        match clause.kind {
            EhClauseKind::Typed => {
                varint::write_unsigned(&mut out, clause.handler_offset);
                varint::write_unsigned(&mut out, clause.type_index);
            }
            EhClauseKind::Fault => {
                varint::write_unsigned(&mut out, clause.handler_offset);
            }
            EhClauseKind::Filter => {
                varint::write_unsigned(&mut out, clause.handler_offset);
                varint::write_unsigned(&mut out, clause.filter_offset);
            }
            EhClauseKind::FailFast => {}
        }
    }
    out
}
