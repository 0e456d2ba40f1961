//! Variable-length unsigned integer codec used by GC-info and EH tables.
//!
//! The number of trailing one bits in the first byte gives the encoded length:
//!
//! | low bits | bytes | payload bits |
//! |----------|-------|--------------|
//! | `xxx0`   | 1     | 7            |
//! | `xx01`   | 2     | 14           |
//! | `x011`   | 3     | 21           |
//! | `0111`   | 4     | 28           |
//! | `1111`   | 5     | 32 (in the next four bytes) |

/// `(length, shift)` indexed by the low nibble of the first byte.
const LOOKUP: [(u8, u8); 16] = [
    (1, 1), // 0000
    (2, 2), // 0001
    (1, 1), // 0010
    (3, 3), // 0011
    (1, 1), // 0100
    (2, 2), // 0101
    (1, 1), // 0110
    (4, 4), // 0111
    (1, 1), // 1000
    (2, 2), // 1001
    (1, 1), // 1010
    (3, 3), // 1011
    (1, 1), // 1100
    (2, 2), // 1101
    (1, 1), // 1110
    (5, 0), // 1111
];

/// Largest encoded length of a 32-bit value.
pub const MAX_ENCODED_LEN: usize = 5;

/// Error returned when a buffer ends in the middle of an encoded value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Truncated;

impl std::fmt::Display for Truncated {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("truncated variable-length integer")
    }
}

impl std::error::Error for Truncated {}

/// Number of bytes needed to encode `value`.
#[must_use]
pub const fn encoded_len(value: u32) -> usize {
    if value < 1 << 7 {
        1
    } else if value < 1 << 14 {
        2
    } else if value < 1 << 21 {
        3
    } else if value < 1 << 28 {
        4
    } else {
        5
    }
}

/// Appends the encoding of `value` to `dest` and returns the number of bytes written.
pub fn write_unsigned(dest: &mut Vec<u8>, value: u32) -> usize {
    let len = encoded_len(value);
    match len {
        1 => dest.push((value << 1) as u8),
        2 => dest.extend_from_slice(&((value << 2) | 0x1).to_le_bytes()[..2]),
        3 => dest.extend_from_slice(&((value << 3) | 0x3).to_le_bytes()[..3]),
        4 => dest.extend_from_slice(&((value << 4) | 0x7).to_le_bytes()),
        _ => {
            dest.push(0x0F);
            dest.extend_from_slice(&value.to_le_bytes());
        }
    }
    len
}

/// Forward-only reader over an encoded byte stream.
///
/// GC-info lives inside module images, so the cursor works on a borrowed slice
/// and never allocates.
#[derive(Debug, Clone, Copy)]
pub struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    #[must_use]
    pub const fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    #[must_use]
    pub const fn at(bytes: &'a [u8], pos: usize) -> Self {
        Self { bytes, pos }
    }

    #[must_use]
    pub const fn position(&self) -> usize {
        self.pos
    }

    #[must_use]
    pub const fn bytes(&self) -> &'a [u8] {
        self.bytes
    }

    pub fn set_position(&mut self, pos: usize) {
        self.pos = pos;
    }

    /// Next raw byte.
    ///
    /// # Errors
    ///
    /// Returns [`Truncated`] at the end of the buffer.
    pub fn read_u8(&mut self) -> Result<u8, Truncated> {
        let b = *self.bytes.get(self.pos).ok_or(Truncated)?;
        self.pos += 1;
        Ok(b)
    }

    /// Next raw byte without advancing.
    ///
    /// # Errors
    ///
    /// Returns [`Truncated`] at the end of the buffer.
    pub fn peek_u8(&self) -> Result<u8, Truncated> {
        self.bytes.get(self.pos).copied().ok_or(Truncated)
    }

    /// Decodes one value and advances past it.
    ///
    /// # Errors
    ///
    /// Returns [`Truncated`] if the encoding runs past the buffer.
    pub fn read_unsigned(&mut self) -> Result<u32, Truncated> {
        let first = self.peek_u8()?;
        let (len, shift) = LOOKUP[usize::from(first & 0xF)];
        let len = usize::from(len);
        let end = self.pos + len;
        let raw = self.bytes.get(self.pos..end).ok_or(Truncated)?;
        self.pos = end;

        if len == MAX_ENCODED_LEN {
            return Ok(u32::from_le_bytes([raw[1], raw[2], raw[3], raw[4]]));
        }

        let mut buf = [0u8; 4];
        buf[..len].copy_from_slice(raw);
        Ok(u32::from_le_bytes(buf) >> shift)
    }

    /// Skips one value and returns its length negated.
    ///
    /// # Errors
    ///
    /// Returns [`Truncated`] if the encoding runs past the buffer.
    pub fn skip_unsigned(&mut self) -> Result<isize, Truncated> {
        let first = self.peek_u8()?;
        let len = usize::from(LOOKUP[usize::from(first & 0xF)].0);
        if self.pos + len > self.bytes.len() {
            return Err(Truncated);
        }
        self.pos += len;
        #[allow(clippy::cast_possible_wrap)]
        Ok(-(len as isize))
    }
}
