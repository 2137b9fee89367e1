//! Variable-length encoding for unsigned integers.
//!
//! Lengths and counts are framed as LEB128-style varints: 7 data bits per
//! byte plus a continuation bit. Fixed-width fields (identifiers, hashes)
//! use big-endian encoding instead; varints are reserved for values whose
//! typical magnitude is small (collection lengths, payload sizes).

use crate::Error;
use bytes::{Buf, BufMut};

const DATA_BITS: u32 = 7;
const DATA_MASK: u8 = 0x7F;
const CONTINUATION: u8 = 0x80;

/// Maximum number of bytes a `u64` varint can occupy.
pub const MAX_VARINT_LEN_U64: usize = 10;

/// Writes `value` as a varint.
pub fn write(value: u64, buf: &mut impl BufMut) {
    let mut v = value;
    loop {
        let byte = (v as u8) & DATA_MASK;
        v >>= DATA_BITS;
        if v == 0 {
            buf.put_u8(byte);
            return;
        }
        buf.put_u8(byte | CONTINUATION);
    }
}

/// Returns the encoded size of `value` as a varint.
pub const fn size(value: u64) -> usize {
    let bits = 64 - (value | 1).leading_zeros();
    bits.div_ceil(DATA_BITS) as usize
}

/// Reads a varint, rejecting non-canonical and overflowing encodings.
pub fn read(buf: &mut impl Buf) -> Result<u64, Error> {
    let mut value: u64 = 0;
    for i in 0..MAX_VARINT_LEN_U64 {
        if !buf.has_remaining() {
            return Err(Error::EndOfBuffer);
        }
        let byte = buf.get_u8();
        let data = (byte & DATA_MASK) as u64;

        // The tenth byte may only carry the single remaining bit.
        if i == MAX_VARINT_LEN_U64 - 1 && data > 1 {
            return Err(Error::InvalidVarint);
        }
        value |= data << (i as u32 * DATA_BITS);
        if byte & CONTINUATION == 0 {
            // A trailing zero byte would be a non-canonical encoding.
            if byte == 0 && i > 0 {
                return Err(Error::InvalidVarint);
            }
            return Ok(value);
        }
    }
    Err(Error::InvalidVarint)
}

/// Reads a varint and ensures it does not exceed `max`.
///
/// Used when the value sizes an allocation, so untrusted input cannot force
/// unbounded memory use.
pub fn read_capped(buf: &mut impl Buf, max: usize) -> Result<usize, Error> {
    let value = read(buf)?;
    let value = usize::try_from(value).map_err(|_| Error::InvalidVarint)?;
    if value > max {
        return Err(Error::LengthExceeded(value, max));
    }
    Ok(value)
}
