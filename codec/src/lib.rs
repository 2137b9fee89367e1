//! Serialize and deserialize structured data.
//!
//! `moira-codec` defines the byte-level framing used for on-disk event
//! export files, genesis sections, and inter-epoch record hashing. The
//! traits are deliberately minimal: a type describes how to [Write] itself
//! to a buffer, how large that encoding is ([EncodeSize]), and how to
//! [Read] itself back out. [Encode::encode] and [Decode::decode] are the
//! provided entry points; `decode` insists the buffer is fully consumed so
//! trailing garbage is never silently accepted.
//!
//! Fixed-width integers are encoded big-endian so encoded keys sort the
//! same way the values do. Collection lengths use [varint] framing with an
//! explicit cap supplied by the caller.

mod error;
pub use error::Error;
pub mod varint;

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Trait for types that can be written (encoded) to a buffer.
pub trait Write {
    /// Encodes this value by writing to a buffer.
    fn write(&self, buf: &mut impl BufMut);
}

/// Trait for types that know the exact size of their encoding.
pub trait EncodeSize {
    /// Returns the exact number of bytes [Write::write] will produce.
    fn encode_size(&self) -> usize;
}

/// Trait for types that can be read (decoded) from a buffer.
pub trait Read: Sized {
    /// Reads a value from the buffer, consuming the necessary bytes.
    fn read(buf: &mut impl Buf) -> Result<Self, Error>;
}

/// Trait for types that can be encoded to a buffer.
pub trait Encode: Write + EncodeSize {
    /// Encodes a value to a freshly-allocated buffer.
    ///
    /// Panics if the [Write] implementation does not write exactly
    /// [EncodeSize::encode_size] bytes.
    fn encode(&self) -> Bytes {
        let size = self.encode_size();
        let mut buf = BytesMut::with_capacity(size);
        self.write(&mut buf);
        assert_eq!(buf.len(), size, "write() did not write expected bytes");
        buf.freeze()
    }
}

impl<T: Write + EncodeSize> Encode for T {}

/// Trait for types that can be decoded from a buffer, ensuring the entire
/// buffer is consumed.
pub trait Decode: Read {
    /// Decodes a value from a buffer, rejecting trailing data.
    fn decode(mut buf: impl Buf) -> Result<Self, Error> {
        let result = Self::read(&mut buf)?;
        let remaining = buf.remaining();
        if remaining > 0 {
            return Err(Error::ExtraData(remaining));
        }
        Ok(result)
    }
}

impl<T: Read> Decode for T {}

macro_rules! impl_uint_codec {
    ($type:ty, $put:ident, $get:ident) => {
        impl Write for $type {
            #[inline]
            fn write(&self, buf: &mut impl BufMut) {
                buf.$put(*self);
            }
        }

        impl EncodeSize for $type {
            #[inline]
            fn encode_size(&self) -> usize {
                std::mem::size_of::<$type>()
            }
        }

        impl Read for $type {
            #[inline]
            fn read(buf: &mut impl Buf) -> Result<Self, Error> {
                if buf.remaining() < std::mem::size_of::<$type>() {
                    return Err(Error::EndOfBuffer);
                }
                Ok(buf.$get())
            }
        }
    };
}

impl_uint_codec!(u8, put_u8, get_u8);
impl_uint_codec!(u16, put_u16, get_u16);
impl_uint_codec!(u32, put_u32, get_u32);
impl_uint_codec!(u64, put_u64, get_u64);

impl Write for bool {
    #[inline]
    fn write(&self, buf: &mut impl BufMut) {
        buf.put_u8(*self as u8);
    }
}

impl EncodeSize for bool {
    #[inline]
    fn encode_size(&self) -> usize {
        1
    }
}

impl Read for bool {
    fn read(buf: &mut impl Buf) -> Result<Self, Error> {
        match u8::read(buf)? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(Error::InvalidBool),
        }
    }
}

impl<const N: usize> Write for [u8; N] {
    #[inline]
    fn write(&self, buf: &mut impl BufMut) {
        buf.put_slice(self);
    }
}

impl<const N: usize> EncodeSize for [u8; N] {
    #[inline]
    fn encode_size(&self) -> usize {
        N
    }
}

impl<const N: usize> Read for [u8; N] {
    fn read(buf: &mut impl Buf) -> Result<Self, Error> {
        if buf.remaining() < N {
            return Err(Error::EndOfBuffer);
        }
        let mut array = [0u8; N];
        buf.copy_to_slice(&mut array);
        Ok(array)
    }
}

/// Writes a length-prefixed byte string.
pub fn write_bytes(value: &[u8], buf: &mut impl BufMut) {
    varint::write(value.len() as u64, buf);
    buf.put_slice(value);
}

/// Returns the encoded size of a length-prefixed byte string.
pub fn bytes_size(value: &[u8]) -> usize {
    varint::size(value.len() as u64) + value.len()
}

/// Reads a length-prefixed byte string of at most `max` bytes.
pub fn read_bytes(buf: &mut impl Buf, max: usize) -> Result<Vec<u8>, Error> {
    let len = varint::read_capped(buf, max)?;
    if buf.remaining() < len {
        return Err(Error::EndOfBuffer);
    }
    let mut value = vec![0u8; len];
    buf.copy_to_slice(&mut value);
    Ok(value)
}

/// Writes a length-prefixed collection.
pub fn write_vec<T: Write>(items: &[T], buf: &mut impl BufMut) {
    varint::write(items.len() as u64, buf);
    for item in items {
        item.write(buf);
    }
}

/// Returns the encoded size of a length-prefixed collection.
pub fn vec_size<T: EncodeSize>(items: &[T]) -> usize {
    varint::size(items.len() as u64) + items.iter().map(|i| i.encode_size()).sum::<usize>()
}

/// Reads a length-prefixed collection of at most `max` items.
pub fn read_vec<T: Read>(buf: &mut impl Buf, max: usize) -> Result<Vec<T>, Error> {
    let len = varint::read_capped(buf, max)?;
    let mut items = Vec::with_capacity(len.min(1024));
    for _ in 0..len {
        items.push(T::read(buf)?);
    }
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uint_roundtrip() {
        let encoded = 0xDEAD_BEEFu32.encode();
        assert_eq!(encoded.len(), 4);
        assert_eq!(u32::decode(encoded).unwrap(), 0xDEAD_BEEF);
    }

    #[test]
    fn test_uint_sorts_big_endian() {
        // Encoded keys must sort like the values they encode.
        let small = 5u64.encode();
        let large = 600u64.encode();
        assert!(small < large);
    }

    #[test]
    fn test_decode_rejects_trailing_data() {
        let mut buf = BytesMut::new();
        7u32.write(&mut buf);
        buf.put_u8(0xFF);
        assert!(matches!(u32::decode(buf.freeze()), Err(Error::ExtraData(1))));
    }

    #[test]
    fn test_bool() {
        assert!(bool::decode(true.encode()).unwrap());
        assert!(!bool::decode(false.encode()).unwrap());
        let raw: &[u8] = &[2];
        assert!(matches!(bool::decode(raw), Err(Error::InvalidBool)));
    }

    #[test]
    fn test_array_roundtrip() {
        let array = [7u8; 32];
        assert_eq!(<[u8; 32]>::decode(array.encode()).unwrap(), array);
    }

    #[test]
    fn test_bytes_capped() {
        let mut buf = BytesMut::new();
        write_bytes(b"hello", &mut buf);
        assert_eq!(buf.len(), bytes_size(b"hello"));
        let frozen = buf.freeze();
        assert_eq!(read_bytes(&mut frozen.clone(), 16).unwrap(), b"hello");
        assert!(matches!(
            read_bytes(&mut frozen.clone(), 3),
            Err(Error::LengthExceeded(5, 3))
        ));
    }

    #[test]
    fn test_vec_roundtrip() {
        let items = vec![1u32, 2, 3];
        let mut buf = BytesMut::new();
        write_vec(&items, &mut buf);
        assert_eq!(buf.len(), vec_size(&items));
        let decoded: Vec<u32> = read_vec(&mut buf.freeze(), 8).unwrap();
        assert_eq!(decoded, items);
    }

    #[test]
    fn test_vec_length_lies() {
        // A length prefix larger than the remaining payload must not panic.
        let mut buf = BytesMut::new();
        varint::write(1_000, &mut buf);
        let result: Result<Vec<u32>, _> = read_vec(&mut buf.freeze(), 2_000);
        assert!(matches!(result, Err(Error::EndOfBuffer)));
    }
}
