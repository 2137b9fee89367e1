//! Core identifiers.
//!
//! Explicit constructors (`Epoch::new()`, `ValidatorId::new()`) are
//! required to create instances from raw integers; implicit `From`
//! conversions are intentionally not provided to prevent accidental type
//! misuse. Fixed-width identifiers encode big-endian so encoded keys sort
//! like the values.

use bytes::{Buf, BufMut};
use moira_codec::{EncodeSize, Error as CodecError, Read, Write};
use std::fmt::{self, Display, Formatter};

macro_rules! impl_id {
    ($name:ident, $raw:ty, $doc:literal) => {
        #[doc = $doc]
        #[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name($raw);

        impl $name {
            /// Creates a new value from its raw representation.
            pub const fn new(value: $raw) -> Self {
                Self(value)
            }

            /// Returns the raw representation.
            pub const fn get(self) -> $raw {
                self.0
            }

            /// Returns the next value.
            ///
            /// # Panics
            ///
            /// Panics on overflow.
            pub const fn next(self) -> Self {
                Self(self.0 + 1)
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
                Display::fmt(&self.0, f)
            }
        }

        impl Write for $name {
            fn write(&self, buf: &mut impl BufMut) {
                self.0.write(buf);
            }
        }

        impl EncodeSize for $name {
            fn encode_size(&self) -> usize {
                std::mem::size_of::<$raw>()
            }
        }

        impl Read for $name {
            fn read(buf: &mut impl Buf) -> Result<Self, CodecError> {
                Ok(Self(<$raw>::read(buf)?))
            }
        }
    };
}

impl_id!(ValidatorId, u32, "Identifies one validator within the network.");
impl_id!(Epoch, u32, "A sealed unit of DAG history; monotonically increasing.");
impl_id!(Frame, u32, "Intra-epoch round number derived from strong-see quorum.");
impl_id!(Lamport, u32, "Lamport timestamp, scoped within an epoch.");
impl_id!(BlockIndex, u64, "Block number, global across epochs.");

/// A 32-byte hash.
#[derive(Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Hash(pub [u8; 32]);

impl Hash {
    pub const ZERO: Self = Self([0u8; 32]);

    /// Hashes `data` with SHA-256.
    pub fn of(data: &[u8]) -> Self {
        use sha2::{Digest, Sha256};
        Self(Sha256::digest(data).into())
    }

    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", hex(&self.0[..8]))
    }
}

impl Display for Hash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&hex(&self.0))
    }
}

impl Write for Hash {
    fn write(&self, buf: &mut impl BufMut) {
        self.0.write(buf);
    }
}

impl EncodeSize for Hash {
    fn encode_size(&self) -> usize {
        32
    }
}

impl Read for Hash {
    fn read(buf: &mut impl Buf) -> Result<Self, CodecError> {
        Ok(Self(<[u8; 32]>::read(buf)?))
    }
}

/// A 20-byte account address.
#[derive(Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address(pub [u8; 20]);

impl Address {
    pub const fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", hex(&self.0))
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&hex(&self.0))
    }
}

impl Write for Address {
    fn write(&self, buf: &mut impl BufMut) {
        self.0.write(buf);
    }
}

impl EncodeSize for Address {
    fn encode_size(&self) -> usize {
        20
    }
}

impl Read for Address {
    fn read(buf: &mut impl Buf) -> Result<Self, CodecError> {
        Ok(Self(<[u8; 20]>::read(buf)?))
    }
}

/// An event identifier: `epoch (4, BE) ‖ lamport (4, BE) ‖ hash tail (24)`.
///
/// The layout makes raw identifiers sortable by `(epoch, lamport)`, which
/// the stores exploit for range scans and the engine for canonical
/// tie-breaking.
#[derive(Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventId(pub [u8; 32]);

impl EventId {
    pub const ZERO: Self = Self([0u8; 32]);

    /// Assembles an identifier from its parts.
    pub fn assemble(epoch: Epoch, lamport: Lamport, tail: &[u8; 24]) -> Self {
        let mut id = [0u8; 32];
        id[0..4].copy_from_slice(&epoch.get().to_be_bytes());
        id[4..8].copy_from_slice(&lamport.get().to_be_bytes());
        id[8..32].copy_from_slice(tail);
        Self(id)
    }

    pub fn epoch(&self) -> Epoch {
        Epoch::new(u32::from_be_bytes(self.0[0..4].try_into().unwrap()))
    }

    pub fn lamport(&self) -> Lamport {
        Lamport::new(u32::from_be_bytes(self.0[4..8].try_into().unwrap()))
    }

    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for EventId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "EventId({}:{}:{})",
            self.epoch(),
            self.lamport(),
            hex(&self.0[8..12])
        )
    }
}

impl Display for EventId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&hex(&self.0))
    }
}

impl Write for EventId {
    fn write(&self, buf: &mut impl BufMut) {
        self.0.write(buf);
    }
}

impl EncodeSize for EventId {
    fn encode_size(&self) -> usize {
        32
    }
}

impl Read for EventId {
    fn read(buf: &mut impl Buf) -> Result<Self, CodecError> {
        Ok(Self(<[u8; 32]>::read(buf)?))
    }
}

/// Converts bytes to a hexadecimal string.
pub fn hex(bytes: &[u8]) -> String {
    let mut hex = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        hex.push_str(&format!("{byte:02x}"));
    }
    hex
}

/// Converts a hexadecimal string to bytes.
pub fn from_hex(hex: &str) -> Option<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return None;
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use moira_codec::{Decode, Encode};

    #[test]
    fn test_event_id_layout() {
        let id = EventId::assemble(Epoch::new(3), Lamport::new(17), &[0xAB; 24]);
        assert_eq!(id.epoch(), Epoch::new(3));
        assert_eq!(id.lamport(), Lamport::new(17));
        assert_eq!(&id.0[8..], &[0xAB; 24]);
    }

    #[test]
    fn test_event_id_sorts_by_epoch_then_lamport() {
        let a = EventId::assemble(Epoch::new(1), Lamport::new(9), &[0xFF; 24]);
        let b = EventId::assemble(Epoch::new(2), Lamport::new(1), &[0x00; 24]);
        let c = EventId::assemble(Epoch::new(2), Lamport::new(2), &[0x00; 24]);
        assert!(a < b && b < c);
    }

    #[test]
    fn test_id_codec_roundtrip() {
        let epoch = Epoch::new(42);
        assert_eq!(Epoch::decode(epoch.encode()).unwrap(), epoch);
        let block = BlockIndex::new(7);
        assert_eq!(BlockIndex::decode(block.encode()).unwrap(), block);
    }

    #[test]
    fn test_hex() {
        assert_eq!(hex(&[0xde, 0xad]), "dead");
        assert_eq!(from_hex("dead").unwrap(), vec![0xde, 0xad]);
        assert!(from_hex("abc").is_none());
        assert!(from_hex("zz").is_none());
    }
}
