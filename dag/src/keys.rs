//! Pluggable validator keys.
//!
//! The core is agnostic to the signature scheme: anything implementing
//! [Signer] and [Verifier] can back a validator. [FakeSigner] is the
//! fakenet scheme used by multi-node tests; it is a keyed hash, NOT a
//! signature, and is unusable outside tests by construction (the "key" is
//! derived from the public validator id).

use crate::types::{Hash, ValidatorId};
use bytes::{Buf, BufMut};
use moira_codec::{EncodeSize, Error as CodecError, Read, Write};
use std::fmt;

/// A 32-byte public key.
#[derive(Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PublicKey(pub [u8; 32]);

impl PublicKey {
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", crate::types::hex(&self.0[..8]))
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&crate::types::hex(&self.0))
    }
}

impl Write for PublicKey {
    fn write(&self, buf: &mut impl BufMut) {
        self.0.write(buf);
    }
}

impl EncodeSize for PublicKey {
    fn encode_size(&self) -> usize {
        32
    }
}

impl Read for PublicKey {
    fn read(buf: &mut impl Buf) -> Result<Self, CodecError> {
        Ok(Self(<[u8; 32]>::read(buf)?))
    }
}

/// A 64-byte signature.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Signature(pub [u8; 64]);

impl Default for Signature {
    fn default() -> Self {
        Self([0u8; 64])
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({})", crate::types::hex(&self.0[..8]))
    }
}

impl Write for Signature {
    fn write(&self, buf: &mut impl BufMut) {
        buf.put_slice(&self.0);
    }
}

impl EncodeSize for Signature {
    fn encode_size(&self) -> usize {
        64
    }
}

impl Read for Signature {
    fn read(buf: &mut impl Buf) -> Result<Self, CodecError> {
        if buf.remaining() < 64 {
            return Err(CodecError::EndOfBuffer);
        }
        let mut sig = [0u8; 64];
        buf.copy_to_slice(&mut sig);
        Ok(Self(sig))
    }
}

/// Produces signatures for this node's validator key.
pub trait Signer: Send + Sync {
    fn public(&self) -> PublicKey;
    fn sign(&self, message: &[u8]) -> Signature;
}

/// Verifies signatures against validator public keys.
pub trait Verifier: Send + Sync {
    fn verify(&self, public: &PublicKey, message: &[u8], signature: &Signature) -> bool;
}

/// The deterministic fakenet key for a validator id.
pub fn fake_key(id: ValidatorId) -> PublicKey {
    let mut seed = b"fakenet-validator-".to_vec();
    seed.extend_from_slice(&id.get().to_be_bytes());
    PublicKey(*Hash::of(&seed).as_bytes())
}

/// Fakenet signer: a keyed hash over (public, message).
pub struct FakeSigner {
    public: PublicKey,
}

impl FakeSigner {
    pub fn new(id: ValidatorId) -> Self {
        Self {
            public: fake_key(id),
        }
    }
}

impl Signer for FakeSigner {
    fn public(&self) -> PublicKey {
        self.public
    }

    fn sign(&self, message: &[u8]) -> Signature {
        fake_sign(&self.public, message)
    }
}

/// Fakenet verification scheme.
pub struct FakeScheme;

impl Verifier for FakeScheme {
    fn verify(&self, public: &PublicKey, message: &[u8], signature: &Signature) -> bool {
        fake_sign(public, message) == *signature
    }
}

fn fake_sign(public: &PublicKey, message: &[u8]) -> Signature {
    let mut preimage = Vec::with_capacity(32 + message.len() + 1);
    preimage.extend_from_slice(public.as_bytes());
    preimage.extend_from_slice(message);
    preimage.push(0);
    let left = Hash::of(&preimage);
    *preimage.last_mut().unwrap() = 1;
    let right = Hash::of(&preimage);
    let mut sig = [0u8; 64];
    sig[..32].copy_from_slice(left.as_bytes());
    sig[32..].copy_from_slice(right.as_bytes());
    Signature(sig)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fake_key_deterministic() {
        assert_eq!(fake_key(ValidatorId::new(3)), fake_key(ValidatorId::new(3)));
        assert_ne!(fake_key(ValidatorId::new(3)), fake_key(ValidatorId::new(4)));
    }

    #[test]
    fn test_fake_sign_verify() {
        let signer = FakeSigner::new(ValidatorId::new(1));
        let sig = signer.sign(b"message");
        assert!(FakeScheme.verify(&signer.public(), b"message", &sig));
        assert!(!FakeScheme.verify(&signer.public(), b"other", &sig));
    }
}
