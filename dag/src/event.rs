//! Events and their payloads.
//!
//! An event is immutable once signed: the identifier commits to the header
//! and payload hash, and the signature covers the same message. Structural
//! invariants (lamport rule, self-parent chain, same-epoch parents) are
//! checked by [crate::check_event]; the engine re-checks what it depends
//! on.

use crate::keys::{Signature, Signer, Verifier};
use crate::types::{Address, Epoch, EventId, Frame, Hash, Lamport, ValidatorId};
use bytes::{Buf, BufMut};
use moira_codec::{
    bytes_size, read_bytes, read_vec, vec_size, write_bytes, write_vec, Encode, EncodeSize,
    Error as CodecError, Read, Write,
};

/// Maximum number of parents an event may carry.
pub const MAX_PARENTS: usize = 64;
/// Maximum number of transactions in one event payload.
pub const MAX_EVENT_TXS: usize = 8_192;
/// Maximum transaction input size in bytes.
pub const MAX_TX_INPUT: usize = 1 << 20;
/// Maximum number of block votes in one event payload.
pub const MAX_BLOCK_VOTES: usize = 1_024;
/// Maximum authorization-list length (SetCode-style transactions).
pub const MAX_AUTHORIZATIONS: usize = 256;

/// A transaction as the core sees it: enough structure for nonce ordering,
/// gas accounting, and the SetCode authorization caps. The instruction set
/// behind `input` is an external collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub sender: Address,
    pub nonce: u64,
    /// `None` denotes contract creation.
    pub to: Option<Address>,
    pub value: u64,
    pub gas: u64,
    pub input: Vec<u8>,
    /// SetCode-style authorization list; bounded by the rules snapshot.
    pub authorizations: Vec<Address>,
}

impl Transaction {
    /// The transaction hash: SHA-256 of the canonical encoding.
    pub fn hash(&self) -> Hash {
        Hash::of(&self.encode())
    }
}

impl Write for Transaction {
    fn write(&self, buf: &mut impl BufMut) {
        self.sender.write(buf);
        self.nonce.write(buf);
        match &self.to {
            Some(to) => {
                true.write(buf);
                to.write(buf);
            }
            None => false.write(buf),
        }
        self.value.write(buf);
        self.gas.write(buf);
        write_bytes(&self.input, buf);
        write_vec(&self.authorizations, buf);
    }
}

impl EncodeSize for Transaction {
    fn encode_size(&self) -> usize {
        20 + 8
            + 1
            + self.to.map_or(0, |_| 20)
            + 8
            + 8
            + bytes_size(&self.input)
            + vec_size(&self.authorizations)
    }
}

impl Read for Transaction {
    fn read(buf: &mut impl Buf) -> Result<Self, CodecError> {
        let sender = Address::read(buf)?;
        let nonce = u64::read(buf)?;
        let to = if bool::read(buf)? {
            Some(Address::read(buf)?)
        } else {
            None
        };
        Ok(Self {
            sender,
            nonce,
            to,
            value: u64::read(buf)?,
            gas: u64::read(buf)?,
            input: read_bytes(buf, MAX_TX_INPUT)?,
            authorizations: read_vec(buf, MAX_AUTHORIZATIONS)?,
        })
    }
}

/// A validator's vote for a block it has observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockVote {
    pub index: crate::types::BlockIndex,
    pub hash: Hash,
}

impl Write for BlockVote {
    fn write(&self, buf: &mut impl BufMut) {
        self.index.write(buf);
        self.hash.write(buf);
    }
}

impl EncodeSize for BlockVote {
    fn encode_size(&self) -> usize {
        8 + 32
    }
}

impl Read for BlockVote {
    fn read(buf: &mut impl Buf) -> Result<Self, CodecError> {
        Ok(Self {
            index: crate::types::BlockIndex::read(buf)?,
            hash: Hash::read(buf)?,
        })
    }
}

/// A validator's vote on the record of a sealed epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpochVote {
    pub epoch: Epoch,
    pub hash: Hash,
}

impl Write for EpochVote {
    fn write(&self, buf: &mut impl BufMut) {
        self.epoch.write(buf);
        self.hash.write(buf);
    }
}

impl EncodeSize for EpochVote {
    fn encode_size(&self) -> usize {
        4 + 32
    }
}

impl Read for EpochVote {
    fn read(buf: &mut impl Buf) -> Result<Self, CodecError> {
        Ok(Self {
            epoch: Epoch::read(buf)?,
            hash: Hash::read(buf)?,
        })
    }
}

/// The optional payload carried by an event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Payload {
    pub txs: Vec<Transaction>,
    pub block_votes: Vec<BlockVote>,
    pub epoch_vote: Option<EpochVote>,
}

impl Payload {
    pub fn is_empty(&self) -> bool {
        self.txs.is_empty() && self.block_votes.is_empty() && self.epoch_vote.is_none()
    }

    /// The payload hash committed to by the event header.
    pub fn hash(&self) -> Hash {
        Hash::of(&self.encode())
    }
}

impl Write for Payload {
    fn write(&self, buf: &mut impl BufMut) {
        write_vec(&self.txs, buf);
        write_vec(&self.block_votes, buf);
        match &self.epoch_vote {
            Some(vote) => {
                true.write(buf);
                vote.write(buf);
            }
            None => false.write(buf),
        }
    }
}

impl EncodeSize for Payload {
    fn encode_size(&self) -> usize {
        vec_size(&self.txs)
            + vec_size(&self.block_votes)
            + 1
            + self.epoch_vote.map_or(0, |v| v.encode_size())
    }
}

impl Read for Payload {
    fn read(buf: &mut impl Buf) -> Result<Self, CodecError> {
        Ok(Self {
            txs: read_vec(buf, MAX_EVENT_TXS)?,
            block_votes: read_vec(buf, MAX_BLOCK_VOTES)?,
            epoch_vote: if bool::read(buf)? {
                Some(EpochVote::read(buf)?)
            } else {
                None
            },
        })
    }
}

/// The signed portion of an event, minus the payload body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventHeader {
    pub creator: ValidatorId,
    /// Per-creator sequence number; the first event of a creator in an
    /// epoch has `seq == 1` and no self-parent.
    pub seq: u32,
    pub epoch: Epoch,
    pub frame: Frame,
    pub lamport: Lamport,
    /// Ordered parent list; when `seq > 1` the first entry is the
    /// creator's previous event.
    pub parents: Vec<EventId>,
    pub payload_hash: Hash,
    pub gas_power_used: u64,
    pub gas_power_left: u64,
    /// Creator wall clock at creation, unix nanoseconds.
    pub creation_time: u64,
    /// Stake-weighted median of parents' creation times.
    pub median_time: u64,
}

impl Write for EventHeader {
    fn write(&self, buf: &mut impl BufMut) {
        self.creator.write(buf);
        self.seq.write(buf);
        self.epoch.write(buf);
        self.frame.write(buf);
        self.lamport.write(buf);
        write_vec(&self.parents, buf);
        self.payload_hash.write(buf);
        self.gas_power_used.write(buf);
        self.gas_power_left.write(buf);
        self.creation_time.write(buf);
        self.median_time.write(buf);
    }
}

impl EncodeSize for EventHeader {
    fn encode_size(&self) -> usize {
        4 + 4 + 4 + 4 + 4 + vec_size(&self.parents) + 32 + 8 + 8 + 8 + 8
    }
}

impl Read for EventHeader {
    fn read(buf: &mut impl Buf) -> Result<Self, CodecError> {
        Ok(Self {
            creator: ValidatorId::read(buf)?,
            seq: u32::read(buf)?,
            epoch: Epoch::read(buf)?,
            frame: Frame::read(buf)?,
            lamport: Lamport::read(buf)?,
            parents: read_vec(buf, MAX_PARENTS)?,
            payload_hash: Hash::read(buf)?,
            gas_power_used: u64::read(buf)?,
            gas_power_left: u64::read(buf)?,
            creation_time: u64::read(buf)?,
            median_time: u64::read(buf)?,
        })
    }
}

impl EventHeader {
    /// The message covered by the event signature.
    pub fn signing_message(&self) -> Hash {
        Hash::of(&self.encode())
    }

    /// Derives the event identifier for this header.
    pub fn derive_id(&self) -> EventId {
        let digest = self.signing_message();
        let tail: [u8; 24] = digest.as_bytes()[0..24].try_into().unwrap();
        EventId::assemble(self.epoch, self.lamport, &tail)
    }
}

/// A signed, immutable DAG event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    header: EventHeader,
    id: EventId,
    signature: Signature,
    payload: Payload,
}

impl Event {
    /// Signs `header` over `payload` and assembles the event.
    ///
    /// The caller must have set `header.payload_hash` aside; it is
    /// recomputed here to keep the commitment honest.
    pub fn sign(mut header: EventHeader, payload: Payload, signer: &dyn Signer) -> Self {
        header.payload_hash = payload.hash();
        let id = header.derive_id();
        let signature = signer.sign(header.signing_message().as_bytes());
        Self {
            header,
            id,
            signature,
            payload,
        }
    }

    /// Reassembles an event from decoded parts, re-deriving the id.
    pub fn from_parts(header: EventHeader, signature: Signature, payload: Payload) -> Self {
        let id = header.derive_id();
        Self {
            header,
            id,
            signature,
            payload,
        }
    }

    pub fn id(&self) -> EventId {
        self.id
    }

    pub fn header(&self) -> &EventHeader {
        &self.header
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    pub fn creator(&self) -> ValidatorId {
        self.header.creator
    }

    pub fn seq(&self) -> u32 {
        self.header.seq
    }

    pub fn epoch(&self) -> Epoch {
        self.header.epoch
    }

    pub fn lamport(&self) -> Lamport {
        self.header.lamport
    }

    pub fn parents(&self) -> &[EventId] {
        &self.header.parents
    }

    /// The creator's previous event, present whenever `seq > 1`.
    pub fn self_parent(&self) -> Option<EventId> {
        if self.header.seq > 1 {
            self.header.parents.first().copied()
        } else {
            None
        }
    }

    /// Verifies the signature and the payload commitment against the
    /// claimed creator key.
    pub fn verify(&self, verifier: &dyn Verifier, public: &crate::keys::PublicKey) -> bool {
        self.header.payload_hash == self.payload.hash()
            && self.id == self.header.derive_id()
            && verifier.verify(
                public,
                self.header.signing_message().as_bytes(),
                &self.signature,
            )
    }
}

impl Write for Event {
    fn write(&self, buf: &mut impl BufMut) {
        self.header.write(buf);
        self.signature.write(buf);
        self.payload.write(buf);
    }
}

impl EncodeSize for Event {
    fn encode_size(&self) -> usize {
        self.header.encode_size() + self.signature.encode_size() + self.payload.encode_size()
    }
}

impl Read for Event {
    fn read(buf: &mut impl Buf) -> Result<Self, CodecError> {
        let header = EventHeader::read(buf)?;
        let signature = Signature::read(buf)?;
        let payload = Payload::read(buf)?;
        Ok(Self::from_parts(header, signature, payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{FakeScheme, FakeSigner};
    use moira_codec::Decode;

    pub(crate) fn sample_tx(nonce: u64) -> Transaction {
        Transaction {
            sender: Address([7u8; 20]),
            nonce,
            to: Some(Address([9u8; 20])),
            value: 1_000,
            gas: 21_000,
            input: vec![1, 2, 3],
            authorizations: Vec::new(),
        }
    }

    fn sample_event() -> Event {
        let signer = FakeSigner::new(ValidatorId::new(3));
        let header = EventHeader {
            creator: ValidatorId::new(3),
            seq: 2,
            epoch: Epoch::new(1),
            frame: Frame::new(1),
            lamport: Lamport::new(5),
            parents: vec![EventId::assemble(
                Epoch::new(1),
                Lamport::new(4),
                &[1u8; 24],
            )],
            payload_hash: Hash::ZERO,
            gas_power_used: 100,
            gas_power_left: 900,
            creation_time: 1_000_000,
            median_time: 999_000,
        };
        let payload = Payload {
            txs: vec![sample_tx(1), sample_tx(2)],
            block_votes: vec![],
            epoch_vote: None,
        };
        Event::sign(header, payload, &signer)
    }

    #[test]
    fn test_id_matches_header() {
        let event = sample_event();
        assert_eq!(event.id().epoch(), Epoch::new(1));
        assert_eq!(event.id().lamport(), Lamport::new(5));
        assert_eq!(event.id(), event.header().derive_id());
    }

    #[test]
    fn test_codec_roundtrip() {
        let event = sample_event();
        let decoded = Event::decode(event.encode()).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn test_signature_verifies() {
        let event = sample_event();
        let signer = FakeSigner::new(ValidatorId::new(3));
        assert!(event.verify(&FakeScheme, &signer.public()));
        let wrong = FakeSigner::new(ValidatorId::new(4));
        assert!(!event.verify(&FakeScheme, &wrong.public()));
    }

    #[test]
    fn test_tampered_payload_fails_verify() {
        let event = sample_event();
        let mut payload = event.payload().clone();
        payload.txs.push(sample_tx(3));
        let tampered = Event::from_parts(event.header().clone(), *event.signature(), payload);
        let signer = FakeSigner::new(ValidatorId::new(3));
        assert!(!tampered.verify(&FakeScheme, &signer.public()));
    }

    #[test]
    fn test_self_parent_rule() {
        let event = sample_event();
        assert!(event.self_parent().is_some());
        let mut header = event.header().clone();
        header.seq = 1;
        header.parents = vec![];
        let first = Event::sign(header, Payload::default(), &FakeSigner::new(ValidatorId::new(3)));
        assert!(first.self_parent().is_none());
    }
}
