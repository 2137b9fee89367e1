//! Block and epoch records.

use crate::types::{BlockIndex, Epoch, EventId, Frame, Hash, Address};
use crate::validators::Validators;
use bytes::{Buf, BufMut};
use moira_codec::{
    bytes_size, read_bytes, read_vec, vec_size, write_bytes, write_vec, Encode, EncodeSize,
    Error as CodecError, Read, Write,
};

/// Maximum events per block accepted from untrusted input.
pub const MAX_BLOCK_EVENTS: usize = 1 << 16;
/// Maximum transactions per block accepted from untrusted input.
pub const MAX_BLOCK_TXS: usize = 1 << 20;
/// Maximum state roots in one epoch record.
pub const MAX_EPOCH_ROOTS: usize = 1 << 20;

/// An immutable block record: the unit the block processor appends per
/// decided atropos. Never mutated, never pruned in archive mode.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Block {
    pub index: BlockIndex,
    pub parent_index: BlockIndex,
    /// Unix nanoseconds; strictly greater than the parent's.
    pub timestamp: u64,
    pub atropos: EventId,
    /// Events confirmed by this block, in consensus order.
    pub events: Vec<EventId>,
    /// Transaction hashes in application order (skipped ones included).
    pub tx_hashes: Vec<Hash>,
    /// Bitmap over `tx_hashes`: bit set = transaction was skipped.
    pub skipped_txs: Vec<u8>,
    pub gas_used: u64,
    /// EVM state root after applying this block.
    pub state_root: Hash,
}

impl Block {
    /// The block hash: SHA-256 of the canonical encoding.
    pub fn hash(&self) -> Hash {
        Hash::of(&self.encode())
    }

    /// Returns true if the transaction at `position` was skipped.
    pub fn is_skipped(&self, position: usize) -> bool {
        self.skipped_txs
            .get(position / 8)
            .is_some_and(|byte| byte & (1 << (position % 8)) != 0)
    }

    /// Marks the transaction at `position` skipped.
    pub fn mark_skipped(&mut self, position: usize) {
        let byte = position / 8;
        if self.skipped_txs.len() <= byte {
            self.skipped_txs.resize(byte + 1, 0);
        }
        self.skipped_txs[byte] |= 1 << (position % 8);
    }
}

impl Write for Block {
    fn write(&self, buf: &mut impl BufMut) {
        self.index.write(buf);
        self.parent_index.write(buf);
        self.timestamp.write(buf);
        self.atropos.write(buf);
        write_vec(&self.events, buf);
        write_vec(&self.tx_hashes, buf);
        write_bytes(&self.skipped_txs, buf);
        self.gas_used.write(buf);
        self.state_root.write(buf);
    }
}

impl EncodeSize for Block {
    fn encode_size(&self) -> usize {
        8 + 8
            + 8
            + 32
            + vec_size(&self.events)
            + vec_size(&self.tx_hashes)
            + bytes_size(&self.skipped_txs)
            + 8
            + 32
    }
}

impl Read for Block {
    fn read(buf: &mut impl Buf) -> Result<Self, CodecError> {
        Ok(Self {
            index: BlockIndex::read(buf)?,
            parent_index: BlockIndex::read(buf)?,
            timestamp: u64::read(buf)?,
            atropos: EventId::read(buf)?,
            events: read_vec(buf, MAX_BLOCK_EVENTS)?,
            tx_hashes: read_vec(buf, MAX_BLOCK_TXS)?,
            skipped_txs: read_bytes(buf, MAX_BLOCK_TXS / 8 + 1)?,
            gas_used: u64::read(buf)?,
            state_root: Hash::read(buf)?,
        })
    }
}

/// The rules snapshot shared by all events of an epoch.
///
/// The SetCode limits (`max_delegation_depth`,
/// `max_authorization_list`) are defined by the transaction-type module;
/// the core only threads them into validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rules {
    pub max_parents: u32,
    /// The epoch seals once an atropos is decided at or after this frame.
    pub max_epoch_frames: Frame,
    /// Sealed epoch sub-stores kept before dropping.
    pub retention_epochs: u32,
    pub max_txs_per_address: u32,
    pub max_event_gas: u64,
    /// Gas power replenished per second of median time.
    pub gas_power_per_sec: u64,
    /// Cap on accumulated gas power.
    pub max_gas_power: u64,
    pub max_delegation_depth: u32,
    pub max_authorization_list: u32,
}

impl Default for Rules {
    fn default() -> Self {
        Self {
            max_parents: 8,
            max_epoch_frames: Frame::new(20),
            retention_epochs: 2,
            max_txs_per_address: 32,
            max_event_gas: 10_000_000,
            gas_power_per_sec: 100_000_000,
            max_gas_power: 1_000_000_000,
            max_delegation_depth: 1,
            max_authorization_list: 256,
        }
    }
}

impl Write for Rules {
    fn write(&self, buf: &mut impl BufMut) {
        self.max_parents.write(buf);
        self.max_epoch_frames.write(buf);
        self.retention_epochs.write(buf);
        self.max_txs_per_address.write(buf);
        self.max_event_gas.write(buf);
        self.gas_power_per_sec.write(buf);
        self.max_gas_power.write(buf);
        self.max_delegation_depth.write(buf);
        self.max_authorization_list.write(buf);
    }
}

impl EncodeSize for Rules {
    fn encode_size(&self) -> usize {
        4 + 4 + 4 + 4 + 8 + 8 + 8 + 4 + 4
    }
}

impl Read for Rules {
    fn read(buf: &mut impl Buf) -> Result<Self, CodecError> {
        Ok(Self {
            max_parents: u32::read(buf)?,
            max_epoch_frames: Frame::read(buf)?,
            retention_epochs: u32::read(buf)?,
            max_txs_per_address: u32::read(buf)?,
            max_event_gas: u64::read(buf)?,
            gas_power_per_sec: u64::read(buf)?,
            max_gas_power: u64::read(buf)?,
            max_delegation_depth: u32::read(buf)?,
            max_authorization_list: u32::read(buf)?,
        })
    }
}

/// The record written when an epoch seals. Its hash anchors inter-epoch
/// history and is what epoch votes refer to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EpochRecord {
    pub epoch: Epoch,
    pub sealing_frame: Frame,
    pub validators: Validators,
    pub rules: Rules,
    pub closing_block: BlockIndex,
    /// State roots committed during the epoch, in block order.
    pub state_roots: Vec<Hash>,
}

impl EpochRecord {
    pub fn hash(&self) -> Hash {
        Hash::of(&self.encode())
    }
}

impl Write for EpochRecord {
    fn write(&self, buf: &mut impl BufMut) {
        self.epoch.write(buf);
        self.sealing_frame.write(buf);
        self.validators.write(buf);
        self.rules.write(buf);
        self.closing_block.write(buf);
        write_vec(&self.state_roots, buf);
    }
}

impl EncodeSize for EpochRecord {
    fn encode_size(&self) -> usize {
        4 + 4
            + self.validators.encode_size()
            + self.rules.encode_size()
            + 8
            + vec_size(&self.state_roots)
    }
}

impl Read for EpochRecord {
    fn read(buf: &mut impl Buf) -> Result<Self, CodecError> {
        Ok(Self {
            epoch: Epoch::read(buf)?,
            sealing_frame: Frame::read(buf)?,
            validators: Validators::read(buf)?,
            rules: Rules::read(buf)?,
            closing_block: BlockIndex::read(buf)?,
            state_roots: read_vec(buf, MAX_EPOCH_ROOTS)?,
        })
    }
}

/// One emitted log entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogEntry {
    pub address: Address,
    pub topics: Vec<Hash>,
    pub data: Vec<u8>,
}

impl Write for LogEntry {
    fn write(&self, buf: &mut impl BufMut) {
        self.address.write(buf);
        write_vec(&self.topics, buf);
        write_bytes(&self.data, buf);
    }
}

impl EncodeSize for LogEntry {
    fn encode_size(&self) -> usize {
        20 + vec_size(&self.topics) + bytes_size(&self.data)
    }
}

impl Read for LogEntry {
    fn read(buf: &mut impl Buf) -> Result<Self, CodecError> {
        Ok(Self {
            address: Address::read(buf)?,
            topics: read_vec(buf, 8)?,
            data: read_bytes(buf, 1 << 20)?,
        })
    }
}

/// The receipt of one applied (or skipped) transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Receipt {
    pub tx_hash: Hash,
    pub ok: bool,
    pub gas_used: u64,
    pub logs: Vec<LogEntry>,
}

impl Write for Receipt {
    fn write(&self, buf: &mut impl BufMut) {
        self.tx_hash.write(buf);
        self.ok.write(buf);
        self.gas_used.write(buf);
        write_vec(&self.logs, buf);
    }
}

impl EncodeSize for Receipt {
    fn encode_size(&self) -> usize {
        32 + 1 + 8 + vec_size(&self.logs)
    }
}

impl Read for Receipt {
    fn read(buf: &mut impl Buf) -> Result<Self, CodecError> {
        Ok(Self {
            tx_hash: Hash::read(buf)?,
            ok: bool::read(buf)?,
            gas_used: u64::read(buf)?,
            logs: read_vec(buf, 1 << 12)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use moira_codec::Decode;

    #[test]
    fn test_block_roundtrip() {
        let mut block = Block {
            index: BlockIndex::new(5),
            parent_index: BlockIndex::new(4),
            timestamp: 1_000,
            atropos: EventId::assemble(Epoch::new(1), crate::types::Lamport::new(9), &[3; 24]),
            events: vec![EventId::ZERO],
            tx_hashes: vec![Hash::of(b"tx1"), Hash::of(b"tx2"), Hash::of(b"tx3")],
            skipped_txs: Vec::new(),
            gas_used: 42_000,
            state_root: Hash::of(b"root"),
        };
        block.mark_skipped(1);
        let decoded = Block::decode(block.encode()).unwrap();
        assert_eq!(decoded, block);
        assert!(!decoded.is_skipped(0));
        assert!(decoded.is_skipped(1));
        assert!(!decoded.is_skipped(2));
        // Out-of-range positions read as not skipped.
        assert!(!decoded.is_skipped(64));
    }

    #[test]
    fn test_epoch_record_roundtrip() {
        let record = EpochRecord {
            epoch: Epoch::new(2),
            sealing_frame: Frame::new(20),
            validators: Validators::fakenet(3),
            rules: Rules::default(),
            closing_block: BlockIndex::new(17),
            state_roots: vec![Hash::of(b"a"), Hash::of(b"b")],
        };
        let decoded = EpochRecord::decode(record.encode()).unwrap();
        assert_eq!(decoded, record);
        assert_eq!(decoded.hash(), record.hash());
    }

    #[test]
    fn test_receipt_roundtrip() {
        let receipt = Receipt {
            tx_hash: Hash::of(b"tx"),
            ok: true,
            gas_used: 21_000,
            logs: vec![LogEntry {
                address: Address([1; 20]),
                topics: vec![Hash::of(b"topic")],
                data: vec![0xAA],
            }],
        };
        assert_eq!(Receipt::decode(receipt.encode()).unwrap(), receipt);
    }
}
