//! On-disk interchange formats behind the CLI: event files, genesis
//! files, and the evm consistency check.
//!
//! Event files are a flat record stream so they can be produced and
//! consumed without seeking. Genesis files carry independently-verifiable
//! gzip units; each unit header holds a Merkle root over the uncompressed
//! stream, so a reader can reject a damaged file before replaying it.

use crate::ingress::{Accepted, Delivery};
use crate::Error;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use moira_codec::{Decode, Encode};
use moira_dag::{BlockIndex, Epoch, Event, Hash};
use moira_gossip::{EvmStore, GossipStore};
use sha2::{Digest, Sha256};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};

const EVENTS_MAGIC: [u8; 4] = *b"MOEV";
const EVENTS_VERSION: u8 = 1;
/// Hard cap on a single event record; anything larger is a damaged file.
const MAX_EVENT_RECORD: u32 = 16 << 20;

const GENESIS_MAGIC: [u8; 4] = *b"MOGN";
const GENESIS_VERSION: u8 = 1;
/// Unit hashes are Merkle roots over pieces of this many uncompressed bytes.
const GENESIS_PIECE: usize = 1 << 20;

/// Writes every event of epochs `from..=to` to `writer`, oldest first.
///
/// Within an epoch the per-epoch index yields lamport order, so parents
/// always precede children and the file replays without reordering.
pub fn export_events(
    store: &GossipStore,
    writer: &mut impl io::Write,
    from: Epoch,
    to: Epoch,
) -> Result<u64, Error> {
    writer.write_all(&EVENTS_MAGIC)?;
    writer.write_all(&[EVENTS_VERSION])?;
    let mut written = 0u64;
    for epoch in from.get()..=to.get() {
        for id in store.epoch_events(Epoch::new(epoch))? {
            let Some(event) = store.event(&id)? else {
                warn!(event = %id, epoch, "indexed event has no body, skipping");
                continue;
            };
            let raw = event.encode();
            writer.write_all(&(raw.len() as u32).to_be_bytes())?;
            writer.write_all(&raw)?;
            writer.write_all(&crc32fast::hash(&raw).to_be_bytes())?;
            written += 1;
        }
    }
    Ok(written)
}

/// Outcome of [import_events].
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ImportStats {
    /// Events accepted by the engine.
    pub delivered: u64,
    /// Events belonging to other epochs (already-sealed history).
    pub skipped: u64,
    /// The stop flag was raised; the file was not read to the end.
    pub interrupted: bool,
}

/// Replays an event file into `delivery`.
///
/// `stop` is observed at record boundaries, so an interrupt never leaves
/// a half-applied record behind.
pub fn import_events(
    delivery: &dyn Delivery,
    reader: &mut impl io::Read,
    stop: &AtomicBool,
) -> Result<ImportStats, Error> {
    let mut header = [0u8; 5];
    reader.read_exact(&mut header)?;
    if header[..4] != EVENTS_MAGIC {
        return Err(bad_file("events", "not an event file"));
    }
    if header[4] != EVENTS_VERSION {
        return Err(bad_file(
            "events",
            format!("unsupported version {}", header[4]),
        ));
    }

    let mut stats = ImportStats::default();
    loop {
        if stop.load(Ordering::Relaxed) {
            stats.interrupted = true;
            info!(delivered = stats.delivered, "import interrupted");
            return Ok(stats);
        }
        let mut len = [0u8; 4];
        match read_or_end(reader, &mut len)? {
            false => return Ok(stats),
            true => {}
        }
        let len = u32::from_be_bytes(len);
        if len > MAX_EVENT_RECORD {
            return Err(bad_file("events", format!("oversized record ({len} bytes)")));
        }
        let mut raw = vec![0u8; len as usize];
        reader.read_exact(&mut raw)?;
        let mut crc = [0u8; 4];
        reader.read_exact(&mut crc)?;
        if crc32fast::hash(&raw) != u32::from_be_bytes(crc) {
            return Err(bad_file("events", "record checksum mismatch"));
        }
        let event = Event::decode(raw.as_slice())?;
        match delivery.deliver(event)? {
            Accepted::Now => stats.delivered += 1,
            Accepted::WrongEpoch(_) => stats.skipped += 1,
        }
    }
}

/// Reads exactly `buf`, or returns false on a clean end of stream.
fn read_or_end(reader: &mut impl io::Read, buf: &mut [u8]) -> Result<bool, Error> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(err) => Err(err.into()),
    }
}

/// The sections a genesis file can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenesisUnit {
    /// Sealed epoch records.
    EpochRecords,
    /// Blocks with their receipts.
    Blocks,
    /// The evm state trie behind the latest block.
    EvmState,
}

impl GenesisUnit {
    pub fn name(&self) -> &'static str {
        match self {
            Self::EpochRecords => "ers",
            Self::Blocks => "brs",
            Self::EvmState => "evm",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "ers" => Some(Self::EpochRecords),
            "brs" => Some(Self::Blocks),
            "evm" => Some(Self::EvmState),
            _ => None,
        }
    }
}

/// Writes the requested units into a seekable genesis file.
pub fn export_genesis<W: io::Write + io::Seek>(
    writer: &mut W,
    store: &GossipStore,
    evm: &EvmStore,
    units: &[GenesisUnit],
) -> Result<(), Error> {
    for unit in units {
        write_unit(writer, unit.name(), |sink| match unit {
            GenesisUnit::EpochRecords => fill_epoch_records(store, sink),
            GenesisUnit::Blocks => fill_blocks(store, evm, sink),
            GenesisUnit::EvmState => fill_evm_state(store, evm, sink),
        })?;
        info!(unit = unit.name(), "genesis unit written");
    }
    Ok(())
}

fn fill_epoch_records(store: &GossipStore, sink: &mut dyn io::Write) -> Result<(), Error> {
    let mut epoch = 1u32;
    while let Some(record) = store.epoch_record(Epoch::new(epoch))? {
        let raw = record.encode();
        sink.write_all(&(raw.len() as u32).to_be_bytes())?;
        sink.write_all(&raw)?;
        epoch += 1;
    }
    Ok(())
}

fn fill_blocks(store: &GossipStore, evm: &EvmStore, sink: &mut dyn io::Write) -> Result<(), Error> {
    let Some(latest) = store.latest_block_index()? else {
        return Ok(());
    };
    for index in 1..=latest.get() {
        let block = store
            .block(BlockIndex::new(index))?
            .ok_or_else(|| bad_file("genesis", format!("missing block {index}")))?;
        let raw = block.encode();
        sink.write_all(&(raw.len() as u32).to_be_bytes())?;
        sink.write_all(&raw)?;
        let mut receipts = Vec::new();
        for (position, tx_hash) in block.tx_hashes.iter().enumerate() {
            if block.is_skipped(position) {
                continue;
            }
            let receipt = evm.receipt(tx_hash)?.ok_or_else(|| {
                bad_file("genesis", format!("missing receipt for {tx_hash} in block {index}"))
            })?;
            receipts.push(receipt);
        }
        sink.write_all(&(receipts.len() as u32).to_be_bytes())?;
        for receipt in receipts {
            let raw = receipt.encode();
            sink.write_all(&(raw.len() as u32).to_be_bytes())?;
            sink.write_all(&raw)?;
        }
    }
    Ok(())
}

fn fill_evm_state(
    store: &GossipStore,
    evm: &EvmStore,
    mut sink: &mut dyn io::Write,
) -> Result<(), Error> {
    let root = match store.latest_block_index()? {
        Some(latest) => match store.block(latest)? {
            Some(block) => block.state_root,
            None => Hash::ZERO,
        },
        None => Hash::ZERO,
    };
    evm.export_state(&root, &mut sink)?;
    Ok(())
}

/// Header bytes before the per-unit placeholder fields.
fn unit_prefix(name: &str) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(6 + name.len());
    prefix.extend_from_slice(&GENESIS_MAGIC);
    prefix.push(GENESIS_VERSION);
    prefix.push(name.len() as u8);
    prefix.extend_from_slice(name.as_bytes());
    prefix
}

/// Streams one unit: placeholder header, gzip body, then the real header
/// written over the placeholder once the hash and sizes are known.
fn write_unit<W: io::Write + io::Seek>(
    writer: &mut W,
    name: &str,
    fill: impl FnOnce(&mut dyn io::Write) -> Result<(), Error>,
) -> Result<(), Error> {
    let start = writer.stream_position()?;
    writer.write_all(&unit_prefix(name))?;
    writer.write_all(&[0u8; 48])?; // hash + uncompressed + compressed

    let mut body = UnitBody::new(&mut *writer);
    fill(&mut body)?;
    let (hash, uncompressed, compressed) = body.finish()?;

    let end = writer.stream_position()?;
    writer.seek(SeekFrom::Start(start + 6 + name.len() as u64))?;
    writer.write_all(hash.as_bytes())?;
    writer.write_all(&uncompressed.to_be_bytes())?;
    writer.write_all(&compressed.to_be_bytes())?;
    writer.seek(SeekFrom::Start(end))?;
    Ok(())
}

struct CountingWriter<W: io::Write> {
    inner: W,
    written: u64,
}

impl<W: io::Write> io::Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Compresses the unit body while hashing the uncompressed stream in
/// [GENESIS_PIECE] chunks.
struct UnitBody<W: io::Write> {
    gz: GzEncoder<CountingWriter<W>>,
    piece: Sha256,
    filled: usize,
    pieces: Vec<Hash>,
    uncompressed: u64,
}

impl<W: io::Write> UnitBody<W> {
    fn new(writer: W) -> Self {
        Self {
            gz: GzEncoder::new(
                CountingWriter {
                    inner: writer,
                    written: 0,
                },
                Compression::default(),
            ),
            piece: Sha256::new(),
            filled: 0,
            pieces: Vec::new(),
            uncompressed: 0,
        }
    }

    fn absorb(&mut self, mut buf: &[u8]) {
        self.uncompressed += buf.len() as u64;
        while !buf.is_empty() {
            let take = (GENESIS_PIECE - self.filled).min(buf.len());
            self.piece.update(&buf[..take]);
            self.filled += take;
            buf = &buf[take..];
            if self.filled == GENESIS_PIECE {
                let piece = std::mem::replace(&mut self.piece, Sha256::new());
                self.pieces.push(Hash(piece.finalize().into()));
                self.filled = 0;
            }
        }
    }

    fn finish(mut self) -> Result<(Hash, u64, u64), Error> {
        if self.filled > 0 {
            self.pieces.push(Hash(self.piece.finalize().into()));
        }
        let hash = merkle_root(self.pieces);
        let counting = self.gz.finish()?;
        Ok((hash, self.uncompressed, counting.written))
    }
}

impl<W: io::Write> io::Write for UnitBody<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.gz.write_all(buf)?;
        self.absorb(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.gz.flush()
    }
}

/// Pairwise SHA-256 reduction; an odd node is promoted unchanged.
fn merkle_root(mut level: Vec<Hash>) -> Hash {
    if level.is_empty() {
        return Hash::ZERO;
    }
    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|pair| {
                if pair.len() == 2 {
                    let mut joined = [0u8; 64];
                    joined[..32].copy_from_slice(pair[0].as_bytes());
                    joined[32..].copy_from_slice(pair[1].as_bytes());
                    Hash::of(&joined)
                } else {
                    pair[0]
                }
            })
            .collect();
    }
    level[0]
}

/// Reads the next unit of a genesis file, verifying its hash and sizes.
/// Returns `None` on a clean end of file.
pub fn read_unit(reader: &mut impl io::Read) -> Result<Option<(String, Vec<u8>)>, Error> {
    let mut magic = [0u8; 4];
    if !read_or_end(reader, &mut magic)? {
        return Ok(None);
    }
    if magic != GENESIS_MAGIC {
        return Err(bad_file("genesis", "not a genesis unit"));
    }
    let mut meta = [0u8; 2];
    reader.read_exact(&mut meta)?;
    if meta[0] != GENESIS_VERSION {
        return Err(bad_file(
            "genesis",
            format!("unsupported version {}", meta[0]),
        ));
    }
    let mut name = vec![0u8; meta[1] as usize];
    reader.read_exact(&mut name)?;
    let name = String::from_utf8(name).map_err(|_| bad_file("genesis", "unit name not utf-8"))?;

    let mut hash = [0u8; 32];
    reader.read_exact(&mut hash)?;
    let mut sizes = [0u8; 16];
    reader.read_exact(&mut sizes)?;
    let uncompressed = u64::from_be_bytes(sizes[..8].try_into().unwrap());
    let compressed = u64::from_be_bytes(sizes[8..].try_into().unwrap());

    let mut body = vec![0u8; compressed as usize];
    reader.read_exact(&mut body)?;
    let mut raw = Vec::new();
    GzDecoder::new(body.as_slice()).read_to_end(&mut raw)?;
    if raw.len() as u64 != uncompressed {
        return Err(bad_file("genesis", "unit length mismatch"));
    }
    let pieces = raw
        .chunks(GENESIS_PIECE)
        .map(|piece| Hash::of(piece))
        .collect();
    if merkle_root(pieces) != Hash(hash) {
        return Err(bad_file("genesis", format!("unit {name} hash mismatch")));
    }
    Ok(Some((name, raw)))
}

/// Outcome of [check_evm].
#[derive(Debug, Default, PartialEq, Eq)]
pub struct EvmCheck {
    /// Blocks with their body present.
    pub blocks: u64,
    /// Receipts verified against those blocks.
    pub receipts: u64,
    /// Trie nodes visited while verifying the latest state root.
    pub state_nodes: usize,
    /// Inclusive ranges of pruned (absent) blocks.
    pub pruned: Vec<(BlockIndex, BlockIndex)>,
}

/// Walks every block from 1 to the latest and cross-checks the evm data
/// behind it. Pruned history is reported, not treated as damage; a
/// missing receipt for an applied transaction is.
pub fn check_evm(store: &GossipStore, evm: &EvmStore) -> Result<EvmCheck, Error> {
    let mut check = EvmCheck::default();
    let Some(latest) = store.latest_block_index()? else {
        return Ok(check);
    };
    let mut pruned_from: Option<u64> = None;
    let mut last_root = Hash::ZERO;
    for index in 1..=latest.get() {
        let Some(block) = store.block(BlockIndex::new(index))? else {
            pruned_from.get_or_insert(index);
            continue;
        };
        if let Some(from) = pruned_from.take() {
            info!("pruned fromBlock={from} toBlock={}", index - 1);
            check
                .pruned
                .push((BlockIndex::new(from), BlockIndex::new(index - 1)));
        }
        for (position, tx_hash) in block.tx_hashes.iter().enumerate() {
            if block.is_skipped(position) {
                continue;
            }
            if !evm.has_receipt(tx_hash)? {
                return Err(bad_file(
                    "evm",
                    format!("missing receipt for {tx_hash} in block {index}"),
                ));
            }
            check.receipts += 1;
        }
        last_root = block.state_root;
        check.blocks += 1;
    }
    // Cannot happen with the latest pointer maintained by put_block, but a
    // trailing run is still a reportable range.
    if let Some(from) = pruned_from.take() {
        info!("pruned fromBlock={from} toBlock={}", latest.get());
        check.pruned.push((BlockIndex::new(from), latest));
    }
    check.state_nodes = evm.check_state(&last_root)?;
    Ok(check)
}

fn bad_file(file: &'static str, reason: impl Into<String>) -> Error {
    Error::BadFile {
        file,
        reason: reason.into(),
    }
}
