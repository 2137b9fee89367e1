//! Operator database commands behind `moira db`.
//!
//! These run against a stopped node. `heal` and `dump-sfc` are gated
//! behind `--experimental` at the CLI; both work on (or leave behind) a
//! database set that the regular startup path refuses.

use crate::{ErrLock, Error};
use moira_dag::types::{Epoch, Hash};
use moira_gossip::{EvmStore, GossipStore};
use moira_kvdb::producer::{Producer, ProducerConfig};
use moira_kvdb::rocks::Rocks;
use moira_kvdb::routing::{
    BackendKind, Router, FLUSH_ID_KEY, LAYOUT_KEY, LAYOUT_VERSION, RESERVED_PREFIX,
};
use moira_kvdb::tree::Tree;
use moira_kvdb::{Kv, SharedKv};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Key carrying resumable migration progress, in the reserved space next
/// to the flush-ID and layout markers.
const PROGRESS_KEY: [u8; 2] = [RESERVED_PREFIX, b'p'];

/// Bytes copied or indexed between progress checkpoints.
const BATCH_BYTES: usize = 8 << 20;

/// Suffix of the shadow directory a reformat copies into.
const REFORMAT_SUFFIX: &str = ".reformat";

/// Reports free bytes under a path; `None` disables the cutoff.
///
/// The standard library has no portable free-space query, so the default
/// probe reports `None` and operators wire a platform one if they want
/// the cutoff.
pub type DiskProbe = Arc<dyn Fn(&Path) -> Option<u64> + Send + Sync>;

pub fn disabled_probe() -> DiskProbe {
    Arc::new(|_| None)
}

fn ensure_free(probe: &DiskProbe, path: &Path, required: u64) -> Result<(), Error> {
    if required == 0 {
        return Ok(());
    }
    if let Some(available) = probe(path) {
        if available < required {
            return Err(Error::LowDisk {
                available,
                required,
            });
        }
    }
    Ok(())
}

/// Compacts every routed database end to end.
pub fn compact(datadir: &Path, router: Router, cfg: ProducerConfig) -> Result<Vec<String>, Error> {
    let producer = Producer::open(datadir, router, cfg)?;
    let names = producer.db_names();
    producer.compact_all()?;
    info!(dbs = names.len(), "compaction finished");
    Ok(names)
}

/// Outcome of [heal].
#[derive(Debug)]
pub struct HealReport {
    /// Highest epoch with a durable record; everything above it was
    /// reverted.
    pub sealed_epoch: Epoch,
    /// Partition databases dropped by the revert.
    pub dropped: Vec<String>,
    /// The fresh clean flush-ID stamped into every database.
    pub flush_id: u64,
}

/// Crash recovery: reverts to the last fully-sealed epoch, drops the
/// epoch-scoped databases above it, stamps clean flush markers, and
/// releases the errlock.
pub fn heal(datadir: &Path, router: Router, cfg: ProducerConfig) -> Result<HealReport, Error> {
    let producer = Producer::open_unchecked(datadir, router, cfg)?;

    let records = producer.open_table("gossip/R")?;
    let mut sealed = 0u32;
    for pair in records.iterate(&[], None)? {
        let (key, _) = pair?;
        if key.len() == 4 {
            sealed = sealed.max(u32::from_be_bytes([key[0], key[1], key[2], key[3]]));
        }
    }
    records.close()?;

    let mut dropped = Vec::new();
    for name in producer.db_names() {
        let Some(epoch) = partition_epoch(&name) else {
            continue;
        };
        if epoch > sealed {
            producer.drop_db(&name)?;
            dropped.push(name);
        }
    }
    let flush_id = producer.stamp_clean()?;
    ErrLock::new(datadir).release()?;
    info!(sealed, flush_id, dropped = dropped.len(), "heal finished");
    Ok(HealReport {
        sealed_epoch: Epoch::new(sealed),
        dropped,
        flush_id,
    })
}

fn partition_epoch(name: &str) -> Option<u32> {
    let (group, suffix) = name.rsplit_once('-')?;
    if group != "gossip" && group != "hashgraph" {
        return None;
    }
    suffix.parse().ok()
}

/// How [transform] migrates the database set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformMode {
    /// Copy every database carrying a stale layout version into a fresh
    /// one with the current layout.
    Reformat,
    /// Rebuild the derived per-epoch event indexes from the event table.
    Rebuild,
}

/// Outcome of [transform].
#[derive(Debug)]
pub struct TransformReport {
    pub mode: TransformMode,
    /// Databases migrated or rebuilt.
    pub touched: Vec<String>,
    /// Keys copied or events re-indexed.
    pub entries: u64,
}

/// Layout migration. Interrupting is safe: progress is checkpointed under
/// a reserved key and a rerun resumes where the last run stopped.
pub fn transform(
    datadir: &Path,
    router: Router,
    cfg: ProducerConfig,
    mode: TransformMode,
    probe: &DiskProbe,
    minfreedisk: u64,
) -> Result<TransformReport, Error> {
    match mode {
        TransformMode::Reformat => reformat(datadir, &router, &cfg, probe, minfreedisk),
        TransformMode::Rebuild => {
            let producer = Producer::open_unchecked(datadir, router, cfg)?;
            rebuild(datadir, &producer, probe, minfreedisk)
        }
    }
}

fn open_raw(kind: BackendKind, path: &Path, cfg: &ProducerConfig) -> Result<SharedKv, Error> {
    Ok(match kind {
        BackendKind::Memory => Arc::new(moira_kvdb::memory::Memory::new()),
        BackendKind::Rocks => Arc::new(Rocks::open(path, &cfg.rocks)?),
        BackendKind::Tree => Arc::new(Tree::open(path, cfg.tree_cache)?),
    })
}

fn reformat(
    datadir: &Path,
    router: &Router,
    cfg: &ProducerConfig,
    probe: &DiskProbe,
    minfreedisk: u64,
) -> Result<TransformReport, Error> {
    let mut report = TransformReport {
        mode: TransformMode::Reformat,
        touched: Vec::new(),
        entries: 0,
    };
    for entry in std::fs::read_dir(datadir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.ends_with(REFORMAT_SUFFIX) {
            continue; // shadow of an interrupted run, handled with its source
        }
        let Some(kind) = router.backend_for_db(&name) else {
            warn!(db = %name, "unroutable database, leaving untouched");
            continue;
        };
        let copied = reformat_db(datadir, &name, kind, cfg, probe, minfreedisk)?;
        if let Some(copied) = copied {
            report.entries += copied;
            report.touched.push(name);
        }
    }
    info!(
        dbs = report.touched.len(),
        keys = report.entries,
        "reformat finished"
    );
    Ok(report)
}

/// Migrates one database; returns `None` when its layout is current.
fn reformat_db(
    datadir: &Path,
    name: &str,
    kind: BackendKind,
    cfg: &ProducerConfig,
    probe: &DiskProbe,
    minfreedisk: u64,
) -> Result<Option<u64>, Error> {
    let source_path = datadir.join(name);
    let shadow_path = datadir.join(format!("{name}{REFORMAT_SUFFIX}"));
    let source = open_raw(kind, &source_path, cfg)?;

    let layout = match source.get(&LAYOUT_KEY)? {
        Some(raw) if raw.len() == 4 => u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]),
        _ => 0,
    };
    if layout == LAYOUT_VERSION {
        return Ok(None);
    }
    info!(db = %name, from = layout, to = LAYOUT_VERSION, "reformatting");

    let shadow = open_raw(kind, &shadow_path, cfg)?;
    let resume = shadow.get(&PROGRESS_KEY)?;
    let start = resume.as_deref().map(after_key);

    let mut copied = 0u64;
    let mut batch_bytes = 0usize;
    let mut last_key: Option<Box<[u8]>> = None;
    for pair in source.iterate(&[], start.as_deref())? {
        let (key, value) = pair?;
        if key.first() == Some(&RESERVED_PREFIX) {
            continue;
        }
        shadow.put(&key, &value)?;
        copied += 1;
        batch_bytes += key.len() + value.len();
        last_key = Some(key);
        if batch_bytes >= BATCH_BYTES {
            shadow.put(&PROGRESS_KEY, last_key.as_deref().unwrap_or(&[]))?;
            shadow.sync()?;
            ensure_free(probe, datadir, minfreedisk)?;
            batch_bytes = 0;
        }
    }

    // The marker set moves over verbatim; only the layout version changes.
    if let Some(marker) = source.get(&FLUSH_ID_KEY)? {
        shadow.put(&FLUSH_ID_KEY, &marker)?;
    }
    shadow.put(&LAYOUT_KEY, &LAYOUT_VERSION.to_be_bytes())?;
    shadow.delete(&PROGRESS_KEY)?;
    shadow.sync()?;

    drop(source);
    drop(shadow);
    std::fs::remove_dir_all(&source_path)?;
    std::fs::rename(&shadow_path, &source_path)?;
    Ok(Some(copied))
}

/// The first key strictly after `key` in byte order.
fn after_key(key: &[u8]) -> Vec<u8> {
    let mut next = key.to_vec();
    next.push(0);
    next
}

fn rebuild(
    datadir: &Path,
    producer: &Producer,
    probe: &DiskProbe,
    minfreedisk: u64,
) -> Result<TransformReport, Error> {
    let main = producer
        .raw_db("main")
        .ok_or_else(|| Error::BadFile {
            file: "transform",
            reason: "no main database to rebuild from".to_string(),
        })?;
    let resume = main.get(&PROGRESS_KEY)?;
    let start = resume.as_deref().map(after_key);

    let events = producer.open_table("gossip/E")?;
    let mut indexes: HashMap<u32, moira_kvdb::producer::Store> = HashMap::new();
    let mut indexed = 0u64;
    let mut batch_bytes = 0usize;
    let mut last_key: Option<Box<[u8]>> = None;
    for pair in events.iterate(&[], start.as_deref())? {
        let (key, value) = pair?;
        if key.len() != 32 {
            continue;
        }
        let epoch = u32::from_be_bytes([key[0], key[1], key[2], key[3]]);
        if !indexes.contains_key(&epoch) {
            indexes.insert(epoch, producer.open_table(&format!("gossip-{epoch}/E"))?);
        }
        indexes[&epoch].put(&key, &[])?;
        indexed += 1;
        batch_bytes += key.len() + value.len();
        last_key = Some(key);
        if batch_bytes >= BATCH_BYTES {
            main.put(&PROGRESS_KEY, last_key.as_deref().unwrap_or(&[]))?;
            producer.flush()?;
            ensure_free(probe, datadir, minfreedisk)?;
            batch_bytes = 0;
        }
    }
    main.delete(&PROGRESS_KEY)?;
    producer.flush()?;
    let touched: Vec<String> = indexes.keys().map(|e| format!("gossip-{e}")).collect();
    drop(events);
    drop(indexes);
    producer.stamp_clean()?;
    info!(events = indexed, epochs = touched.len(), "rebuild finished");
    Ok(TransformReport {
        mode: TransformMode::Rebuild,
        touched,
        entries: indexed,
    })
}

/// Outcome of [dump_sfc].
#[derive(Debug)]
pub struct DumpReport {
    /// State root the dump walked.
    pub root: Hash,
    /// Trie nodes rewritten and verified in the auxiliary table.
    pub nodes: usize,
}

/// Walks the state behind the latest block, rewrites it into a dedicated
/// auxiliary table, and verifies the root is fully reproducible there.
///
/// The auxiliary table is outside the node's layout, so the database set
/// is left requiring a heal before the node may start again.
pub fn dump_sfc(datadir: &Path, router: Router, cfg: ProducerConfig) -> Result<DumpReport, Error> {
    let producer = Producer::open(datadir, router, cfg)?;
    let store = GossipStore::open(&producer)?;
    let evm = EvmStore::open(&producer)?;

    let root = match store.latest_block_index()? {
        Some(latest) => match store.block(latest)? {
            Some(block) => block.state_root,
            None => Hash::ZERO,
        },
        None => Hash::ZERO,
    };
    let target: SharedKv = Arc::new(producer.open_table("evm/S")?);
    let nodes = evm.dump_state(&root, target)?;
    producer.flush()?;
    info!(%root, nodes, "state dump verified");
    ErrLock::new(datadir).engage(
        "db dump-sfc left an auxiliary state table; run `moira db heal --experimental`",
    );
    Ok(DumpReport { root, nodes })
}

/// Shadow directories left behind by an interrupted reformat, if any.
pub fn stale_shadows(datadir: &Path) -> Result<Vec<PathBuf>, Error> {
    let mut shadows = Vec::new();
    for entry in std::fs::read_dir(datadir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir()
            && entry.file_name().to_string_lossy().ends_with(REFORMAT_SUFFIX)
        {
            shadows.push(entry.path());
        }
    }
    Ok(shadows)
}
