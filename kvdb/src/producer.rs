//! Flushable multi-database producer.
//!
//! The producer is the single authority over durability. Stores opened
//! through it buffer writes in memory ([crate::flushable::Flushable]);
//! [Producer::flush] commits everything with a two-pass protocol:
//!
//! 1. For every open database, the pending writes and a dirty-prefixed
//!    marker carrying the new flush-ID are applied in one atomic backend
//!    batch, then synced.
//! 2. Once every database holds its data, the markers are rewritten with
//!    the clean prefix and synced again.
//!
//! A crash anywhere in the middle leaves at least one database with a
//! stale or dirty marker. On startup every database found on disk is
//! inspected; unless all markers agree and carry the clean prefix, the
//! producer refuses to open ([crate::Error::Corrupted]) and the operator
//! must run the heal path.
//!
//! Handles are cached and reference-counted: `open` of an already-open
//! logical path returns a handle over the same underlying database, and
//! the database is released only when the last handle closes. A database
//! marked for drop is physically removed on its last close.

use crate::flushable::Flushable;
use crate::memory::Memory;
use crate::prefixed::Table;
use crate::rocks::{Rocks, RocksConfig};
use crate::routing::{
    BackendKind, Route, Router, FLUSH_ID_KEY, LAYOUT_KEY, LAYOUT_VERSION,
};
use crate::tree::Tree;
use crate::{Batch, Error, Kv, KvIter, SharedKv};
use parking_lot::Mutex;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

const CLEAN: u8 = 0x00;
const DIRTY: u8 = 0xFF;

/// Producer configuration.
#[derive(Debug, Clone)]
pub struct ProducerConfig {
    /// Flush is recommended once the unflushed estimate crosses this.
    pub flush_threshold: usize,
    pub rocks: RocksConfig,
    /// sled cache capacity in bytes.
    pub tree_cache: u64,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            flush_threshold: 8 << 20,
            rocks: RocksConfig::default(),
            tree_cache: 16 << 20,
        }
    }
}

/// Producer metrics.
#[derive(Default)]
struct Metrics {
    flushes: Counter,
    flushed_bytes: Counter,
    pending_bytes: Gauge,
}

struct DbEntry {
    flushable: Arc<Flushable>,
    refs: usize,
    dropped: bool,
    iterators: Arc<AtomicUsize>,
}

struct State {
    dbs: HashMap<String, DbEntry>,
    flush_id: u64,
}

struct Inner {
    base: Option<PathBuf>,
    router: Router,
    cfg: ProducerConfig,
    state: Mutex<State>,
    metrics: Metrics,
}

/// The flushable multi-database producer.
#[derive(Clone)]
pub struct Producer {
    inner: Arc<Inner>,
}

impl Producer {
    /// Opens a producer over `base`, inspecting every database found on
    /// disk per the startup recovery contract.
    pub fn open(
        base: impl AsRef<Path>,
        router: Router,
        cfg: ProducerConfig,
    ) -> Result<Self, Error> {
        Self::open_internal(Some(base.as_ref().to_path_buf()), router, cfg, true)
    }

    /// Opens a purely in-memory producer (fakenet and tests). The router's
    /// backends are overridden to memory.
    pub fn in_memory(router: Router, cfg: ProducerConfig) -> Self {
        Self::open_internal(None, router.in_memory(), cfg, true)
            .expect("in-memory producer cannot fail to open")
    }

    /// Opens without validating flush markers. Reserved for the heal and
    /// transform paths; regular startup must use [Producer::open].
    pub fn open_unchecked(
        base: impl AsRef<Path>,
        router: Router,
        cfg: ProducerConfig,
    ) -> Result<Self, Error> {
        Self::open_internal(Some(base.as_ref().to_path_buf()), router, cfg, false)
    }

    fn open_internal(
        base: Option<PathBuf>,
        router: Router,
        cfg: ProducerConfig,
        verify: bool,
    ) -> Result<Self, Error> {
        let mut dbs = HashMap::new();
        let mut flush_id = 0u64;
        if let Some(base) = &base {
            std::fs::create_dir_all(base)?;
            let mut seen_id: Option<(String, u64)> = None;
            for entry in std::fs::read_dir(base)? {
                let entry = entry?;
                if !entry.file_type()?.is_dir() {
                    continue;
                }
                let name = entry
                    .file_name()
                    .into_string()
                    .map_err(|name| Error::InvalidName(name.to_string_lossy().into_owned()))?;
                let kind = router.backend_for_db(&name).ok_or_else(|| {
                    Error::UnknownRoute(format!("on-disk database {name} matches no route"))
                })?;
                let backend = open_backend(kind, &entry.path(), &cfg)?;
                if verify {
                    let id = read_clean_marker(backend.as_ref(), &name)?;
                    check_layout(backend.as_ref(), &name)?;
                    match &seen_id {
                        Some((first, expected)) if *expected != id => {
                            return Err(Error::Corrupted(format!(
                                "flush-ID mismatch: {first} carries {expected}, {name} carries {id}"
                            )));
                        }
                        Some(_) => {}
                        None => seen_id = Some((name.clone(), id)),
                    }
                }
                dbs.insert(
                    name,
                    DbEntry {
                        flushable: Arc::new(Flushable::new(backend)),
                        refs: 0,
                        dropped: false,
                        iterators: Arc::new(AtomicUsize::new(0)),
                    },
                );
            }
            if let Some((_, id)) = seen_id {
                flush_id = id;
            }
            if verify && !dbs.is_empty() {
                info!(dbs = dbs.len(), flush_id, "opened database set");
            }
        }
        Ok(Self {
            inner: Arc::new(Inner {
                base,
                router,
                cfg,
                state: Mutex::new(State { dbs, flush_id }),
                metrics: Metrics::default(),
            }),
        })
    }

    /// Registers producer metrics.
    pub fn register_metrics(&self, registry: &mut Registry) {
        let registry = registry.sub_registry_with_prefix("kvdb");
        registry.register(
            "flushes",
            "Number of successful producer flushes",
            self.inner.metrics.flushes.clone(),
        );
        registry.register(
            "flushed_bytes",
            "Bytes committed by producer flushes",
            self.inner.metrics.flushed_bytes.clone(),
        );
        registry.register(
            "pending_bytes",
            "Estimated bytes buffered and not yet flushed",
            self.inner.metrics.pending_bytes.clone(),
        );
    }

    /// Opens (or re-opens) the store behind a logical table path.
    pub fn open_table(&self, logical: &str) -> Result<Store, Error> {
        let route = self.inner.router.resolve(logical)?;
        let mut state = self.inner.state.lock();
        let flush_id = state.flush_id;
        if !state.dbs.contains_key(&route.db) {
            let flushable = self.create_db(&route, flush_id)?;
            state.dbs.insert(
                route.db.clone(),
                DbEntry {
                    flushable,
                    refs: 0,
                    dropped: false,
                    iterators: Arc::new(AtomicUsize::new(0)),
                },
            );
        }
        let entry = state.dbs.get_mut(&route.db).expect("just inserted");
        if entry.dropped {
            return Err(Error::Closed);
        }
        entry.refs += 1;
        let flushable: SharedKv = entry.flushable.clone();
        Ok(Store {
            logical: logical.to_string(),
            db: route.db.clone(),
            table: Table::new(flushable, route.prefix),
            iterators: entry.iterators.clone(),
            closed: AtomicBool::new(false),
            inner: self.inner.clone(),
        })
    }

    fn create_db(&self, route: &Route, flush_id: u64) -> Result<Arc<Flushable>, Error> {
        let backend = match &self.inner.base {
            Some(base) => {
                let path = base.join(&route.db);
                debug!(db = %route.db, backend = ?route.backend, "creating database");
                open_backend(route.backend, &path, &self.inner.cfg)?
            }
            None => Arc::new(Memory::new()),
        };
        // Stamp fresh databases so the startup inspection accepts them.
        backend.put(&LAYOUT_KEY, &LAYOUT_VERSION.to_be_bytes())?;
        backend.put(&FLUSH_ID_KEY, &marker_value(CLEAN, flush_id))?;
        backend.sync()?;
        Ok(Arc::new(Flushable::new(backend)))
    }

    /// Estimated byte size of writes buffered across all open databases.
    pub fn not_flushed_size_est(&self) -> usize {
        let state = self.inner.state.lock();
        state
            .dbs
            .values()
            .map(|entry| entry.flushable.not_flushed_size_est())
            .sum()
    }

    /// Returns true if the unflushed estimate crossed the configured
    /// threshold.
    pub fn flush_needed(&self) -> bool {
        let est = self.not_flushed_size_est();
        self.inner.metrics.pending_bytes.set(est as i64);
        est > self.inner.cfg.flush_threshold
    }

    /// Commits all buffered writes to every open database and advances the
    /// flush-ID. Returns the new ID.
    pub fn flush(&self) -> Result<u64, Error> {
        let mut state = self.inner.state.lock();
        let next = state.flush_id + 1;
        let mut flushed_bytes = 0u64;

        // Pass 1: data plus dirty marker, atomically per database.
        for entry in state.dbs.values().filter(|entry| !entry.dropped) {
            let mut batch = entry.flushable.pending_batch();
            flushed_bytes += batch.size() as u64;
            batch.put(&FLUSH_ID_KEY, &marker_value(DIRTY, next));
            entry.flushable.backend().write(batch)?;
            entry.flushable.backend().sync()?;
        }

        // Pass 2: every database holds its data; mark the set clean.
        for entry in state.dbs.values().filter(|entry| !entry.dropped) {
            entry
                .flushable
                .backend()
                .put(&FLUSH_ID_KEY, &marker_value(CLEAN, next))?;
            entry.flushable.backend().sync()?;
            entry.flushable.clear_pending();
        }

        state.flush_id = next;
        self.inner.metrics.flushes.inc();
        self.inner.metrics.flushed_bytes.inc_by(flushed_bytes);
        self.inner.metrics.pending_bytes.set(0);
        debug!(flush_id = next, bytes = flushed_bytes, "flushed");
        Ok(next)
    }

    /// Rewrites clean markers carrying a fresh flush-ID into every open
    /// database. Part of the heal path, after the operator-visible
    /// inconsistency has been resolved.
    pub fn stamp_clean(&self) -> Result<u64, Error> {
        let mut state = self.inner.state.lock();
        let next = state.flush_id + 1;
        for entry in state.dbs.values() {
            entry
                .flushable
                .backend()
                .put(&FLUSH_ID_KEY, &marker_value(CLEAN, next))?;
            entry.flushable.backend().sync()?;
        }
        state.flush_id = next;
        Ok(next)
    }

    /// Marks a physical database for removal on its last close. Removes it
    /// immediately when no handles are open. Idempotent.
    pub fn drop_db(&self, db: &str) -> Result<(), Error> {
        let mut state = self.inner.state.lock();
        match state.dbs.get_mut(db) {
            Some(entry) => {
                entry.dropped = true;
                if entry.refs == 0 {
                    state.dbs.remove(db);
                    self.remove_files(db)?;
                }
            }
            None => self.remove_files(db)?,
        }
        Ok(())
    }

    /// Names of the physical databases currently known to the producer.
    pub fn db_names(&self) -> Vec<String> {
        let state = self.inner.state.lock();
        let mut names: Vec<_> = state.dbs.keys().cloned().collect();
        names.sort();
        names
    }

    /// Compacts every open database end to end.
    pub fn compact_all(&self) -> Result<(), Error> {
        let state = self.inner.state.lock();
        for (name, entry) in &state.dbs {
            debug!(db = %name, "compacting");
            entry.flushable.backend().compact(None, None)?;
        }
        Ok(())
    }

    /// Direct access to a physical database, bypassing routing. Reserved
    /// for the transform/heal paths.
    pub fn raw_db(&self, db: &str) -> Option<SharedKv> {
        let state = self.inner.state.lock();
        state.dbs.get(db).map(|entry| {
            let kv: SharedKv = entry.flushable.clone();
            kv
        })
    }

    fn remove_files(&self, db: &str) -> Result<(), Error> {
        if let Some(base) = &self.inner.base {
            let path = base.join(db);
            if path.exists() {
                info!(db, "removing database files");
                std::fs::remove_dir_all(path)?;
            }
        }
        Ok(())
    }

    fn release(&self, db: &str) -> Result<(), Error> {
        let mut state = self.inner.state.lock();
        let Some(entry) = state.dbs.get_mut(db) else {
            return Ok(());
        };
        entry.refs = entry.refs.saturating_sub(1);
        if entry.refs == 0 && entry.dropped {
            state.dbs.remove(db);
            drop(state);
            self.remove_files(db)?;
        }
        Ok(())
    }
}

fn open_backend(
    kind: BackendKind,
    path: &Path,
    cfg: &ProducerConfig,
) -> Result<SharedKv, Error> {
    Ok(match kind {
        BackendKind::Memory => Arc::new(Memory::new()),
        BackendKind::Rocks => Arc::new(Rocks::open(path, &cfg.rocks)?),
        BackendKind::Tree => Arc::new(Tree::open(path, cfg.tree_cache)?),
    })
}

fn marker_value(state: u8, id: u64) -> Vec<u8> {
    let mut value = Vec::with_capacity(9);
    value.push(state);
    value.extend_from_slice(&id.to_be_bytes());
    value
}

fn read_clean_marker(backend: &dyn Kv, name: &str) -> Result<u64, Error> {
    let Some(marker) = backend.get(&FLUSH_ID_KEY)? else {
        return Err(Error::Corrupted(format!("{name} is missing its flush-ID marker")));
    };
    if marker.len() != 9 {
        return Err(Error::Corrupted(format!("{name} carries a malformed flush-ID marker")));
    }
    let id = u64::from_be_bytes(marker[1..].try_into().unwrap());
    match marker[0] {
        CLEAN => Ok(id),
        DIRTY => Err(Error::Corrupted(format!(
            "{name} carries a dirty flush-ID marker ({id}): the last flush did not complete"
        ))),
        other => Err(Error::Corrupted(format!(
            "{name} carries an unknown flush-ID state byte {other:#04x}"
        ))),
    }
}

fn check_layout(backend: &dyn Kv, name: &str) -> Result<(), Error> {
    let Some(layout) = backend.get(&LAYOUT_KEY)? else {
        return Err(Error::Corrupted(format!("{name} is missing its layout marker")));
    };
    let disk = u32::from_be_bytes(
        layout
            .as_slice()
            .try_into()
            .map_err(|_| Error::Corrupted(format!("{name} carries a malformed layout marker")))?,
    );
    if disk != LAYOUT_VERSION {
        return Err(Error::LayoutMismatch {
            disk,
            expected: LAYOUT_VERSION,
        });
    }
    Ok(())
}

/// A handle to one logical table.
///
/// The handle buffers writes through the producer; nothing it writes is
/// durable until [Producer::flush]. Iterators are tracked so a close with
/// outstanding iterators reports a leak instead of returning cleanly.
pub struct Store {
    logical: String,
    db: String,
    table: Table,
    iterators: Arc<AtomicUsize>,
    closed: AtomicBool,
    inner: Arc<Inner>,
}

impl Store {
    /// The logical path this handle was opened with.
    pub fn logical(&self) -> &str {
        &self.logical
    }

    /// The physical database name backing this handle.
    pub fn db_name(&self) -> &str {
        &self.db
    }

    /// Releases this handle. Fails with [Error::Leaked] while iterators
    /// obtained from it are still alive; the reference is not released in
    /// that case.
    pub fn close(&self) -> Result<(), Error> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let outstanding = self.iterators.load(Ordering::SeqCst);
        if outstanding > 0 {
            self.closed.store(false, Ordering::SeqCst);
            return Err(Error::Leaked {
                db: self.db.clone(),
                count: outstanding,
            });
        }
        Producer {
            inner: self.inner.clone(),
        }
        .release(&self.db)
    }

    fn ensure_open(&self) -> Result<(), Error> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        Ok(())
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::SeqCst) {
            if let Err(err) = self.close() {
                warn!(db = %self.db, %err, "store dropped without close");
            }
        }
    }
}

impl Kv for Store {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, Error> {
        self.ensure_open()?;
        self.table.get(key)
    }

    fn has(&self, key: &[u8]) -> Result<bool, Error> {
        self.ensure_open()?;
        self.table.has(key)
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), Error> {
        self.ensure_open()?;
        self.table.put(key, value)
    }

    fn delete(&self, key: &[u8]) -> Result<(), Error> {
        self.ensure_open()?;
        self.table.delete(key)
    }

    fn write(&self, batch: Batch) -> Result<(), Error> {
        self.ensure_open()?;
        self.table.write(batch)
    }

    fn iterate(&self, prefix: &[u8], start: Option<&[u8]>) -> Result<KvIter<'_>, Error> {
        self.ensure_open()?;
        let inner = self.table.iterate(prefix, start)?;
        self.iterators.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(TrackedIter {
            inner,
            count: self.iterators.clone(),
        }))
    }

    fn compact(&self, from: Option<&[u8]>, to: Option<&[u8]>) -> Result<(), Error> {
        self.ensure_open()?;
        self.table.compact(from, to)
    }

    fn sync(&self) -> Result<(), Error> {
        self.ensure_open()?;
        self.table.sync()
    }
}

struct TrackedIter<'a> {
    inner: KvIter<'a>,
    count: Arc<AtomicUsize>,
}

impl Iterator for TrackedIter<'_> {
    type Item = Result<crate::KvPair, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }
}

impl Drop for TrackedIter<'_> {
    fn drop(&mut self) {
        self.count.fetch_sub(1, Ordering::SeqCst);
    }
}
