//! Write-buffering store wrapper.
//!
//! A [Flushable] absorbs puts and deletes into an in-memory overlay and
//! serves reads through it, so callers observe their own writes
//! immediately. Nothing reaches the backend until the producer drains the
//! overlay into a single atomic batch at flush time. The overlay also
//! feeds `not_flushed_size_est`, which the producer uses to decide when a
//! flush is due.

use crate::{Batch, Error, Kv, KvIter, Op, SharedKv};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A store whose writes are buffered in memory until flushed.
pub struct Flushable {
    backend: SharedKv,
    /// Pending writes; `None` marks a delete.
    pending: RwLock<BTreeMap<Vec<u8>, Option<Vec<u8>>>>,
    pending_size: AtomicUsize,
}

impl Flushable {
    /// Wraps `backend` with an empty overlay.
    pub fn new(backend: SharedKv) -> Self {
        Self {
            backend,
            pending: RwLock::new(BTreeMap::new()),
            pending_size: AtomicUsize::new(0),
        }
    }

    /// The wrapped backend.
    pub fn backend(&self) -> &SharedKv {
        &self.backend
    }

    /// Estimated byte size of writes not yet flushed.
    pub fn not_flushed_size_est(&self) -> usize {
        self.pending_size.load(Ordering::Relaxed)
    }

    /// Snapshots the overlay as a batch, without clearing it.
    ///
    /// The producer appends its flush marker to this batch so data and
    /// marker land in one atomic backend write.
    pub fn pending_batch(&self) -> Batch {
        let pending = self.pending.read();
        let mut batch = Batch::new();
        for (key, value) in pending.iter() {
            match value {
                Some(value) => batch.put(key, value),
                None => batch.delete(key),
            }
        }
        batch
    }

    /// Discards the overlay after a successful flush.
    pub fn clear_pending(&self) {
        self.pending.write().clear();
        self.pending_size.store(0, Ordering::Relaxed);
    }

    fn record(&self, key: Vec<u8>, value: Option<Vec<u8>>) {
        let delta = key.len() + value.as_ref().map_or(0, |v| v.len());
        self.pending_size.fetch_add(delta, Ordering::Relaxed);
        self.pending.write().insert(key, value);
    }
}

impl Kv for Flushable {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, Error> {
        if let Some(value) = self.pending.read().get(key) {
            return Ok(value.clone());
        }
        self.backend.get(key)
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), Error> {
        self.record(key.to_vec(), Some(value.to_vec()));
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<(), Error> {
        self.record(key.to_vec(), None);
        Ok(())
    }

    fn write(&self, batch: Batch) -> Result<(), Error> {
        for op in batch.into_ops() {
            match op {
                Op::Put(key, value) => self.record(key, Some(value)),
                Op::Delete(key) => self.record(key, None),
            }
        }
        Ok(())
    }

    fn iterate(&self, prefix: &[u8], start: Option<&[u8]>) -> Result<KvIter<'_>, Error> {
        let from = start.unwrap_or(prefix);
        let overlay: Vec<(Vec<u8>, Option<Vec<u8>>)> = self
            .pending
            .read()
            .range(from.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let backend = self.backend.iterate(prefix, start)?;
        Ok(Box::new(MergeIter {
            overlay: overlay.into_iter().peekable(),
            backend: backend.peekable(),
        }))
    }

    fn compact(&self, from: Option<&[u8]>, to: Option<&[u8]>) -> Result<(), Error> {
        self.backend.compact(from, to)
    }

    fn sync(&self) -> Result<(), Error> {
        self.backend.sync()
    }
}

/// Merges the overlay with the backend iterator; on key collision the
/// overlay wins and overlay deletes suppress backend pairs.
struct MergeIter<'a> {
    overlay: std::iter::Peekable<std::vec::IntoIter<(Vec<u8>, Option<Vec<u8>>)>>,
    backend: std::iter::Peekable<KvIter<'a>>,
}

impl Iterator for MergeIter<'_> {
    type Item = Result<crate::KvPair, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            // Pick the smaller key; errors from the backend pass through.
            let side = match (self.overlay.peek(), self.backend.peek()) {
                (None, None) => return None,
                (Some(_), None) => Side::Overlay,
                (None, Some(_)) => Side::Backend,
                (Some((ok, _)), Some(Ok((bk, _)))) => match ok.as_slice().cmp(bk.as_ref()) {
                    std::cmp::Ordering::Less => Side::Overlay,
                    std::cmp::Ordering::Greater => Side::Backend,
                    std::cmp::Ordering::Equal => Side::Both,
                },
                (Some(_), Some(Err(_))) => Side::Backend,
            };
            match side {
                Side::Backend => return self.backend.next(),
                Side::Overlay | Side::Both => {
                    if matches!(side, Side::Both) {
                        self.backend.next();
                    }
                    let (key, value) = self.overlay.next().unwrap();
                    match value {
                        Some(value) => {
                            return Some(Ok((
                                key.into_boxed_slice(),
                                value.into_boxed_slice(),
                            )))
                        }
                        // Deleted in the overlay: skip.
                        None => continue,
                    }
                }
            }
        }
    }
}

enum Side {
    Overlay,
    Backend,
    Both,
}
