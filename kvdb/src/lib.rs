//! Multi-backend flushable key/value substrate.
//!
//! The substrate layers three concerns on top of raw ordered key/value
//! engines:
//!
//! 1. **Backends** ([memory], [rocks], [tree]) expose the uniform [Kv]
//!    trait over an in-memory map, an LSM engine (rocksdb), and a
//!    B-tree/LSM hybrid (sled).
//! 2. **Routing** ([routing]) maps logical table paths (`gossip/E`,
//!    `hashgraph-<epoch>`, `evm/M`) to a (backend, physical database,
//!    in-database key prefix) triple, with a versioned on-disk layout
//!    marker.
//! 3. **The producer** ([producer]) caches reference-counted database
//!    handles, buffers writes in memory ([flushable]), and commits them to
//!    every opened database with a flush-ID protocol that makes a crash
//!    mid-commit detectable on the next startup.
//!
//! Writes issued through a producer handle are NOT durable until
//! [producer::Producer::flush] returns. The atomicity unit is the producer,
//! never a single database: either every database carries the new clean
//! flush-ID, or startup refuses with [Error::Corrupted].

mod error;
pub use error::Error;

pub mod compactor;
pub mod flushable;
pub mod memory;
pub mod prefixed;
pub mod producer;
pub mod readonly;
pub mod rocks;
pub mod routing;
pub mod tree;

use std::sync::Arc;

/// A key/value pair yielded by iteration.
pub type KvPair = (Box<[u8]>, Box<[u8]>);

/// A boxed iterator over key/value pairs in ascending key order.
pub type KvIter<'a> = Box<dyn Iterator<Item = Result<KvPair, Error>> + 'a>;

/// A batch of writes applied atomically to one backend.
#[derive(Default, Debug, Clone)]
pub struct Batch {
    ops: Vec<Op>,
    size: usize,
}

#[derive(Debug, Clone)]
pub(crate) enum Op {
    Put(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
}

impl Batch {
    /// Creates an empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stages a put.
    pub fn put(&mut self, key: &[u8], value: &[u8]) {
        self.size += key.len() + value.len();
        self.ops.push(Op::Put(key.to_vec(), value.to_vec()));
    }

    /// Stages a delete.
    pub fn delete(&mut self, key: &[u8]) {
        self.size += key.len();
        self.ops.push(Op::Delete(key.to_vec()));
    }

    /// Estimated byte size of the staged operations.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of staged operations.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Returns true if no operations are staged.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub(crate) fn into_ops(self) -> Vec<Op> {
        self.ops
    }
}

/// Uniform interface over an ordered key/value engine.
///
/// All implementations are safe for concurrent use; writes are atomic per
/// call (and per [Kv::write] batch) but carry no durability promise beyond
/// what the backend provides. Durability across the whole store set is the
/// producer's job.
pub trait Kv: Send + Sync {
    /// Returns the value stored under `key`, if any.
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, Error>;

    /// Returns true if `key` is present.
    fn has(&self, key: &[u8]) -> Result<bool, Error> {
        Ok(self.get(key)?.is_some())
    }

    /// Stores `value` under `key`.
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), Error>;

    /// Removes `key` if present.
    fn delete(&self, key: &[u8]) -> Result<(), Error>;

    /// Applies a batch atomically.
    fn write(&self, batch: Batch) -> Result<(), Error>;

    /// Iterates pairs whose keys start with `prefix`, beginning at
    /// `start` (relative full key) when provided, in ascending key order.
    fn iterate(&self, prefix: &[u8], start: Option<&[u8]>) -> Result<KvIter<'_>, Error>;

    /// Compacts the given key range (`None` bounds mean open-ended). A
    /// backend without explicit compaction treats this as a no-op.
    fn compact(&self, from: Option<&[u8]>, to: Option<&[u8]>) -> Result<(), Error>;

    /// Flushes backend-internal buffers to stable storage.
    fn sync(&self) -> Result<(), Error>;
}

/// A shareable store handle.
pub type SharedKv = Arc<dyn Kv>;

/// Injected handler for unrecoverable errors.
///
/// Production wires this to the errlock path; tests wire a capturing
/// handler. See the node crate.
pub type FatalHandler = Arc<dyn Fn(&Error) + Send + Sync>;

#[cfg(test)]
pub(crate) mod test_util {
    use super::*;

    /// Exercises the common [Kv] contract against any backend.
    pub fn check_kv_contract(kv: &dyn Kv) {
        // Missing key
        assert!(kv.get(b"absent").unwrap().is_none());
        assert!(!kv.has(b"absent").unwrap());

        // Put / get / delete
        kv.put(b"k1", b"v1").unwrap();
        assert_eq!(kv.get(b"k1").unwrap().unwrap(), b"v1");
        kv.delete(b"k1").unwrap();
        assert!(kv.get(b"k1").unwrap().is_none());

        // Batch is atomic and ordered
        let mut batch = Batch::new();
        batch.put(b"a/1", b"1");
        batch.put(b"a/2", b"2");
        batch.put(b"b/1", b"3");
        batch.put(b"a/2", b"2b");
        batch.delete(b"a/1");
        kv.write(batch).unwrap();
        assert!(kv.get(b"a/1").unwrap().is_none());
        assert_eq!(kv.get(b"a/2").unwrap().unwrap(), b"2b");

        // Prefix iteration in ascending order
        kv.put(b"a/0", b"0").unwrap();
        let pairs: Vec<_> = kv
            .iterate(b"a/", None)
            .unwrap()
            .map(|r| r.unwrap())
            .collect();
        let keys: Vec<&[u8]> = pairs.iter().map(|(k, _)| k.as_ref()).collect();
        assert_eq!(keys, vec![&b"a/0"[..], &b"a/2"[..]]);

        // Iteration from a start key
        let pairs: Vec<_> = kv
            .iterate(b"a/", Some(b"a/1"))
            .unwrap()
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].0.as_ref(), b"a/2");

        // Compaction never fails the contract
        kv.compact(None, None).unwrap();
        assert_eq!(kv.get(b"a/2").unwrap().unwrap(), b"2b");
    }
}
