//! In-memory backend.
//!
//! Backs fakenet runs and tests. Iteration snapshots the matching range up
//! front, so an iterator never observes writes issued after its creation.

use crate::{Batch, Error, Kv, KvIter, Op};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

/// An ordered in-memory key/value store.
#[derive(Default)]
pub struct Memory {
    inner: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
    closed: AtomicBool,
}

impl Memory {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the store closed; subsequent operations fail with
    /// [Error::Closed].
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn ensure_open(&self) -> Result<(), Error> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        Ok(())
    }
}

impl Kv for Memory {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, Error> {
        self.ensure_open()?;
        Ok(self.inner.read().get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), Error> {
        self.ensure_open()?;
        self.inner.write().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<(), Error> {
        self.ensure_open()?;
        self.inner.write().remove(key);
        Ok(())
    }

    fn write(&self, batch: Batch) -> Result<(), Error> {
        self.ensure_open()?;
        let mut inner = self.inner.write();
        for op in batch.into_ops() {
            match op {
                Op::Put(key, value) => {
                    inner.insert(key, value);
                }
                Op::Delete(key) => {
                    inner.remove(&key);
                }
            }
        }
        Ok(())
    }

    fn iterate(&self, prefix: &[u8], start: Option<&[u8]>) -> Result<KvIter<'_>, Error> {
        self.ensure_open()?;
        let from = start.unwrap_or(prefix).to_vec();
        let prefix = prefix.to_vec();
        let pairs: Vec<_> = self
            .inner
            .read()
            .range(from..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .map(|(k, v)| (k.clone().into_boxed_slice(), v.clone().into_boxed_slice()))
            .collect();
        Ok(Box::new(pairs.into_iter().map(Ok)))
    }

    fn compact(&self, _from: Option<&[u8]>, _to: Option<&[u8]>) -> Result<(), Error> {
        self.ensure_open()
    }

    fn sync(&self) -> Result<(), Error> {
        self.ensure_open()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::check_kv_contract;

    #[test]
    fn test_contract() {
        check_kv_contract(&Memory::new());
    }

    #[test]
    fn test_closed() {
        let kv = Memory::new();
        kv.put(b"k", b"v").unwrap();
        kv.close();
        assert!(matches!(kv.get(b"k"), Err(Error::Closed)));
        assert!(matches!(kv.put(b"k", b"v"), Err(Error::Closed)));
        assert!(matches!(kv.iterate(b"", None).err(), Some(Error::Closed)));
    }

    #[test]
    fn test_iterator_snapshot() {
        let kv = Memory::new();
        kv.put(b"p/1", b"1").unwrap();
        let iter = kv.iterate(b"p/", None).unwrap();
        kv.put(b"p/2", b"2").unwrap();
        assert_eq!(iter.count(), 1);
    }
}
