//! Table view over a shared database.
//!
//! A [Table] confines a caller to the key space under a fixed prefix,
//! letting many logical tables share one physical database. Keys yielded by
//! iteration have the prefix stripped, so a table is indistinguishable from
//! a dedicated database.

use crate::{Batch, Error, Kv, KvIter, SharedKv};

/// A prefix-scoped view of a shared database.
#[derive(Clone)]
pub struct Table {
    inner: SharedKv,
    prefix: Vec<u8>,
}

impl Table {
    /// Creates a view of `inner` scoped to `prefix`.
    pub fn new(inner: SharedKv, prefix: Vec<u8>) -> Self {
        Self { inner, prefix }
    }

    fn full_key(&self, key: &[u8]) -> Vec<u8> {
        let mut full = Vec::with_capacity(self.prefix.len() + key.len());
        full.extend_from_slice(&self.prefix);
        full.extend_from_slice(key);
        full
    }
}

impl Kv for Table {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, Error> {
        self.inner.get(&self.full_key(key))
    }

    fn has(&self, key: &[u8]) -> Result<bool, Error> {
        self.inner.has(&self.full_key(key))
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), Error> {
        self.inner.put(&self.full_key(key), value)
    }

    fn delete(&self, key: &[u8]) -> Result<(), Error> {
        self.inner.delete(&self.full_key(key))
    }

    fn write(&self, batch: Batch) -> Result<(), Error> {
        let mut rewritten = Batch::new();
        for op in batch.into_ops() {
            match op {
                crate::Op::Put(key, value) => rewritten.put(&self.full_key(&key), &value),
                crate::Op::Delete(key) => rewritten.delete(&self.full_key(&key)),
            }
        }
        self.inner.write(rewritten)
    }

    fn iterate(&self, prefix: &[u8], start: Option<&[u8]>) -> Result<KvIter<'_>, Error> {
        let full_prefix = self.full_key(prefix);
        let full_start = start.map(|s| self.full_key(s));
        let strip = self.prefix.len();
        let iter = self
            .inner
            .iterate(&full_prefix, full_start.as_deref())?
            .map(move |item| {
                item.map(|(k, v)| (k[strip..].to_vec().into_boxed_slice(), v))
            });
        Ok(Box::new(iter))
    }

    fn compact(&self, from: Option<&[u8]>, to: Option<&[u8]>) -> Result<(), Error> {
        let from = Some(self.full_key(from.unwrap_or_default()));
        // An open upper bound within the table is the prefix's successor.
        let to = match to {
            Some(to) => Some(self.full_key(to)),
            None => key_successor(&self.prefix),
        };
        self.inner.compact(from.as_deref(), to.as_deref())
    }

    fn sync(&self) -> Result<(), Error> {
        self.inner.sync()
    }
}

/// Returns the smallest key strictly greater than every key starting with
/// `prefix`, or `None` if no such key exists (all-0xFF prefix).
pub fn key_successor(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut succ = prefix.to_vec();
    while let Some(last) = succ.last_mut() {
        if *last < 0xFF {
            *last += 1;
            return Some(succ);
        }
        succ.pop();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Memory;
    use std::sync::Arc;

    #[test]
    fn test_scoping() {
        let shared: SharedKv = Arc::new(Memory::new());
        let t1 = Table::new(shared.clone(), vec![b'1']);
        let t2 = Table::new(shared.clone(), vec![b'2']);

        t1.put(b"k", b"one").unwrap();
        t2.put(b"k", b"two").unwrap();
        assert_eq!(t1.get(b"k").unwrap().unwrap(), b"one");
        assert_eq!(t2.get(b"k").unwrap().unwrap(), b"two");

        // Iteration strips the prefix and stays within the table.
        let pairs: Vec<_> = t1.iterate(b"", None).unwrap().map(|r| r.unwrap()).collect();
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].0.as_ref(), b"k");
    }

    #[test]
    fn test_contract() {
        let shared: SharedKv = Arc::new(Memory::new());
        let table = Table::new(shared, vec![0xAB]);
        crate::test_util::check_kv_contract(&table);
    }

    #[test]
    fn test_key_successor() {
        assert_eq!(key_successor(b"ab").unwrap(), b"ac");
        assert_eq!(key_successor(&[0x01, 0xFF]).unwrap(), vec![0x02]);
        assert_eq!(key_successor(&[0xFF, 0xFF]), None);
    }
}
