//! B-tree/LSM hybrid backend over sled.

use crate::{Batch, Error, Kv, KvIter, Op};
use std::path::Path;

impl From<sled::Error> for Error {
    fn from(err: sled::Error) -> Self {
        Error::Backend(err.to_string())
    }
}

/// An on-disk Bw-tree key/value store.
pub struct Tree {
    db: sled::Db,
}

impl Tree {
    /// Opens (or creates) a database at `path`.
    pub fn open(path: impl AsRef<Path>, cache_capacity: u64) -> Result<Self, Error> {
        let db = sled::Config::new()
            .path(path)
            .cache_capacity(cache_capacity)
            .open()?;
        Ok(Self { db })
    }
}

impl Kv for Tree {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, Error> {
        Ok(self.db.get(key)?.map(|v| v.to_vec()))
    }

    fn has(&self, key: &[u8]) -> Result<bool, Error> {
        Ok(self.db.contains_key(key)?)
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), Error> {
        self.db.insert(key, value)?;
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<(), Error> {
        self.db.remove(key)?;
        Ok(())
    }

    fn write(&self, batch: Batch) -> Result<(), Error> {
        let mut inner = sled::Batch::default();
        for op in batch.into_ops() {
            match op {
                Op::Put(key, value) => inner.insert(key, value),
                Op::Delete(key) => inner.remove(key),
            }
        }
        self.db.apply_batch(inner)?;
        Ok(())
    }

    fn iterate(&self, prefix: &[u8], start: Option<&[u8]>) -> Result<KvIter<'_>, Error> {
        let from = start.unwrap_or(prefix).to_vec();
        let prefix = prefix.to_vec();
        let iter = self
            .db
            .range(from..)
            .map(|item| {
                item.map(|(k, v)| {
                    (
                        k.to_vec().into_boxed_slice(),
                        v.to_vec().into_boxed_slice(),
                    )
                })
                .map_err(Error::from)
            })
            .take_while(move |item| match item {
                Ok((key, _)) => key.starts_with(&prefix),
                Err(_) => true,
            });
        Ok(Box::new(iter))
    }

    fn compact(&self, _from: Option<&[u8]>, _to: Option<&[u8]>) -> Result<(), Error> {
        // sled compacts continuously; there is no explicit range compaction.
        Ok(())
    }

    fn sync(&self) -> Result<(), Error> {
        self.db.flush()?;
        Ok(())
    }
}
