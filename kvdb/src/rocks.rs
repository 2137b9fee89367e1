//! LSM backend over rocksdb.

use crate::{Batch, Error, Kv, KvIter, Op};
use rocksdb::{Direction, IteratorMode, Options, WriteBatch, DB};
use std::path::Path;

impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        Error::Backend(err.to_string())
    }
}

/// Tuning knobs for the LSM backend.
#[derive(Debug, Clone)]
pub struct RocksConfig {
    /// Memtable size in bytes.
    pub write_buffer_size: usize,
    /// LRU block cache size in bytes; `None` disables the cache.
    pub block_cache_size: Option<usize>,
    /// Bloom filter bits per key; `0.0` disables the filter.
    pub bloom_filter_bits: f64,
}

impl Default for RocksConfig {
    fn default() -> Self {
        Self {
            write_buffer_size: 64 << 20,
            block_cache_size: Some(128 << 20),
            bloom_filter_bits: 10.0,
        }
    }
}

/// An on-disk LSM key/value store.
pub struct Rocks {
    db: DB,
}

impl Rocks {
    /// Opens (or creates) a database at `path`.
    pub fn open(path: impl AsRef<Path>, config: &RocksConfig) -> Result<Self, Error> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_write_buffer_size(config.write_buffer_size);

        let mut block_opts = rocksdb::BlockBasedOptions::default();
        if let Some(cache_size) = config.block_cache_size {
            let cache = rocksdb::Cache::new_lru_cache(cache_size);
            block_opts.set_block_cache(&cache);
        }
        if config.bloom_filter_bits > 0.0 {
            block_opts.set_bloom_filter(config.bloom_filter_bits, false);
        }
        opts.set_block_based_table_factory(&block_opts);

        let db = DB::open(&opts, path)?;
        Ok(Self { db })
    }
}

impl Kv for Rocks {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, Error> {
        Ok(self.db.get(key)?)
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), Error> {
        Ok(self.db.put(key, value)?)
    }

    fn delete(&self, key: &[u8]) -> Result<(), Error> {
        Ok(self.db.delete(key)?)
    }

    fn write(&self, batch: Batch) -> Result<(), Error> {
        let mut inner = WriteBatch::default();
        for op in batch.into_ops() {
            match op {
                Op::Put(key, value) => inner.put(key, value),
                Op::Delete(key) => inner.delete(key),
            }
        }
        Ok(self.db.write(inner)?)
    }

    fn iterate(&self, prefix: &[u8], start: Option<&[u8]>) -> Result<KvIter<'_>, Error> {
        let from = start.unwrap_or(prefix).to_vec();
        let prefix = prefix.to_vec();
        let iter = self
            .db
            .iterator(IteratorMode::From(&from, Direction::Forward))
            .map(|item| item.map_err(Error::from))
            .take_while(move |item| match item {
                Ok((key, _)) => key.starts_with(&prefix),
                // Surface the error, then stop.
                Err(_) => true,
            });
        Ok(Box::new(iter))
    }

    fn compact(&self, from: Option<&[u8]>, to: Option<&[u8]>) -> Result<(), Error> {
        self.db.compact_range(from, to);
        Ok(())
    }

    fn sync(&self) -> Result<(), Error> {
        Ok(self.db.flush()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::check_kv_contract;

    #[test]
    fn test_contract() {
        let dir = tempfile::tempdir().unwrap();
        let kv = Rocks::open(dir.path(), &RocksConfig::default()).unwrap();
        check_kv_contract(&kv);
    }

    #[test]
    fn test_reopen_persists() {
        let dir = tempfile::tempdir().unwrap();
        {
            let kv = Rocks::open(dir.path(), &RocksConfig::default()).unwrap();
            kv.put(b"k", b"v").unwrap();
            kv.sync().unwrap();
        }
        let kv = Rocks::open(dir.path(), &RocksConfig::default()).unwrap();
        assert_eq!(kv.get(b"k").unwrap().unwrap(), b"v");
    }
}
