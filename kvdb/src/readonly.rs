//! Read-only wrapper.
//!
//! Used by export paths and `check evm`, where a stray write would corrupt
//! the store being inspected. Mutating operations fail with
//! [Error::UnsupportedOp].

use crate::{Batch, Error, Kv, KvIter, SharedKv};

/// A wrapper that rejects every mutating operation.
#[derive(Clone)]
pub struct ReadOnly {
    inner: SharedKv,
}

impl ReadOnly {
    /// Wraps `inner` read-only.
    pub fn new(inner: SharedKv) -> Self {
        Self { inner }
    }
}

impl Kv for ReadOnly {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, Error> {
        self.inner.get(key)
    }

    fn has(&self, key: &[u8]) -> Result<bool, Error> {
        self.inner.has(key)
    }

    fn put(&self, _key: &[u8], _value: &[u8]) -> Result<(), Error> {
        Err(Error::UnsupportedOp("put on read-only store"))
    }

    fn delete(&self, _key: &[u8]) -> Result<(), Error> {
        Err(Error::UnsupportedOp("delete on read-only store"))
    }

    fn write(&self, _batch: Batch) -> Result<(), Error> {
        Err(Error::UnsupportedOp("write on read-only store"))
    }

    fn iterate(&self, prefix: &[u8], start: Option<&[u8]>) -> Result<KvIter<'_>, Error> {
        self.inner.iterate(prefix, start)
    }

    fn compact(&self, _from: Option<&[u8]>, _to: Option<&[u8]>) -> Result<(), Error> {
        Err(Error::UnsupportedOp("compact on read-only store"))
    }

    fn sync(&self) -> Result<(), Error> {
        Err(Error::UnsupportedOp("sync on read-only store"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Memory;
    use std::sync::Arc;

    #[test]
    fn test_rejects_writes() {
        let inner = Arc::new(Memory::new());
        inner.put(b"k", b"v").unwrap();

        let ro = ReadOnly::new(inner);
        assert_eq!(ro.get(b"k").unwrap().unwrap(), b"v");
        assert!(matches!(ro.put(b"k", b"x"), Err(Error::UnsupportedOp(_))));
        assert!(matches!(ro.delete(b"k"), Err(Error::UnsupportedOp(_))));
        assert!(matches!(
            ro.write(Batch::new()),
            Err(Error::UnsupportedOp(_))
        ));
        // The underlying value is untouched.
        assert_eq!(ro.get(b"k").unwrap().unwrap(), b"v");
    }
}
