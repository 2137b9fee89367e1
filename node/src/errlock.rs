//! The errlock fatal path.
//!
//! A fatal error writes its reason into `errlock` under the datadir and
//! the process exits. Subsequent starts refuse while the file exists, so
//! a crash into an inconsistent state never turns into a silent restart
//! loop. `db heal` releases the lock after recovery.

use crate::Error;
use std::path::{Path, PathBuf};
use tracing::error;

const ERRLOCK_FILE: &str = "errlock";

pub struct ErrLock {
    path: PathBuf,
}

impl ErrLock {
    pub fn new(datadir: &Path) -> Self {
        Self {
            path: datadir.join(ERRLOCK_FILE),
        }
    }

    /// Fails with [Error::Locked] while a previous fatal reason exists.
    pub fn check(&self) -> Result<(), Error> {
        match std::fs::read_to_string(&self.path) {
            Ok(reason) => Err(Error::Locked(reason.trim().to_string())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Records a fatal reason. Best effort: the node is about to stop
    /// either way, so a failing write only logs.
    pub fn engage(&self, reason: &str) {
        error!(%reason, "fatal; writing errlock");
        if let Err(err) = std::fs::write(&self.path, reason) {
            error!(%err, path = %self.path.display(), "failed to write errlock");
        }
    }

    /// Clears the lock after recovery.
    pub fn release(&self) -> Result<(), Error> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    pub fn engaged(&self) -> bool {
        self.path.exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engage_blocks_start_until_release() {
        let dir = tempfile::tempdir().unwrap();
        let lock = ErrLock::new(dir.path());
        lock.check().unwrap();
        assert!(!lock.engaged());

        lock.engage("store: corrupted flush id");
        assert!(lock.engaged());
        match lock.check() {
            Err(Error::Locked(reason)) => assert!(reason.contains("corrupted")),
            other => panic!("expected Locked, got {other:?}"),
        }
        // A second engage keeps the first reason readable.
        lock.engage("another failure");
        assert!(lock.engaged());

        lock.release().unwrap();
        lock.check().unwrap();
        // Releasing twice is fine.
        lock.release().unwrap();
    }
}
