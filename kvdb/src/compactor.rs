//! Range-tracking auto-compactor.
//!
//! Backends with high read amplification benefit from compacting key
//! ranges that were recently written or deleted in bulk (epoch drops,
//! imports). The compactor tracks the covering range of such writes and,
//! on [Compactor::tick], compacts either that range (fine threshold) or
//! the whole database (coarse threshold). A failed compaction degrades the
//! compactor to a no-op: writes are never blocked on compaction.

use crate::{Error, Kv, SharedKv};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::warn;

/// Compaction thresholds in estimated bytes.
#[derive(Debug, Clone, Copy)]
pub struct Thresholds {
    /// Compact the tracked range once it crosses this.
    pub fine: usize,
    /// Compact the whole database once it crosses this.
    pub coarse: usize,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            fine: 32 << 20,
            coarse: 256 << 20,
        }
    }
}

#[derive(Default)]
struct Tracked {
    min: Option<Vec<u8>>,
    max: Option<Vec<u8>>,
    bytes: usize,
}

/// Tracks bulk writes against one database and compacts when warranted.
pub struct Compactor {
    kv: SharedKv,
    thresholds: Thresholds,
    tracked: Mutex<Tracked>,
    degraded: AtomicBool,
}

impl Compactor {
    pub fn new(kv: SharedKv, thresholds: Thresholds) -> Self {
        Self {
            kv,
            thresholds,
            tracked: Mutex::new(Tracked::default()),
            degraded: AtomicBool::new(false),
        }
    }

    /// Records a write or delete of `size` estimated bytes at `key`.
    pub fn note(&self, key: &[u8], size: usize) {
        if self.degraded.load(Ordering::Relaxed) {
            return;
        }
        let mut tracked = self.tracked.lock();
        tracked.bytes += size;
        if tracked.min.as_deref().is_none_or(|min| key < min) {
            tracked.min = Some(key.to_vec());
        }
        if tracked.max.as_deref().is_none_or(|max| key > max) {
            tracked.max = Some(key.to_vec());
        }
    }

    /// Returns true if the compactor has degraded to a no-op.
    pub fn degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    /// Compacts if a threshold has been crossed. Called from a background
    /// task; never propagates compaction errors.
    pub fn tick(&self) {
        if self.degraded.load(Ordering::Relaxed) {
            return;
        }
        let tracked = {
            let mut guard = self.tracked.lock();
            if guard.bytes < self.thresholds.fine {
                return;
            }
            std::mem::take(&mut *guard)
        };
        let result = if tracked.bytes >= self.thresholds.coarse {
            self.kv.compact(None, None)
        } else {
            self.kv
                .compact(tracked.min.as_deref(), tracked.max.as_deref())
        };
        if let Err(err) = result {
            warn!(%err, "auto-compaction failed: degrading to no-op");
            self.degraded.store(true, Ordering::Relaxed);
        }
    }
}
