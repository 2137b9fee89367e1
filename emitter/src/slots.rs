//! Emission slot timing and congestion back-off.

use rand::Rng;
use std::time::Duration;

/// Slot timing and the pending-gas back-off tiers.
#[derive(Debug, Clone)]
pub struct SlotConfig {
    /// Base interval between emissions.
    pub min_interval: Duration,
    /// Interval used when there is nothing of our own to send but
    /// someone else's transactions await confirmation.
    pub confirming_interval: Duration,
    /// Pending gas above which throughput halves.
    pub limited_tps_threshold: u64,
    /// Pending gas above which events stop packing transactions.
    pub no_txs_threshold: u64,
    /// Pending gas above which emission halts entirely.
    pub emergency_threshold: u64,
}

impl Default for SlotConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(500),
            confirming_interval: Duration::from_millis(1_000),
            limited_tps_threshold: 100_000_000,
            no_txs_threshold: 300_000_000,
            emergency_threshold: 1_000_000_000,
        }
    }
}

/// Congestion tier derived from the DAG's unconfirmed gas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Throttle {
    Normal,
    /// Double the slot interval.
    Halved,
    /// Emit, but without transactions.
    NoTxs,
    /// Do not emit.
    Halt,
}

pub fn throttle(config: &SlotConfig, pending_gas: u64) -> Throttle {
    if pending_gas > config.emergency_threshold {
        Throttle::Halt
    } else if pending_gas > config.no_txs_threshold {
        Throttle::NoTxs
    } else if pending_gas > config.limited_tps_threshold {
        Throttle::Halved
    } else {
        Throttle::Normal
    }
}

/// Computes the sleep until the next emission slot. `None` means emission
/// is halted and the caller should re-check after `min_interval`.
pub fn next_interval(
    config: &SlotConfig,
    throttle: Throttle,
    own_txs: bool,
    txs_to_confirm: bool,
    rng: &mut impl Rng,
) -> Option<Duration> {
    if throttle == Throttle::Halt {
        return None;
    }
    let mut base = if !own_txs && txs_to_confirm {
        config.confirming_interval
    } else {
        config.min_interval
    };
    if throttle == Throttle::Halved {
        base *= 2;
    }
    // Up to 10% jitter desynchronizes validators with equal configs.
    let jitter = rng.gen_range(0..=base.as_nanos() as u64 / 10);
    Some(base + Duration::from_nanos(jitter))
}
