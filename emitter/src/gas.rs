//! Validator gas-power accounting.
//!
//! Each validator holds a rolling allocation replenished by elapsed median
//! time and capped by the rules; every emitted event debits it. The
//! remaining allocation bounds the gas packed into the next event.

use moira_dag::chain::Rules;

const NANOS_PER_SEC: u128 = 1_000_000_000;

#[derive(Debug, Clone, Copy)]
pub struct GasPower {
    left: u64,
    last_refill: u64,
}

impl GasPower {
    /// A fresh allocation starting at the cap.
    pub fn new(rules: &Rules, now: u64) -> Self {
        Self {
            left: rules.max_gas_power,
            last_refill: now,
        }
    }

    pub fn left(&self) -> u64 {
        self.left
    }

    /// Replenishes for the time elapsed since the last refill. Time moving
    /// backwards replenishes nothing.
    pub fn refill(&mut self, rules: &Rules, now: u64) {
        let elapsed = u128::from(now.saturating_sub(self.last_refill));
        let gained = (elapsed * u128::from(rules.gas_power_per_sec) / NANOS_PER_SEC)
            .min(u128::from(u64::MAX)) as u64;
        self.left = self.left.saturating_add(gained).min(rules.max_gas_power);
        self.last_refill = self.last_refill.max(now);
    }

    /// Debits an emission. Returns false (leaving the balance untouched)
    /// when the allocation cannot cover it.
    pub fn debit(&mut self, gas: u64) -> bool {
        match self.left.checked_sub(gas) {
            Some(rest) => {
                self.left = rest;
                true
            }
            None => false,
        }
    }
}
