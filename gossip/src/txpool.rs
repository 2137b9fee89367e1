//! The transaction pool.
//!
//! Transactions queue per sender in nonce order and leave the pool when a
//! receipt confirms them. Selection for an event respects the per-address
//! cap and a gas budget, and marks picked transactions in-flight so the
//! next event does not re-pack them.

use crate::Error;
use moira_dag::event::Transaction;
use moira_dag::types::{Address, Hash};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::debug;

/// A pooled transaction plus an optional completion callback, invoked with
/// the receipt once the transaction is confirmed in a block.
pub struct TxDesc {
    pub tx: Transaction,
    pub callback: Option<Box<dyn FnOnce(&moira_dag::chain::Receipt) + Send>>,
}

impl TxDesc {
    pub fn new(tx: Transaction) -> Self {
        Self { tx, callback: None }
    }
}

#[derive(Default)]
struct PoolInner {
    /// Per-sender queues keyed by nonce.
    by_sender: HashMap<Address, BTreeMap<u64, TxDesc>>,
    /// Hash to queue position, for confirmation lookup.
    by_hash: HashMap<Hash, (Address, u64)>,
    /// Transactions handed to the emitter but not yet confirmed.
    in_flight: HashSet<Hash>,
    len: usize,
}

/// Shared, thread-safe transaction pool.
pub struct TxPool {
    inner: Mutex<PoolInner>,
    capacity: usize,
}

impl TxPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(PoolInner::default()),
            capacity,
        }
    }

    /// Queues a transaction. A transaction with the same sender and nonce
    /// replaces the queued one.
    pub fn add(&self, desc: TxDesc) -> Result<(), Error> {
        let mut inner = self.inner.lock();
        let sender = desc.tx.sender;
        let nonce = desc.tx.nonce;
        let hash = desc.tx.hash();
        if inner.len >= self.capacity && !inner.contains_slot(&sender, nonce) {
            return Err(Error::PoolFull(self.capacity));
        }
        let queue = inner.by_sender.entry(sender).or_default();
        if let Some(prior) = queue.insert(nonce, desc) {
            let prior_hash = prior.tx.hash();
            inner.by_hash.remove(&prior_hash);
            inner.in_flight.remove(&prior_hash);
        } else {
            inner.len += 1;
        }
        inner.by_hash.insert(hash, (sender, nonce));
        Ok(())
    }

    /// Picks transactions for the next event: per sender in consecutive
    /// nonce order, at most `max_per_address` each, stopping at the gas
    /// budget. Picked transactions are marked in-flight.
    pub fn select(&self, max_per_address: u32, gas_budget: u64) -> Vec<Transaction> {
        let mut inner = self.inner.lock();
        let mut remaining = gas_budget;
        let mut picked = Vec::new();
        let mut picked_hashes = Vec::new();
        for (sender, queue) in &inner.by_sender {
            let mut taken = 0u32;
            let mut expected: Option<u64> = None;
            for (nonce, desc) in queue {
                if taken >= max_per_address {
                    break;
                }
                // Nonce gaps stall the rest of the sender's queue.
                if expected.is_some_and(|e| *nonce != e) {
                    break;
                }
                let hash = desc.tx.hash();
                if inner.in_flight.contains(&hash) {
                    expected = Some(nonce + 1);
                    continue;
                }
                if desc.tx.gas > remaining {
                    break;
                }
                remaining -= desc.tx.gas;
                taken += 1;
                expected = Some(nonce + 1);
                picked.push(desc.tx.clone());
                picked_hashes.push(hash);
            }
            if remaining == 0 {
                debug!(sender = %sender, "gas budget exhausted during selection");
                break;
            }
        }
        for hash in picked_hashes {
            inner.in_flight.insert(hash);
        }
        picked
    }

    /// Removes a confirmed transaction and fires its callback.
    pub fn confirm(&self, receipt: &moira_dag::chain::Receipt) {
        let desc = {
            let mut inner = self.inner.lock();
            inner.in_flight.remove(&receipt.tx_hash);
            let Some((sender, nonce)) = inner.by_hash.remove(&receipt.tx_hash) else {
                return;
            };
            let Some(queue) = inner.by_sender.get_mut(&sender) else {
                return;
            };
            let desc = queue.remove(&nonce);
            if queue.is_empty() {
                inner.by_sender.remove(&sender);
            }
            if desc.is_some() {
                inner.len -= 1;
            }
            desc
        };
        // Fired outside the lock; callbacks may re-enter the pool.
        if let Some(TxDesc {
            callback: Some(callback),
            ..
        }) = desc
        {
            callback(receipt);
        }
    }

    /// Returns picked-but-unconfirmed transactions to selectability, for
    /// re-packing after an emission failure or epoch turnover.
    pub fn reset_in_flight(&self) {
        self.inner.lock().in_flight.clear();
    }

    /// Queued transactions originated by `sender`.
    pub fn originated_by(&self, sender: &Address) -> usize {
        self.inner
            .lock()
            .by_sender
            .get(sender)
            .map_or(0, BTreeMap::len)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PoolInner {
    fn contains_slot(&self, sender: &Address, nonce: u64) -> bool {
        self.by_sender
            .get(sender)
            .is_some_and(|queue| queue.contains_key(&nonce))
    }
}
