//! The event-ordered block processor.
//!
//! One block is appended per decided atropos: confirmed events are
//! archived as they are reported, their transactions applied in consensus
//! order with receipt-based dedup, and the block, receipts, logs, state
//! root, and latest-block pointer committed in a single producer flush.
//! On an epoch seal the record is persisted and retired per-epoch
//! sub-stores are dropped.

use crate::evm::{Account, EvmStore};
use crate::stores::GossipStore;
use crate::txpool::TxPool;
use crate::{Error, FatalHandler};
use moira_consensus::Reporter;
use moira_dag::chain::{Block, EpochRecord, Receipt, Rules};
use moira_dag::event::{Event, Transaction};
use moira_dag::types::{Address, BlockIndex, Epoch, Frame, Hash};
use moira_dag::validators::Validators;
use moira_dag::vecclock::ForkEvidence;
use moira_kvdb::producer::Producer;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::registry::Registry;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Base gas charged per applied transaction.
const TX_GAS: u64 = 21_000;

#[derive(Default)]
struct Metrics {
    blocks: Counter,
    applied_txs: Counter,
    skipped_txs: Counter,
}

/// Applies consensus output to durable state.
pub struct Processor {
    producer: Producer,
    store: Arc<GossipStore>,
    evm: EvmStore,
    pool: Option<Arc<TxPool>>,
    validators: Validators,
    rules: Rules,
    state_root: Hash,
    latest: Option<BlockIndex>,
    prev_timestamp: u64,
    confirmed_gas: u64,
    confirmed_txs: u64,
    /// State roots committed since the last epoch seal, in block order.
    epoch_roots: Vec<Hash>,
    fatal: FatalHandler,
    metrics: Metrics,
}

impl Processor {
    /// Opens the processor, resuming from the latest persisted block when
    /// one exists.
    pub fn open(
        producer: &Producer,
        store: Arc<GossipStore>,
        evm: EvmStore,
        pool: Option<Arc<TxPool>>,
        validators: Validators,
        rules: Rules,
        fatal: FatalHandler,
    ) -> Result<Self, Error> {
        let (latest, state_root, prev_timestamp) = match store.latest_block_index()? {
            Some(index) => {
                let block = store
                    .block(index)?
                    .ok_or(Error::MissingState(Hash::ZERO))?;
                (Some(index), block.state_root, block.timestamp)
            }
            None => (None, Hash::ZERO, 0),
        };
        if !evm.has_state_db(&state_root)? {
            return Err(Error::MissingState(state_root));
        }
        Ok(Self {
            producer: producer.clone(),
            store,
            evm,
            pool,
            validators,
            rules,
            state_root,
            latest,
            prev_timestamp,
            confirmed_gas: 0,
            confirmed_txs: 0,
            epoch_roots: Vec::new(),
            fatal,
            metrics: Metrics::default(),
        })
    }

    pub fn register_metrics(&self, registry: &mut Registry) {
        let registry = registry.sub_registry_with_prefix("processor");
        registry.register(
            "blocks",
            "Blocks appended by the processor",
            self.metrics.blocks.clone(),
        );
        registry.register(
            "applied_txs",
            "Transactions applied into blocks",
            self.metrics.applied_txs.clone(),
        );
        registry.register(
            "skipped_txs",
            "Transactions skipped as duplicate or invalid",
            self.metrics.skipped_txs.clone(),
        );
    }

    pub fn latest_block_index(&self) -> Option<BlockIndex> {
        self.latest
    }

    pub fn state_root(&self) -> Hash {
        self.state_root
    }

    /// Cumulative gas power of events confirmed since this processor
    /// opened. Paired with the ingress delivery counter it bounds the gas
    /// still waiting for a block.
    pub fn confirmed_gas(&self) -> u64 {
        self.confirmed_gas
    }

    /// Transactions carried by confirmed events since this processor
    /// opened, applied or not.
    pub fn confirmed_txs(&self) -> u64 {
        self.confirmed_txs
    }

    /// Seeds the genesis state by applying `accounts` onto the empty root
    /// and committing the result. Only valid before the first block.
    pub fn seed_genesis(&mut self, accounts: &[(Address, Account)]) -> Result<Hash, Error> {
        let mut state = self.evm.state_db(self.state_root)?;
        for (address, account) in accounts {
            state.set_account(address, account)?;
        }
        self.state_root = state.root();
        self.producer.flush()?;
        Ok(self.state_root)
    }

    fn apply_block(&mut self, atropos: &Event, confirmed: &[Event]) -> Result<(), Error> {
        let index = self.latest.map_or(BlockIndex::new(1), BlockIndex::next);
        let parent_index = self.latest.unwrap_or(BlockIndex::new(0));
        // Block time never goes backwards, whatever the atropos claims.
        let timestamp = (self.prev_timestamp + 1).max(atropos.header().median_time);

        let mut state = self.evm.state_db(self.state_root)?;
        let mut block = Block {
            index,
            parent_index,
            timestamp,
            atropos: atropos.id(),
            events: confirmed.iter().map(Event::id).collect(),
            ..Default::default()
        };
        let mut receipts = Vec::new();
        let mut seen = HashSet::new();
        for event in confirmed {
            for tx in &event.payload().txs {
                let hash = tx.hash();
                let position = block.tx_hashes.len();
                block.tx_hashes.push(hash);
                // Receipts persist across blocks; `seen` catches repeats
                // within this one.
                if self.evm.has_receipt(&hash)? || !seen.insert(hash) {
                    block.mark_skipped(position);
                    continue;
                }
                match apply_tx(&mut state, tx)? {
                    Some(receipt) => {
                        block.gas_used += receipt.gas_used;
                        receipts.push(receipt);
                    }
                    None => block.mark_skipped(position),
                }
            }
        }
        block.state_root = state.root();

        let mut log_position = 0u32;
        for receipt in &receipts {
            self.evm.put_receipt(receipt)?;
            log_position = self.evm.index_logs(index, log_position, &receipt.logs)?;
        }
        self.store.put_block(&block)?;
        self.producer.flush()?;

        self.metrics.blocks.inc();
        self.metrics.applied_txs.inc_by(receipts.len() as u64);
        self.metrics
            .skipped_txs
            .inc_by((block.tx_hashes.len() - receipts.len()) as u64);
        debug!(
            index = index.get(),
            events = confirmed.len(),
            txs = receipts.len(),
            skipped = block.tx_hashes.len() - receipts.len(),
            "appended block"
        );

        self.latest = Some(index);
        self.state_root = block.state_root;
        self.prev_timestamp = timestamp;
        self.epoch_roots.push(block.state_root);

        if let Some(pool) = &self.pool {
            for receipt in &receipts {
                pool.confirm(receipt);
            }
        }
        Ok(())
    }

    fn seal_epoch(&mut self, epoch: Epoch, sealing_frame: Frame) -> Result<(), Error> {
        let record = EpochRecord {
            epoch,
            sealing_frame,
            validators: self.validators.clone(),
            rules: self.rules.clone(),
            closing_block: self.latest.unwrap_or(BlockIndex::new(0)),
            state_roots: std::mem::take(&mut self.epoch_roots),
        };
        self.store.put_epoch_record(&record)?;
        if epoch.get() > self.rules.retention_epochs {
            let retired = Epoch::new(epoch.get() - self.rules.retention_epochs);
            self.store.drop_epoch_index(retired)?;
            self.producer
                .drop_db(&format!("hashgraph-{}", retired.get()))?;
        }
        self.producer.flush()?;
        info!(
            epoch = epoch.get(),
            frame = sealing_frame.get(),
            record = %record.hash(),
            "sealed epoch"
        );
        Ok(())
    }
}

impl Reporter for Processor {
    fn event_confirmed(&mut self, event: &Event) {
        self.confirmed_gas = self
            .confirmed_gas
            .saturating_add(event.header().gas_power_used);
        self.confirmed_txs += event.payload().txs.len() as u64;
        if let Err(err) = self.store.insert_event(event) {
            (self.fatal)(&err);
        }
    }

    fn atropos_decided(&mut self, atropos: &Event, confirmed: &[Event]) {
        if let Err(err) = self.apply_block(atropos, confirmed) {
            (self.fatal)(&err);
        }
    }

    fn epoch_sealed(&mut self, epoch: Epoch, sealing_frame: Frame) -> (Validators, Rules) {
        if let Err(err) = self.seal_epoch(epoch, sealing_frame) {
            (self.fatal)(&err);
        }
        // Without a staking module the validator set and rules carry over.
        (self.validators.clone(), self.rules.clone())
    }

    fn cheater_detected(&mut self, evidence: &ForkEvidence) {
        warn!(
            creator = evidence.creator.get(),
            "validator self-forked; excluded from ordering"
        );
    }
}

/// Applies one transaction. Returns `None` when the transaction must be
/// skipped (stale or future nonce, or unpayable gas); a returned receipt
/// with `ok == false` records a failed transfer whose nonce and gas were
/// still consumed.
fn apply_tx(state: &mut crate::evm::StateDb, tx: &Transaction) -> Result<Option<Receipt>, Error> {
    let mut sender = state.account(&tx.sender)?.unwrap_or_default();
    if tx.nonce != sender.nonce || tx.gas < TX_GAS {
        return Ok(None);
    }
    sender.nonce += 1;

    let recipient = tx.to.unwrap_or_else(|| contract_address(tx));
    let ok = sender.balance >= tx.value;
    let transfer = ok && recipient != tx.sender;
    if transfer {
        sender.balance -= tx.value;
    }
    state.set_account(&tx.sender, &sender)?;
    if transfer {
        let mut to = state.account(&recipient)?.unwrap_or_default();
        to.balance += tx.value;
        state.set_account(&recipient, &to)?;
    }
    Ok(Some(Receipt {
        tx_hash: tx.hash(),
        ok,
        gas_used: TX_GAS,
        logs: Vec::new(),
    }))
}

/// Deterministic address for a contract creation.
fn contract_address(tx: &Transaction) -> Address {
    let mut hasher = Sha256::new();
    hasher.update(tx.sender.as_bytes());
    hasher.update(tx.nonce.to_be_bytes());
    let digest = hasher.finalize();
    let mut address = [0u8; 20];
    address.copy_from_slice(&digest[..20]);
    Address(address)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::txpool::TxDesc;
    use moira_dag::event::{EventHeader, Payload};
    use moira_dag::keys::FakeSigner;
    use moira_dag::types::{Lamport, ValidatorId};
    use moira_kvdb::producer::ProducerConfig;
    use moira_kvdb::routing::Router;
    use parking_lot::Mutex;

    fn addr(n: u8) -> Address {
        Address([n; 20])
    }

    fn tx(sender: u8, nonce: u64, to: u8, value: u64) -> Transaction {
        Transaction {
            sender: addr(sender),
            nonce,
            to: Some(addr(to)),
            value,
            gas: TX_GAS,
            input: Vec::new(),
            authorizations: Vec::new(),
        }
    }

    fn event(lamport: u32, median_time: u64, txs: Vec<Transaction>) -> Event {
        let signer = FakeSigner::new(ValidatorId::new(0));
        let header = EventHeader {
            creator: ValidatorId::new(0),
            seq: lamport,
            epoch: Epoch::new(1),
            lamport: Lamport::new(lamport),
            median_time,
            ..Default::default()
        };
        Event::sign(
            header,
            Payload {
                txs,
                ..Default::default()
            },
            &signer,
        )
    }

    struct Fixture {
        producer: Producer,
        store: Arc<GossipStore>,
        processor: Processor,
        fatal_errors: Arc<Mutex<Vec<String>>>,
    }

    fn fixture(pool: Option<Arc<TxPool>>, funded: &[(Address, u64)]) -> Fixture {
        let producer = Producer::in_memory(Router::default_layout(), ProducerConfig::default());
        let store = Arc::new(GossipStore::open(&producer).unwrap());
        let evm = EvmStore::open(&producer).unwrap();
        let fatal_errors = Arc::new(Mutex::new(Vec::new()));
        let sink = fatal_errors.clone();
        let fatal: FatalHandler = Arc::new(move |err| sink.lock().push(err.to_string()));
        let mut processor = Processor::open(
            &producer,
            store.clone(),
            evm,
            pool,
            Validators::fakenet(3),
            Rules::default(),
            fatal,
        )
        .unwrap();
        let accounts: Vec<_> = funded
            .iter()
            .map(|(address, balance)| {
                (
                    *address,
                    Account {
                        nonce: 0,
                        balance: *balance,
                    },
                )
            })
            .collect();
        processor.seed_genesis(&accounts).unwrap();
        Fixture {
            producer,
            store,
            processor,
            fatal_errors,
        }
    }

    #[test]
    fn test_block_applies_transfers_in_order() {
        let mut fx = fixture(None, &[(addr(1), 100)]);
        let e1 = event(1, 50, vec![tx(1, 0, 2, 30)]);
        let e2 = event(2, 60, vec![tx(1, 1, 3, 20)]);
        fx.processor.event_confirmed(&e1);
        fx.processor.event_confirmed(&e2);
        fx.processor.atropos_decided(&e2, &[e1.clone(), e2.clone()]);
        assert!(fx.fatal_errors.lock().is_empty());

        let block = fx.store.block(BlockIndex::new(1)).unwrap().unwrap();
        assert_eq!(block.tx_hashes.len(), 2);
        assert!(!block.is_skipped(0));
        assert!(!block.is_skipped(1));
        assert_eq!(block.gas_used, 2 * TX_GAS);
        assert_eq!(block.timestamp, 60);

        let state = fx
            .processor
            .evm
            .state_db(fx.processor.state_root())
            .unwrap();
        assert_eq!(state.account(&addr(1)).unwrap().unwrap().balance, 50);
        assert_eq!(state.account(&addr(2)).unwrap().unwrap().balance, 30);
        assert_eq!(state.account(&addr(3)).unwrap().unwrap().balance, 20);
        assert_eq!(state.account(&addr(1)).unwrap().unwrap().nonce, 2);
    }

    #[test]
    fn test_duplicates_and_bad_nonces_are_skipped() {
        let mut fx = fixture(None, &[(addr(1), 100)]);
        let dup = tx(1, 0, 2, 10);
        let e1 = event(1, 50, vec![dup.clone(), dup.clone(), tx(1, 5, 2, 10)]);
        fx.processor.atropos_decided(&e1, &[e1.clone()]);

        let block = fx.store.block(BlockIndex::new(1)).unwrap().unwrap();
        assert!(!block.is_skipped(0));
        assert!(block.is_skipped(1)); // in-batch duplicate
        assert!(block.is_skipped(2)); // nonce gap

        // Replaying the same transaction in a later block skips on the
        // persisted receipt.
        let e2 = event(2, 60, vec![dup]);
        fx.processor.atropos_decided(&e2, &[e2.clone()]);
        let block = fx.store.block(BlockIndex::new(2)).unwrap().unwrap();
        assert!(block.is_skipped(0));
        assert!(fx.fatal_errors.lock().is_empty());
    }

    #[test]
    fn test_insufficient_balance_fails_but_consumes_nonce() {
        let mut fx = fixture(None, &[(addr(1), 10)]);
        let e1 = event(1, 50, vec![tx(1, 0, 2, 999)]);
        fx.processor.atropos_decided(&e1, &[e1.clone()]);

        let block = fx.store.block(BlockIndex::new(1)).unwrap().unwrap();
        assert!(!block.is_skipped(0));
        let receipt = fx.processor.evm.receipt(&block.tx_hashes[0]).unwrap().unwrap();
        assert!(!receipt.ok);

        let state = fx
            .processor
            .evm
            .state_db(fx.processor.state_root())
            .unwrap();
        let sender = state.account(&addr(1)).unwrap().unwrap();
        assert_eq!(sender.nonce, 1);
        assert_eq!(sender.balance, 10);
        assert!(state.account(&addr(2)).unwrap().is_none());
    }

    #[test]
    fn test_timestamps_are_strictly_monotonic() {
        let mut fx = fixture(None, &[]);
        let e1 = event(1, 100, vec![]);
        let e2 = event(2, 40, vec![]); // clock claim goes backwards
        fx.processor.atropos_decided(&e1, &[e1.clone()]);
        fx.processor.atropos_decided(&e2, &[e2.clone()]);
        let b1 = fx.store.block(BlockIndex::new(1)).unwrap().unwrap();
        let b2 = fx.store.block(BlockIndex::new(2)).unwrap().unwrap();
        assert_eq!(b1.timestamp, 100);
        assert_eq!(b2.timestamp, 101);
        assert_eq!(b2.parent_index, b1.index);
    }

    #[test]
    fn test_pool_confirmation_fires() {
        let pool = Arc::new(TxPool::new(100));
        let mut fx = fixture(Some(pool.clone()), &[(addr(1), 100)]);
        let t = tx(1, 0, 2, 10);
        pool.add(TxDesc::new(t.clone())).unwrap();
        assert_eq!(pool.len(), 1);

        let e1 = event(1, 50, vec![t]);
        fx.processor.atropos_decided(&e1, &[e1.clone()]);
        assert!(pool.is_empty());
    }

    #[test]
    fn test_epoch_seal_writes_record_and_drops_retired_index() {
        let mut fx = fixture(None, &[]);
        let e1 = event(1, 50, vec![]);
        fx.processor.event_confirmed(&e1);
        fx.processor.atropos_decided(&e1, &[e1.clone()]);

        let (validators, rules) = fx.processor.epoch_sealed(Epoch::new(1), Frame::new(20));
        assert_eq!(validators.len(), 3);
        assert_eq!(rules, Rules::default());
        let record = fx.store.epoch_record(Epoch::new(1)).unwrap().unwrap();
        assert_eq!(record.closing_block, BlockIndex::new(1));
        assert_eq!(record.state_roots.len(), 1);

        // With retention 2, sealing epoch 3 retires epoch 1's index.
        assert_eq!(fx.store.epoch_event_count(Epoch::new(1)).unwrap(), 1);
        fx.processor.epoch_sealed(Epoch::new(2), Frame::new(20));
        fx.processor.epoch_sealed(Epoch::new(3), Frame::new(20));
        assert_eq!(fx.store.epoch_event_count(Epoch::new(1)).unwrap(), 0);
        assert!(fx.store.has_event(&e1.id()).unwrap());
        assert!(fx.fatal_errors.lock().is_empty());
    }

    #[test]
    fn test_processor_resumes_from_latest_block() {
        let mut fx = fixture(None, &[(addr(1), 100)]);
        let e1 = event(1, 50, vec![tx(1, 0, 2, 30)]);
        fx.processor.atropos_decided(&e1, &[e1.clone()]);
        let root = fx.processor.state_root();

        let evm = EvmStore::open(&fx.producer).unwrap();
        let reopened = Processor::open(
            &fx.producer,
            fx.store.clone(),
            evm,
            None,
            Validators::fakenet(3),
            Rules::default(),
            Arc::new(|_| {}),
        )
        .unwrap();
        assert_eq!(reopened.latest_block_index(), Some(BlockIndex::new(1)));
        assert_eq!(reopened.state_root(), root);
    }
}
