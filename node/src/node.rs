//! Node assembly.
//!
//! [NodeCore] opens the full store/engine/ingress stack from a
//! [NodeConfig]; [run] adds the async shell around it: the emitter loop,
//! the flush-and-compaction loop, the free-disk watchdog, and signal
//! handling. Offline commands reuse [NodeCore::open] so they see exactly
//! the stores a running node would.

use crate::config::NodeConfig;
use crate::dbops::DiskProbe;
use crate::errlock::ErrLock;
use crate::ingress::{Accepted, Delivery, EpochStoreOpener, Ingress};
use crate::Error;
use moira_consensus::{Config as EngineConfig, Engine, EpochStore};
use moira_dag::chain::EpochRecord;
use moira_dag::event::{BlockVote, EpochVote, Event};
use moira_dag::keys::{fake_key, FakeScheme, FakeSigner, Signer};
use moira_dag::types::{Address, Epoch, EventId};
use moira_dag::validators::Validators;
use moira_emitter::{now_nanos, parents, Context, Emitter, EmitterFiles};
use moira_gossip::{Account, EvmStore, GossipStore, Processor, TxPool};
use moira_kvdb::compactor::{Compactor, Thresholds};
use moira_kvdb::producer::{Producer, ProducerConfig};
use moira_kvdb::routing::Router;
use parking_lot::Mutex;
use prometheus_client::registry::Registry;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

/// Balance every fakenet validator account starts with.
const FAKENET_ENDOWMENT: u64 = 1_000_000_000_000;

/// How often the maintenance loop wakes up.
const MAINTENANCE_INTERVAL: Duration = Duration::from_millis(500);

/// The assembled node: producer, stores, engine, and ingress.
pub struct NodeCore {
    pub config: NodeConfig,
    pub producer: Producer,
    pub store: Arc<GossipStore>,
    pub pool: Arc<TxPool>,
    pub engine: Arc<Mutex<Engine<Processor>>>,
    pub ingress: Arc<Ingress<Processor>>,
    pub errlock: Arc<ErrLock>,
    pub registry: Registry,
}

impl NodeCore {
    /// Opens every store, resumes epoch state from the last sealed record,
    /// and replays the current epoch's event log into a fresh engine. A
    /// fakenet configuration runs fully in memory and seeds the genesis
    /// state on first open.
    pub fn open(config: NodeConfig, store_cfg: ProducerConfig) -> Result<Self, Error> {
        std::fs::create_dir_all(&config.datadir)?;
        let errlock = Arc::new(ErrLock::new(&config.datadir));
        errlock.check()?;

        let fakenet = config.validator.fakenet;
        let producer = match fakenet {
            Some(_) => Producer::in_memory(Router::default_layout(), store_cfg),
            None => Producer::open(&config.datadir, Router::default_layout(), store_cfg)?,
        };
        let mut registry = Registry::default();
        producer.register_metrics(&mut registry);

        let store = Arc::new(GossipStore::open(&producer)?);
        let evm = EvmStore::open(&producer)?;
        let pool = Arc::new(TxPool::new(config.emitter.max_pool_txs));

        let sealed = last_epoch_record(&store)?;
        let (epoch, validators, rules) = match &sealed {
            Some(record) => (
                record.epoch.next(),
                record.validators.clone(),
                record.rules.clone(),
            ),
            None => {
                let n = fakenet.unwrap_or(3);
                let rules = moira_dag::chain::Rules {
                    retention_epochs: config.store.retention_epochs,
                    ..moira_dag::chain::Rules::default()
                };
                (Epoch::new(1), Validators::fakenet(n), rules)
            }
        };
        info!(
            epoch = epoch.get(),
            validators = validators.len(),
            "resuming consensus state"
        );

        let fatal: moira_gossip::FatalHandler = {
            let errlock = errlock.clone();
            Arc::new(move |err| errlock.engage(&format!("gossip: {err}")))
        };
        let mut processor = Processor::open(
            &producer,
            store.clone(),
            evm,
            Some(pool.clone()),
            validators.clone(),
            rules.clone(),
            fatal,
        )?;
        processor.register_metrics(&mut registry);
        if fakenet.is_some() && sealed.is_none() && store.latest_block_index()?.is_none() {
            let accounts: Vec<(Address, Account)> = validators
                .ids()
                .map(|id| {
                    (
                        validator_address(id),
                        Account {
                            nonce: 0,
                            balance: FAKENET_ENDOWMENT,
                        },
                    )
                })
                .collect();
            let root = processor.seed_genesis(&accounts)?;
            info!(root = %root, accounts = accounts.len(), "seeded fakenet genesis state");
        }

        let mut engine = Engine::new(EngineConfig::default(), epoch, validators, rules, processor);
        engine.register_metrics(&mut registry);
        let replayed = epoch_log(&producer, epoch)?.replay(&mut engine)?;
        if replayed > 0 {
            info!(events = replayed, epoch = epoch.get(), "replayed epoch log");
        }
        let engine = Arc::new(Mutex::new(engine));

        let opener: EpochStoreOpener = {
            let producer = producer.clone();
            Box::new(move |epoch| epoch_log(&producer, epoch))
        };
        let ingress = Arc::new(Ingress::new(engine.clone(), opener, Arc::new(FakeScheme)));
        ingress.register_metrics(&mut registry);

        Ok(Self {
            config,
            producer,
            store,
            pool,
            engine,
            ingress,
            errlock,
            registry,
        })
    }

    /// A fresh EVM store handle over this node's producer.
    pub fn evm(&self) -> Result<EvmStore, Error> {
        EvmStore::open(&self.producer).map_err(Error::from)
    }

    pub fn current_epoch(&self) -> Epoch {
        self.engine.lock().epoch()
    }

    async fn serve(mut self, probe: DiskProbe) -> Result<(), Error> {
        let (tx, _keepalive) = watch::channel(false);
        let tx = Arc::new(tx);

        let signal = {
            let tx = tx.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("interrupt received; shutting down");
                }
                let _ = tx.send(true);
            })
        };

        let mut workers = Vec::new();
        if let Some(id) = self.config.validator_id() {
            let signer = FakeSigner::new(id);
            info!(pubkey = %signer.public(), "Unlocked validator key");
            let dir = self.config.datadir.join("emitter");
            std::fs::create_dir_all(&dir)?;
            let (epoch, validators, rules) = {
                let engine = self.engine.lock();
                (
                    engine.epoch(),
                    engine.validators().clone(),
                    engine.rules().clone(),
                )
            };
            let fatal: moira_emitter::FatalHandler = {
                let errlock = self.errlock.clone();
                Arc::new(move |err| errlock.engage(&format!("emitter: {err}")))
            };
            let emitter = Emitter::bootstrap(
                self.config.emitter_config(id),
                signer,
                validators,
                rules,
                epoch,
                self.pool.clone(),
                EmitterFiles::open(&dir)?,
                fatal,
                now_nanos(),
            )?;
            emitter.register_metrics(&mut self.registry);
            let ctx = EngineContext {
                engine: self.engine.clone(),
                ingress: self.ingress.clone(),
                store: self.store.clone(),
            };
            workers.push(tokio::spawn(emit_loop(
                emitter,
                ctx,
                self.engine.clone(),
                tx.subscribe(),
            )));
        }
        workers.push(tokio::spawn(maintain(
            self.producer.clone(),
            self.errlock.clone(),
            self.config.datadir.clone(),
            self.config.minfreedisk,
            probe,
            tx.clone(),
        )));

        let mut rx = tx.subscribe();
        let _ = rx.changed().await;
        for worker in workers {
            let _ = worker.await;
        }
        signal.abort();

        if let Err(err) = self.producer.flush() {
            warn!(%err, "final flush failed");
        }
        self.errlock.check()?;
        info!("node stopped");
        Ok(())
    }
}

/// Opens the node and runs it until interrupted or a fatal error engages
/// the errlock.
pub fn run(config: NodeConfig, store_cfg: ProducerConfig, probe: DiskProbe) -> Result<(), Error> {
    let core = NodeCore::open(config, store_cfg)?;
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(core.serve(probe))
}

/// The durable event log of one epoch partition.
fn epoch_log(producer: &Producer, epoch: Epoch) -> Result<EpochStore, Error> {
    let table = producer.open_table(&format!("hashgraph-{}/E", epoch.get()))?;
    Ok(EpochStore::new(Arc::new(table)))
}

/// Scans sealed records from epoch 1 upward; records are dense, so the
/// first gap ends the scan.
fn last_epoch_record(store: &GossipStore) -> Result<Option<EpochRecord>, Error> {
    let mut last = None;
    let mut epoch = Epoch::new(1);
    while let Some(record) = store.epoch_record(epoch)? {
        epoch = epoch.next();
        last = Some(record);
    }
    Ok(last)
}

/// The account a fakenet validator controls, derived from its key.
pub fn validator_address(id: moira_dag::types::ValidatorId) -> Address {
    let key = fake_key(id);
    let mut address = [0u8; 20];
    address.copy_from_slice(&key.as_bytes()[..20]);
    Address(address)
}

/// The emitter's view of the node.
struct EngineContext {
    engine: Arc<Mutex<Engine<Processor>>>,
    ingress: Arc<Ingress<Processor>>,
    store: Arc<GossipStore>,
}

impl Context for EngineContext {
    fn select_parents(&self, self_parent: Option<EventId>, max_parents: u32) -> Vec<EventId> {
        let heads = match self.store.heads() {
            Ok(heads) => heads,
            Err(err) => {
                warn!(%err, "head lookup failed");
                Vec::new()
            }
        };
        let engine = self.engine.lock();
        parents::select_parents(engine.clock(), self_parent, &heads, max_parents)
    }

    fn median_time(&self, parents: &[EventId], own_time: u64) -> u64 {
        self.engine.lock().clock().median_time(parents, own_time)
    }

    fn pending_gas(&self) -> u64 {
        let confirmed = self.engine.lock().reporter().confirmed_gas();
        self.ingress.delivered_gas().saturating_sub(confirmed)
    }

    fn txs_to_confirm(&self) -> bool {
        let confirmed = self.engine.lock().reporter().confirmed_txs();
        self.ingress.delivered_txs() > confirmed
    }

    fn votes(&self) -> (Vec<BlockVote>, Option<EpochVote>) {
        let (latest, epoch) = {
            let engine = self.engine.lock();
            (engine.reporter().latest_block_index(), engine.epoch())
        };
        let block_votes = latest
            .and_then(|index| self.store.block(index).ok().flatten())
            .map(|block| {
                vec![BlockVote {
                    index: block.index,
                    hash: block.hash(),
                }]
            })
            .unwrap_or_default();
        let epoch_vote = epoch
            .get()
            .checked_sub(1)
            .filter(|sealed| *sealed > 0)
            .and_then(|sealed| self.store.epoch_record(Epoch::new(sealed)).ok().flatten())
            .map(|record| EpochVote {
                epoch: record.epoch,
                hash: record.hash(),
            });
        (block_votes, epoch_vote)
    }

    fn submit(&mut self, event: Event) -> bool {
        match self.ingress.deliver(event) {
            Ok(Accepted::Now) => true,
            Ok(Accepted::WrongEpoch(epoch)) => {
                warn!(epoch = epoch.get(), "own event raced an epoch seal");
                false
            }
            Err(err) => {
                warn!(%err, "own event rejected");
                false
            }
        }
    }
}

/// Drives the emitter, rotating it whenever the engine seals an epoch.
async fn emit_loop(
    mut emitter: Emitter<FakeSigner>,
    mut ctx: EngineContext,
    engine: Arc<Mutex<Engine<Processor>>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        {
            let engine = engine.lock();
            if engine.epoch() != emitter.epoch() {
                emitter.on_epoch(
                    engine.epoch(),
                    engine.validators().clone(),
                    engine.rules().clone(),
                );
            }
        }
        let sleep_for = emitter.tick(&mut ctx, now_nanos());
        tokio::select! {
            _ = tokio::time::sleep(sleep_for) => {}
            _ = shutdown.changed() => {
                info!("emitter stopping");
                return;
            }
        }
    }
}

/// Flushes when the producer asks for it, feeds the per-database
/// compactors, and watches the errlock and free disk.
async fn maintain(
    producer: Producer,
    errlock: Arc<ErrLock>,
    datadir: PathBuf,
    minfreedisk: u64,
    probe: DiskProbe,
    shutdown: Arc<watch::Sender<bool>>,
) {
    let mut rx = shutdown.subscribe();
    let mut compactors: HashMap<String, Compactor> = HashMap::new();
    let mut interval = tokio::time::interval(MAINTENANCE_INTERVAL);
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = rx.changed() => return,
        }
        if errlock.engaged() {
            let _ = shutdown.send(true);
            return;
        }
        if minfreedisk > 0 {
            if let Some(available) = probe(&datadir) {
                if available < minfreedisk {
                    warn!(
                        available,
                        required = minfreedisk,
                        "free disk below the configured minimum; shutting down"
                    );
                    let _ = shutdown.send(true);
                    return;
                }
            }
        }
        if !producer.flush_needed() {
            continue;
        }
        match producer.flush() {
            Ok(flushed) => {
                let names = producer.db_names();
                compactors.retain(|name, _| names.contains(name));
                let share = flushed as usize / names.len().max(1);
                for name in names {
                    let compactor = match compactors.entry(name) {
                        Entry::Occupied(entry) => entry.into_mut(),
                        Entry::Vacant(entry) => {
                            let Some(kv) = producer.raw_db(entry.key()) else {
                                continue;
                            };
                            entry.insert(Compactor::new(kv, Thresholds::default()))
                        }
                    };
                    compactor.note(b"", share);
                    compactor.tick();
                }
            }
            Err(err) => {
                errlock.engage(&format!("store: {err}"));
                let _ = shutdown.send(true);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{NodeConfig, ValidatorConfig};
    use moira_dag::event::Transaction;
    use moira_gossip::TxDesc;

    fn fakenet_config(dir: &std::path::Path, validators: u32, id: Option<u32>) -> NodeConfig {
        NodeConfig {
            datadir: dir.to_path_buf(),
            validator: ValidatorConfig {
                id,
                fakenet: Some(validators),
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_open_seeds_fakenet_accounts() {
        let dir = tempfile::tempdir().unwrap();
        let core = NodeCore::open(
            fakenet_config(dir.path(), 3, None),
            ProducerConfig::default(),
        )
        .unwrap();

        let evm = core.evm().unwrap();
        for i in 0..3 {
            let account = evm
                .account(&validator_address(moira_dag::types::ValidatorId::new(i)))
                .unwrap()
                .expect("seeded account");
            assert_eq!(account.balance, FAKENET_ENDOWMENT);
        }
        assert!(evm
            .account(&Address([0xEE; 20]))
            .unwrap()
            .is_none());
    }

    /// A single-validator fakenet confirms its own events, so driving the
    /// emitter state machine by hand must produce a block and confirm a
    /// pooled transaction.
    #[test]
    fn test_single_validator_emits_through_to_a_block() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = fakenet_config(dir.path(), 1, Some(0));
        config.emitter.doublesign_protection_ms = 0;
        let core = NodeCore::open(config.clone(), ProducerConfig::default()).unwrap();

        let sender = validator_address(moira_dag::types::ValidatorId::new(0));
        let tx = Transaction {
            sender,
            nonce: 0,
            to: Some(Address([9; 20])),
            value: 5,
            gas: 21_000,
            input: Vec::new(),
            authorizations: Vec::new(),
        };
        core.pool.add(TxDesc::new(tx)).unwrap();

        let signer = FakeSigner::new(moira_dag::types::ValidatorId::new(0));
        let files = EmitterFiles::open(dir.path()).unwrap();
        let (epoch, validators, rules) = {
            let engine = core.engine.lock();
            (
                engine.epoch(),
                engine.validators().clone(),
                engine.rules().clone(),
            )
        };
        let mut emitter = Emitter::bootstrap(
            config.emitter_config(moira_dag::types::ValidatorId::new(0)),
            signer,
            validators,
            rules,
            epoch,
            core.pool.clone(),
            files,
            Arc::new(|err| panic!("fatal: {err}")),
            0,
        )
        .unwrap();
        let mut ctx = EngineContext {
            engine: core.engine.clone(),
            ingress: core.ingress.clone(),
            store: core.store.clone(),
        };

        let mut now = 1_000;
        for _ in 0..512 {
            {
                let engine = core.engine.lock();
                if engine.epoch() != emitter.epoch() {
                    emitter.on_epoch(
                        engine.epoch(),
                        engine.validators().clone(),
                        engine.rules().clone(),
                    );
                }
            }
            now += emitter.tick(&mut ctx, now).as_nanos() as u64 + 1;
            let blocked = core
                .engine
                .lock()
                .reporter()
                .latest_block_index()
                .is_some();
            if blocked && core.pool.is_empty() {
                break;
            }
        }

        let latest = core
            .engine
            .lock()
            .reporter()
            .latest_block_index()
            .expect("a block was appended");
        let block = core.store.block(latest).unwrap().unwrap();
        assert!(block.index.get() >= 1);
        assert!(core.pool.is_empty(), "pooled transaction confirmed");
        let recipient = core
            .evm()
            .unwrap()
            .account(&Address([9; 20]))
            .unwrap()
            .expect("transfer landed");
        assert_eq!(recipient.balance, 5);
    }

    #[test]
    fn test_errlock_blocks_open() {
        let dir = tempfile::tempdir().unwrap();
        ErrLock::new(dir.path()).engage("gossip: state node missing");
        let result = NodeCore::open(
            fakenet_config(dir.path(), 3, None),
            ProducerConfig::default(),
        );
        assert!(matches!(result, Err(Error::Locked(_))));
    }
}
