//! Event ingress: the delivery contract and its in-process implementation.
//!
//! Transports are external; the core only requires that delivery preserves
//! per-creator seq order and retries events with missing parents until the
//! parents arrive or the epoch rotates. [Ingress] is the in-process
//! implementation used by the emitter, `import events`, and tests: it runs
//! the structural checkers, records the event for replay, and feeds the
//! engine.

use crate::Error;
use moira_consensus::{Engine, EpochStore, Reporter};
use moira_dag::keys::Verifier;
use moira_dag::{check_event, Epoch, Event};
use parking_lot::Mutex;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::registry::Registry;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// What a transport does with one delivered event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accepted {
    /// Validated and handed to the engine (possibly parked for parents).
    Now,
    /// Belongs to another epoch; redeliver after rotation or drop.
    WrongEpoch(Epoch),
}

/// The delivery contract the node exposes to transports.
pub trait Delivery: Send {
    fn deliver(&self, event: Event) -> Result<Accepted, Error>;
}

/// Opens the durable event log of one epoch. The log lives in an
/// epoch-partitioned database, so the handle rotates with the engine.
pub type EpochStoreOpener = Box<dyn Fn(Epoch) -> Result<EpochStore, Error> + Send + Sync>;

#[derive(Default)]
struct Metrics {
    received: Counter,
    rejected: Counter,
}

/// In-process delivery into the consensus engine.
pub struct Ingress<R: Reporter> {
    engine: Arc<Mutex<Engine<R>>>,
    events: Mutex<Option<(Epoch, EpochStore)>>,
    opener: EpochStoreOpener,
    verifier: Arc<dyn Verifier + Send + Sync>,
    delivered_gas: AtomicU64,
    delivered_txs: AtomicU64,
    metrics: Metrics,
}

impl<R: Reporter> Ingress<R> {
    pub fn new(
        engine: Arc<Mutex<Engine<R>>>,
        opener: EpochStoreOpener,
        verifier: Arc<dyn Verifier + Send + Sync>,
    ) -> Self {
        Self {
            engine,
            events: Mutex::new(None),
            opener,
            verifier,
            delivered_gas: AtomicU64::new(0),
            delivered_txs: AtomicU64::new(0),
            metrics: Metrics::default(),
        }
    }

    /// Cumulative gas power of accepted events. The emitter pairs this
    /// with the processor's confirmed counter to estimate the gas still
    /// waiting for a block.
    pub fn delivered_gas(&self) -> u64 {
        self.delivered_gas.load(Ordering::Relaxed)
    }

    /// Transactions carried by accepted events.
    pub fn delivered_txs(&self) -> u64 {
        self.delivered_txs.load(Ordering::Relaxed)
    }

    pub fn register_metrics(&self, registry: &mut Registry) {
        let registry = registry.sub_registry_with_prefix("ingress");
        registry.register(
            "received",
            "Events accepted by ingress",
            self.metrics.received.clone(),
        );
        registry.register(
            "rejected",
            "Events rejected by the checkers",
            self.metrics.rejected.clone(),
        );
    }

    pub fn engine(&self) -> &Arc<Mutex<Engine<R>>> {
        &self.engine
    }

    fn record(&self, event: &Event) -> Result<(), Error> {
        let mut slot = self.events.lock();
        // Rotating releases the retired partition's handle, letting the
        // retention drop physically remove it.
        if slot.as_ref().map(|(epoch, _)| *epoch) != Some(event.epoch()) {
            *slot = Some((event.epoch(), (self.opener)(event.epoch())?));
        }
        let (_, store) = slot.as_ref().expect("just filled");
        store.insert(event)?;
        Ok(())
    }
}

impl<R: Reporter + Send> Delivery for Ingress<R> {
    fn deliver(&self, event: Event) -> Result<Accepted, Error> {
        let mut engine = self.engine.lock();
        if event.epoch() != engine.epoch() {
            debug!(
                event = %event.id(),
                epoch = event.epoch().get(),
                current = engine.epoch().get(),
                "event from another epoch"
            );
            return Ok(Accepted::WrongEpoch(event.epoch()));
        }
        if let Err(err) = check_event(&event, engine.validators(), engine.rules(), &*self.verifier)
        {
            self.metrics.rejected.inc();
            return Err(err.into());
        }
        // Durable before indexed, so a replay sees at least everything the
        // engine ever saw.
        self.record(&event)?;
        self.delivered_gas
            .fetch_add(event.header().gas_power_used, Ordering::Relaxed);
        self.delivered_txs
            .fetch_add(event.payload().txs.len() as u64, Ordering::Relaxed);
        engine.process(event)?;
        self.metrics.received.inc();
        Ok(Accepted::Now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use moira_consensus::Config;
    use moira_dag::event::{EventHeader, Payload};
    use moira_dag::keys::{FakeScheme, FakeSigner};
    use moira_dag::types::{Lamport, ValidatorId};
    use moira_dag::{Rules, Validators};
    use moira_kvdb::memory::Memory;
    use moira_kvdb::SharedKv;

    struct Sink;

    impl Reporter for Sink {
        fn event_confirmed(&mut self, _: &Event) {}
        fn atropos_decided(&mut self, _: &Event, _: &[Event]) {}
        fn epoch_sealed(&mut self, _: Epoch, _: moira_dag::Frame) -> (Validators, Rules) {
            (Validators::fakenet(3), Rules::default())
        }
    }

    fn ingress(log: SharedKv) -> Ingress<Sink> {
        let engine = Engine::new(
            Config::default(),
            Epoch::new(1),
            Validators::fakenet(3),
            Rules::default(),
            Sink,
        );
        Ingress::new(
            Arc::new(Mutex::new(engine)),
            Box::new(move |_| Ok(EpochStore::new(log.clone()))),
            Arc::new(FakeScheme),
        )
    }

    fn leaf(creator: u32) -> Event {
        let signer = FakeSigner::new(ValidatorId::new(creator));
        let header = EventHeader {
            creator: ValidatorId::new(creator),
            seq: 1,
            epoch: Epoch::new(1),
            lamport: Lamport::new(1),
            creation_time: 1,
            median_time: 1,
            ..Default::default()
        };
        Event::sign(header, Payload::default(), &signer)
    }

    #[test]
    fn test_valid_event_is_stored_and_indexed() {
        let log: SharedKv = Arc::new(Memory::new());
        let ingress = ingress(log.clone());
        let event = leaf(0);
        assert_eq!(ingress.deliver(event.clone()).unwrap(), Accepted::Now);
        assert!(ingress.engine.lock().contains(&event.id()));
        assert!(EpochStore::new(log).has(&event.id()).unwrap());
    }

    #[test]
    fn test_checker_rejection_stays_out_of_store() {
        let log: SharedKv = Arc::new(Memory::new());
        let ingress = ingress(log.clone());
        let event = leaf(9); // not in the validator set
        assert!(matches!(
            ingress.deliver(event.clone()),
            Err(Error::Check(_))
        ));
        assert!(!EpochStore::new(log).has(&event.id()).unwrap());
    }

    #[test]
    fn test_wrong_epoch_is_redeliverable() {
        let log: SharedKv = Arc::new(Memory::new());
        let ingress = ingress(log);
        let signer = FakeSigner::new(ValidatorId::new(0));
        let header = EventHeader {
            creator: ValidatorId::new(0),
            seq: 1,
            epoch: Epoch::new(2),
            lamport: Lamport::new(1),
            ..Default::default()
        };
        let event = Event::sign(header, Payload::default(), &signer);
        assert_eq!(
            ingress.deliver(event).unwrap(),
            Accepted::WrongEpoch(Epoch::new(2))
        );
    }
}
