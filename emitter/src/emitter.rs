//! The emission state machine and its async loop.

use crate::gas::GasPower;
use crate::persist::{EmitterFiles, PrevEvent};
use crate::slots::{self, SlotConfig, Throttle};
use crate::{Error, FatalHandler};
use moira_dag::chain::Rules;
use moira_dag::event::{Event, EventHeader, Payload};
use moira_dag::keys::Signer;
use moira_dag::types::{Epoch, EventId, Frame, Lamport, ValidatorId};
use moira_dag::validators::Validators;
use moira_gossip::TxPool;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::registry::Registry;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// What the emitter needs from the rest of the node. The node implements
/// this over the consensus engine, the gossip store, and the broadcast
/// path; tests implement it in-process.
pub trait Context: Send {
    /// Parents for the next event, self-parent first when given.
    fn select_parents(&self, self_parent: Option<EventId>, max_parents: u32) -> Vec<EventId>;

    /// Stake-weighted median of the parents' creation times.
    fn median_time(&self, parents: &[EventId], own_time: u64) -> u64;

    /// Gas of transactions observed in the DAG but not yet in a block.
    fn pending_gas(&self) -> u64;

    /// True when someone else's transactions await confirmation.
    fn txs_to_confirm(&self) -> bool;

    /// The vote payload for the next event, if the node has fresh votes.
    fn votes(&self) -> (Vec<moira_dag::event::BlockVote>, Option<moira_dag::event::EpochVote>);

    /// Hands the signed event to local processing and broadcast. A `false`
    /// return means the node's own validator rejected it.
    fn submit(&mut self, event: Event) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Waiting out the doublesign-protection window.
    Bootstrapping,
    /// Not (yet) in the validator set, or catching up.
    Idle,
    /// Next wake-up emits.
    Ready,
    /// Emitted; waiting for the next slot.
    Cooling,
}

#[derive(Debug, Clone)]
pub struct EmitterConfig {
    pub validator: ValidatorId,
    pub slots: SlotConfig,
    /// Refuse to emit until wall clock exceeds the previous emission time
    /// plus this, unix nanoseconds.
    pub doublesign_protection: u64,
    /// Intrinsic gas of an event, before its transactions.
    pub event_gas: u64,
}

impl Default for EmitterConfig {
    fn default() -> Self {
        Self {
            validator: ValidatorId::new(0),
            slots: SlotConfig::default(),
            doublesign_protection: 30_000_000_000,
            event_gas: 28_000,
        }
    }
}

#[derive(Default)]
struct Metrics {
    emitted: Counter,
    halted_slots: Counter,
}

/// The per-validator emission loop.
pub struct Emitter<S: Signer> {
    config: EmitterConfig,
    signer: S,
    validators: Validators,
    rules: Rules,
    epoch: Epoch,
    pool: Arc<TxPool>,
    files: EmitterFiles,
    gas: GasPower,
    prev: Option<PrevEvent>,
    self_last: Option<(EventId, u32)>,
    phase: Phase,
    fatal: FatalHandler,
    rng: StdRng,
    metrics: Metrics,
}

impl<S: Signer> Emitter<S> {
    /// Loads the doublesign-protection files and starts in
    /// [Phase::Bootstrapping].
    pub fn bootstrap(
        config: EmitterConfig,
        signer: S,
        validators: Validators,
        rules: Rules,
        epoch: Epoch,
        pool: Arc<TxPool>,
        files: EmitterFiles,
        fatal: FatalHandler,
        now: u64,
    ) -> Result<Self, Error> {
        let prev = files.load_prev_event()?;
        let self_last = prev
            .filter(|p| p.epoch == epoch)
            .map(|p| (p.id, p.seq));
        if let Some(prev) = &prev {
            info!(
                epoch = prev.epoch.get(),
                seq = prev.seq,
                "recovered previous emission record"
            );
        }
        Ok(Self {
            gas: GasPower::new(&rules, now),
            config,
            signer,
            validators,
            rules,
            epoch,
            pool,
            files,
            prev,
            self_last,
            phase: Phase::Bootstrapping,
            fatal,
            rng: StdRng::from_entropy(),
            metrics: Metrics::default(),
        })
    }

    pub fn register_metrics(&self, registry: &mut Registry) {
        let registry = registry.sub_registry_with_prefix("emitter");
        registry.register(
            "emitted",
            "Events emitted by this validator",
            self.metrics.emitted.clone(),
        );
        registry.register(
            "halted_slots",
            "Slots skipped due to emergency back-off",
            self.metrics.halted_slots.clone(),
        );
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    /// Earliest wall clock at which emitting is doublesign-safe.
    pub fn safe_after(&self) -> u64 {
        self.prev.map_or(0, |p| {
            p.creation_time.saturating_add(self.config.doublesign_protection)
        })
    }

    /// Rotates to a new epoch's validator set and rules.
    pub fn on_epoch(&mut self, epoch: Epoch, validators: Validators, rules: Rules) {
        self.epoch = epoch;
        self.validators = validators;
        self.rules = rules;
        self.self_last = None;
        self.pool.reset_in_flight();
        if self.phase != Phase::Bootstrapping {
            self.phase = Phase::Idle;
        }
    }

    /// One state-machine step. Returns how long to sleep before the next.
    pub fn tick(&mut self, ctx: &mut dyn Context, now: u64) -> Duration {
        match self.phase {
            Phase::Bootstrapping => {
                let safe_after = self.safe_after();
                if now <= safe_after {
                    return Duration::from_nanos(safe_after - now + 1);
                }
                self.phase = Phase::Idle;
                Duration::ZERO
            }
            Phase::Idle => {
                if self.validators.contains(self.config.validator) {
                    self.phase = Phase::Ready;
                    Duration::ZERO
                } else {
                    Duration::from_secs(1)
                }
            }
            Phase::Ready => {
                let throttle = slots::throttle(&self.config.slots, ctx.pending_gas());
                if throttle == Throttle::Halt {
                    self.metrics.halted_slots.inc();
                    debug!("emission halted by emergency threshold");
                    return self.config.slots.min_interval;
                }
                match self.build(ctx, now, throttle) {
                    Ok(event) => {
                        let id = event.id();
                        if !ctx.submit(event) {
                            (self.fatal)(&Error::OwnEventRejected(id));
                            self.phase = Phase::Idle;
                            return Duration::from_secs(1);
                        }
                        self.metrics.emitted.inc();
                    }
                    Err(err) => {
                        (self.fatal)(&err);
                        self.phase = Phase::Idle;
                        return Duration::from_secs(1);
                    }
                }
                self.phase = Phase::Cooling;
                Duration::ZERO
            }
            Phase::Cooling => {
                let throttle = slots::throttle(&self.config.slots, ctx.pending_gas());
                let interval = slots::next_interval(
                    &self.config.slots,
                    throttle,
                    !self.pool.is_empty(),
                    ctx.txs_to_confirm(),
                    &mut self.rng,
                );
                self.phase = Phase::Ready;
                interval.unwrap_or(self.config.slots.min_interval)
            }
        }
    }

    fn build(&mut self, ctx: &mut dyn Context, now: u64, throttle: Throttle) -> Result<Event, Error> {
        let self_parent = self.self_last.map(|(id, _)| id);
        let parents = ctx.select_parents(self_parent, self.rules.max_parents);
        let seq = self.self_last.map_or(1, |(_, seq)| seq + 1);

        // Never reuse or precede the previously persisted creation time.
        let creation_time = now.max(self.prev.map_or(0, |p| p.creation_time + 1));
        let lamport = parents
            .iter()
            .map(|p| p.lamport().get())
            .max()
            .unwrap_or(0)
            + 1;
        let median_time = ctx.median_time(&parents, creation_time);

        self.gas.refill(&self.rules, median_time.max(creation_time));
        let txs = if throttle >= Throttle::NoTxs {
            Vec::new()
        } else {
            let budget = self
                .gas
                .left()
                .saturating_sub(self.config.event_gas)
                .min(self.rules.max_event_gas - self.config.event_gas);
            self.pool.select(self.rules.max_txs_per_address, budget)
        };
        let gas_power_used: u64 =
            self.config.event_gas + txs.iter().map(|tx| tx.gas).sum::<u64>();
        if !self.gas.debit(gas_power_used) {
            // An empty event still fits: the budget above keeps tx gas
            // within the allocation, so only the intrinsic part can trip.
            warn!(left = self.gas.left(), "gas power exhausted; skipping slot");
            return Err(Error::GasPowerExhausted);
        }

        let (block_votes, epoch_vote) = ctx.votes();
        let header = EventHeader {
            creator: self.config.validator,
            seq,
            epoch: self.epoch,
            frame: Frame::new(0),
            lamport: Lamport::new(lamport),
            parents,
            payload_hash: Default::default(),
            gas_power_used,
            gas_power_left: self.gas.left(),
            creation_time,
            median_time,
        };
        let payload = Payload {
            txs,
            block_votes: block_votes.clone(),
            epoch_vote,
        };
        let event = Event::sign(header, payload, &self.signer);

        // Persist before handing out: a crash after this point must not
        // allow a conflicting re-emission.
        self.files.save_prev_event(&PrevEvent {
            id: event.id(),
            epoch: self.epoch,
            seq,
            creation_time,
        })?;
        if let Some(vote) = block_votes.last() {
            self.files.save_block_vote(vote)?;
        }
        if let Some(vote) = &epoch_vote {
            self.files.save_epoch_vote(vote)?;
        }
        self.prev = Some(PrevEvent {
            id: event.id(),
            epoch: self.epoch,
            seq,
            creation_time,
        });
        self.self_last = Some((event.id(), seq));
        debug!(seq, lamport, txs = event.payload().txs.len(), "emitted event");
        Ok(event)
    }

    /// Drives the state machine until `shutdown` flips.
    pub async fn run(mut self, mut ctx: impl Context, mut shutdown: watch::Receiver<bool>) {
        loop {
            let sleep_for = self.tick(&mut ctx, now_nanos());
            tokio::select! {
                _ = tokio::time::sleep(sleep_for) => {}
                _ = shutdown.changed() => {
                    info!("emitter stopping");
                    return;
                }
            }
        }
    }
}

/// Wall clock as unix nanoseconds.
pub fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_nanos() as u64)
}
