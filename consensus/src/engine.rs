//! The consensus engine.
//!
//! Events enter in any order; the engine indexes them once their parents
//! are present, assigns frames, runs the election, and emits atropos
//! decisions through the [Reporter]. All outputs are pure functions of the
//! delivered event set, so two nodes fed the same events in different
//! orders produce identical streams.

use crate::election::Election;
use crate::roots::Frames;
use crate::Error;
use moira_dag::chain::Rules;
use moira_dag::event::Event;
use moira_dag::types::{Epoch, EventId, Frame};
use moira_dag::validators::Validators;
use moira_dag::vecclock::{ForkEvidence, VectorClock};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::registry::Registry;
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Downstream consumer of consensus output.
///
/// `epoch_sealed` returns the validator set and rules for the next epoch;
/// the block processor derives them from the sealed state.
pub trait Reporter {
    /// An event entered the final order.
    fn event_confirmed(&mut self, event: &Event);

    /// A frame's atropos was decided; `confirmed` is its newly ordered
    /// subgraph (atropos included, consensus order).
    fn atropos_decided(&mut self, atropos: &Event, confirmed: &[Event]);

    /// The epoch sealed at `sealing_frame`.
    fn epoch_sealed(&mut self, epoch: Epoch, sealing_frame: Frame) -> (Validators, Rules);

    /// A validator self-forked.
    fn cheater_detected(&mut self, _evidence: &ForkEvidence) {}
}

/// Engine tuning.
#[derive(Debug, Clone)]
pub struct Config {
    /// Upper bound on buffered events with missing parents.
    pub max_pending: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self { max_pending: 4096 }
    }
}

#[derive(Default)]
struct Metrics {
    confirmed_events: Counter,
    atropoi: Counter,
    epochs_sealed: Counter,
}

/// The per-node consensus engine.
pub struct Engine<R: Reporter> {
    config: Config,
    epoch: Epoch,
    rules: Rules,
    vc: VectorClock,
    frames: Frames,
    election: Election,
    /// Indexed events not yet confirmed by an atropos.
    events: HashMap<EventId, Event>,
    /// Events waiting for parents.
    pending: HashMap<EventId, Event>,
    waiters: HashMap<EventId, Vec<EventId>>,
    /// Highest frame whose atropos has been emitted (or skipped).
    finalized: Frame,
    reporter: R,
    metrics: Metrics,
}

impl<R: Reporter> Engine<R> {
    pub fn new(
        config: Config,
        epoch: Epoch,
        validators: Validators,
        rules: Rules,
        reporter: R,
    ) -> Self {
        Self {
            config,
            epoch,
            rules,
            vc: VectorClock::new(validators.clone()),
            frames: Frames::new(validators),
            election: Election::new(),
            events: HashMap::new(),
            pending: HashMap::new(),
            waiters: HashMap::new(),
            finalized: Frame::new(0),
            reporter,
            metrics: Metrics::default(),
        }
    }

    /// Registers engine metrics.
    pub fn register_metrics(&self, registry: &mut Registry) {
        let registry = registry.sub_registry_with_prefix("consensus");
        registry.register(
            "confirmed_events",
            "Events confirmed into the final order",
            self.metrics.confirmed_events.clone(),
        );
        registry.register(
            "atropoi",
            "Atropos decisions emitted",
            self.metrics.atropoi.clone(),
        );
        registry.register(
            "epochs_sealed",
            "Epochs sealed",
            self.metrics.epochs_sealed.clone(),
        );
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub fn rules(&self) -> &Rules {
        &self.rules
    }

    pub fn validators(&self) -> &Validators {
        self.vc.validators()
    }

    /// The frame the next event by this node would land in (best effort,
    /// for emitter header fields).
    pub fn current_frame(&self) -> Frame {
        self.frames
            .roots()
            .keys()
            .next_back()
            .copied()
            .unwrap_or(Frame::new(1))
    }

    /// Returns true if the event is already indexed.
    pub fn contains(&self, id: &EventId) -> bool {
        self.vc.has(id)
    }

    /// The happens-before index over this epoch's events.
    pub fn clock(&self) -> &moira_dag::VectorClock {
        &self.vc
    }

    pub fn reporter(&self) -> &R {
        &self.reporter
    }

    pub fn reporter_mut(&mut self) -> &mut R {
        &mut self.reporter
    }

    /// Ingests one event.
    ///
    /// Events from other epochs are rejected with [Error::WrongEpoch] (the
    /// delivery layer retries after rotation). Events with missing parents
    /// are buffered and indexed once the parents arrive. Duplicates are
    /// ignored.
    pub fn process(&mut self, event: Event) -> Result<(), Error> {
        if event.epoch() != self.epoch {
            return Err(Error::WrongEpoch {
                id: event.id(),
                got: event.epoch(),
                want: self.epoch,
            });
        }
        let id = event.id();
        if self.vc.has(&id) || self.pending.contains_key(&id) {
            return Ok(());
        }

        let missing: Vec<EventId> = event
            .parents()
            .iter()
            .filter(|p| !self.vc.has(p))
            .copied()
            .collect();
        if !missing.is_empty() {
            if self.pending.len() >= self.config.max_pending {
                return Err(Error::PendingFull(self.pending.len()));
            }
            debug!(event = %id, missing = missing.len(), "buffering event with missing parents");
            for parent in missing {
                self.waiters.entry(parent).or_default().push(id);
            }
            self.pending.insert(id, event);
            return Ok(());
        }

        self.index(event)?;
        self.drain(id)?;
        self.progress();
        Ok(())
    }

    /// Indexes events from the pending buffer unblocked by `ready`.
    fn drain(&mut self, ready: EventId) -> Result<(), Error> {
        let mut queue = vec![ready];
        while let Some(done) = queue.pop() {
            let Some(waiters) = self.waiters.remove(&done) else {
                continue;
            };
            for waiter in waiters {
                let unblocked = self
                    .pending
                    .get(&waiter)
                    .is_some_and(|e| e.parents().iter().all(|p| self.vc.has(p)));
                if !unblocked {
                    continue;
                }
                if let Some(event) = self.pending.remove(&waiter) {
                    self.index(event)?;
                    queue.push(waiter);
                }
            }
        }
        Ok(())
    }

    fn index(&mut self, event: Event) -> Result<(), Error> {
        let id = event.id();
        if let Some(evidence) = self.vc.add(&event)? {
            warn!(
                creator = %evidence.creator,
                first = %evidence.first,
                second = %evidence.second,
                "self-fork detected, excluding creator"
            );
            self.reporter.cheater_detected(&evidence);
        }
        let (frame, is_root) = self.frames.assign(
            &self.vc,
            id,
            event.creator(),
            event.seq(),
            event.parents(),
        );
        if is_root {
            debug!(event = %id, frame = %frame, "new root");
        }
        self.events.insert(id, event);
        Ok(())
    }

    /// Runs the election and emits every frame that became decidable.
    fn progress(&mut self) {
        self.election
            .sweep(&self.frames, &self.vc, self.finalized.next());

        loop {
            let next = self.finalized.next();
            if !self.election.frame_decided(next, &self.vc) {
                return;
            }
            let atropos_id = self.election.atropos(next, &self.vc);
            self.finalized = next;

            if let Some(atropos_id) = atropos_id {
                if self.emit_atropos(next, atropos_id) {
                    // Epoch rotated; all frame state is gone.
                    return;
                }
            } else {
                warn!(frame = %next, "no accepted root, skipping frame");
            }

            self.frames.prune(self.finalized);
            self.election.prune(self.finalized);
        }
    }

    /// Orders the atropos subgraph and reports it. Returns true if the
    /// epoch sealed.
    fn emit_atropos(&mut self, frame: Frame, atropos_id: EventId) -> bool {
        let Some(atropos) = self.events.get(&atropos_id).cloned() else {
            warn!(frame = %frame, atropos = %atropos_id, "atropos not held, skipping frame");
            return false;
        };
        let mut confirmed: Vec<Event> = self
            .events
            .values()
            .filter(|e| {
                self.vc.sees(&atropos_id, &e.id()) && !self.vc.is_cheater(e.creator())
            })
            .cloned()
            .collect();
        confirmed.sort_by_key(|e| (e.lamport(), e.creator(), e.id()));

        for event in &confirmed {
            self.events.remove(&event.id());
            self.reporter.event_confirmed(event);
        }
        self.metrics
            .confirmed_events
            .inc_by(confirmed.len() as u64);
        self.metrics.atropoi.inc();

        debug!(frame = %frame, atropos = %atropos_id, events = confirmed.len(), "atropos decided");
        self.reporter.atropos_decided(&atropos, &confirmed);

        if frame >= self.rules.max_epoch_frames {
            self.seal(frame);
            return true;
        }
        false
    }

    fn seal(&mut self, frame: Frame) {
        let sealed = self.epoch;
        let (validators, rules) = self.reporter.epoch_sealed(sealed, frame);
        self.epoch = sealed.next();
        self.rules = rules;
        self.vc.reset(validators.clone());
        self.frames = Frames::new(validators);
        self.election = Election::new();
        self.events.clear();
        self.pending.clear();
        self.waiters.clear();
        self.finalized = Frame::new(0);
        self.metrics.epochs_sealed.inc();
        info!(sealed = %sealed, next = %self.epoch, frame = %frame, "epoch sealed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use moira_dag::event::{EventHeader, Payload};
    use moira_dag::keys::FakeSigner;
    use moira_dag::types::{Lamport, ValidatorId};
    use rand::seq::SliceRandom;
    use rand::SeedableRng;
    use std::collections::HashSet;

    /// Generates a full-mesh DAG round by round, independent of any engine.
    struct Mesh {
        epoch: Epoch,
        last: Vec<Option<Event>>,
        round: u64,
    }

    impl Mesh {
        fn new(n: usize) -> Self {
            Self {
                epoch: Epoch::new(1),
                last: vec![None; n],
                round: 0,
            }
        }

        fn round(&mut self) -> Vec<Event> {
            self.round += 1;
            let heads: Vec<EventId> = self
                .last
                .iter()
                .flatten()
                .map(|e| e.id())
                .collect();
            let mut out = Vec::new();
            for v in 0..self.last.len() {
                let creator = ValidatorId::new(v as u32 + 1);
                let mut parents = Vec::new();
                let seq = match &self.last[v] {
                    Some(prev) => {
                        parents.push(prev.id());
                        prev.seq() + 1
                    }
                    None => 1,
                };
                for head in &heads {
                    if !parents.contains(head) {
                        parents.push(*head);
                    }
                }
                let lamport = parents
                    .iter()
                    .map(|p| p.lamport().get())
                    .max()
                    .unwrap_or(0)
                    + 1;
                let header = EventHeader {
                    creator,
                    seq,
                    epoch: self.epoch,
                    frame: Frame::new(0),
                    lamport: Lamport::new(lamport),
                    parents,
                    payload_hash: Default::default(),
                    gas_power_used: 0,
                    gas_power_left: 0,
                    creation_time: self.round * 1_000,
                    median_time: self.round * 1_000,
                };
                let event = Event::sign(header, Payload::default(), &FakeSigner::new(creator));
                self.last[v] = Some(event.clone());
                out.push(event);
            }
            out
        }
    }

    #[derive(Default)]
    struct Recorder {
        confirmed: Vec<EventId>,
        atropoi: Vec<(EventId, Vec<EventId>)>,
        sealed: Vec<(Epoch, Frame)>,
        cheaters: Vec<ValidatorId>,
        next_validators: u32,
    }

    impl Reporter for Recorder {
        fn event_confirmed(&mut self, event: &Event) {
            self.confirmed.push(event.id());
        }

        fn atropos_decided(&mut self, atropos: &Event, confirmed: &[Event]) {
            self.atropoi
                .push((atropos.id(), confirmed.iter().map(|e| e.id()).collect()));
        }

        fn epoch_sealed(&mut self, epoch: Epoch, frame: Frame) -> (Validators, Rules) {
            self.sealed.push((epoch, frame));
            (Validators::fakenet(self.next_validators), Rules::default())
        }

        fn cheater_detected(&mut self, evidence: &ForkEvidence) {
            self.cheaters.push(evidence.creator);
        }
    }

    fn engine(n: u32) -> Engine<Recorder> {
        Engine::new(
            Config::default(),
            Epoch::new(1),
            Validators::fakenet(n),
            Rules::default(),
            Recorder {
                next_validators: n,
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_atropos_emitted_and_ordered() {
        let mut engine = engine(4);
        let mut mesh = Mesh::new(4);
        for _ in 0..10 {
            for event in mesh.round() {
                engine.process(event).unwrap();
            }
        }
        let recorder = engine.reporter();
        assert!(!recorder.atropoi.is_empty(), "no atropos decided");
        // No duplicates across the whole confirmed stream.
        let mut seen = HashSet::new();
        for id in &recorder.confirmed {
            assert!(seen.insert(*id), "event confirmed twice: {id:?}");
        }
        // Each batch is ordered by lamport (embedded in the id tail after
        // the epoch bytes).
        for (_, batch) in &recorder.atropoi {
            let lamports: Vec<u32> = batch.iter().map(|id| id.lamport().get()).collect();
            let mut sorted = lamports.clone();
            sorted.sort_unstable();
            assert_eq!(lamports, sorted);
        }
    }

    #[test]
    fn test_shuffled_delivery_is_deterministic() {
        let mut mesh = Mesh::new(4);
        let mut events = Vec::new();
        for _ in 0..10 {
            events.extend(mesh.round());
        }

        let mut ordered = engine(4);
        for event in &events {
            ordered.process(event.clone()).unwrap();
        }

        for seed in 0..3u64 {
            let mut shuffled = events.clone();
            shuffled.shuffle(&mut rand::rngs::StdRng::seed_from_u64(seed));
            let mut engine = engine(4);
            for event in shuffled {
                engine.process(event).unwrap();
            }
            assert_eq!(
                engine.reporter().atropoi,
                ordered.reporter().atropoi,
                "seed {seed}"
            );
            assert_eq!(engine.reporter().confirmed, ordered.reporter().confirmed);
        }
    }

    #[test]
    fn test_wrong_epoch_rejected() {
        let mut engine = engine(3);
        let mut mesh = Mesh::new(3);
        mesh.epoch = Epoch::new(2);
        let event = mesh.round().remove(0);
        match engine.process(event) {
            Err(Error::WrongEpoch { got, want, .. }) => {
                assert_eq!(got, Epoch::new(2));
                assert_eq!(want, Epoch::new(1));
            }
            other => panic!("expected WrongEpoch, got {other:?}"),
        }
    }

    #[test]
    fn test_duplicate_ignored() {
        let mut engine = engine(3);
        let mut mesh = Mesh::new(3);
        let event = mesh.round().remove(0);
        engine.process(event.clone()).unwrap();
        engine.process(event).unwrap();
        assert_eq!(engine.reporter().confirmed.len(), 0);
    }

    #[test]
    fn test_pending_buffer_bounded() {
        let mut engine = Engine::new(
            Config { max_pending: 2 },
            Epoch::new(1),
            Validators::fakenet(3),
            Rules::default(),
            Recorder::default(),
        );
        let mut mesh = Mesh::new(3);
        mesh.round();
        let second = mesh.round();
        // Parents were never delivered, so these buffer.
        engine.process(second[0].clone()).unwrap();
        engine.process(second[1].clone()).unwrap();
        assert!(matches!(
            engine.process(second[2].clone()),
            Err(Error::PendingFull(2))
        ));
    }

    #[test]
    fn test_missing_parents_drain_in_order() {
        let mut engine = engine(3);
        let mut mesh = Mesh::new(3);
        let first = mesh.round();
        let second = mesh.round();
        // Children first: they buffer.
        for event in &second {
            engine.process(event.clone()).unwrap();
        }
        assert!(!engine.contains(&second[0].id()));
        // Parents arrive, children drain.
        for event in &first {
            engine.process(event.clone()).unwrap();
        }
        for event in &second {
            assert!(engine.contains(&event.id()));
        }
    }

    #[test]
    fn test_epoch_seals_and_rotates() {
        let mut engine = Engine::new(
            Config::default(),
            Epoch::new(1),
            Validators::fakenet(4),
            Rules {
                max_epoch_frames: Frame::new(2),
                ..Rules::default()
            },
            Recorder {
                next_validators: 4,
                ..Default::default()
            },
        );
        let mut mesh = Mesh::new(4);
        let mut old_epoch_events = Vec::new();
        for _ in 0..14 {
            for event in mesh.round() {
                match engine.process(event.clone()) {
                    Ok(()) => {}
                    Err(Error::WrongEpoch { .. }) => old_epoch_events.push(event),
                    Err(other) => panic!("{other}"),
                }
            }
            if engine.epoch() > Epoch::new(1) {
                break;
            }
        }
        assert_eq!(engine.epoch(), Epoch::new(2));
        assert_eq!(engine.reporter().sealed, vec![(Epoch::new(1), Frame::new(2))]);

        // A fresh epoch accepts new leaves.
        let mut next = Mesh::new(4);
        next.epoch = Epoch::new(2);
        for event in next.round() {
            let id = event.id();
            engine.process(event).unwrap();
            assert!(engine.contains(&id));
        }
    }

    #[test]
    fn test_fork_reported_and_excluded() {
        let mut engine = engine(4);
        let mut mesh = Mesh::new(4);
        let first = mesh.round();
        for event in &first {
            engine.process(event.clone()).unwrap();
        }
        // A second leaf by validator 1: same (creator, seq), new content.
        let header = EventHeader {
            creator: ValidatorId::new(1),
            seq: 1,
            epoch: Epoch::new(1),
            frame: Frame::new(0),
            lamport: Lamport::new(1),
            parents: vec![],
            payload_hash: Default::default(),
            gas_power_used: 0,
            gas_power_left: 0,
            creation_time: 999,
            median_time: 999,
        };
        let fork = Event::sign(
            header,
            Payload::default(),
            &FakeSigner::new(ValidatorId::new(1)),
        );
        engine.process(fork).unwrap();
        assert_eq!(engine.reporter().cheaters, vec![ValidatorId::new(1)]);

        // The cheater's events never enter the final order.
        for _ in 0..10 {
            for event in mesh.round() {
                engine.process(event).unwrap();
            }
        }
        let confirmed = &engine.reporter().confirmed;
        assert!(!confirmed.is_empty());
        let v1_events: Vec<&EventId> = confirmed
            .iter()
            .filter(|id| first[0].id() == **id)
            .collect();
        assert!(v1_events.is_empty(), "cheater event confirmed");
    }
}
