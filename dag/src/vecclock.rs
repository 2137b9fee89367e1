//! Incremental happens-before index.
//!
//! For every event the index keeps a compact vector of the highest
//! sequence number seen per validator. Adding an event is a componentwise
//! max over its parents' vectors plus its own slot, so `sees` answers in
//! O(validators) and the index grows linearly with the epoch.
//!
//! Two events by the same creator with the same sequence number are a
//! self-fork; the index reports the evidence and remembers the creator as
//! a cheater for the rest of the epoch.

use crate::event::Event;
use crate::types::{EventId, ValidatorId};
use crate::validators::Validators;
use std::collections::{BTreeSet, HashMap};
use thiserror::Error;

/// Errors from the vector-clock index.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("event creator {0} is not in the validator set")]
    UnknownValidator(ValidatorId),
    #[error("parent {0} is not indexed")]
    MissingParent(EventId),
    #[error("event {0} is already indexed")]
    AlreadyIndexed(EventId),
}

/// Evidence of a self-fork: two distinct events by one creator with the
/// same sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForkEvidence {
    pub creator: ValidatorId,
    pub first: EventId,
    pub second: EventId,
}

#[derive(Debug, Clone, Copy)]
struct EventInfo {
    creator: ValidatorId,
    slot: usize,
    seq: u32,
    creation_time: u64,
}

/// The vector-clock index over one epoch's DAG.
pub struct VectorClock {
    validators: Validators,
    vectors: HashMap<EventId, Box<[u32]>>,
    info: HashMap<EventId, EventInfo>,
    branches: HashMap<(ValidatorId, u32), EventId>,
    cheaters: BTreeSet<ValidatorId>,
}

impl VectorClock {
    pub fn new(validators: Validators) -> Self {
        Self {
            validators,
            vectors: HashMap::new(),
            info: HashMap::new(),
            branches: HashMap::new(),
            cheaters: BTreeSet::new(),
        }
    }

    /// Drops all state and installs the next epoch's validator set.
    pub fn reset(&mut self, validators: Validators) {
        self.validators = validators;
        self.vectors.clear();
        self.info.clear();
        self.branches.clear();
        self.cheaters.clear();
    }

    /// The validator set this index is scoped to.
    pub fn validators(&self) -> &Validators {
        &self.validators
    }

    /// Returns true if `id` has been indexed.
    pub fn has(&self, id: &EventId) -> bool {
        self.vectors.contains_key(id)
    }

    /// Validators caught self-forking this epoch.
    pub fn cheaters(&self) -> impl Iterator<Item = ValidatorId> + '_ {
        self.cheaters.iter().copied()
    }

    pub fn is_cheater(&self, id: ValidatorId) -> bool {
        self.cheaters.contains(&id)
    }

    /// Indexes an event whose parents are all indexed. Returns fork
    /// evidence if this event exposes a self-fork.
    pub fn add(&mut self, event: &Event) -> Result<Option<ForkEvidence>, Error> {
        let id = event.id();
        if self.vectors.contains_key(&id) {
            return Err(Error::AlreadyIndexed(id));
        }
        let creator = event.creator();
        let slot = self
            .validators
            .index_of(creator)
            .ok_or(Error::UnknownValidator(creator))?;

        let mut vector = vec![0u32; self.validators.len()].into_boxed_slice();
        for parent in event.parents() {
            let parent_vector = self
                .vectors
                .get(parent)
                .ok_or(Error::MissingParent(*parent))?;
            for (own, seen) in vector.iter_mut().zip(parent_vector.iter()) {
                *own = (*own).max(*seen);
            }
        }
        vector[slot] = vector[slot].max(event.seq());

        self.vectors.insert(id, vector);
        self.info.insert(
            id,
            EventInfo {
                creator,
                slot,
                seq: event.seq(),
                creation_time: event.header().creation_time,
            },
        );

        let evidence = match self.branches.insert((creator, event.seq()), id) {
            Some(first) if first != id => {
                self.cheaters.insert(creator);
                Some(ForkEvidence {
                    creator,
                    first,
                    second: id,
                })
            }
            _ => None,
        };
        Ok(evidence)
    }

    /// Returns true iff `a` sees `b`: `b` is `a` itself or a transitive
    /// parent of `a`. Both must be indexed.
    pub fn sees(&self, a: &EventId, b: &EventId) -> bool {
        if a == b {
            return self.has(a);
        }
        let (Some(va), Some(ib)) = (self.vectors.get(a), self.info.get(b)) else {
            return false;
        };
        va[ib.slot] >= ib.seq
    }

    /// Stake-weighted median of the parents' creation times; `own_time`
    /// when there are no parents.
    pub fn median_time(&self, parents: &[EventId], own_time: u64) -> u64 {
        let mut weighted: Vec<(u64, u64)> = parents
            .iter()
            .filter_map(|p| self.info.get(p))
            .map(|info| (info.creation_time, self.validators.weight(info.creator)))
            .collect();
        if weighted.is_empty() {
            return own_time;
        }
        weighted.sort_unstable_by_key(|(time, _)| *time);
        let total: u64 = weighted.iter().map(|(_, w)| w).sum();
        let half = total / 2;
        let mut acc = 0u64;
        for (time, weight) in &weighted {
            acc += weight;
            if acc > half {
                return *time;
            }
        }
        weighted.last().unwrap().0
    }

    /// The creator of an indexed event.
    pub fn creator_of(&self, id: &EventId) -> Option<ValidatorId> {
        self.info.get(id).map(|info| info.creator)
    }

    /// The highest sequence number of `creator` seen by `observer`.
    pub fn highest_seen(&self, observer: &EventId, creator: ValidatorId) -> u32 {
        let (Some(vector), Some(slot)) = (
            self.vectors.get(observer),
            self.validators.index_of(creator),
        ) else {
            return 0;
        };
        vector[slot]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventHeader, Payload};
    use crate::keys::FakeSigner;
    use crate::types::{Epoch, Frame, Lamport};
    use rand::seq::SliceRandom;
    use rand::{Rng, SeedableRng};
    use std::collections::HashSet;

    fn make_event(
        creator: u32,
        seq: u32,
        parents: Vec<EventId>,
        lamport: u32,
        time: u64,
    ) -> Event {
        let header = EventHeader {
            creator: ValidatorId::new(creator),
            seq,
            epoch: Epoch::new(1),
            frame: Frame::new(1),
            lamport: Lamport::new(lamport),
            parents,
            payload_hash: Default::default(),
            gas_power_used: 0,
            gas_power_left: 0,
            creation_time: time,
            median_time: time,
        };
        Event::sign(header, Payload::default(), &FakeSigner::new(ValidatorId::new(creator)))
    }

    #[test]
    fn test_sees_direct_and_transitive() {
        let mut vc = VectorClock::new(Validators::fakenet(3));
        let a = make_event(1, 1, vec![], 1, 10);
        let b = make_event(2, 1, vec![a.id()], 2, 20);
        let c = make_event(3, 1, vec![b.id()], 3, 30);
        vc.add(&a).unwrap();
        vc.add(&b).unwrap();
        vc.add(&c).unwrap();

        assert!(vc.sees(&b.id(), &a.id()));
        assert!(vc.sees(&c.id(), &b.id()));
        // Transitivity
        assert!(vc.sees(&c.id(), &a.id()));
        // Not symmetric
        assert!(!vc.sees(&a.id(), &c.id()));
        // Reflexive
        assert!(vc.sees(&a.id(), &a.id()));
    }

    #[test]
    fn test_missing_parent_rejected() {
        let mut vc = VectorClock::new(Validators::fakenet(2));
        let ghost = EventId::assemble(Epoch::new(1), Lamport::new(1), &[9; 24]);
        let event = make_event(1, 1, vec![ghost], 2, 10);
        assert_eq!(vc.add(&event), Err(Error::MissingParent(ghost)));
    }

    #[test]
    fn test_fork_detection() {
        let mut vc = VectorClock::new(Validators::fakenet(2));
        let a = make_event(1, 1, vec![], 1, 10);
        vc.add(&a).unwrap();
        // Same creator, same seq, different content.
        let forked = make_event(1, 1, vec![], 1, 11);
        let evidence = vc.add(&forked).unwrap().expect("fork must be detected");
        assert_eq!(evidence.creator, ValidatorId::new(1));
        assert!(vc.is_cheater(ValidatorId::new(1)));
    }

    #[test]
    fn test_median_time_weighted() {
        let validators = Validators::build([
            (
                ValidatorId::new(1),
                crate::validators::Profile { weight: 1, public: Default::default() },
            ),
            (
                ValidatorId::new(2),
                crate::validators::Profile { weight: 10, public: Default::default() },
            ),
        ]);
        let mut vc = VectorClock::new(validators);
        let a = make_event(1, 1, vec![], 1, 100);
        let b = make_event(2, 1, vec![], 1, 500);
        vc.add(&a).unwrap();
        vc.add(&b).unwrap();
        // Validator 2's weight dominates: the median lands on its time.
        assert_eq!(vc.median_time(&[a.id(), b.id()], 0), 500);
        // No parents: fall back to the event's own time.
        assert_eq!(vc.median_time(&[], 42), 42);
    }

    /// Causality against a transitive-closure oracle over random DAGs fed
    /// in random topological orders.
    #[test]
    fn test_causality_matches_oracle() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        for _ in 0..20 {
            let n_validators = rng.gen_range(2..6);
            let mut vc = VectorClock::new(Validators::fakenet(n_validators));
            let mut events: Vec<Event> = Vec::new();
            let mut ancestors: HashMap<EventId, HashSet<EventId>> = HashMap::new();
            let mut last_by_creator: HashMap<u32, Event> = HashMap::new();

            for step in 0..40 {
                let creator = rng.gen_range(1..=n_validators);
                let mut parents = Vec::new();
                let seq = match last_by_creator.get(&creator) {
                    Some(prev) => {
                        parents.push(prev.id());
                        prev.seq() + 1
                    }
                    None => 1,
                };
                // Random extra parents from already-created events.
                for _ in 0..rng.gen_range(0..3) {
                    if let Some(extra) = events.choose(&mut rng) {
                        if !parents.contains(&extra.id()) {
                            parents.push(extra.id());
                        }
                    }
                }
                let lamport = parents
                    .iter()
                    .map(|p| p.lamport().get())
                    .max()
                    .unwrap_or(0)
                    + 1;
                let event = make_event(creator, seq, parents.clone(), lamport, step);
                let mut closure: HashSet<EventId> = HashSet::new();
                for parent in &parents {
                    closure.insert(*parent);
                    closure.extend(ancestors[parent].iter().copied());
                }
                ancestors.insert(event.id(), closure);
                last_by_creator.insert(creator, event.clone());
                vc.add(&event).unwrap();
                events.push(event);
            }

            for a in &events {
                for b in &events {
                    let expected = a.id() == b.id() || ancestors[&a.id()].contains(&b.id());
                    assert_eq!(
                        vc.sees(&a.id(), &b.id()),
                        expected,
                        "sees({:?}, {:?})",
                        a.id(),
                        b.id()
                    );
                }
            }
        }
    }
}
