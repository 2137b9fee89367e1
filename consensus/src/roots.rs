//! Frame assignment and the strongly-sees relation.
//!
//! An event strongly sees a root when events by a quorum of validator
//! branches sit between them. The tracker maintains, per event and per
//! tracked root, the set of validators it sees the root "through"; the set
//! is the union of the parents' sets plus the event's own creator when the
//! event sees the root, so it is computed once at insertion and never
//! revisited.

use moira_dag::types::{EventId, Frame, ValidatorId};
use moira_dag::validators::Validators;
use moira_dag::vecclock::VectorClock;
use std::collections::{BTreeMap, HashMap};

/// A validator bitset laid out by vector-clock slot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct Mask {
    bits: Vec<u64>,
}

impl Mask {
    pub fn new(slots: usize) -> Self {
        Self {
            bits: vec![0; slots.div_ceil(64)],
        }
    }

    pub fn set(&mut self, slot: usize) {
        self.bits[slot / 64] |= 1 << (slot % 64);
    }

    pub fn get(&self, slot: usize) -> bool {
        self.bits
            .get(slot / 64)
            .is_some_and(|word| word & (1 << (slot % 64)) != 0)
    }

    pub fn union(&mut self, other: &Mask) {
        for (word, with) in self.bits.iter_mut().zip(other.bits.iter()) {
            *word |= with;
        }
    }
}

/// A root event of some frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RootInfo {
    pub id: EventId,
    pub creator: ValidatorId,
}

/// Per-epoch frame and root bookkeeping.
pub(crate) struct Frames {
    validators: Validators,
    quorum: u64,
    roots: BTreeMap<Frame, Vec<RootInfo>>,
    frame_of: HashMap<EventId, Frame>,
    through: HashMap<EventId, HashMap<EventId, Mask>>,
}

impl Frames {
    pub fn new(validators: Validators) -> Self {
        Self {
            quorum: validators.quorum(),
            validators,
            roots: BTreeMap::new(),
            frame_of: HashMap::new(),
            through: HashMap::new(),
        }
    }

    pub fn roots(&self) -> &BTreeMap<Frame, Vec<RootInfo>> {
        &self.roots
    }

    pub fn roots_of(&self, frame: Frame) -> &[RootInfo] {
        self.roots.get(&frame).map_or(&[], Vec::as_slice)
    }

    pub fn frame_of(&self, id: &EventId) -> Option<Frame> {
        self.frame_of.get(id).copied()
    }

    /// Returns true if `event` sees `root` through a quorum of validator
    /// branches.
    pub fn strongly_sees(&self, event: &EventId, root: &EventId) -> bool {
        self.through
            .get(event)
            .and_then(|masks| masks.get(root))
            .is_some_and(|mask| self.mask_weight(mask) >= self.quorum)
    }

    fn mask_weight(&self, mask: &Mask) -> u64 {
        self.validators
            .iter()
            .enumerate()
            .filter(|(slot, _)| mask.get(*slot))
            .map(|(_, (_, profile))| profile.weight)
            .sum()
    }

    /// Assigns a frame to a freshly indexed event and registers it as a
    /// root when it advances the frame (or is a leaf). Cheater events never
    /// become roots. Returns `(frame, is_root)`.
    pub fn assign(
        &mut self,
        vc: &VectorClock,
        id: EventId,
        creator: ValidatorId,
        seq: u32,
        parents: &[EventId],
    ) -> (Frame, bool) {
        let slots = self.validators.len();
        let slot = self.validators.index_of(creator);

        // Through-sets over every tracked root, inherited from the parents.
        let mut masks: HashMap<EventId, Mask> = HashMap::new();
        for roots in self.roots.values() {
            for root in roots {
                let mut mask = Mask::new(slots);
                for parent in parents {
                    if let Some(inherited) =
                        self.through.get(parent).and_then(|m| m.get(&root.id))
                    {
                        mask.union(inherited);
                    }
                }
                if vc.sees(&id, &root.id) {
                    if let Some(slot) = slot {
                        mask.set(slot);
                    }
                }
                masks.insert(root.id, mask);
            }
        }

        let (frame, is_root) = if seq <= 1 || parents.is_empty() {
            // A creator's first event of the epoch is a frame-1 root.
            (Frame::new(1), true)
        } else {
            let base = parents
                .iter()
                .filter_map(|p| self.frame_of.get(p).copied())
                .max()
                .unwrap_or(Frame::new(1));
            let seen_weight: u64 = self
                .roots_of(base)
                .iter()
                .filter(|root| {
                    masks
                        .get(&root.id)
                        .is_some_and(|mask| self.mask_weight(mask) >= self.quorum)
                })
                .map(|root| self.validators.weight(root.creator))
                .sum();
            if seen_weight >= self.quorum {
                (base.next(), true)
            } else {
                (base, false)
            }
        };

        self.frame_of.insert(id, frame);
        self.through.insert(id, masks);

        let registered = is_root && !vc.is_cheater(creator);
        if registered {
            self.roots
                .entry(frame)
                .or_default()
                .push(RootInfo { id, creator });
            // A root sees itself through its own branch.
            if let Some(slot) = slot {
                let mut own = Mask::new(slots);
                own.set(slot);
                if let Some(masks) = self.through.get_mut(&id) {
                    masks.insert(id, own);
                }
            }
        }
        (frame, registered)
    }

    /// Drops roots and through-set entries for frames below `floor`.
    pub fn prune(&mut self, floor: Frame) {
        let stale: Vec<EventId> = self
            .roots
            .range(..floor)
            .flat_map(|(_, roots)| roots.iter().map(|r| r.id))
            .collect();
        self.roots.retain(|frame, _| *frame >= floor);
        for masks in self.through.values_mut() {
            for id in &stale {
                masks.remove(id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use moira_dag::event::{Event, EventHeader, Payload};
    use moira_dag::keys::FakeSigner;
    use moira_dag::types::{Epoch, Lamport};

    struct Net {
        vc: VectorClock,
        frames: Frames,
        last: HashMap<u32, Event>,
    }

    impl Net {
        fn new(n: u32) -> Self {
            let validators = Validators::fakenet(n);
            Self {
                vc: VectorClock::new(validators.clone()),
                frames: Frames::new(validators),
                last: HashMap::new(),
            }
        }

        fn emit(&mut self, creator: u32, extra_parents: &[EventId]) -> (Event, Frame, bool) {
            let mut parents = Vec::new();
            let seq = match self.last.get(&creator) {
                Some(prev) => {
                    parents.push(prev.id());
                    prev.seq() + 1
                }
                None => 1,
            };
            for p in extra_parents {
                if !parents.contains(p) {
                    parents.push(*p);
                }
            }
            let lamport = parents
                .iter()
                .map(|p| p.lamport().get())
                .max()
                .unwrap_or(0)
                + 1;
            let header = EventHeader {
                creator: ValidatorId::new(creator),
                seq,
                epoch: Epoch::new(1),
                frame: Frame::new(0),
                lamport: Lamport::new(lamport),
                parents: parents.clone(),
                payload_hash: Default::default(),
                gas_power_used: 0,
                gas_power_left: 0,
                creation_time: lamport as u64,
                median_time: lamport as u64,
            };
            let event = Event::sign(
                header,
                Payload::default(),
                &FakeSigner::new(ValidatorId::new(creator)),
            );
            self.vc.add(&event).unwrap();
            let (frame, is_root) = self.frames.assign(
                &self.vc,
                event.id(),
                event.creator(),
                event.seq(),
                event.parents(),
            );
            self.last.insert(creator, event.clone());
            (event, frame, is_root)
        }

        /// One full-mesh round: every validator emits with everyone's
        /// previous event as parents. Returns the round's events.
        fn round(&mut self) -> Vec<(Event, Frame, bool)> {
            let heads: Vec<EventId> = self.last.values().map(|e| e.id()).collect();
            (1..=self.vc.validators().len() as u32)
                .map(|creator| self.emit(creator, &heads))
                .collect()
        }
    }

    #[test]
    fn test_leaves_are_frame_one_roots() {
        let mut net = Net::new(3);
        for creator in 1..=3 {
            let (_, frame, is_root) = net.emit(creator, &[]);
            assert_eq!(frame, Frame::new(1));
            assert!(is_root);
        }
        assert_eq!(net.frames.roots_of(Frame::new(1)).len(), 3);
    }

    #[test]
    fn test_frame_advances_on_strong_quorum() {
        let mut net = Net::new(3);
        net.round();
        // Second round sees the leaves but not strongly (only one branch
        // in between); frame stays at 1.
        for (_, frame, is_root) in net.round() {
            assert_eq!(frame, Frame::new(1));
            assert!(!is_root);
        }
        // Third round strongly sees the leaves through all branches.
        for (_, frame, is_root) in net.round() {
            assert_eq!(frame, Frame::new(2));
            assert!(is_root);
        }
    }

    #[test]
    fn test_strongly_sees_needs_quorum_of_branches() {
        let mut net = Net::new(3);
        let leaves = net.round();
        let a1 = leaves[0].0.id();
        // v1's chain alone never strongly sees a1.
        let (b1, _, _) = net.emit(1, &[]);
        let (c1, _, _) = net.emit(1, &[]);
        assert!(net.vc.sees(&c1.id(), &a1));
        assert!(!net.frames.strongly_sees(&c1.id(), &a1));
        assert!(!net.frames.strongly_sees(&b1.id(), &a1));
    }

    #[test]
    fn test_prune_drops_stale_roots() {
        let mut net = Net::new(3);
        for _ in 0..5 {
            net.round();
        }
        assert!(!net.frames.roots_of(Frame::new(1)).is_empty());
        net.frames.prune(Frame::new(2));
        assert!(net.frames.roots_of(Frame::new(1)).is_empty());
        assert!(!net.frames.roots_of(Frame::new(2)).is_empty());
    }
}
