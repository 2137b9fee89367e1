//! Root election.
//!
//! The election decides, for every (frame, validator) slot, whether that
//! validator's root of the frame enters history. Roots of frame f+1 vote
//! directly: yes iff they descend from the slot's root. Roots of later
//! frames adopt the majority-by-weight vote among the previous-frame roots
//! they strongly see, and the slot is decided once the agreeing weight
//! reaches quorum. Every vote is a function of the DAG alone, so all nodes
//! decide each slot identically regardless of delivery order.

use crate::roots::Frames;
use moira_dag::types::{EventId, Frame, ValidatorId};
use moira_dag::vecclock::VectorClock;
use std::collections::HashMap;
use tracing::debug;

#[derive(Default)]
pub(crate) struct Election {
    /// (voter root, subject frame, subject validator) -> vote.
    votes: HashMap<(EventId, Frame, ValidatorId), bool>,
    /// Decided slots; `Some(root)` means the root enters history.
    decided: HashMap<(Frame, ValidatorId), Option<EventId>>,
}

impl Election {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true once every validator slot of `frame` is decided.
    pub fn frame_decided(&self, frame: Frame, vc: &VectorClock) -> bool {
        vc.validators()
            .ids()
            .all(|v| self.decided.contains_key(&(frame, v)))
    }

    /// The accepted root with the smallest id in a fully decided frame.
    pub fn atropos(&self, frame: Frame, vc: &VectorClock) -> Option<EventId> {
        vc.validators()
            .ids()
            .filter_map(|v| self.decided.get(&(frame, v)).copied().flatten())
            .min()
    }

    /// Computes every missing vote for slots at frames in
    /// `floor..max_known`, deciding slots where quorum is reached.
    ///
    /// Voters are processed in ascending frame order, so an aggregating
    /// voter always finds the previous frame's votes already in place.
    pub fn sweep(&mut self, frames: &Frames, vc: &VectorClock, floor: Frame) {
        let validators = vc.validators();
        let quorum = validators.quorum();
        let Some(max_frame) = frames.roots().keys().next_back().copied() else {
            return;
        };

        for subject_frame in floor.get()..max_frame.get() {
            let subject_frame = Frame::new(subject_frame);
            for subject in validators.ids() {
                if self.decided.contains_key(&(subject_frame, subject)) {
                    continue;
                }
                if vc.is_cheater(subject) {
                    self.decided.insert((subject_frame, subject), None);
                    debug!(frame = %subject_frame, validator = %subject, "cheater slot voided");
                    continue;
                }
                let subject_root = frames
                    .roots_of(subject_frame)
                    .iter()
                    .find(|r| r.creator == subject)
                    .map(|r| r.id);

                'voters: for (voter_frame, voters) in frames.roots().range(subject_frame.next()..)
                {
                    for voter in voters {
                        let key = (voter.id, subject_frame, subject);
                        if self.votes.contains_key(&key) {
                            continue;
                        }
                        let vote = if *voter_frame == subject_frame.next() {
                            subject_root.is_some_and(|r| vc.sees(&voter.id, &r))
                        } else {
                            let prev = Frame::new(voter_frame.get() - 1);
                            let mut yes = 0u64;
                            let mut no = 0u64;
                            for carrier in frames.roots_of(prev) {
                                if !frames.strongly_sees(&voter.id, &carrier.id) {
                                    continue;
                                }
                                match self.votes.get(&(carrier.id, subject_frame, subject)) {
                                    Some(true) => yes += validators.weight(carrier.creator),
                                    Some(false) => no += validators.weight(carrier.creator),
                                    None => {}
                                }
                            }
                            if yes >= quorum || no >= quorum {
                                let accepted = yes >= quorum;
                                self.votes.insert(key, accepted);
                                self.decided.insert(
                                    (subject_frame, subject),
                                    if accepted { subject_root } else { None },
                                );
                                debug!(
                                    frame = %subject_frame,
                                    validator = %subject,
                                    accepted,
                                    "slot decided"
                                );
                                break 'voters;
                            }
                            yes >= no
                        };
                        self.votes.insert(key, vote);
                    }
                }
            }
        }
    }

    /// Drops votes and decisions for frames below `floor`.
    pub fn prune(&mut self, floor: Frame) {
        self.votes.retain(|(_, frame, _), _| *frame >= floor);
        self.decided.retain(|(frame, _), _| *frame >= floor);
    }
}
