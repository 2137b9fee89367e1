//! Parent selection by observation coverage.
//!
//! Heads are ranked by how much new validator observation, weighted by
//! stake, they would add to the event under construction. Greedy selection
//! makes redundancy worthless: a head whose whole view is already covered
//! by the chosen parents scores zero and is dropped.

use moira_dag::types::EventId;
use moira_dag::vecclock::VectorClock;

/// Picks up to `max_parents` parents from `heads`. The self-parent, when
/// present, always comes first.
pub fn select_parents(
    clock: &VectorClock,
    self_parent: Option<EventId>,
    heads: &[EventId],
    max_parents: u32,
) -> Vec<EventId> {
    let max_parents = max_parents.max(1) as usize;
    let validators = clock.validators();
    let mut chosen = Vec::new();
    let mut coverage = vec![0u32; validators.len()];

    let mut cover = |coverage: &mut Vec<u32>, id: &EventId| {
        for (slot, (validator, _)) in validators.iter().enumerate() {
            coverage[slot] = coverage[slot].max(clock.highest_seen(id, validator));
        }
    };
    if let Some(id) = self_parent {
        chosen.push(id);
        cover(&mut coverage, &id);
    }

    let mut candidates: Vec<EventId> = heads
        .iter()
        .copied()
        .filter(|head| Some(*head) != self_parent && clock.has(head))
        .collect();
    candidates.sort();
    candidates.dedup();

    while chosen.len() < max_parents {
        let mut best: Option<(u64, EventId)> = None;
        for head in &candidates {
            if chosen.contains(head) {
                continue;
            }
            let mut gain = 0u64;
            for (slot, (validator, profile)) in validators.iter().enumerate() {
                if clock.highest_seen(head, validator) > coverage[slot] {
                    gain += profile.weight;
                }
            }
            if gain == 0 {
                continue;
            }
            if best.is_none_or(|(bg, bid)| gain > bg || (gain == bg && *head < bid)) {
                best = Some((gain, *head));
            }
        }
        let Some((_, head)) = best else { break };
        chosen.push(head);
        cover(&mut coverage, &head);
    }

    // Fallback when the metric finds nothing: a leaf still references the
    // freshest heads it knows.
    if chosen.len() < 2 {
        for head in candidates {
            if chosen.len() >= max_parents {
                break;
            }
            if !chosen.contains(&head) {
                chosen.push(head);
            }
        }
    }
    chosen
}
