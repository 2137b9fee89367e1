//! Epoch-scoped event persistence.
//!
//! Events are keyed by their raw identifier. Identifiers sort by
//! (epoch, lamport) and a parent's lamport is strictly below its child's,
//! so a plain key scan replays the epoch in a valid topological order and
//! a restarted engine rebuilds without a pending buffer.

use crate::engine::{Engine, Reporter};
use crate::Error;
use moira_codec::{Decode, Encode};
use moira_dag::event::Event;
use moira_dag::types::EventId;
use moira_kvdb::SharedKv;
use tracing::debug;

/// The event table of one `hashgraph-<epoch>` partition.
#[derive(Clone)]
pub struct EpochStore {
    kv: SharedKv,
}

impl EpochStore {
    pub fn new(kv: SharedKv) -> Self {
        Self { kv }
    }

    /// Persists an event. Not durable until the producer flushes.
    pub fn insert(&self, event: &Event) -> Result<(), Error> {
        self.kv
            .put(event.id().as_bytes(), &event.encode())
            .map_err(Error::from)
    }

    pub fn get(&self, id: &EventId) -> Result<Option<Event>, Error> {
        match self.kv.get(id.as_bytes())? {
            Some(raw) => Ok(Some(Event::decode(raw.as_slice())?)),
            None => Ok(None),
        }
    }

    pub fn has(&self, id: &EventId) -> Result<bool, Error> {
        self.kv.has(id.as_bytes()).map_err(Error::from)
    }

    /// Number of stored events.
    pub fn len(&self) -> Result<usize, Error> {
        let mut count = 0;
        for pair in self.kv.iterate(&[], None)? {
            pair?;
            count += 1;
        }
        Ok(count)
    }

    pub fn is_empty(&self) -> Result<bool, Error> {
        Ok(self.kv.iterate(&[], None)?.next().is_none())
    }

    /// Feeds every stored event into the engine in key order.
    pub fn replay<R: Reporter>(&self, engine: &mut Engine<R>) -> Result<usize, Error> {
        let mut replayed = 0;
        for pair in self.kv.iterate(&[], None)? {
            let (_, raw) = pair?;
            engine.process(Event::decode(raw.as_ref())?)?;
            replayed += 1;
        }
        debug!(events = replayed, "epoch replayed");
        Ok(replayed)
    }
}
