//! Lachesis-style consensus: frame assignment, root election, atropos
//! decision, deterministic ordering, and epoch sealing.

mod election;
mod roots;

pub mod engine;
pub mod store;

pub use engine::{Config, Engine, Reporter};
pub use store::EpochStore;

use moira_dag::types::{Epoch, EventId};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("event {id} belongs to epoch {got}, engine is at {want}")]
    WrongEpoch {
        id: EventId,
        got: Epoch,
        want: Epoch,
    },
    #[error("pending buffer full ({0} events)")]
    PendingFull(usize),
    #[error("index: {0}")]
    Index(#[from] moira_dag::vecclock::Error),
    #[error("codec: {0}")]
    Codec(#[from] moira_codec::Error),
    #[error("store: {0}")]
    Store(#[from] moira_kvdb::Error),
}
