//! Validator-side event creation.
//!
//! The emitter runs one loop per node: wait for a slot, pick parents and
//! transactions, sign, persist the doublesign-protection record, submit.
//! Slot timing backs off under congestion; a restart refuses to emit until
//! the protection window after the last persisted emission has passed.

pub mod emitter;
pub mod gas;
pub mod parents;
pub mod persist;
pub mod slots;

pub use emitter::{now_nanos, Context, Emitter, EmitterConfig, Phase};
pub use gas::GasPower;
pub use persist::{EmitterFiles, PrevEvent};
pub use slots::{SlotConfig, Throttle};

use moira_dag::types::EventId;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("store: {0}")]
    Store(#[from] moira_gossip::Error),
    #[error("codec: {0}")]
    Codec(#[from] moira_codec::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("own event {0} rejected by local validation")]
    OwnEventRejected(EventId),
    #[error("gas power exhausted")]
    GasPowerExhausted,
}

/// Injected handler for unrecoverable errors; production wires it to the
/// errlock path.
pub type FatalHandler = Arc<dyn Fn(&Error) + Send + Sync>;
