//! Typed stores over the storage substrate, the EVM state store, the
//! block processor, and the transaction pool contract.

mod trie;

pub mod evm;
pub mod processor;
pub mod stores;
pub mod txpool;

pub use evm::{Account, EvmStore, StateDb};
pub use processor::Processor;
pub use stores::GossipStore;
pub use txpool::{TxDesc, TxPool};

use moira_dag::types::Hash;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("store: {0}")]
    Store(#[from] moira_kvdb::Error),
    #[error("codec: {0}")]
    Codec(#[from] moira_codec::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("state node {0} is missing")]
    MissingState(Hash),
    #[error("state node hash mismatch: expected {expected}, got {got}")]
    StateMismatch { expected: Hash, got: Hash },
    #[error("transaction pool full ({0} transactions)")]
    PoolFull(usize),
}

/// Injected handler for unrecoverable errors; production wires it to the
/// errlock path.
pub type FatalHandler = Arc<dyn Fn(&Error) + Send + Sync>;
