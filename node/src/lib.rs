//! The node: configuration, datadir and errlock management, the CLI's
//! file formats, and the wiring that assembles the other crates into a
//! running validator.

pub mod cli;
pub mod config;
pub mod dbops;
pub mod errlock;
pub mod files;
pub mod ingress;
pub mod node;

pub use config::NodeConfig;
pub use errlock::ErrLock;
pub use ingress::Ingress;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("config: {0}")]
    Config(#[from] toml::de::Error),
    #[error("codec: {0}")]
    Codec(#[from] moira_codec::Error),
    #[error("store: {0}")]
    Store(#[from] moira_kvdb::Error),
    #[error("gossip: {0}")]
    Gossip(#[from] moira_gossip::Error),
    #[error("consensus: {0}")]
    Consensus(#[from] moira_consensus::Error),
    #[error("emitter: {0}")]
    Emitter(#[from] moira_emitter::Error),
    #[error("event rejected: {0}")]
    Check(#[from] moira_dag::CheckError),
    #[error("node is locked: {0}")]
    Locked(String),
    #[error("{file}: {reason}")]
    BadFile { file: &'static str, reason: String },
    #[error("{0} requires --experimental")]
    Experimental(&'static str),
    #[error("free disk {available} below the configured minimum {required}")]
    LowDisk { available: u64, required: u64 },
}
