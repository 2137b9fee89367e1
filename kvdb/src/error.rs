//! Error types for the storage substrate.

use thiserror::Error;

/// Errors surfaced by stores, the producer, and the routing layer.
///
/// Backend errors are carried verbatim in [Error::Backend]; nothing in this
/// crate reinterprets them.
#[derive(Error, Debug)]
pub enum Error {
    #[error("database closed")]
    Closed,
    #[error("operation not supported: {0}")]
    UnsupportedOp(&'static str),
    #[error("database corrupted: {0}")]
    Corrupted(String),
    #[error("unknown routing key: {0}")]
    UnknownRoute(String),
    #[error("invalid database name: {0}")]
    InvalidName(String),
    #[error("tables layout mismatch: on-disk version {disk}, expected {expected}")]
    LayoutMismatch { disk: u32, expected: u32 },
    #[error("iterator leak: {db} has {count} outstanding iterators")]
    Leaked { db: String, count: usize },
    #[error("backend error: {0}")]
    Backend(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
