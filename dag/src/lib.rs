//! DAG primitives: identifiers, events, validator sets, and the
//! happens-before index the consensus engine is built on.

pub mod chain;
pub mod event;
pub mod keys;
pub mod types;
pub mod validators;
pub mod vecclock;

pub use chain::{Block, EpochRecord, LogEntry, Receipt, Rules};
pub use event::{BlockVote, EpochVote, Event, EventHeader, Payload, Transaction};
pub use keys::{FakeScheme, FakeSigner, PublicKey, Signature, Signer, Verifier};
pub use types::{Address, BlockIndex, Epoch, EventId, Frame, Hash, Lamport, ValidatorId};
pub use validators::{Profile, Validators};
pub use vecclock::{ForkEvidence, VectorClock};

use thiserror::Error;

/// Rejection reasons from [check_event].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CheckError {
    #[error("creator {0} is not in the validator set")]
    UnknownCreator(ValidatorId),
    #[error("event has {got} parents, limit is {limit}")]
    TooManyParents { got: usize, limit: u32 },
    #[error("duplicate parent {0}")]
    DuplicateParent(EventId),
    #[error("parent {0} belongs to a different epoch")]
    ParentEpochMismatch(EventId),
    #[error("lamport is {got}, expected {expected}")]
    BadLamport { got: Lamport, expected: Lamport },
    #[error("sequence number zero")]
    ZeroSeq,
    #[error("event with seq {0} has no self-parent slot")]
    MissingSelfParent(u32),
    #[error("first event of a creator must not reference a self-parent")]
    UnexpectedSelfParent,
    #[error("payload hash does not match payload")]
    PayloadMismatch,
    #[error("event gas {got} exceeds limit {limit}")]
    GasOverLimit { got: u64, limit: u64 },
    #[error("authorization list of {got} exceeds limit {limit}")]
    TooManyAuthorizations { got: usize, limit: u32 },
    #[error("bad signature")]
    BadSignature,
}

/// Structural and signature validation applied to every event before it
/// reaches the engine.
///
/// Checks are scoped to what a single event proves about itself: caps,
/// the lamport rule over the parents encoded in the identifiers, the
/// self-parent slot, the payload commitment, and the creator signature.
/// Parent availability and fork detection are the engine's business.
pub fn check_event(
    event: &Event,
    validators: &Validators,
    rules: &Rules,
    verifier: &dyn Verifier,
) -> Result<(), CheckError> {
    let creator = event.creator();
    let public = validators
        .public(creator)
        .ok_or(CheckError::UnknownCreator(creator))?;

    let parents = event.parents();
    if parents.len() > rules.max_parents as usize {
        return Err(CheckError::TooManyParents {
            got: parents.len(),
            limit: rules.max_parents,
        });
    }
    for (i, parent) in parents.iter().enumerate() {
        if parents[..i].contains(parent) {
            return Err(CheckError::DuplicateParent(*parent));
        }
        if parent.epoch() != event.epoch() {
            return Err(CheckError::ParentEpochMismatch(*parent));
        }
    }

    // Identifiers embed the parent lamports, so the rule is checkable
    // without fetching the parents.
    let expected = Lamport::new(
        parents
            .iter()
            .map(|p| p.lamport().get())
            .max()
            .unwrap_or(0)
            + 1,
    );
    if event.lamport() != expected {
        return Err(CheckError::BadLamport {
            got: event.lamport(),
            expected,
        });
    }

    match event.seq() {
        0 => return Err(CheckError::ZeroSeq),
        1 => {
            // No self-parent slot; any parents are cross-creator.
        }
        seq if parents.is_empty() => return Err(CheckError::MissingSelfParent(seq)),
        _ => {}
    }

    if event.header().payload_hash != event.payload().hash() {
        return Err(CheckError::PayloadMismatch);
    }

    let gas: u64 = event.payload().txs.iter().map(|tx| tx.gas).sum();
    if gas > rules.max_event_gas {
        return Err(CheckError::GasOverLimit {
            got: gas,
            limit: rules.max_event_gas,
        });
    }
    for tx in &event.payload().txs {
        if tx.authorizations.len() > rules.max_authorization_list as usize {
            return Err(CheckError::TooManyAuthorizations {
                got: tx.authorizations.len(),
                limit: rules.max_authorization_list,
            });
        }
    }

    if !event.verify(verifier, public) {
        return Err(CheckError::BadSignature);
    }
    Ok(())
}
