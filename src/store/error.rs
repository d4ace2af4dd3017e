use thiserror::Error;

use crate::model::TransferId;

pub type StoreResult<T> = Result<T, StoreError>;

/// Failure reported by a store while working inside a unit of work.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("idempotency key '{0}' is already used")]
    DuplicateIdempotencyKey(String),

    #[error("transfer {0} does not exist")]
    TransferMissing(TransferId),

    #[error("transfer {0}: idempotency key, or terms of a completed transfer, cannot change")]
    ImmutableTransfer(TransferId),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}
