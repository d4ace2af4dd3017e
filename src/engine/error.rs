//! Error types for ledger operations.

use thiserror::Error;

use crate::Points;
use crate::model::{AccountId, TransferStatus};
use crate::store::StoreError;

/// Top-level error returned by every [`Engine`](super::Engine) operation.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid argument: {0}")]
    InvalidArgument(#[from] ArgumentError),

    #[error("account {0} not found")]
    AccountNotFound(AccountId),

    #[error("transfer '{0}' not found")]
    TransferNotFound(String),

    #[error("insufficient balance for account {account}: balance {balance}, requested {requested}")]
    InsufficientBalance {
        account: AccountId,
        balance: Points,
        requested: Points,
    },

    #[error("transfer '{key}' cannot move from {from} to {to}")]
    InvalidState {
        key: String,
        from: TransferStatus,
        to: TransferStatus,
    },

    #[error("store failure: {0}")]
    StoreFailure(#[from] StoreError),
}

impl EngineError {
    /// Whether the caller may retry the same request.
    ///
    /// A retried transfer with the same idempotency key is a no-op if the
    /// earlier attempt committed after all.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::StoreFailure(_))
    }
}

/// Malformed input, detected before any write.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ArgumentError {
    #[error("amount must be positive, got {0}")]
    NonPositiveAmount(Points),

    #[error("cannot transfer from account {0} to itself")]
    SameAccount(AccountId),

    #[error("idempotency key must not be empty")]
    EmptyIdempotencyKey,

    #[error("account name must not be empty")]
    EmptyName,

    #[error("opening balance must not be negative, got {0}")]
    NegativeBalance(Points),

    #[error("account {0} already exists")]
    DuplicateAccount(AccountId),

    #[error("balance of account {0} would overflow")]
    BalanceOverflow(AccountId),
}
