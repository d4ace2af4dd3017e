//! Core domain types for the points ledger.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::Points;
use crate::engine::ArgumentError;

/// Account identifier.
pub type AccountId = u64;

/// Transfer identifier, assigned by the store.
pub type TransferId = u64;

/// Ledger entry identifier, assigned by the store.
pub type EntryId = u64;

/// A point-holding account. Only `balance` and `updated_at` are touched by transfers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub name: String,
    pub balance: Points,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Account {
    pub fn new(id: AccountId, name: impl Into<String>, balance: Points, at: DateTime<Utc>) -> Self {
        Self {
            id,
            name: name.into(),
            balance,
            created_at: at,
            updated_at: at,
        }
    }
}

/// Lifecycle of a transfer.
///
/// `pending -> processing -> {completed | failed | cancelled}`, with `reversed`
/// reachable from `processing` and `cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
    Reversed,
}

impl TransferStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferStatus::Pending => "pending",
            TransferStatus::Processing => "processing",
            TransferStatus::Completed => "completed",
            TransferStatus::Failed => "failed",
            TransferStatus::Cancelled => "cancelled",
            TransferStatus::Reversed => "reversed",
        }
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown {kind} '{value}'")]
pub struct UnknownVariant {
    kind: &'static str,
    value: String,
}

impl FromStr for TransferStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TransferStatus::Pending),
            "processing" => Ok(TransferStatus::Processing),
            "completed" => Ok(TransferStatus::Completed),
            "failed" => Ok(TransferStatus::Failed),
            "cancelled" => Ok(TransferStatus::Cancelled),
            "reversed" => Ok(TransferStatus::Reversed),
            other => Err(UnknownVariant {
                kind: "transfer status",
                value: other.to_string(),
            }),
        }
    }
}

/// A point transfer between two accounts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfer {
    pub id: TransferId,
    pub from: AccountId,
    pub to: AccountId,
    pub amount: Points,
    pub status: TransferStatus,
    pub note: Option<String>,
    pub idempotency_key: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub fail_reason: Option<String>,
}

impl Transfer {
    /// Whether `other` touches the same accounts with the same amount.
    pub fn same_terms(&self, other: &Transfer) -> bool {
        self.from == other.from && self.to == other.to && self.amount == other.amount
    }
}

/// A transfer about to be created; the store assigns the id.
#[derive(Debug, Clone)]
pub struct NewTransfer {
    pub from: AccountId,
    pub to: AccountId,
    pub amount: Points,
    pub status: TransferStatus,
    pub note: Option<String>,
    pub idempotency_key: String,
    pub created_at: DateTime<Utc>,
}

/// Kind of balance-changing event recorded in the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    TransferOut,
    TransferIn,
    Adjust,
    Earn,
    Redeem,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::TransferOut => "transfer_out",
            EventType::TransferIn => "transfer_in",
            EventType::Adjust => "adjust",
            EventType::Earn => "earn",
            EventType::Redeem => "redeem",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "transfer_out" => Ok(EventType::TransferOut),
            "transfer_in" => Ok(EventType::TransferIn),
            "adjust" => Ok(EventType::Adjust),
            "earn" => Ok(EventType::Earn),
            "redeem" => Ok(EventType::Redeem),
            other => Err(UnknownVariant {
                kind: "event type",
                value: other.to_string(),
            }),
        }
    }
}

/// Immutable record of one balance change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: EntryId,
    pub account: AccountId,
    pub change: Points,
    pub balance_after: Points,
    pub event_type: EventType,
    pub transfer_id: Option<TransferId>,
    pub reference: Option<String>,
    pub metadata: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A ledger entry about to be appended; the store assigns the id.
#[derive(Debug, Clone)]
pub struct NewLedgerEntry {
    pub account: AccountId,
    pub change: Points,
    pub balance_after: Points,
    pub event_type: EventType,
    pub transfer_id: Option<TransferId>,
    pub reference: Option<String>,
    pub metadata: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl NewLedgerEntry {
    /// Entry for `account` (already carrying its post-change balance) caused by `transfer`.
    pub fn for_transfer(
        account: &Account,
        change: Points,
        event_type: EventType,
        transfer: &Transfer,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            account: account.id,
            change,
            balance_after: account.balance,
            event_type,
            transfer_id: Some(transfer.id),
            reference: Some(transfer.idempotency_key.clone()),
            metadata: None,
            created_at: at,
        }
    }

    pub fn with_metadata(mut self, metadata: impl Into<String>) -> Self {
        self.metadata = Some(metadata.into());
        self
    }
}

/// Caller input for `Engine::initiate_transfer`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub from: AccountId,
    pub to: AccountId,
    pub amount: Points,
    pub note: Option<String>,
    pub idempotency_key: String,
}

impl TransferRequest {
    pub fn new(
        from: AccountId,
        to: AccountId,
        amount: impl Into<Points>,
        idempotency_key: impl Into<String>,
    ) -> Self {
        Self {
            from,
            to,
            amount: amount.into(),
            note: None,
            idempotency_key: idempotency_key.into(),
        }
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    /// Input checks that need no store access.
    pub fn validate(&self) -> Result<(), ArgumentError> {
        if !self.amount.is_positive() {
            return Err(ArgumentError::NonPositiveAmount(self.amount));
        }
        if self.from == self.to {
            return Err(ArgumentError::SameAccount(self.from));
        }
        if self.idempotency_key.is_empty() {
            return Err(ArgumentError::EmptyIdempotencyKey);
        }
        Ok(())
    }
}

/// A transfer together with both of its accounts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferDetail {
    pub transfer: Transfer,
    pub from_account: Account,
    pub to_account: Account,
}

/// Filter for listing transfers. `account` matches either side.
#[derive(Debug, Clone, Default)]
pub struct TransferFilter {
    pub account: Option<AccountId>,
    pub status: Option<TransferStatus>,
}

impl TransferFilter {
    pub fn matches(&self, transfer: &Transfer) -> bool {
        let account_ok = self
            .account
            .is_none_or(|id| transfer.from == id || transfer.to == id);
        let status_ok = self.status.is_none_or(|s| transfer.status == s);
        account_ok && status_ok
    }
}

/// Filter for listing an account's ledger.
#[derive(Debug, Clone, Default)]
pub struct LedgerFilter {
    pub event_type: Option<EventType>,
}

impl LedgerFilter {
    pub fn matches(&self, entry: &LedgerEntry) -> bool {
        self.event_type.is_none_or(|e| entry.event_type == e)
    }
}

/// An input command for the engine.
#[derive(Debug, Clone)]
pub enum Command {
    /// Create an account with an opening balance.
    Open {
        account: AccountId,
        name: String,
        balance: Points,
    },
    /// Move points between accounts.
    Transfer(TransferRequest),
    /// Cancel a transfer by idempotency key.
    Cancel { key: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_str() {
        for status in [
            TransferStatus::Pending,
            TransferStatus::Processing,
            TransferStatus::Completed,
            TransferStatus::Failed,
            TransferStatus::Cancelled,
            TransferStatus::Reversed,
        ] {
            assert_eq!(status.as_str().parse::<TransferStatus>(), Ok(status));
        }
        assert!("done".parse::<TransferStatus>().is_err());
    }

    #[test]
    fn event_type_parse_rejects_unknown() {
        assert_eq!("transfer_in".parse::<EventType>(), Ok(EventType::TransferIn));
        let err = "refund".parse::<EventType>().unwrap_err();
        assert_eq!(err.to_string(), "unknown event type 'refund'");
    }

    #[test]
    fn validate_rejects_bad_requests() {
        assert_eq!(
            TransferRequest::new(1, 2, 0, "k").validate(),
            Err(ArgumentError::NonPositiveAmount(Points::ZERO))
        );
        assert_eq!(
            TransferRequest::new(1, 2, -5, "k").validate(),
            Err(ArgumentError::NonPositiveAmount(Points::new(-5)))
        );
        assert_eq!(
            TransferRequest::new(1, 1, 5, "k").validate(),
            Err(ArgumentError::SameAccount(1))
        );
        assert_eq!(
            TransferRequest::new(1, 2, 5, "").validate(),
            Err(ArgumentError::EmptyIdempotencyKey)
        );
        assert_eq!(TransferRequest::new(1, 2, 5, "k").validate(), Ok(()));
    }

    #[test]
    fn transfer_filter_matches_either_side() {
        let now = Utc::now();
        let transfer = Transfer {
            id: 1,
            from: 1,
            to: 2,
            amount: Points::new(10),
            status: TransferStatus::Completed,
            note: None,
            idempotency_key: "k".into(),
            created_at: now,
            updated_at: now,
            completed_at: Some(now),
            fail_reason: None,
        };

        assert!(TransferFilter::default().matches(&transfer));
        for account in [1, 2] {
            let filter = TransferFilter {
                account: Some(account),
                status: None,
            };
            assert!(filter.matches(&transfer));
        }
        let other = TransferFilter {
            account: Some(3),
            status: None,
        };
        assert!(!other.matches(&transfer));
        let cancelled = TransferFilter {
            account: Some(1),
            status: Some(TransferStatus::Cancelled),
        };
        assert!(!cancelled.matches(&transfer));
    }
}
