//! Point transfer engine.
//!
//! The engine moves points between accounts and keeps a double-entry ledger
//! of every balance change. Each mutating operation runs as exactly one unit
//! of work against the injected [`Store`]: balances, ledger entries and the
//! transfer status either all change together or not at all.
//! Transfers are idempotent on their caller-supplied key.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, info};

use crate::Points;
use crate::model::{
    Account, AccountId, Command, EventType, LedgerEntry, LedgerFilter, NewLedgerEntry,
    NewTransfer, Transfer, TransferDetail, TransferFilter, TransferRequest, TransferStatus,
};
use crate::store::{AccountStore, LedgerStore, Store, TransferStore, UnitOfWork};

mod state;

mod error;
pub use error::{ArgumentError, EngineError};

/// The point transfer engine.
///
/// Cheap to clone; clones share the same store.
pub struct Engine<S> {
    store: Arc<S>,
}

impl<S> Clone for Engine<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

/// Outcome of a transfer request inside its unit of work.
enum Initiated {
    Created(TransferDetail),
    /// The idempotency key was already used; nothing changed.
    Replayed(TransferDetail),
}

/// Public API
impl<S: Store> Engine<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Run the engine over a stream of commands.
    pub async fn run(&self, mut stream: impl Stream<Item = Command> + Unpin) {
        while let Some(command) = stream.next().await {
            // a failed command is logged by `apply` and must not stop the engine
            let _ = self.apply(command).await;
        }
    }

    /// Apply a single command.
    pub async fn apply(&self, command: Command) -> Result<(), EngineError> {
        match command {
            Command::Open {
                account,
                name,
                balance,
            } => {
                self.open_account(account, name, balance).await?;
            }
            Command::Transfer(request) => {
                self.initiate_transfer(request).await?;
            }
            Command::Cancel { key } => {
                self.cancel_transfer(&key).await?;
            }
        }
        Ok(())
    }

    /// Create an account with an opening balance.
    ///
    /// A positive opening balance is recorded as an `adjust` ledger entry so
    /// that every account's ledger sums to its balance.
    pub async fn open_account(
        &self,
        id: AccountId,
        name: impl Into<String>,
        balance: Points,
    ) -> Result<Account, EngineError> {
        let name = name.into();
        let result = self.try_open_account(id, name, balance).await;
        match &result {
            Ok(_) => info!(account = id, balance = %balance, "open applied"),
            Err(e) => info!(account = id, reason = %e, "open skipped"),
        }
        result
    }

    /// Move `request.amount` points from `request.from` to `request.to`.
    ///
    /// Repeating a request with an already used idempotency key returns the
    /// transfer recorded for that key, whatever its other fields, and has no
    /// side effects.
    pub async fn initiate_transfer(
        &self,
        request: TransferRequest,
    ) -> Result<TransferDetail, EngineError> {
        let result = self.try_initiate_transfer(&request).await;
        match &result {
            Ok(detail) => info!(
                key = %request.idempotency_key,
                from = request.from,
                to = request.to,
                amount = %request.amount,
                status = %detail.transfer.status,
                "transfer applied"
            ),
            Err(e) => info!(
                key = %request.idempotency_key,
                from = request.from,
                to = request.to,
                amount = %request.amount,
                reason = %e,
                "transfer skipped"
            ),
        }
        result
    }

    /// Cancel a `pending` or `processing` transfer.
    ///
    /// A `processing` transfer has already moved funds; they are moved back and
    /// the reversal is recorded as a pair of `adjust` ledger entries.
    pub async fn cancel_transfer(&self, key: &str) -> Result<TransferDetail, EngineError> {
        let result = self
            .store
            .atomically(|uow| execute_cancel(uow, key, Utc::now()))
            .await;
        Self::log_result("cancel", key, &result);
        result
    }

    /// Transfers matching `filter`, newest first.
    pub async fn list_transfers(
        &self,
        filter: &TransferFilter,
    ) -> Result<Vec<TransferDetail>, EngineError> {
        self.store
            .atomically(|uow| -> Result<Vec<TransferDetail>, EngineError> {
                let uow: &dyn UnitOfWork = uow;
                uow.list_transfers(filter)?
                    .into_iter()
                    .map(|transfer| detail(uow, transfer))
                    .collect()
            })
            .await
    }

    pub async fn get_transfer_by_key(&self, key: &str) -> Result<TransferDetail, EngineError> {
        self.store
            .atomically(|uow| -> Result<_, EngineError> {
                let transfer = uow
                    .transfer_by_key(key)?
                    .ok_or_else(|| EngineError::TransferNotFound(key.to_string()))?;
                detail(uow, transfer)
            })
            .await
    }

    /// Ledger entries of `account` matching `filter`, newest first.
    pub async fn get_ledger(
        &self,
        account: AccountId,
        filter: &LedgerFilter,
    ) -> Result<Vec<LedgerEntry>, EngineError> {
        self.store
            .atomically(|uow| -> Result<_, EngineError> {
                Ok(uow.list_entries(account, filter)?)
            })
            .await
    }

    pub async fn account(&self, id: AccountId) -> Result<Account, EngineError> {
        self.store
            .atomically(|uow| load_account(uow, id))
            .await
    }

    /// All accounts ordered by id.
    pub async fn accounts(&self) -> Result<Vec<Account>, EngineError> {
        self.store
            .atomically(|uow| -> Result<_, EngineError> { Ok(uow.list_accounts()?) })
            .await
    }
}

/// Private API
impl<S: Store> Engine<S> {
    fn log_result<T>(op: &str, key: &str, result: &Result<T, EngineError>) {
        match result {
            Ok(_) => info!(key, "{op} applied"),
            Err(e) => info!(key, reason = %e, "{op} skipped"),
        }
    }

    async fn try_open_account(
        &self,
        id: AccountId,
        name: String,
        balance: Points,
    ) -> Result<Account, EngineError> {
        if name.is_empty() {
            return Err(ArgumentError::EmptyName.into());
        }
        if balance.is_negative() {
            return Err(ArgumentError::NegativeBalance(balance).into());
        }

        self.store
            .atomically(move |uow| -> Result<_, EngineError> {
                if uow.get_account(id)?.is_some() {
                    return Err(ArgumentError::DuplicateAccount(id).into());
                }

                let now = Utc::now();
                let account = Account::new(id, name, balance, now);
                uow.save_account(&account)?;

                if balance.is_positive() {
                    uow.append_entry(NewLedgerEntry {
                        account: id,
                        change: balance,
                        balance_after: balance,
                        event_type: EventType::Adjust,
                        transfer_id: None,
                        reference: None,
                        metadata: Some("opening balance".to_string()),
                        created_at: now,
                    })?;
                }
                Ok(account)
            })
            .await
    }

    async fn try_initiate_transfer(
        &self,
        request: &TransferRequest,
    ) -> Result<TransferDetail, EngineError> {
        request.validate()?;

        let initiated = self
            .store
            .atomically(|uow| execute_transfer(uow, request, Utc::now()))
            .await?;

        match initiated {
            Initiated::Created(detail) => Ok(detail),
            Initiated::Replayed(detail) => {
                debug!(
                    key = %request.idempotency_key,
                    transfer = detail.transfer.id,
                    "idempotency key already used, returning recorded transfer"
                );
                Ok(detail)
            }
        }
    }
}

fn load_account(uow: &dyn UnitOfWork, id: AccountId) -> Result<Account, EngineError> {
    uow.get_account(id)?.ok_or(EngineError::AccountNotFound(id))
}

fn detail(uow: &dyn UnitOfWork, transfer: Transfer) -> Result<TransferDetail, EngineError> {
    Ok(TransferDetail {
        from_account: load_account(uow, transfer.from)?,
        to_account: load_account(uow, transfer.to)?,
        transfer,
    })
}

/// Body of `initiate_transfer`. Runs inside one unit of work.
fn execute_transfer(
    uow: &mut dyn UnitOfWork,
    request: &TransferRequest,
    now: DateTime<Utc>,
) -> Result<Initiated, EngineError> {
    // Checked here rather than before the unit of work so that a concurrent
    // request with the same key sees the committed transfer.
    if let Some(existing) = uow.transfer_by_key(&request.idempotency_key)? {
        return Ok(Initiated::Replayed(detail(uow, existing)?));
    }

    let mut from = load_account(uow, request.from)?;
    let mut to = load_account(uow, request.to)?;

    if from.balance < request.amount {
        return Err(EngineError::InsufficientBalance {
            account: from.id,
            balance: from.balance,
            requested: request.amount,
        });
    }
    let credited = to
        .balance
        .checked_add(request.amount)
        .ok_or(ArgumentError::BalanceOverflow(to.id))?;

    let mut transfer = uow.create_transfer(NewTransfer {
        from: from.id,
        to: to.id,
        amount: request.amount,
        status: TransferStatus::Processing,
        note: request.note.clone(),
        idempotency_key: request.idempotency_key.clone(),
        created_at: now,
    })?;

    from.balance = from.balance - request.amount;
    from.updated_at = now;
    to.balance = credited;
    to.updated_at = now;
    uow.save_account(&from)?;
    uow.save_account(&to)?;

    uow.append_entry(NewLedgerEntry::for_transfer(
        &from,
        -request.amount,
        EventType::TransferOut,
        &transfer,
        now,
    ))?;
    uow.append_entry(NewLedgerEntry::for_transfer(
        &to,
        request.amount,
        EventType::TransferIn,
        &transfer,
        now,
    ))?;

    state::advance(&mut transfer, TransferStatus::Completed, now)?;
    uow.save_transfer(&transfer)?;

    Ok(Initiated::Created(TransferDetail {
        transfer,
        from_account: from,
        to_account: to,
    }))
}

/// Body of `cancel_transfer`. Runs inside one unit of work.
fn execute_cancel(
    uow: &mut dyn UnitOfWork,
    key: &str,
    now: DateTime<Utc>,
) -> Result<TransferDetail, EngineError> {
    let mut transfer = uow
        .transfer_by_key(key)?
        .ok_or_else(|| EngineError::TransferNotFound(key.to_string()))?;

    let previous = transfer.status;
    state::advance(&mut transfer, TransferStatus::Cancelled, now)?;

    let mut from = load_account(uow, transfer.from)?;
    let mut to = load_account(uow, transfer.to)?;

    if previous == TransferStatus::Processing {
        let amount = transfer.amount;
        if to.balance < amount {
            return Err(EngineError::InsufficientBalance {
                account: to.id,
                balance: to.balance,
                requested: amount,
            });
        }

        from.balance = from
            .balance
            .checked_add(amount)
            .ok_or(ArgumentError::BalanceOverflow(from.id))?;
        from.updated_at = now;
        to.balance = to.balance - amount;
        to.updated_at = now;
        uow.save_account(&from)?;
        uow.save_account(&to)?;

        uow.append_entry(
            NewLedgerEntry::for_transfer(&from, amount, EventType::Adjust, &transfer, now)
                .with_metadata("reversal"),
        )?;
        uow.append_entry(
            NewLedgerEntry::for_transfer(&to, -amount, EventType::Adjust, &transfer, now)
                .with_metadata("reversal"),
        )?;
    }

    uow.save_transfer(&transfer)?;

    Ok(TransferDetail {
        transfer,
        from_account: from,
        to_account: to,
    })
}
