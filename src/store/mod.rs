//! Transactional storage for accounts, transfers and the ledger.
//!
//! Every read and write goes through a [`UnitOfWork`] handed out by
//! [`Store::atomically`]. Writes staged inside the closure become visible
//! only if it returns `Ok`; any `Err` drops them.

use std::future::Future;

use crate::model::{
    Account, AccountId, LedgerEntry, LedgerFilter, NewLedgerEntry, NewTransfer, Transfer,
    TransferFilter,
};

mod error;
pub use error::{StoreError, StoreResult};

mod memory;
pub use memory::MemoryStore;

/// Account records. Balances are only changed by the engine.
pub trait AccountStore {
    fn get_account(&self, id: AccountId) -> StoreResult<Option<Account>>;

    /// Insert or replace.
    fn save_account(&mut self, account: &Account) -> StoreResult<()>;

    /// All accounts ordered by id.
    fn list_accounts(&self) -> StoreResult<Vec<Account>>;
}

/// Transfer records, unique by idempotency key.
pub trait TransferStore {
    fn transfer_by_key(&self, key: &str) -> StoreResult<Option<Transfer>>;

    /// Fails with [`StoreError::DuplicateIdempotencyKey`] if the key was ever used.
    fn create_transfer(&mut self, transfer: NewTransfer) -> StoreResult<Transfer>;

    fn save_transfer(&mut self, transfer: &Transfer) -> StoreResult<()>;

    /// Newest first.
    fn list_transfers(&self, filter: &TransferFilter) -> StoreResult<Vec<Transfer>>;
}

/// Append-only ledger.
pub trait LedgerStore {
    fn append_entry(&mut self, entry: NewLedgerEntry) -> StoreResult<LedgerEntry>;

    /// Newest first.
    fn list_entries(&self, account: AccountId, filter: &LedgerFilter)
    -> StoreResult<Vec<LedgerEntry>>;
}

/// Everything the engine may touch within one atomic step.
pub trait UnitOfWork: AccountStore + TransferStore + LedgerStore {}

impl<T: AccountStore + TransferStore + LedgerStore + ?Sized> UnitOfWork for T {}

/// A store able to run units of work atomically.
///
/// Implementations must serialize units of work that touch the same
/// accounts or idempotency keys, so that a balance check is never made
/// against a value another unit of work is about to overwrite.
pub trait Store: Send + Sync + 'static {
    fn atomically<T, E, F>(&self, work: F) -> impl Future<Output = Result<T, E>> + Send
    where
        F: FnOnce(&mut dyn UnitOfWork) -> Result<T, E> + Send,
        T: Send,
        E: Send;
}
