//! In-process transactional store.
//!
//! All committed state lives behind one async mutex. A unit of work holds the
//! lock for its whole (synchronous) run and stages its writes separately;
//! staged writes are merged into the committed tables only on `Ok`.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;

use tokio::sync::Mutex;
use tracing::trace;

use super::{AccountStore, LedgerStore, Store, StoreError, StoreResult, TransferStore, UnitOfWork};
use crate::model::{
    Account, AccountId, EntryId, LedgerEntry, LedgerFilter, NewLedgerEntry, NewTransfer, Transfer,
    TransferFilter, TransferId, TransferStatus,
};

#[derive(Debug, Default)]
struct Tables {
    accounts: BTreeMap<AccountId, Account>,
    transfers: BTreeMap<TransferId, Transfer>,
    keys: HashMap<String, TransferId>,
    ledger: Vec<LedgerEntry>,
    last_transfer_id: TransferId,
    last_entry_id: EntryId,
}

impl Tables {
    fn apply(&mut self, staged: Staged) {
        self.accounts.extend(staged.accounts);
        self.transfers.extend(staged.transfers);
        self.keys.extend(staged.keys);
        self.ledger.extend(staged.entries);
        self.last_transfer_id = staged.last_transfer_id;
        self.last_entry_id = staged.last_entry_id;
    }
}

/// Writes of one unit of work that are not yet visible to anyone else.
#[derive(Debug, Default)]
struct Staged {
    accounts: BTreeMap<AccountId, Account>,
    transfers: BTreeMap<TransferId, Transfer>,
    keys: HashMap<String, TransferId>,
    entries: Vec<LedgerEntry>,
    last_transfer_id: TransferId,
    last_entry_id: EntryId,
}

impl Staged {
    fn is_empty(&self) -> bool {
        self.accounts.is_empty() && self.transfers.is_empty() && self.entries.is_empty()
    }
}

/// Serializable in-memory store for accounts, transfers and ledger entries.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    fn atomically<T, E, F>(&self, work: F) -> impl Future<Output = Result<T, E>> + Send
    where
        F: FnOnce(&mut dyn UnitOfWork) -> Result<T, E> + Send,
        T: Send,
        E: Send,
    {
        async move {
            let mut tables = self.tables.lock().await;
            let mut unit = MemoryUnitOfWork::new(&tables);
            let result = work(&mut unit);
            let staged = unit.staged;

            if result.is_ok() {
                if !staged.is_empty() {
                    trace!(
                        accounts = staged.accounts.len(),
                        transfers = staged.transfers.len(),
                        entries = staged.entries.len(),
                        "unit of work committed"
                    );
                }
                tables.apply(staged);
            } else if !staged.is_empty() {
                trace!("unit of work rolled back");
            }
            result
        }
    }
}

struct MemoryUnitOfWork<'a> {
    committed: &'a Tables,
    staged: Staged,
}

impl<'a> MemoryUnitOfWork<'a> {
    fn new(committed: &'a Tables) -> Self {
        Self {
            committed,
            staged: Staged {
                last_transfer_id: committed.last_transfer_id,
                last_entry_id: committed.last_entry_id,
                ..Staged::default()
            },
        }
    }

    fn transfer(&self, id: TransferId) -> Option<&Transfer> {
        self.staged
            .transfers
            .get(&id)
            .or_else(|| self.committed.transfers.get(&id))
    }

    fn key_in_use(&self, key: &str) -> bool {
        self.staged.keys.contains_key(key) || self.committed.keys.contains_key(key)
    }
}

impl AccountStore for MemoryUnitOfWork<'_> {
    fn get_account(&self, id: AccountId) -> StoreResult<Option<Account>> {
        Ok(self
            .staged
            .accounts
            .get(&id)
            .or_else(|| self.committed.accounts.get(&id))
            .cloned())
    }

    fn save_account(&mut self, account: &Account) -> StoreResult<()> {
        self.staged.accounts.insert(account.id, account.clone());
        Ok(())
    }

    fn list_accounts(&self) -> StoreResult<Vec<Account>> {
        let mut merged: BTreeMap<AccountId, &Account> = self
            .committed
            .accounts
            .iter()
            .map(|(id, a)| (*id, a))
            .collect();
        merged.extend(self.staged.accounts.iter().map(|(id, a)| (*id, a)));
        Ok(merged.into_values().cloned().collect())
    }
}

impl TransferStore for MemoryUnitOfWork<'_> {
    fn transfer_by_key(&self, key: &str) -> StoreResult<Option<Transfer>> {
        let id = self
            .staged
            .keys
            .get(key)
            .or_else(|| self.committed.keys.get(key));
        Ok(id.and_then(|id| self.transfer(*id)).cloned())
    }

    fn create_transfer(&mut self, transfer: NewTransfer) -> StoreResult<Transfer> {
        if self.key_in_use(&transfer.idempotency_key) {
            return Err(StoreError::DuplicateIdempotencyKey(transfer.idempotency_key));
        }

        self.staged.last_transfer_id += 1;
        let created = Transfer {
            id: self.staged.last_transfer_id,
            from: transfer.from,
            to: transfer.to,
            amount: transfer.amount,
            status: transfer.status,
            note: transfer.note,
            idempotency_key: transfer.idempotency_key,
            created_at: transfer.created_at,
            updated_at: transfer.created_at,
            completed_at: None,
            fail_reason: None,
        };

        self.staged
            .keys
            .insert(created.idempotency_key.clone(), created.id);
        self.staged.transfers.insert(created.id, created.clone());
        Ok(created)
    }

    fn save_transfer(&mut self, transfer: &Transfer) -> StoreResult<()> {
        let current = self
            .transfer(transfer.id)
            .ok_or(StoreError::TransferMissing(transfer.id))?;

        if current.idempotency_key != transfer.idempotency_key
            || (current.status == TransferStatus::Completed && !current.same_terms(transfer))
        {
            return Err(StoreError::ImmutableTransfer(transfer.id));
        }

        self.staged.transfers.insert(transfer.id, transfer.clone());
        Ok(())
    }

    fn list_transfers(&self, filter: &TransferFilter) -> StoreResult<Vec<Transfer>> {
        let mut merged: BTreeMap<TransferId, &Transfer> = self
            .committed
            .transfers
            .iter()
            .map(|(id, t)| (*id, t))
            .collect();
        merged.extend(self.staged.transfers.iter().map(|(id, t)| (*id, t)));

        let mut transfers: Vec<Transfer> = merged
            .into_values()
            .filter(|t| filter.matches(t))
            .cloned()
            .collect();
        transfers.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));
        Ok(transfers)
    }
}

impl LedgerStore for MemoryUnitOfWork<'_> {
    fn append_entry(&mut self, entry: NewLedgerEntry) -> StoreResult<LedgerEntry> {
        self.staged.last_entry_id += 1;
        let appended = LedgerEntry {
            id: self.staged.last_entry_id,
            account: entry.account,
            change: entry.change,
            balance_after: entry.balance_after,
            event_type: entry.event_type,
            transfer_id: entry.transfer_id,
            reference: entry.reference,
            metadata: entry.metadata,
            created_at: entry.created_at,
        };
        self.staged.entries.push(appended.clone());
        Ok(appended)
    }

    fn list_entries(
        &self,
        account: AccountId,
        filter: &LedgerFilter,
    ) -> StoreResult<Vec<LedgerEntry>> {
        let mut entries: Vec<LedgerEntry> = self
            .committed
            .ledger
            .iter()
            .chain(self.staged.entries.iter())
            .filter(|e| e.account == account && filter.matches(e))
            .cloned()
            .collect();
        entries.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Points;
    use crate::model::EventType;
    use chrono::{DateTime, Duration, Utc};

    fn account(id: AccountId, balance: i64) -> Account {
        Account::new(id, format!("user-{id}"), Points::new(balance), Utc::now())
    }

    fn new_transfer(key: &str, at: DateTime<Utc>) -> NewTransfer {
        NewTransfer {
            from: 1,
            to: 2,
            amount: Points::new(10),
            status: TransferStatus::Processing,
            note: None,
            idempotency_key: key.to_string(),
            created_at: at,
        }
    }

    fn entry(account: AccountId, change: i64, at: DateTime<Utc>) -> NewLedgerEntry {
        NewLedgerEntry {
            account,
            change: Points::new(change),
            balance_after: Points::new(change),
            event_type: EventType::Earn,
            transfer_id: None,
            reference: None,
            metadata: None,
            created_at: at,
        }
    }

    #[tokio::test]
    async fn committed_writes_are_visible() {
        let store = MemoryStore::new();
        store
            .atomically(|uow| uow.save_account(&account(1, 100)))
            .await
            .unwrap();

        let loaded = store
            .atomically(|uow| uow.get_account(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.balance, Points::new(100));
    }

    #[tokio::test]
    async fn failed_unit_of_work_leaves_no_trace() {
        let store = MemoryStore::new();
        let result: Result<(), StoreError> = store
            .atomically(|uow| {
                uow.save_account(&account(1, 100))?;
                uow.create_transfer(new_transfer("k1", Utc::now()))?;
                uow.append_entry(entry(1, 100, Utc::now()))?;
                Err(StoreError::Unavailable("disk full".into()))
            })
            .await;
        assert!(result.is_err());

        let (account, transfer, entries) = store
            .atomically(|uow| {
                Ok::<_, StoreError>((
                    uow.get_account(1)?,
                    uow.transfer_by_key("k1")?,
                    uow.list_entries(1, &LedgerFilter::default())?,
                ))
            })
            .await
            .unwrap();
        assert!(account.is_none());
        assert!(transfer.is_none());
        assert!(entries.is_empty());
    }

    #[tokio::test]
    async fn rolled_back_ids_are_reused() {
        let store = MemoryStore::new();
        let _ = store
            .atomically(|uow| {
                uow.create_transfer(new_transfer("k1", Utc::now()))?;
                Err::<(), _>(StoreError::Unavailable("boom".into()))
            })
            .await;

        let created = store
            .atomically(|uow| uow.create_transfer(new_transfer("k2", Utc::now())))
            .await
            .unwrap();
        assert_eq!(created.id, 1);
    }

    #[tokio::test]
    async fn reads_see_own_staged_writes() {
        let store = MemoryStore::new();
        store
            .atomically(|uow| {
                uow.save_account(&account(1, 5))?;
                assert_eq!(uow.get_account(1)?.unwrap().balance, Points::new(5));

                let transfer = uow.create_transfer(new_transfer("k1", Utc::now()))?;
                assert_eq!(uow.transfer_by_key("k1")?, Some(transfer));

                uow.append_entry(entry(1, 5, Utc::now()))?;
                assert_eq!(uow.list_entries(1, &LedgerFilter::default())?.len(), 1);
                Ok::<_, StoreError>(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn duplicate_idempotency_key_is_rejected() {
        let store = MemoryStore::new();
        store
            .atomically(|uow| uow.create_transfer(new_transfer("k1", Utc::now())))
            .await
            .unwrap();

        let result = store
            .atomically(|uow| uow.create_transfer(new_transfer("k1", Utc::now())))
            .await;
        assert_eq!(
            result,
            Err(StoreError::DuplicateIdempotencyKey("k1".to_string()))
        );
    }

    #[tokio::test]
    async fn save_transfer_requires_existing_record() {
        let store = MemoryStore::new();
        let mut transfer = store
            .atomically(|uow| uow.create_transfer(new_transfer("k1", Utc::now())))
            .await
            .unwrap();
        transfer.id = 99;

        let result = store.atomically(|uow| uow.save_transfer(&transfer)).await;
        assert_eq!(result, Err(StoreError::TransferMissing(99)));
    }

    #[tokio::test]
    async fn completed_transfer_terms_are_immutable() {
        let store = MemoryStore::new();
        let mut transfer = store
            .atomically(|uow| uow.create_transfer(new_transfer("k1", Utc::now())))
            .await
            .unwrap();
        transfer.status = TransferStatus::Completed;
        store
            .atomically(|uow| uow.save_transfer(&transfer))
            .await
            .unwrap();

        transfer.amount = Points::new(1_000);
        let result = store.atomically(|uow| uow.save_transfer(&transfer)).await;
        assert_eq!(result, Err(StoreError::ImmutableTransfer(transfer.id)));
    }

    #[tokio::test]
    async fn lists_are_newest_first() {
        let store = MemoryStore::new();
        let earlier = Utc::now();
        let later = earlier + Duration::seconds(1);

        store
            .atomically(|uow| {
                uow.create_transfer(new_transfer("late", later))?;
                uow.create_transfer(new_transfer("early", earlier))?;
                uow.create_transfer(new_transfer("late-2", later))?;
                uow.append_entry(entry(1, 1, earlier))?;
                uow.append_entry(entry(1, 2, later))?;
                uow.append_entry(entry(2, 3, later))?;
                Ok::<_, StoreError>(())
            })
            .await
            .unwrap();

        let (transfers, entries) = store
            .atomically(|uow| {
                Ok::<_, StoreError>((
                    uow.list_transfers(&TransferFilter::default())?,
                    uow.list_entries(1, &LedgerFilter::default())?,
                ))
            })
            .await
            .unwrap();

        let keys: Vec<_> = transfers
            .iter()
            .map(|t| t.idempotency_key.as_str())
            .collect();
        assert_eq!(keys, ["late-2", "late", "early"]);

        let changes: Vec<_> = entries.iter().map(|e| e.change.value()).collect();
        assert_eq!(changes, [2, 1]);
    }

    #[tokio::test]
    async fn list_accounts_is_ordered_by_id() {
        let store = MemoryStore::new();
        store
            .atomically(|uow| {
                uow.save_account(&account(3, 0))?;
                uow.save_account(&account(1, 0))?;
                Ok::<_, StoreError>(())
            })
            .await
            .unwrap();
        store
            .atomically(|uow| uow.save_account(&account(2, 0)))
            .await
            .unwrap();

        let ids: Vec<_> = store
            .atomically(|uow| uow.list_accounts())
            .await
            .unwrap()
            .into_iter()
            .map(|a| a.id)
            .collect();
        assert_eq!(ids, [1, 2, 3]);
    }
}
