//! In-memory ledger backend
//!
//! Committed state (rows + log) sits behind one `RwLock` that is held only for
//! the O(1) apply step of a commit and for snapshot reads. Transfer-level
//! exclusion comes from the per-account [`AccountLockTable`], whose guards are
//! owned by the [`MemoryUnit`] until it commits or rolls back.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, warn};

use super::{AtomicUnit, LedgerStore};
use crate::account::Account;
use crate::core_types::{AccountId, TransactionId, UserId};
use crate::money::Amount;
use crate::transfer::error::TransferError;
use crate::transfer::lock::{AccountGuard, AccountLockTable};
use crate::transfer::types::TransactionRecord;

/// Committed ledger state
#[derive(Default)]
struct LedgerState {
    accounts: HashMap<AccountId, Account>,
    log: Vec<TransactionRecord>,
    by_id: HashMap<TransactionId, usize>,
    by_client_ref: HashMap<(UserId, String), usize>,
}

/// Storage faults for exercising rollback paths
#[derive(Default)]
struct FaultPlan {
    /// Successful saves left before the next save fails (one-shot)
    saves_before_failure: Mutex<Option<usize>>,
    fail_next_commit: AtomicBool,
}

struct Inner {
    state: RwLock<LedgerState>,
    locks: AccountLockTable,
    faults: FaultPlan,
}

/// In-memory [`LedgerStore`]. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct MemoryLedger {
    inner: Arc<Inner>,
}

fn poisoned() -> TransferError {
    TransferError::StorageFailure("ledger state lock poisoned".to_string())
}

impl MemoryLedger {
    pub fn new(lock_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: RwLock::new(LedgerState::default()),
                locks: AccountLockTable::new(lock_timeout),
                faults: FaultPlan::default(),
            }),
        }
    }

    /// Whether a unit currently holds the account's lock
    pub fn is_locked(&self, account: AccountId) -> bool {
        self.inner.locks.is_locked(account)
    }

    /// Let `n` more `save_account` calls succeed, then fail the next one
    /// with `StorageFailure`. One-shot.
    pub fn fail_save_after(&self, n: usize) {
        if let Ok(mut slot) = self.inner.faults.saves_before_failure.lock() {
            *slot = Some(n);
        }
    }

    /// Fail the next `commit` with `StorageFailure`. One-shot.
    pub fn fail_next_commit(&self) {
        self.inner
            .faults
            .fail_next_commit
            .store(true, Ordering::SeqCst);
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, LedgerState>, TransferError> {
        self.inner.state.read().map_err(|_| poisoned())
    }
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

#[async_trait]
impl LedgerStore for MemoryLedger {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn begin(&self) -> Result<Box<dyn AtomicUnit>, TransferError> {
        Ok(Box::new(MemoryUnit {
            inner: Arc::clone(&self.inner),
            guards: Vec::with_capacity(2),
            loaded: HashMap::with_capacity(2),
            staged_accounts: HashMap::with_capacity(2),
            staged_records: Vec::with_capacity(1),
        }))
    }

    async fn open_account(
        &self,
        owner: UserId,
        balance: Amount,
    ) -> Result<Account, TransferError> {
        let account = Account::new(AccountId::new(), owner, balance);
        let mut state = self.inner.state.write().map_err(|_| poisoned())?;
        state.accounts.insert(account.id, account.clone());
        debug!(account = %account.id, owner = %owner, balance = %balance, "Account opened");
        Ok(account)
    }

    async fn get_account(&self, id: AccountId) -> Result<Option<Account>, TransferError> {
        Ok(self.read()?.accounts.get(&id).cloned())
    }

    async fn list_accounts(&self) -> Result<Vec<Account>, TransferError> {
        Ok(self.read()?.accounts.values().cloned().collect())
    }

    async fn get_transaction(
        &self,
        id: TransactionId,
    ) -> Result<Option<TransactionRecord>, TransferError> {
        let state = self.read()?;
        Ok(state.by_id.get(&id).map(|&i| state.log[i].clone()))
    }

    async fn list_transactions(&self) -> Result<Vec<TransactionRecord>, TransferError> {
        Ok(self.read()?.log.clone())
    }

    async fn transactions_for_account(
        &self,
        account: AccountId,
    ) -> Result<Vec<TransactionRecord>, TransferError> {
        let state = self.read()?;
        Ok(state
            .log
            .iter()
            .rev()
            .filter(|r| r.touches(account))
            .cloned()
            .collect())
    }

    async fn find_transaction_by_client_ref(
        &self,
        initiator: UserId,
        client_ref: &str,
    ) -> Result<Option<TransactionRecord>, TransferError> {
        let state = self.read()?;
        Ok(state
            .by_client_ref
            .get(&(initiator, client_ref.to_string()))
            .map(|&i| state.log[i].clone()))
    }
}

/// Atomic unit over [`MemoryLedger`].
///
/// Holds account guards plus staged writes; dropping it releases the guards
/// and discards the writes.
pub struct MemoryUnit {
    inner: Arc<Inner>,
    guards: Vec<AccountGuard>,
    /// Rows as read under lock
    loaded: HashMap<AccountId, Account>,
    staged_accounts: HashMap<AccountId, Account>,
    staged_records: Vec<TransactionRecord>,
}

impl MemoryUnit {
    fn take_save_fault(&self) -> bool {
        let Ok(mut slot) = self.inner.faults.saves_before_failure.lock() else {
            return false;
        };
        match *slot {
            Some(0) => {
                *slot = None;
                true
            }
            Some(n) => {
                *slot = Some(n - 1);
                false
            }
            None => false,
        }
    }
}

#[async_trait]
impl AtomicUnit for MemoryUnit {
    async fn get_account_for_update(&mut self, id: AccountId) -> Result<Account, TransferError> {
        if let Some(account) = self.staged_accounts.get(&id).or_else(|| self.loaded.get(&id)) {
            return Ok(account.clone());
        }

        let guard = self.inner.locks.acquire(id).await?;
        self.guards.push(guard);

        // Read after the lock is held: this is the value every check must use
        let row = {
            let state = self.inner.state.read().map_err(|_| poisoned())?;
            state.accounts.get(&id).cloned()
        };
        let account = row.ok_or(TransferError::AccountNotFound(id))?;
        self.loaded.insert(id, account.clone());
        Ok(account)
    }

    async fn save_account(&mut self, account: &Account) -> Result<(), TransferError> {
        let Some(locked) = self.loaded.get(&account.id) else {
            return Err(TransferError::StorageFailure(format!(
                "account {} was not loaded for update in this unit",
                account.id
            )));
        };
        if self.take_save_fault() {
            warn!(account = %account.id, "Injected storage fault on save");
            return Err(TransferError::StorageFailure(
                "injected fault on save_account".to_string(),
            ));
        }

        // Only the balance is writable from here
        let mut row = locked.clone();
        row.balance = account.balance;
        row.updated_at = Utc::now();
        self.staged_accounts.insert(row.id, row);
        Ok(())
    }

    async fn find_by_client_ref(
        &mut self,
        initiator: UserId,
        client_ref: &str,
    ) -> Result<Option<TransactionRecord>, TransferError> {
        let state = self.inner.state.read().map_err(|_| poisoned())?;
        Ok(state
            .by_client_ref
            .get(&(initiator, client_ref.to_string()))
            .map(|&i| state.log[i].clone()))
    }

    async fn append_transaction(
        &mut self,
        record: &TransactionRecord,
    ) -> Result<(), TransferError> {
        if self.staged_records.iter().any(|r| r.id == record.id) {
            return Err(TransferError::StorageFailure(format!(
                "transaction {} appended twice",
                record.id
            )));
        }
        self.staged_records.push(record.clone());
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), TransferError> {
        if self.inner.faults.fail_next_commit.swap(false, Ordering::SeqCst) {
            warn!("Injected storage fault on commit");
            return Err(TransferError::StorageFailure(
                "injected fault on commit".to_string(),
            ));
        }

        let MemoryUnit {
            inner,
            guards,
            staged_accounts,
            staged_records,
            ..
        } = *self;

        {
            let mut state = inner.state.write().map_err(|_| poisoned())?;

            // Validate everything before touching anything
            for record in &staged_records {
                if state.by_id.contains_key(&record.id) {
                    return Err(TransferError::StorageFailure(format!(
                        "transaction id {} already exists",
                        record.id
                    )));
                }
                if let Some(key) = &record.client_ref
                    && state
                        .by_client_ref
                        .contains_key(&(record.initiator, key.clone()))
                {
                    return Err(TransferError::DuplicateRequest);
                }
            }

            for (id, row) in staged_accounts {
                state.accounts.insert(id, row);
            }
            for record in staged_records {
                let idx = state.log.len();
                state.by_id.insert(record.id, idx);
                if let Some(key) = &record.client_ref {
                    state.by_client_ref.insert((record.initiator, key.clone()), idx);
                }
                state.log.push(record);
            }
        }

        // Publish first, then release locks
        drop(guards);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), TransferError> {
        debug!(
            staged_accounts = self.staged_accounts.len(),
            staged_records = self.staged_records.len(),
            "Atomic unit rolled back"
        );
        Ok(())
    }
}
