//! Account Lock Manager
//!
//! Two rules keep concurrent transfers deadlock-free:
//!
//! 1. **Global order**: of the two accounts in a transfer, the one with the lower
//!    [`AccountId`] is always locked first ([`LockOrder`]).
//! 2. **Hold until end of unit**: guards live inside the atomic unit and are
//!    dropped only on commit or rollback.
//!
//! With a total order no cycle of waiters can form, so every wait either
//! succeeds or hits the lock timeout (→ [`TransferError::Busy`]).

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use super::error::TransferError;
use crate::core_types::AccountId;

/// Deterministic acquisition order for the two accounts of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockOrder {
    first: AccountId,
    second: AccountId,
}

impl LockOrder {
    /// Order two distinct accounts. Equal ids fail with `SameAccount`
    /// before anything is locked.
    pub fn new(a: AccountId, b: AccountId) -> Result<Self, TransferError> {
        if a == b {
            return Err(TransferError::SameAccount);
        }
        let (first, second) = if a < b { (a, b) } else { (b, a) };
        Ok(Self { first, second })
    }

    #[inline]
    pub fn first(&self) -> AccountId {
        self.first
    }

    #[inline]
    pub fn second(&self) -> AccountId {
        self.second
    }

    /// Accounts in acquisition order
    pub fn in_order(&self) -> [AccountId; 2] {
        [self.first, self.second]
    }
}

type LockMap = DashMap<AccountId, Arc<Mutex<()>>>;

/// Drop the account's entry once nobody holds or waits on its mutex.
///
/// `remove_if` runs under the shard write lock, the same lock `acquire` takes
/// to clone the mutex out, so a count of 1 (the map's own Arc) cannot race
/// with a new waiter.
fn evict_if_idle(locks: &LockMap, account: AccountId) {
    locks.remove_if(&account, |_, lock| Arc::strong_count(lock) == 1);
}

/// Exclusive hold on one account; released on drop.
pub struct AccountGuard {
    account: AccountId,
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<LockMap>,
}

impl AccountGuard {
    pub fn account(&self) -> AccountId {
        self.account
    }
}

impl Drop for AccountGuard {
    fn drop(&mut self) {
        // Unlock first so the guard's Arc no longer counts
        drop(self.guard.take());
        evict_if_idle(&self.locks, self.account);
    }
}

impl std::fmt::Debug for AccountGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountGuard")
            .field("account", &self.account)
            .finish()
    }
}

/// Per-account exclusive locks with a bounded wait.
///
/// One `tokio::sync::Mutex` per account, created on first use and evicted
/// when the last holder or waiter is gone. Waiters are woken in FIFO order
/// by tokio, but only mutual exclusion is relied upon.
pub struct AccountLockTable {
    locks: Arc<LockMap>,
    wait: Duration,
}

impl AccountLockTable {
    pub fn new(wait: Duration) -> Self {
        Self {
            locks: Arc::new(DashMap::new()),
            wait,
        }
    }

    pub fn wait(&self) -> Duration {
        self.wait
    }

    /// Acquire the exclusive lock for `account`, waiting at most the configured timeout.
    pub async fn acquire(&self, account: AccountId) -> Result<AccountGuard, TransferError> {
        // Clone the Arc out so no DashMap shard guard is held across the await
        let lock = Arc::clone(
            &*self
                .locks
                .entry(account)
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        );

        let acquired = tokio::time::timeout(self.wait, lock.lock_owned()).await;
        match acquired {
            Ok(guard) => {
                debug!(account = %account, "Account lock acquired");
                Ok(AccountGuard {
                    account,
                    guard: Some(guard),
                    locks: Arc::clone(&self.locks),
                })
            }
            Err(_) => {
                debug!(account = %account, wait_ms = self.wait.as_millis() as u64, "Account lock wait timed out");
                evict_if_idle(&self.locks, account);
                Err(TransferError::Busy)
            }
        }
    }

    /// Whether some unit currently holds the lock for `account`
    pub fn is_locked(&self, account: AccountId) -> bool {
        self.locks
            .get(&account)
            .map(|lock| lock.try_lock().is_err())
            .unwrap_or(false)
    }

    /// Number of accounts with a live holder or waiter
    pub fn tracked(&self) -> usize {
        self.locks.len()
    }
}
