//! Ledger Store
//!
//! Durable keyed storage for account balances and the immutable transaction log.
//!
//! # Write path
//!
//! All balance writes go through an [`AtomicUnit`] obtained from
//! [`LedgerStore::begin`]:
//!
//! ```text
//! begin ─▶ get_account_for_update* ─▶ save_account* ─▶ append_transaction* ─▶ commit
//!                       │                                                     │
//!                       └──────────────── any error ──────────────────▶ rollback
//! ```
//!
//! `get_account_for_update` takes the account's exclusive lock for the rest of the
//! unit. Nothing staged in a unit is visible to any reader until `commit` returns.
//! Dropping a unit without committing discards it.
//!
//! # Read path
//!
//! The read methods on [`LedgerStore`] return the last committed state and never
//! wait on a transfer's account lock.
//!
//! # Backends
//!
//! - [`MemoryLedger`] - in-process rows + [`AccountLockTable`](crate::transfer::lock::AccountLockTable)
//! - [`PgLedger`] - PostgreSQL, `SELECT ... FOR UPDATE` row locks

pub mod memory;
pub mod postgres;

pub use memory::MemoryLedger;
pub use postgres::PgLedger;

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::account::Account;
use crate::core_types::{AccountId, TransactionId, UserId};
use crate::money::Amount;
use crate::transfer::error::TransferError;
use crate::transfer::types::TransactionRecord;

/// Scoped transaction boundary over the ledger.
#[async_trait]
pub trait AtomicUnit: Send {
    /// Lock `id` for the remainder of the unit and return its current row.
    ///
    /// # Errors
    /// - `AccountNotFound` if the account does not exist
    /// - `Busy` if the lock was not obtained within the configured wait
    async fn get_account_for_update(&mut self, id: AccountId) -> Result<Account, TransferError>;

    /// Stage a balance change. Only accounts locked by this unit may be saved,
    /// and only the balance is written.
    async fn save_account(&mut self, account: &Account) -> Result<(), TransferError>;

    /// Committed record carrying this idempotency key for this initiator,
    /// read inside the unit (same connection, no second checkout).
    async fn find_by_client_ref(
        &mut self,
        initiator: UserId,
        client_ref: &str,
    ) -> Result<Option<TransactionRecord>, TransferError>;

    /// Stage an immutable transaction record.
    async fn append_transaction(&mut self, record: &TransactionRecord)
    -> Result<(), TransferError>;

    /// Publish every staged write at once and release the unit's locks.
    async fn commit(self: Box<Self>) -> Result<(), TransferError>;

    /// Discard every staged write and release the unit's locks.
    async fn rollback(self: Box<Self>) -> Result<(), TransferError>;
}

/// Ledger storage backend.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Backend name for logging
    fn name(&self) -> &'static str;

    /// Open a new atomic unit
    async fn begin(&self) -> Result<Box<dyn AtomicUnit>, TransferError>;

    /// Create an account with an initial balance.
    ///
    /// Stand-in for the account-management collaborator (seeding, tests);
    /// never called by the transfer path.
    async fn open_account(&self, owner: UserId, balance: Amount)
    -> Result<Account, TransferError>;

    /// Last committed state of one account
    async fn get_account(&self, id: AccountId) -> Result<Option<Account>, TransferError>;

    async fn list_accounts(&self) -> Result<Vec<Account>, TransferError>;

    async fn get_transaction(
        &self,
        id: TransactionId,
    ) -> Result<Option<TransactionRecord>, TransferError>;

    /// Whole log, oldest first
    async fn list_transactions(&self) -> Result<Vec<TransactionRecord>, TransferError>;

    /// Records where `account` is source or destination, newest first
    async fn transactions_for_account(
        &self,
        account: AccountId,
    ) -> Result<Vec<TransactionRecord>, TransferError>;

    /// Committed record carrying this idempotency key for this initiator
    async fn find_transaction_by_client_ref(
        &self,
        initiator: UserId,
        client_ref: &str,
    ) -> Result<Option<TransactionRecord>, TransferError>;

    /// Sum of all committed balances.
    async fn total_balance(&self) -> Result<Decimal, TransferError> {
        let accounts = self.list_accounts().await?;
        Ok(accounts.iter().map(|a| a.balance.as_decimal()).sum())
    }
}
