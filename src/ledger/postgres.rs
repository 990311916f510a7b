//! PostgreSQL ledger backend
//!
//! Each atomic unit is one database transaction. Account exclusion uses
//! `SELECT ... FOR UPDATE`; the wait is bounded by `SET LOCAL lock_timeout`,
//! and a timeout surfaces as `TransferError::Busy` (SQLSTATE 55P03).
//! Plain reads run outside any transaction and see the last committed row
//! without waiting on row locks.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use super::{AtomicUnit, LedgerStore};
use crate::account::Account;
use crate::core_types::{AccountId, TransactionId, UserId};
use crate::money::Amount;
use crate::transfer::error::TransferError;
use crate::transfer::types::TransactionRecord;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS accounts (
        id          UUID PRIMARY KEY,
        user_id     UUID NOT NULL,
        balance     NUMERIC(12, 0) NOT NULL CHECK (balance >= 0),
        created_at  TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS transactions (
        id               TEXT PRIMARY KEY,
        user_id          UUID NOT NULL,
        from_account_id  UUID NOT NULL REFERENCES accounts (id) ON DELETE RESTRICT,
        to_account_id    UUID NOT NULL REFERENCES accounts (id) ON DELETE RESTRICT,
        amount           NUMERIC(12, 0) NOT NULL CHECK (amount > 0),
        client_ref       TEXT,
        created_at       TIMESTAMPTZ NOT NULL,
        updated_at       TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS transactions_client_ref_uq
        ON transactions (user_id, client_ref) WHERE client_ref IS NOT NULL
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS transactions_from_idx ON transactions (from_account_id)
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS transactions_to_idx ON transactions (to_account_id)
    "#,
];

const TX_COLUMNS: &str =
    "id, user_id, from_account_id, to_account_id, amount, client_ref, created_at, updated_at";

/// PostgreSQL-backed [`LedgerStore`]
#[derive(Clone)]
pub struct PgLedger {
    pool: PgPool,
    lock_timeout: Duration,
}

impl PgLedger {
    pub fn new(pool: PgPool, lock_timeout: Duration) -> Self {
        Self { pool, lock_timeout }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create tables and indexes if missing
    pub async fn ensure_schema(&self) -> Result<(), TransferError> {
        for stmt in SCHEMA {
            sqlx::query(stmt).execute(&self.pool).await?;
        }
        tracing::info!("Ledger schema ensured");
        Ok(())
    }
}

fn decode_amount(value: Decimal, column: &str) -> Result<Amount, TransferError> {
    Amount::try_from(value)
        .map_err(|e| TransferError::StorageFailure(format!("bad {} value {}: {}", column, value, e)))
}

fn row_to_account(row: &PgRow) -> Result<Account, TransferError> {
    Ok(Account {
        id: AccountId::from_uuid(row.try_get::<Uuid, _>("id")?),
        owner: UserId::from_uuid(row.try_get::<Uuid, _>("user_id")?),
        balance: decode_amount(row.try_get("balance")?, "balance")?,
        updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
    })
}

fn row_to_record(row: &PgRow) -> Result<TransactionRecord, TransferError> {
    let id_str: String = row.try_get("id")?;
    let id: TransactionId = id_str
        .parse()
        .map_err(|_| TransferError::StorageFailure(format!("Invalid transaction id: {}", id_str)))?;

    Ok(TransactionRecord {
        id,
        initiator: UserId::from_uuid(row.try_get::<Uuid, _>("user_id")?),
        amount: decode_amount(row.try_get("amount")?, "amount")?,
        source: AccountId::from_uuid(row.try_get::<Uuid, _>("from_account_id")?),
        destination: AccountId::from_uuid(row.try_get::<Uuid, _>("to_account_id")?),
        client_ref: row.try_get("client_ref")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl LedgerStore for PgLedger {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn begin(&self) -> Result<Box<dyn AtomicUnit>, TransferError> {
        let mut tx = self.pool.begin().await?;
        // SET cannot take bind parameters; the value is an integer we format ourselves
        let stmt = format!(
            "SET LOCAL lock_timeout = '{}ms'",
            self.lock_timeout.as_millis()
        );
        sqlx::query(&stmt).execute(&mut *tx).await?;

        Ok(Box::new(PgUnit {
            tx,
            locked: HashSet::with_capacity(2),
        }))
    }

    async fn open_account(
        &self,
        owner: UserId,
        balance: Amount,
    ) -> Result<Account, TransferError> {
        let row = sqlx::query(
            r#"
            INSERT INTO accounts (id, user_id, balance)
            VALUES ($1, $2, $3)
            RETURNING id, user_id, balance, updated_at
            "#,
        )
        .bind(AccountId::new().as_uuid())
        .bind(owner.as_uuid())
        .bind(balance.as_decimal())
        .fetch_one(&self.pool)
        .await?;

        row_to_account(&row)
    }

    async fn get_account(&self, id: AccountId) -> Result<Option<Account>, TransferError> {
        let row = sqlx::query("SELECT id, user_id, balance, updated_at FROM accounts WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_account).transpose()
    }

    async fn list_accounts(&self) -> Result<Vec<Account>, TransferError> {
        let rows = sqlx::query("SELECT id, user_id, balance, updated_at FROM accounts ORDER BY id")
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(row_to_account).collect()
    }

    async fn get_transaction(
        &self,
        id: TransactionId,
    ) -> Result<Option<TransactionRecord>, TransferError> {
        let row = sqlx::query(&format!("SELECT {} FROM transactions WHERE id = $1", TX_COLUMNS))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_record).transpose()
    }

    async fn list_transactions(&self) -> Result<Vec<TransactionRecord>, TransferError> {
        // ULID text sorts by creation time
        let rows = sqlx::query(&format!("SELECT {} FROM transactions ORDER BY id ASC", TX_COLUMNS))
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(row_to_record).collect()
    }

    async fn transactions_for_account(
        &self,
        account: AccountId,
    ) -> Result<Vec<TransactionRecord>, TransferError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM transactions
             WHERE from_account_id = $1 OR to_account_id = $1
             ORDER BY id DESC",
            TX_COLUMNS
        ))
        .bind(account.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_record).collect()
    }

    async fn find_transaction_by_client_ref(
        &self,
        initiator: UserId,
        client_ref: &str,
    ) -> Result<Option<TransactionRecord>, TransferError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM transactions WHERE user_id = $1 AND client_ref = $2",
            TX_COLUMNS
        ))
        .bind(initiator.as_uuid())
        .bind(client_ref)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_record).transpose()
    }

    async fn total_balance(&self) -> Result<Decimal, TransferError> {
        let total: Option<Decimal> = sqlx::query_scalar("SELECT SUM(balance) FROM accounts")
            .fetch_one(&self.pool)
            .await?;
        Ok(total.unwrap_or(Decimal::ZERO))
    }
}

/// One PostgreSQL transaction. Dropping it without commit rolls back.
pub struct PgUnit {
    tx: Transaction<'static, Postgres>,
    locked: HashSet<AccountId>,
}

#[async_trait]
impl AtomicUnit for PgUnit {
    async fn get_account_for_update(&mut self, id: AccountId) -> Result<Account, TransferError> {
        let row = sqlx::query(
            "SELECT id, user_id, balance, updated_at FROM accounts WHERE id = $1 FOR UPDATE",
        )
        .bind(id.as_uuid())
        .fetch_optional(&mut *self.tx)
        .await?;

        let account = row
            .as_ref()
            .map(row_to_account)
            .transpose()?
            .ok_or(TransferError::AccountNotFound(id))?;
        self.locked.insert(id);
        Ok(account)
    }

    async fn save_account(&mut self, account: &Account) -> Result<(), TransferError> {
        if !self.locked.contains(&account.id) {
            return Err(TransferError::StorageFailure(format!(
                "account {} was not loaded for update in this unit",
                account.id
            )));
        }

        let result =
            sqlx::query("UPDATE accounts SET balance = $1, updated_at = NOW() WHERE id = $2")
                .bind(account.balance.as_decimal())
                .bind(account.id.as_uuid())
                .execute(&mut *self.tx)
                .await?;

        if result.rows_affected() != 1 {
            return Err(TransferError::StorageFailure(format!(
                "balance update touched {} rows for account {}",
                result.rows_affected(),
                account.id
            )));
        }
        Ok(())
    }

    async fn find_by_client_ref(
        &mut self,
        initiator: UserId,
        client_ref: &str,
    ) -> Result<Option<TransactionRecord>, TransferError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM transactions WHERE user_id = $1 AND client_ref = $2",
            TX_COLUMNS
        ))
        .bind(initiator.as_uuid())
        .bind(client_ref)
        .fetch_optional(&mut *self.tx)
        .await?;

        row.as_ref().map(row_to_record).transpose()
    }

    async fn append_transaction(
        &mut self,
        record: &TransactionRecord,
    ) -> Result<(), TransferError> {
        sqlx::query(&format!(
            "INSERT INTO transactions ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
            TX_COLUMNS
        ))
        .bind(record.id.to_string())
        .bind(record.initiator.as_uuid())
        .bind(record.source.as_uuid())
        .bind(record.destination.as_uuid())
        .bind(record.amount.as_decimal())
        .bind(&record.client_ref)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), TransferError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), TransferError> {
        self.tx.rollback().await?;
        Ok(())
    }
}
