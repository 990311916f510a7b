//! Transfer Engine
//!
//! Runs one transfer end-to-end as a single atomic unit:
//!
//! ```text
//! amount > 0 ─▶ source != dest ─▶ begin ─▶ lock(lower id) ─▶ lock(higher id)
//!                                             │
//!      ┌──────────────────────────────────────┘
//!      ▼
//! exists? ─▶ owner == requester? ─▶ balance >= amount? ─▶ debit, credit, append ─▶ commit
//! ```
//!
//! Every check after `begin` reads rows loaded under lock. Any failure before
//! `commit` rolls the unit back, so no partial debit/credit is ever visible.
//! The engine never retries.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use super::auth::authorize_debit;
use super::error::TransferError;
use super::lock::LockOrder;
use super::types::{TransactionRecord, TransferRequest};
use crate::core_types::AccountId;
use crate::ledger::{AtomicUnit, LedgerStore};
use crate::money::Amount;

enum Outcome {
    /// Balances mutated and record staged; commit pending
    Applied(TransactionRecord),
    /// Same client_ref already committed; nothing staged
    Replayed(TransactionRecord),
}

/// Stateless transfer orchestrator over a [`LedgerStore`].
pub struct TransferEngine {
    store: Arc<dyn LedgerStore>,
}

impl TransferEngine {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }

    /// Last committed balance of an account. Never waits on a transfer.
    pub async fn balance(&self, account: AccountId) -> Result<Amount, TransferError> {
        self.store
            .get_account(account)
            .await?
            .map(|a| a.balance)
            .ok_or(TransferError::AccountNotFound(account))
    }

    /// Move `req.amount` from `req.source` to `req.destination`.
    ///
    /// Returns the persisted transaction record, or the earlier record when
    /// `req.client_ref` was already used by the same requester for the same
    /// accounts and amount. A key reused for a different transfer fails with
    /// `DuplicateRequest`.
    pub async fn transfer(&self, req: TransferRequest) -> Result<TransactionRecord, TransferError> {
        // === Checks that need no I/O ===
        if req.amount.is_zero() {
            return Err(reject(&req, TransferError::InvalidAmount));
        }
        let order = LockOrder::new(req.source, req.destination).map_err(|e| reject(&req, e))?;

        let mut unit = self.store.begin().await?;
        let result = self.apply(unit.as_mut(), &req, order).await;

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                if let Err(rb) = unit.rollback().await {
                    error!(error = %rb, "Rollback failed");
                }
                return self.resolve_failure(&req, e).await;
            }
        };

        match outcome {
            Outcome::Applied(record) => {
                if let Err(e) = unit.commit().await {
                    return self.resolve_failure(&req, e).await;
                }
                info!(
                    tx_id = %record.id,
                    requester = %record.initiator,
                    from = %record.source,
                    to = %record.destination,
                    amount = %record.amount,
                    "Transfer committed"
                );
                Ok(record)
            }
            Outcome::Replayed(record) => {
                unit.rollback().await?;
                info!(
                    tx_id = %record.id,
                    client_ref = record.client_ref.as_deref().unwrap_or_default(),
                    "Duplicate submission, returning committed transfer"
                );
                Ok(record)
            }
        }
    }

    /// Body of the atomic unit. Writes nothing unless every precondition holds.
    async fn apply(
        &self,
        unit: &mut dyn AtomicUnit,
        req: &TransferRequest,
        order: LockOrder,
    ) -> Result<Outcome, TransferError> {
        // Lock + load in global id order; existence is checked here
        let first = unit.get_account_for_update(order.first()).await?;
        let second = unit.get_account_for_update(order.second()).await?;
        debug!(first = %first.id, second = %second.id, "Transfer accounts locked");

        let (mut source, mut destination) = if first.id == req.source {
            (first, second)
        } else {
            (second, first)
        };

        if let Some(key) = &req.client_ref
            && let Some(existing) = unit.find_by_client_ref(req.requester, key).await?
        {
            if !existing.matches_request(req) {
                return Err(TransferError::DuplicateRequest);
            }
            return Ok(Outcome::Replayed(existing));
        }

        authorize_debit(req.requester, &source)?;

        source.balance = source
            .balance
            .checked_sub(req.amount)
            .ok_or(TransferError::InsufficientBalance)?;
        destination.balance = destination
            .balance
            .checked_add(req.amount)
            .ok_or(TransferError::Overflow)?;

        unit.save_account(&source).await?;
        unit.save_account(&destination).await?;

        let record = TransactionRecord::new(req);
        unit.append_transaction(&record).await?;

        Ok(Outcome::Applied(record))
    }

    /// Log a failed unit and, for an idempotency-key race lost at commit,
    /// return the winner's record instead.
    async fn resolve_failure(
        &self,
        req: &TransferRequest,
        e: TransferError,
    ) -> Result<TransactionRecord, TransferError> {
        if e == TransferError::DuplicateRequest
            && let Some(key) = &req.client_ref
            && let Some(existing) = self
                .store
                .find_transaction_by_client_ref(req.requester, key)
                .await?
            && existing.matches_request(req)
        {
            info!(tx_id = %existing.id, client_ref = %key, "Concurrent duplicate submission resolved");
            return Ok(existing);
        }

        match &e {
            TransferError::StorageFailure(msg) => error!(
                from = %req.source,
                to = %req.destination,
                error = %msg,
                "Transfer rolled back on storage failure"
            ),
            TransferError::Busy => warn!(
                from = %req.source,
                to = %req.destination,
                "Transfer rolled back, account busy"
            ),
            _ => {
                reject(req, e.clone());
            }
        }
        Err(e)
    }
}

/// Log a business-rule rejection and hand the error back
fn reject(req: &TransferRequest, e: TransferError) -> TransferError {
    warn!(
        requester = %req.requester,
        from = %req.source,
        to = %req.destination,
        amount = %req.amount,
        code = e.code(),
        "Transfer rejected"
    );
    e
}
