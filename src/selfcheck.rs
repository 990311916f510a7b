//! Ledger self-check
//!
//! Seeds two accounts, fires `transfers` concurrent transfers alternating
//! A→B / B→A, then verifies the ledger invariants against committed state:
//! total balance conserved, no negative balance, one log record per success.

use std::sync::Arc;

use futures::future::join_all;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{info, warn};

use crate::core_types::UserId;
use crate::money::Amount;
use crate::transfer::{TransferEngine, TransferError, TransferRequest};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SelfCheckReport {
    pub attempted: usize,
    pub committed: usize,
    pub insufficient_balance: usize,
    pub busy: usize,
    pub other_failures: usize,
    pub total_before: Decimal,
    pub total_after: Decimal,
    pub log_records: usize,
}

impl SelfCheckReport {
    /// Conservation holds and every committed transfer left exactly one record
    pub fn passed(&self) -> bool {
        self.total_before == self.total_after
            && self.log_records == self.committed
            && self.other_failures == 0
    }
}

/// Run the alternating-transfer check against `engine`'s store.
pub async fn run_self_check(
    engine: Arc<TransferEngine>,
    transfers: usize,
    seed_a: Amount,
    seed_b: Amount,
    amount: Amount,
) -> Result<SelfCheckReport, TransferError> {
    let store = engine.store();
    let a = store.open_account(UserId::new(), seed_a).await?;
    let b = store.open_account(UserId::new(), seed_b).await?;
    let log_before = store.list_transactions().await?.len();

    let total_before = a.balance.as_decimal() + b.balance.as_decimal();

    let tasks = (0..transfers).map(|i| {
        let engine = Arc::clone(&engine);
        let req = if i % 2 == 0 {
            TransferRequest::new(a.owner, a.id, b.id, amount)
        } else {
            TransferRequest::new(b.owner, b.id, a.id, amount)
        };
        tokio::spawn(async move { engine.transfer(req).await })
    });

    let mut report = SelfCheckReport {
        attempted: transfers,
        total_before,
        ..Default::default()
    };

    for joined in join_all(tasks).await {
        match joined {
            Ok(Ok(_)) => report.committed += 1,
            Ok(Err(TransferError::InsufficientBalance)) => report.insufficient_balance += 1,
            Ok(Err(TransferError::Busy)) => report.busy += 1,
            Ok(Err(e)) => {
                warn!(error = %e, "Self-check transfer failed");
                report.other_failures += 1;
            }
            Err(join_err) => {
                warn!(error = %join_err, "Self-check task panicked");
                report.other_failures += 1;
            }
        }
    }

    let after_a = engine.balance(a.id).await?;
    let after_b = engine.balance(b.id).await?;
    report.total_after = after_a.as_decimal() + after_b.as_decimal();
    report.log_records = store
        .transactions_for_account(a.id)
        .await?
        .iter()
        .filter(|r| r.touches(b.id))
        .count();
    let log_delta = store.list_transactions().await?.len() - log_before;

    info!(
        backend = store.name(),
        attempted = report.attempted,
        committed = report.committed,
        insufficient = report.insufficient_balance,
        busy = report.busy,
        balance_a = %after_a,
        balance_b = %after_b,
        log_delta,
        "Self-check finished"
    );

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::MemoryLedger;
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_self_check_passes_on_memory_ledger() {
        let ledger = MemoryLedger::new(Duration::from_secs(5));
        let engine = Arc::new(TransferEngine::new(Arc::new(ledger)));

        let report = run_self_check(
            engine,
            200,
            Amount::from_units(1000),
            Amount::from_units(500),
            Amount::from_units(3),
        )
        .await
        .unwrap();

        assert!(report.passed(), "{:?}", report);
        assert_eq!(report.attempted, 200);
        assert_eq!(report.busy, 0);
        assert_eq!(
            report.committed + report.insufficient_balance,
            report.attempted
        );
        assert_eq!(report.total_before, Decimal::from(1500));
    }
}
