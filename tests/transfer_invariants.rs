//! Ledger invariants under concurrent transfers (in-memory backend)

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use core_bank::{
    Account, AccountId, Amount, AtomicUnit, LedgerStore, MemoryLedger, TransactionRecord, TransferEngine,
    TransferError, TransferRequest, UserId,
};
use rust_decimal::Decimal;

struct Bank {
    ledger: MemoryLedger,
    engine: Arc<TransferEngine>,
}

impl Bank {
    fn new() -> Self {
        Self::with_lock_timeout(Duration::from_secs(5))
    }

    fn with_lock_timeout(timeout: Duration) -> Self {
        let ledger = MemoryLedger::new(timeout);
        let engine = Arc::new(TransferEngine::new(Arc::new(ledger.clone())));
        Self { ledger, engine }
    }

    async fn open(&self, units: u64) -> Account {
        self.ledger
            .open_account(UserId::new(), Amount::from_units(units))
            .await
            .unwrap()
    }

    async fn balance(&self, account: &Account) -> Amount {
        self.engine.balance(account.id).await.unwrap()
    }

    /// Accounts sorted by id plus the full log
    async fn snapshot(&self) -> (Vec<Account>, Vec<TransactionRecord>) {
        let mut accounts = self.ledger.list_accounts().await.unwrap();
        accounts.sort_by_key(|a| a.id);
        (accounts, self.ledger.list_transactions().await.unwrap())
    }
}

fn units(n: u64) -> Amount {
    Amount::from_units(n)
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn transfer_moves_funds_and_records_once() {
    let bank = Bank::new();
    let a = bank.open(1000).await;
    let b = bank.open(500).await;

    let record = bank
        .engine
        .transfer(TransferRequest::new(a.owner, a.id, b.id, units(100)))
        .await
        .unwrap();

    assert_eq!(bank.balance(&a).await, units(900));
    assert_eq!(bank.balance(&b).await, units(600));

    let log = bank.ledger.list_transactions().await.unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0], record);
    assert_eq!(record.source, a.id);
    assert_eq!(record.destination, b.id);
    assert_eq!(record.amount, units(100));
    assert_eq!(
        bank.ledger.get_transaction(record.id).await.unwrap(),
        Some(record.clone())
    );
    assert_eq!(
        bank.ledger.transactions_for_account(b.id).await.unwrap(),
        vec![record]
    );
}

#[tokio::test]
async fn insufficient_balance_changes_nothing() {
    let bank = Bank::new();
    let a = bank.open(1000).await;
    let b = bank.open(500).await;
    let before = bank.snapshot().await;

    let err = bank
        .engine
        .transfer(TransferRequest::new(a.owner, a.id, b.id, units(2000)))
        .await
        .unwrap_err();

    assert_eq!(err, TransferError::InsufficientBalance);
    assert!(!err.is_retryable());
    assert_eq!(bank.snapshot().await, before);
}

#[tokio::test]
async fn same_account_rejected_without_taking_a_lock() {
    let bank = Bank::new();
    let a = bank.open(1000).await;

    // Another unit holds A; a same-account transfer must not wait on it
    let mut holder = bank.ledger.begin().await.unwrap();
    holder.get_account_for_update(a.id).await.unwrap();

    let result = tokio::time::timeout(
        Duration::from_millis(100),
        bank.engine
            .transfer(TransferRequest::new(a.owner, a.id, a.id, units(50))),
    )
    .await
    .expect("same-account check must not block");

    assert_eq!(result.unwrap_err(), TransferError::SameAccount);
    holder.rollback().await.unwrap();
    assert_eq!(bank.balance(&a).await, units(1000));
}

#[tokio::test]
async fn non_owner_is_unauthorized() {
    let bank = Bank::new();
    let a = bank.open(1000).await;
    let b = bank.open(500).await;
    let before = bank.snapshot().await;

    let stranger = UserId::new();
    let err = bank
        .engine
        .transfer(TransferRequest::new(stranger, a.id, b.id, units(50)))
        .await
        .unwrap_err();

    assert_eq!(err, TransferError::Unauthorized);
    assert_eq!(err.http_status(), 403);
    assert_eq!(bank.snapshot().await, before);

    // Owning the destination does not help
    let err = bank
        .engine
        .transfer(TransferRequest::new(b.owner, a.id, b.id, units(50)))
        .await
        .unwrap_err();
    assert_eq!(err, TransferError::Unauthorized);
}

#[tokio::test]
async fn every_precondition_failure_leaves_state_unchanged() {
    let bank = Bank::new();
    let a = bank.open(1000).await;
    let b = bank.open(500).await;
    let before = bank.snapshot().await;

    let failures = vec![
        TransferRequest::new(a.owner, a.id, b.id, Amount::ZERO),
        TransferRequest::new(a.owner, a.id, a.id, units(1)),
        TransferRequest::new(a.owner, a.id, AccountId::new(), units(1)),
        TransferRequest::new(a.owner, AccountId::new(), b.id, units(1)),
        TransferRequest::new(UserId::new(), a.id, b.id, units(1)),
        TransferRequest::new(a.owner, a.id, b.id, units(1001)),
    ];

    for req in failures {
        assert!(bank.engine.transfer(req.clone()).await.is_err(), "{:?}", req);
        assert_eq!(bank.snapshot().await, before, "{:?}", req);
    }
    assert!(!bank.ledger.is_locked(a.id));
    assert!(!bank.ledger.is_locked(b.id));
}

// ============================================================================
// Atomicity
// ============================================================================

#[tokio::test]
async fn fault_between_debit_and_credit_rolls_back_everything() {
    let bank = Bank::new();
    let a = bank.open(1000).await;
    let b = bank.open(500).await;
    let before = bank.snapshot().await;

    // Debit save succeeds, credit save fails
    bank.ledger.fail_save_after(1);

    let err = bank
        .engine
        .transfer(TransferRequest::new(a.owner, a.id, b.id, units(100)))
        .await
        .unwrap_err();

    assert!(matches!(err, TransferError::StorageFailure(_)));
    assert!(err.is_retryable());
    assert_eq!(bank.snapshot().await, before);
    assert!(!bank.ledger.is_locked(a.id));
    assert!(!bank.ledger.is_locked(b.id));

    // The caller's retry goes through cleanly
    bank.engine
        .transfer(TransferRequest::new(a.owner, a.id, b.id, units(100)))
        .await
        .unwrap();
    assert_eq!(bank.balance(&a).await, units(900));
    assert_eq!(bank.balance(&b).await, units(600));
}

#[tokio::test]
async fn lock_wait_timeout_is_busy_and_rolls_back() {
    let bank = Bank::with_lock_timeout(Duration::from_millis(50));
    let a = bank.open(1000).await;
    let b = bank.open(500).await;

    let mut holder = bank.ledger.begin().await.unwrap();
    holder.get_account_for_update(b.id).await.unwrap();

    let err = bank
        .engine
        .transfer(TransferRequest::new(a.owner, a.id, b.id, units(10)))
        .await
        .unwrap_err();
    assert_eq!(err, TransferError::Busy);
    assert!(err.is_retryable());

    // The lock the failed transfer did get was released on rollback
    assert!(!bank.ledger.is_locked(a.id));
    holder.rollback().await.unwrap();

    assert_eq!(bank.balance(&a).await, units(1000));
    assert!(bank.ledger.list_transactions().await.unwrap().is_empty());
}

// ============================================================================
// Concurrency
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn hundred_concurrent_debits_against_fifty() {
    let bank = Bank::new();
    let a = bank.open(50).await;
    let b = bank.open(500).await;

    let handles: Vec<_> = (0..100)
        .map(|_| {
            let engine = Arc::clone(&bank.engine);
            let req = TransferRequest::new(a.owner, a.id, b.id, units(1));
            tokio::spawn(async move { engine.transfer(req).await })
        })
        .collect();

    let mut ok = 0;
    let mut insufficient = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => ok += 1,
            Err(TransferError::InsufficientBalance) => insufficient += 1,
            Err(e) => panic!("unexpected error: {}", e),
        }
    }

    assert_eq!(ok, 50);
    assert_eq!(insufficient, 50);
    assert_eq!(bank.balance(&a).await, Amount::ZERO);
    assert_eq!(bank.balance(&b).await, units(550));
    assert_eq!(bank.ledger.list_transactions().await.unwrap().len(), 50);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn opposite_direction_transfers_never_deadlock() {
    let bank = Bank::new();
    let a = bank.open(1000).await;
    let b = bank.open(1000).await;

    let handles: Vec<_> = (0..400)
        .map(|i| {
            let engine = Arc::clone(&bank.engine);
            let req = if i % 2 == 0 {
                TransferRequest::new(a.owner, a.id, b.id, units(7))
            } else {
                TransferRequest::new(b.owner, b.id, a.id, units(7))
            };
            tokio::spawn(async move { engine.transfer(req).await })
        })
        .collect();

    let all = tokio::time::timeout(Duration::from_secs(20), futures::future::join_all(handles))
        .await
        .expect("transfers must all complete");

    let committed = all
        .into_iter()
        .map(|r| r.unwrap())
        .filter(|r| match r {
            Ok(_) => true,
            Err(TransferError::InsufficientBalance) => false,
            Err(e) => panic!("unexpected error: {}", e),
        })
        .count();

    let total = bank.balance(&a).await.as_decimal() + bank.balance(&b).await.as_decimal();
    assert_eq!(total, Decimal::from(2000));
    assert_eq!(
        bank.ledger.list_transactions().await.unwrap().len(),
        committed
    );
}

/// Deterministic xorshift so the interleaving test needs no extra crates
fn next(state: &mut u64) -> u64 {
    *state ^= *state << 13;
    *state ^= *state >> 7;
    *state ^= *state << 17;
    *state
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn random_interleavings_conserve_total_at_every_observation() {
    let bank = Bank::new();
    let mut accounts = Vec::new();
    for seed in [300, 0, 1200, 75, 40, 900] {
        accounts.push(bank.open(seed).await);
    }
    let expected_total = Decimal::from(2515);

    // Reader samples committed state while transfers run
    let done = Arc::new(AtomicBool::new(false));
    let reader = {
        let ledger = bank.ledger.clone();
        let done = Arc::clone(&done);
        tokio::spawn(async move {
            let mut samples = 0usize;
            while !done.load(Ordering::SeqCst) {
                let total = ledger.total_balance().await.unwrap();
                assert_eq!(total, expected_total, "half-applied transfer observed");
                samples += 1;
                tokio::task::yield_now().await;
            }
            samples
        })
    };

    let mut rng = 0x9E37_79B9_7F4A_7C15u64;
    let handles: Vec<_> = (0..600)
        .map(|_| {
            let from = &accounts[(next(&mut rng) % 6) as usize];
            let to = &accounts[(next(&mut rng) % 6) as usize];
            let amount = units(next(&mut rng) % 120);
            let engine = Arc::clone(&bank.engine);
            let req = TransferRequest::new(from.owner, from.id, to.id, amount);
            tokio::spawn(async move { engine.transfer(req).await })
        })
        .collect();

    let mut committed = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => committed += 1,
            Err(
                TransferError::InvalidAmount
                | TransferError::SameAccount
                | TransferError::InsufficientBalance,
            ) => {}
            Err(e) => panic!("unexpected error: {}", e),
        }
    }

    done.store(true, Ordering::SeqCst);
    let samples = reader.await.unwrap();
    assert!(samples > 0);

    assert_eq!(bank.ledger.total_balance().await.unwrap(), expected_total);
    assert_eq!(
        bank.ledger.list_transactions().await.unwrap().len(),
        committed
    );

    // Replaying the log from the seeds reproduces the final balances
    let mut replayed: std::collections::HashMap<AccountId, Decimal> = accounts
        .iter()
        .map(|a| (a.id, a.balance.as_decimal()))
        .collect();
    for record in bank.ledger.list_transactions().await.unwrap() {
        *replayed.get_mut(&record.source).unwrap() -= record.amount.as_decimal();
        *replayed.get_mut(&record.destination).unwrap() += record.amount.as_decimal();
    }
    for account in &accounts {
        assert_eq!(
            bank.balance(account).await.as_decimal(),
            replayed[&account.id]
        );
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_duplicate_client_ref_applies_once() {
    let bank = Bank::new();
    let a = bank.open(1000).await;
    let b = bank.open(0).await;

    let handles: Vec<_> = (0..20)
        .map(|_| {
            let engine = Arc::clone(&bank.engine);
            let req =
                TransferRequest::new(a.owner, a.id, b.id, units(10)).with_client_ref("invoice-9");
            tokio::spawn(async move { engine.transfer(req).await })
        })
        .collect();

    let mut ids = Vec::new();
    for handle in handles {
        ids.push(handle.await.unwrap().unwrap().id);
    }
    ids.dedup();

    assert_eq!(ids.len(), 1);
    assert_eq!(bank.balance(&a).await, units(990));
    assert_eq!(bank.balance(&b).await, units(10));
}
