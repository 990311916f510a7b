//! core_bank - Funds-Transfer Core
//!
//! Moves money between two bank accounts under concurrent access without
//! ever producing a negative balance, a lost update, or a duplicated
//! debit/credit.
//!
//! # Modules
//!
//! - [`core_types`] - Account, user and transaction identifiers
//! - [`money`] - Whole-unit fixed-point [`Amount`]
//! - [`account`] - Account row (owner + balance)
//! - [`ledger`] - Ledger store trait, in-memory and PostgreSQL backends
//! - [`transfer`] - Lock order, authorization gate, transfer engine
//! - [`selfcheck`] - Concurrent invariant check used by the binary
//! - [`config`] / [`logging`] / [`db`] - Ambient plumbing

// Core types - must be first!
pub mod core_types;

pub mod account;
pub mod money;

// Storage
pub mod db;
pub mod ledger;

// Transfer core
pub mod transfer;

// Plumbing
pub mod config;
pub mod logging;
pub mod selfcheck;

// Convenient re-exports at crate root
pub use account::Account;
pub use core_types::{AccountId, TransactionId, UserId};
pub use ledger::{AtomicUnit, LedgerStore, MemoryLedger, PgLedger};
pub use money::{Amount, AmountError};
pub use transfer::{TransactionRecord, TransferEngine, TransferError, TransferRequest};
