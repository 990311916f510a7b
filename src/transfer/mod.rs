//! Funds Transfer
//!
//! Moves money between two accounts as one atomic unit.
//!
//! # Components
//!
//! - [`lock`] - deterministic account lock order + per-account lock table
//! - [`auth`] - source-ownership check, run under lock
//! - [`engine`] - precondition checks, debit/credit, record append, commit
//!
//! # Safety Invariants
//!
//! 1. **Check-under-lock**: existence, ownership and balance are checked only
//!    on rows loaded after both account locks are held
//! 2. **Global lock order**: lower account id is always locked first
//! 3. **All-or-nothing**: balance writes and the transaction record commit together
//! 4. **No silent retry**: every failure is returned to the caller as-is

pub mod auth;
pub mod engine;
pub mod error;
pub mod lock;
pub mod types;

// Re-exports for convenience
pub use engine::TransferEngine;
pub use error::TransferError;
pub use lock::{AccountLockTable, LockOrder};
pub use types::{TransactionRecord, TransferRequest};
