//! Transfer Error Types
//!
//! Closed set of outcomes a transfer can fail with. The transport layer maps
//! these to status codes via [`TransferError::code`] / [`TransferError::http_status`].

use thiserror::Error;

use crate::core_types::AccountId;

/// Transfer error types
///
/// Business-rule failures (`InvalidAmount` .. `InsufficientBalance`) are
/// deterministic. `Busy` and `StorageFailure` are transient; the caller may
/// retry, the core never does.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    // === Validation Errors (before any I/O) ===
    #[error("Amount must be greater than zero")]
    InvalidAmount,

    #[error("Source and destination account cannot be the same")]
    SameAccount,

    // === Account Errors (inside the atomic unit) ===
    #[error("Account not found: {0}")]
    AccountNotFound(AccountId),

    #[error("Requester does not own the source account")]
    Unauthorized,

    #[error("Insufficient balance")]
    InsufficientBalance,

    #[error("Amount would overflow the destination balance")]
    Overflow,

    // === Idempotency Errors ===
    #[error("Duplicate request (client_ref already used)")]
    DuplicateRequest,

    // === System Errors ===
    #[error("Account is busy, lock wait timed out")]
    Busy,

    #[error("Storage failure: {0}")]
    StorageFailure(String),
}

impl TransferError {
    /// Get the error code for API responses
    pub fn code(&self) -> &'static str {
        match self {
            TransferError::InvalidAmount => "INVALID_AMOUNT",
            TransferError::SameAccount => "SAME_ACCOUNT",
            TransferError::AccountNotFound(_) => "ACCOUNT_NOT_FOUND",
            TransferError::Unauthorized => "UNAUTHORIZED",
            TransferError::InsufficientBalance => "INSUFFICIENT_BALANCE",
            TransferError::Overflow => "OVERFLOW",
            TransferError::DuplicateRequest => "DUPLICATE_REQUEST",
            TransferError::Busy => "BUSY",
            TransferError::StorageFailure(_) => "STORAGE_FAILURE",
        }
    }

    /// Get HTTP status code suggestion
    pub fn http_status(&self) -> u16 {
        match self {
            TransferError::InvalidAmount
            | TransferError::SameAccount
            | TransferError::InsufficientBalance
            | TransferError::Overflow => 400,
            TransferError::Unauthorized => 403,
            TransferError::AccountNotFound(_) => 404,
            TransferError::DuplicateRequest => 409,
            TransferError::StorageFailure(_) => 500,
            TransferError::Busy => 503,
        }
    }

    /// Transient failures the caller may retry. Everything else is final.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransferError::Busy | TransferError::StorageFailure(_))
    }
}

/// PostgreSQL SQLSTATE: lock_not_available (raised by `lock_timeout`)
const PG_LOCK_NOT_AVAILABLE: &str = "55P03";
/// PostgreSQL SQLSTATE: query_canceled (raised by `statement_timeout`)
const PG_QUERY_CANCELED: &str = "57014";
/// PostgreSQL SQLSTATE: unique_violation
const PG_UNIQUE_VIOLATION: &str = "23505";

impl From<sqlx::Error> for TransferError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::PoolTimedOut => TransferError::Busy,
            sqlx::Error::Database(db) => match db.code().as_deref() {
                Some(PG_LOCK_NOT_AVAILABLE) | Some(PG_QUERY_CANCELED) => TransferError::Busy,
                Some(PG_UNIQUE_VIOLATION) => TransferError::DuplicateRequest,
                _ => TransferError::StorageFailure(e.to_string()),
            },
            _ => TransferError::StorageFailure(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(TransferError::SameAccount.code(), "SAME_ACCOUNT");
        assert_eq!(
            TransferError::InsufficientBalance.code(),
            "INSUFFICIENT_BALANCE"
        );
        assert_eq!(TransferError::Unauthorized.code(), "UNAUTHORIZED");
        assert_eq!(TransferError::Busy.code(), "BUSY");
    }

    #[test]
    fn test_http_status() {
        assert_eq!(TransferError::InvalidAmount.http_status(), 400);
        assert_eq!(TransferError::Unauthorized.http_status(), 403);
        assert_eq!(
            TransferError::AccountNotFound(AccountId::new()).http_status(),
            404
        );
        assert_eq!(TransferError::Busy.http_status(), 503);
        assert_eq!(
            TransferError::StorageFailure("disk".into()).http_status(),
            500
        );
    }

    #[test]
    fn test_retryable_split() {
        assert!(TransferError::Busy.is_retryable());
        assert!(TransferError::StorageFailure("x".into()).is_retryable());

        assert!(!TransferError::InvalidAmount.is_retryable());
        assert!(!TransferError::SameAccount.is_retryable());
        assert!(!TransferError::Unauthorized.is_retryable());
        assert!(!TransferError::InsufficientBalance.is_retryable());
    }

    #[test]
    fn test_sqlx_pool_timeout_is_busy() {
        assert_eq!(
            TransferError::from(sqlx::Error::PoolTimedOut),
            TransferError::Busy
        );
        assert!(matches!(
            TransferError::from(sqlx::Error::RowNotFound),
            TransferError::StorageFailure(_)
        ));
    }

    #[test]
    fn test_display() {
        let err = TransferError::InsufficientBalance;
        assert_eq!(err.to_string(), "Insufficient balance");
    }
}
