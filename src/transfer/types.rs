//! Transfer Core Types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core_types::{AccountId, TransactionId, UserId};
use crate::money::Amount;

/// Transfer request as handed over by the transport layer.
///
/// `requester` is the identity already verified by the authentication layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub requester: UserId,
    pub source: AccountId,
    pub destination: AccountId,
    pub amount: Amount,
    /// Optional client idempotency key, scoped to the requester
    pub client_ref: Option<String>,
}

impl TransferRequest {
    pub fn new(requester: UserId, source: AccountId, destination: AccountId, amount: Amount) -> Self {
        Self {
            requester,
            source,
            destination,
            amount,
            client_ref: None,
        }
    }

    pub fn with_client_ref(mut self, client_ref: impl Into<String>) -> Self {
        self.client_ref = Some(client_ref.into());
        self
    }
}

/// Immutable record of a committed transfer.
///
/// Serializes as the public transaction response: camelCase keys and a
/// numeric `amount`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionRecord {
    pub id: TransactionId,
    #[serde(rename = "userId")]
    pub initiator: UserId,
    #[serde(with = "amount_as_number")]
    pub amount: Amount,
    #[serde(rename = "fromAccountId")]
    pub source: AccountId,
    #[serde(rename = "toAccountId")]
    pub destination: AccountId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ref: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TransactionRecord {
    /// Build a fresh record for a request that has passed every precondition
    pub fn new(req: &TransferRequest) -> Self {
        let now = Utc::now();
        Self {
            id: TransactionId::new(),
            initiator: req.requester,
            amount: req.amount,
            source: req.source,
            destination: req.destination,
            client_ref: req.client_ref.clone(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Same accounts and amount as `req`: a resubmission, not a new payment
    pub fn matches_request(&self, req: &TransferRequest) -> bool {
        self.source == req.source
            && self.destination == req.destination
            && self.amount == req.amount
    }

    /// Does this record debit or credit the given account
    pub fn touches(&self, account: AccountId) -> bool {
        self.source == account || self.destination == account
    }
}

/// `Amount` as a plain JSON integer instead of the default decimal string
mod amount_as_number {
    use rust_decimal::Decimal;
    use serde::{Deserialize, Deserializer, Serializer};

    use crate::money::Amount;

    pub fn serialize<S: Serializer>(amount: &Amount, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(amount.units())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Amount, D::Error> {
        let units = u64::deserialize(deserializer)?;
        Amount::try_from(Decimal::from(units)).map_err(serde::de::Error::custom)
    }
}
