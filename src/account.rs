//! Account row as seen by the transfer core
//!
//! The account-management collaborator owns every other account field
//! (number, card, pin, type). The core reads `owner` and `balance` and
//! only ever writes `balance`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core_types::{AccountId, UserId};
use crate::money::Amount;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub owner: UserId,
    pub balance: Amount,
    pub updated_at: DateTime<Utc>,
}

impl Account {
    pub fn new(id: AccountId, owner: UserId, balance: Amount) -> Self {
        Self {
            id,
            owner,
            balance,
            updated_at: Utc::now(),
        }
    }

    /// Check whether the given user owns this account
    #[inline]
    pub fn is_owned_by(&self, user: UserId) -> bool {
        self.owner == user
    }
}
