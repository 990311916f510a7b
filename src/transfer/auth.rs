//! Authorization Gate
//!
//! Ownership check for the source account. Must be evaluated on the row
//! loaded *under lock* inside the atomic unit, never on an earlier read.

use tracing::warn;

use super::error::TransferError;
use crate::account::Account;
use crate::core_types::UserId;

/// Confirm `requester` owns `source`.
pub fn authorize_debit(requester: UserId, source: &Account) -> Result<(), TransferError> {
    if source.is_owned_by(requester) {
        return Ok(());
    }
    warn!(
        requester = %requester,
        account = %source.id,
        "Unauthorized transfer attempt"
    );
    Err(TransferError::Unauthorized)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_types::AccountId;
    use crate::money::Amount;

    #[test]
    fn test_owner_passes_stranger_rejected() {
        let owner = UserId::new();
        let account = Account::new(AccountId::new(), owner, Amount::from_units(1));

        assert!(authorize_debit(owner, &account).is_ok());
        assert_eq!(
            authorize_debit(UserId::new(), &account),
            Err(TransferError::Unauthorized)
        );
    }
}
