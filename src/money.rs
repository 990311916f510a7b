//! Money Module
//!
//! Whole-unit amounts and balances. All balance arithmetic MUST go through
//! [`Amount`]; no other module touches the raw `Decimal`.
//!
//! ## Representation
//! - Backed by `rust_decimal::Decimal` with scale fixed at 0 (whole currency units)
//! - Never floating point
//! - Upper bound is the ledger column precision: 12 digits
//!
//! ## Usage
//! ```rust
//! use core_bank::money::Amount;
//!
//! let balance = Amount::parse("1000").unwrap();
//! let after = balance.checked_sub(Amount::from_units(100)).unwrap();
//! assert_eq!(after.to_string(), "900");
//! ```

use std::fmt;
use std::str::FromStr;

use rust_decimal::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum number of integer digits a stored balance may carry.
pub const MAX_DIGITS: u32 = 12;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AmountError {
    #[error("Amount must not be negative")]
    Negative,

    #[error("Amount must be a whole number of units (scale 0), got scale {0}")]
    Fractional(u32),

    #[error("Amount exceeds {MAX_DIGITS} digits")]
    Overflow,

    #[error("Invalid format: {0}")]
    InvalidFormat(String),
}

// ============================================================================
// Amount
// ============================================================================

/// Non-negative whole-unit amount.
///
/// # Invariants (enforced by the private field):
/// - value >= 0
/// - scale == 0
/// - at most [`MAX_DIGITS`] digits
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize)]
#[serde(transparent)]
pub struct Amount(Decimal);

impl Amount {
    pub const ZERO: Amount = Amount(Decimal::ZERO);

    fn max_value() -> Decimal {
        Decimal::from(10_i64.pow(MAX_DIGITS) - 1)
    }

    /// Build from a whole number of units.
    ///
    /// # Panics
    /// If `units` exceeds [`MAX_DIGITS`] digits. Intended for literals and seeding;
    /// use [`Amount::try_from`] for untrusted input.
    pub fn from_units(units: u64) -> Self {
        match Self::try_from(Decimal::from(units)) {
            Ok(amount) => amount,
            Err(e) => panic!("Amount::from_units({units}): {e}"),
        }
    }

    /// Parse a client string. Plain digits only: no sign, no dot, no exponent.
    pub fn parse(s: &str) -> Result<Self, AmountError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(AmountError::InvalidFormat("empty string".into()));
        }
        if s.starts_with('-') {
            return Err(AmountError::Negative);
        }
        if let Some((_, frac)) = s.split_once('.') {
            // "100.0" is still a scale-1 literal; reject instead of normalizing
            return Err(AmountError::Fractional(frac.len() as u32));
        }
        if !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(AmountError::InvalidFormat(format!(
                "invalid character in amount: {}",
                s
            )));
        }
        let digits = s.trim_start_matches('0');
        if digits.len() > MAX_DIGITS as usize {
            return Err(AmountError::Overflow);
        }
        let value =
            Decimal::from_str(s).map_err(|e| AmountError::InvalidFormat(e.to_string()))?;
        Self::try_from(value)
    }

    #[inline]
    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    #[inline]
    pub fn as_decimal(&self) -> Decimal {
        self.0
    }

    /// Whole units as an integer. Lossless: scale is 0 and the value fits in 12 digits.
    #[inline]
    pub fn units(&self) -> u64 {
        self.0.mantissa() as u64
    }

    /// Sum of two amounts; `None` if the result would exceed [`MAX_DIGITS`].
    pub fn checked_add(self, rhs: Amount) -> Option<Amount> {
        let sum = self.0.checked_add(rhs.0)?;
        (sum <= Self::max_value()).then_some(Amount(sum))
    }

    /// Difference of two amounts; `None` if the result would be negative.
    pub fn checked_sub(self, rhs: Amount) -> Option<Amount> {
        if rhs.0 > self.0 {
            return None;
        }
        Some(Amount(self.0 - rhs.0))
    }
}

impl TryFrom<Decimal> for Amount {
    type Error = AmountError;

    /// Accepts integral decimals only. Trailing zero scale (`100.00`) is
    /// normalized; any non-zero fraction is rejected.
    fn try_from(value: Decimal) -> Result<Self, Self::Error> {
        if value.is_sign_negative() && !value.is_zero() {
            return Err(AmountError::Negative);
        }
        if !value.fract().is_zero() {
            return Err(AmountError::Fractional(value.scale()));
        }
        let mut whole = value.trunc();
        whole.rescale(0);
        if whole > Self::max_value() {
            return Err(AmountError::Overflow);
        }
        // -0 normalizes to 0
        Ok(Amount(whole.abs()))
    }
}

impl FromStr for Amount {
    type Err = AmountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Amount::parse(s)
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = <Decimal as Deserialize>::deserialize(deserializer)?;
        Amount::try_from(value).map_err(serde::de::Error::custom)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
