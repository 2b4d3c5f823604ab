//! Fixed-precision money for the shift ledger.
//!
//! Every amount carries exactly two fractional digits. Amounts are persisted as
//! integer minor units so that SQLite `SUM` over sales stays exact.

use std::fmt;
use std::iter::Sum;
use std::ops::{Add, Sub};
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::Value;

use crate::error::LedgerError;

/// Fractional digits kept for every amount.
pub const MONEY_SCALE: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct Money(Decimal);

impl Money {
    pub fn zero() -> Self {
        Money(Decimal::new(0, MONEY_SCALE))
    }

    /// Build from integer minor units (cents).
    pub fn from_minor(minor: i64) -> Self {
        Money(Decimal::new(minor, MONEY_SCALE))
    }

    /// Integer minor units, as stored in the database.
    pub fn to_minor(self) -> Result<i64, LedgerError> {
        i64::try_from(self.0.mantissa()).map_err(|_| LedgerError::InvalidAmount {
            field: "amount".into(),
            reason: "amount is out of range".into(),
        })
    }

    /// Accept a decimal with at most two fractional digits.
    pub fn from_decimal(value: Decimal, field: &str) -> Result<Self, LedgerError> {
        if value.normalize().scale() > MONEY_SCALE {
            return Err(invalid(field, "at most two decimal places are allowed"));
        }
        let mut scaled = value;
        scaled.rescale(MONEY_SCALE);
        if i64::try_from(scaled.mantissa()).is_err() {
            return Err(invalid(field, "amount is out of range"));
        }
        Ok(Money(scaled))
    }

    pub fn try_from_f64(value: f64, field: &str) -> Result<Self, LedgerError> {
        if !value.is_finite() {
            return Err(invalid(field, "amount must be a finite number"));
        }
        // f64 Display is the shortest round-trip form, so 0.1 stays 0.1.
        let decimal = Decimal::from_str(&value.to_string())
            .map_err(|_| invalid(field, "amount is out of range"))?;
        Self::from_decimal(decimal, field)
    }

    /// Parse a JSON number or decimal string.
    pub fn from_json(value: &Value, field: &str) -> Result<Self, LedgerError> {
        match value {
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Self::from_decimal(Decimal::from(i), field)
                } else if let Some(f) = n.as_f64() {
                    Self::try_from_f64(f, field)
                } else {
                    Err(invalid(field, "amount is out of range"))
                }
            }
            Value::String(s) => {
                let trimmed = s.trim();
                if trimmed.is_empty() {
                    return Err(invalid(field, "amount is empty"));
                }
                let decimal = Decimal::from_str(trimmed)
                    .map_err(|_| invalid(field, "amount is not a valid decimal number"))?;
                Self::from_decimal(decimal, field)
            }
            Value::Null => Err(invalid(field, "amount is required")),
            _ => Err(invalid(field, "expected a number or a decimal string")),
        }
    }

    /// Reject negative amounts.
    pub fn non_negative(self, field: &str) -> Result<Self, LedgerError> {
        if self.0.is_sign_negative() && !self.0.is_zero() {
            return Err(invalid(field, "amount must not be negative"));
        }
        Ok(self)
    }

    pub fn is_zero(self) -> bool {
        self.0.is_zero()
    }

    pub fn as_decimal(self) -> Decimal {
        self.0
    }
}

/// Parse a required non-negative amount from a JSON payload value.
pub fn parse_amount(value: &Value, field: &str) -> Result<Money, LedgerError> {
    Money::from_json(value, field)?.non_negative(field)
}

fn invalid(field: &str, reason: &str) -> LedgerError {
    LedgerError::InvalidAmount {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

impl Default for Money {
    fn default() -> Self {
        Money::zero()
    }
}

impl Add for Money {
    type Output = Money;

    fn add(self, rhs: Money) -> Money {
        Money(self.0 + rhs.0)
    }
}

impl Sub for Money {
    type Output = Money;

    fn sub(self, rhs: Money) -> Money {
        Money(self.0 - rhs.0)
    }
}

impl Sum for Money {
    fn sum<I: Iterator<Item = Money>>(iter: I) -> Money {
        iter.fold(Money::zero(), |acc, m| acc + m)
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
