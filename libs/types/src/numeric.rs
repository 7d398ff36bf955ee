//! Exact decimal money type
//!
//! Uses rust_decimal for deterministic arithmetic so that running revenue
//! sums never drift. Producers send amounts either as JSON numbers or as
//! numeric strings (BigDecimal serializers do both); both forms are parsed
//! from their textual representation, never through an intermediate f64.

use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign};
use std::str::FromStr;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Amount parsing failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmountError {
    #[error("amount is not numeric: {0}")]
    NotNumeric(String),

    #[error("amount must be a number or numeric string, got {0}")]
    WrongType(&'static str),

    #[error("amount arithmetic overflowed")]
    Overflow,
}

/// A monetary amount
///
/// Serialized as a JSON float, which is what dashboard consumers expect.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Amount(Decimal);

impl Amount {
    pub const ZERO: Amount = Amount(Decimal::ZERO);

    pub fn new(value: Decimal) -> Self {
        Self(value)
    }

    pub fn from_u64(value: u64) -> Self {
        Self(Decimal::from(value))
    }

    /// Parse from a JSON value (number or numeric string).
    pub fn from_json(value: &serde_json::Value) -> Result<Self, AmountError> {
        match value {
            serde_json::Value::Number(n) => Self::parse_text(&n.to_string()),
            serde_json::Value::String(s) => Self::parse_text(s.trim()),
            serde_json::Value::Null => Err(AmountError::WrongType("null")),
            serde_json::Value::Bool(_) => Err(AmountError::WrongType("bool")),
            serde_json::Value::Array(_) => Err(AmountError::WrongType("array")),
            serde_json::Value::Object(_) => Err(AmountError::WrongType("object")),
        }
    }

    fn parse_text(s: &str) -> Result<Self, AmountError> {
        Decimal::from_str(s)
            .or_else(|_| Decimal::from_scientific(s))
            .map(|d| Self(d.normalize()))
            .map_err(|_| AmountError::NotNumeric(s.to_string()))
    }

    pub fn as_decimal(&self) -> Decimal {
        self.0
    }

    pub fn to_f64(&self) -> f64 {
        self.0.to_f64().unwrap_or(0.0)
    }

    /// Divide by a count, yielding zero for an empty count.
    pub fn per(&self, count: u64) -> Amount {
        if count == 0 {
            return Amount::ZERO;
        }
        Amount(self.0 / Decimal::from(count))
    }

    pub fn checked_add(&self, rhs: Amount) -> Result<Amount, AmountError> {
        self.0
            .checked_add(rhs.0)
            .map(Amount)
            .ok_or(AmountError::Overflow)
    }

    /// Multiply by a count, failing past the representable range.
    pub fn checked_times(&self, count: u64) -> Result<Amount, AmountError> {
        self.0
            .checked_mul(Decimal::from(count))
            .map(Amount)
            .ok_or(AmountError::Overflow)
    }

    /// Add, clamping at the representable bounds.
    pub fn saturating_add(&self, rhs: Amount) -> Amount {
        Amount(self.0.saturating_add(rhs.0))
    }

    /// Multiply by a count, clamping at the representable bounds.
    pub fn saturating_times(&self, count: u64) -> Amount {
        Amount(self.0.saturating_mul(Decimal::from(count)))
    }
}

/// Panics on overflow like `Decimal`. Untrusted input goes through
/// `checked_add` or `saturating_add`.
impl Add for Amount {
    type Output = Amount;

    fn add(self, rhs: Amount) -> Amount {
        Amount(self.0 + rhs.0)
    }
}

impl AddAssign for Amount {
    fn add_assign(&mut self, rhs: Amount) {
        self.0 += rhs.0;
    }
}

impl Sum for Amount {
    fn sum<I: Iterator<Item = Amount>>(iter: I) -> Amount {
        iter.fold(Amount::ZERO, |acc, a| acc.saturating_add(a))
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Amount {
    type Err = AmountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_text(s.trim())
    }
}

impl Serialize for Amount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(self.to_f64())
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        Amount::from_json(&value).map_err(serde::de::Error::custom)
    }
}
