//! Fixed-point monetary amounts.
//!
//! Amounts are `rust_decimal::Decimal` values pinned to two decimal places. There is
//! no floating point anywhere in balance arithmetic, and constructors reject values
//! that would need rounding instead of silently truncating them.

use core::iter::Sum;
use core::ops::{Add, Sub};
use core::str::FromStr;

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::value_object::ValueObject;

/// Number of decimal places carried by every amount.
pub const MONEY_SCALE: u32 = 2;

/// Settlement-currency amount with two decimal places.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "Decimal", into = "Decimal")]
pub struct Money(Decimal);

impl ValueObject for Money {}

impl Money {
    pub const ZERO: Money = Money(Decimal::from_parts(0, 0, 0, false, MONEY_SCALE));

    /// Build from a decimal, rejecting more than two significant decimal places.
    pub fn new(value: Decimal) -> DomainResult<Self> {
        if value.normalize().scale() > MONEY_SCALE {
            return Err(DomainError::validation(
                "amount",
                format!("must have at most {MONEY_SCALE} decimal places"),
            ));
        }
        let mut value = value;
        value.rescale(MONEY_SCALE);
        Ok(Self(value))
    }

    /// Build from minor units (cents).
    pub fn from_minor(cents: i64) -> Self {
        Self(Decimal::new(cents, MONEY_SCALE))
    }

    /// Round toward zero to whole cents.
    ///
    /// Only for algorithms that split an amount on purpose (proportional shares).
    pub fn truncate(value: Decimal) -> Self {
        let mut value = value.round_dp_with_strategy(MONEY_SCALE, RoundingStrategy::ToZero);
        value.rescale(MONEY_SCALE);
        Self(value)
    }

    pub fn zero() -> Self {
        Self::ZERO
    }

    pub fn one_cent() -> Self {
        Self::from_minor(1)
    }

    pub fn as_decimal(&self) -> Decimal {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    pub fn is_positive(&self) -> bool {
        self.0 > Decimal::ZERO
    }

    pub fn is_negative(&self) -> bool {
        self.0 < Decimal::ZERO
    }

    pub fn checked_add(self, other: Money) -> DomainResult<Money> {
        self.0
            .checked_add(other.0)
            .map(Money)
            .ok_or_else(|| DomainError::invariant("amount overflow"))
    }

    pub fn checked_sub(self, other: Money) -> DomainResult<Money> {
        self.0
            .checked_sub(other.0)
            .map(Money)
            .ok_or_else(|| DomainError::invariant("amount overflow"))
    }

    /// `self - other`, floored at zero. Used for "remaining capacity" readouts only.
    pub fn saturating_sub(self, other: Money) -> Money {
        if other >= self { Money::ZERO } else { Money(self.0 - other.0) }
    }
}

impl Default for Money {
    fn default() -> Self {
        Self::ZERO
    }
}

impl TryFrom<Decimal> for Money {
    type Error = DomainError;

    fn try_from(value: Decimal) -> Result<Self, Self::Error> {
        Money::new(value)
    }
}

impl From<Money> for Decimal {
    fn from(value: Money) -> Self {
        value.0
    }
}

impl FromStr for Money {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value = Decimal::from_str(s.trim())
            .map_err(|_| DomainError::validation("amount", "must be a decimal number"))?;
        Money::new(value)
    }
}

impl core::fmt::Display for Money {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
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
    fn sum<I: Iterator<Item = Money>>(iter: I) -> Self {
        iter.fold(Money::ZERO, |acc, m| acc + m)
    }
}

impl<'a> Sum<&'a Money> for Money {
    fn sum<I: Iterator<Item = &'a Money>>(iter: I) -> Self {
        iter.fold(Money::ZERO, |acc, m| acc + *m)
    }
}

/// ISO-4217 style currency code (upper-case, three letters).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Currency(String);

impl ValueObject for Currency {}

impl Currency {
    pub fn new(code: &str) -> DomainResult<Self> {
        let code = code.trim().to_ascii_uppercase();
        if code.len() != 3 || !code.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(DomainError::validation(
                "currency",
                "must be a three-letter currency code",
            ));
        }
        Ok(Self(code))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Currency {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Currency::new(&value)
    }
}

impl From<Currency> for String {
    fn from(value: Currency) -> Self {
        value.0
    }
}

impl core::fmt::Display for Currency {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    #[test]
    fn rejects_sub_cent_precision() {
        let err = Money::new(dec!(10.005)).unwrap_err();
        assert!(err.field_errors().unwrap().contains("amount"));

        // Trailing zeros are not extra precision.
        assert_eq!(Money::new(dec!(10.500)).unwrap(), Money::from_minor(1050));
    }

    #[test]
    fn serializes_with_two_decimal_places() {
        let json = serde_json::to_value(Money::new(dec!(600)).unwrap()).unwrap();
        assert_eq!(json, serde_json::json!("600.00"));

        let parsed: Money = serde_json::from_value(serde_json::json!("12.3")).unwrap();
        assert_eq!(parsed, Money::from_minor(1230));
    }

    #[test]
    fn truncate_rounds_toward_zero() {
        assert_eq!(Money::truncate(dec!(33.339)), Money::from_minor(3333));
        assert_eq!(Money::truncate(dec!(0.009)), Money::ZERO);
    }

    #[test]
    fn currency_is_normalised() {
        assert_eq!(Currency::new("usd").unwrap().as_str(), "USD");
        assert!(Currency::new("US").is_err());
        assert!(Currency::new("U$D").is_err());
    }

    proptest! {
        #[test]
        fn minor_units_round_trip_through_strings(cents in -1_000_000_000i64..1_000_000_000i64) {
            let money = Money::from_minor(cents);
            let parsed: Money = money.to_string().parse().unwrap();
            prop_assert_eq!(money, parsed);
        }
    }
}
