//! Money as an exact, 2-decimal `rust_decimal::Decimal` — never a float.
//! Keeps the "2-decimal precision" invariants in `spec.md` §8 exact instead
//! of approximate.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::ops::{Add, Neg, Sub};

/// An absolute or signed monetary amount, rounded to 2 decimal places at
/// construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Money(Decimal);

impl Money {
    /// Zero.
    #[must_use]
    pub fn zero() -> Self {
        Self(Decimal::ZERO)
    }

    /// Construct from a decimal value, rounding to 2 places (half-up, the
    /// convention every currency amount in this system uses).
    #[must_use]
    pub fn from_decimal(value: Decimal) -> Self {
        Self(value.round_dp(2))
    }

    /// Construct from a floating-point literal (used at detection/reporting
    /// boundaries where the upstream provider payload is JSON `number`).
    #[must_use]
    pub fn from_f64(value: f64) -> Self {
        Self(Decimal::from_f64_retain(value).unwrap_or(Decimal::ZERO).round_dp(2))
    }

    /// Absolute value.
    #[must_use]
    pub fn abs(self) -> Self {
        Self(self.0.abs())
    }

    /// Underlying decimal.
    #[must_use]
    pub fn as_decimal(self) -> Decimal {
        self.0
    }

    /// Lossy `f64` view, for JSON payloads and statistical math (mean,
    /// std-dev) where `Decimal` has no built-in support.
    #[must_use]
    pub fn to_f64(self) -> f64 {
        use rust_decimal::prelude::ToPrimitive;
        self.0.to_f64().unwrap_or(0.0)
    }

    /// True if the amount is zero.
    #[must_use]
    pub fn is_zero(self) -> bool {
        self.0.is_zero()
    }
}

impl Add for Money {
    type Output = Money;
    fn add(self, rhs: Self) -> Self::Output {
        Money(self.0 + rhs.0)
    }
}

impl Sub for Money {
    type Output = Money;
    fn sub(self, rhs: Self) -> Self::Output {
        Money(self.0 - rhs.0)
    }
}

impl Neg for Money {
    type Output = Money;
    fn neg(self) -> Self::Output {
        Money(-self.0)
    }
}

impl std::iter::Sum for Money {
    fn sum<I: Iterator<Item = Money>>(iter: I) -> Self {
        iter.fold(Money::zero(), Add::add)
    }
}

impl std::fmt::Display for Money {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounds_to_two_decimals() {
        let m = Money::from_f64(12.3456);
        assert_eq!(m.as_decimal(), Decimal::new(1235, 2));
    }

    #[test]
    fn sum_is_exact() {
        let values = vec![Money::from_f64(0.10), Money::from_f64(0.20)];
        let total: Money = values.into_iter().sum();
        assert_eq!(total, Money::from_f64(0.30));
    }
}
