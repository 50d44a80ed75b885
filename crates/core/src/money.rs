//! Monetary amounts and percentages for billing math.
//!
//! Amounts are stored in the currency's smallest unit (e.g. paise/cents) as
//! signed integers; percentages are stored in basis points. All derived
//! amounts round half-up to the minor unit, which is what printed receipts
//! reconcile against.

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::value_object::ValueObject;

/// An amount in the currency's smallest unit (e.g. paise, cents).
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Money(i64);

impl Money {
    pub const ZERO: Money = Money(0);

    pub const fn from_minor(minor: i64) -> Self {
        Self(minor)
    }

    pub const fn minor(&self) -> i64 {
        self.0
    }

    pub const fn is_negative(&self) -> bool {
        self.0 < 0
    }

    pub fn checked_add(self, other: Money) -> DomainResult<Money> {
        self.0
            .checked_add(other.0)
            .map(Money)
            .ok_or_else(|| DomainError::invariant("monetary amount overflow"))
    }

    pub fn checked_sub(self, other: Money) -> DomainResult<Money> {
        self.0
            .checked_sub(other.0)
            .map(Money)
            .ok_or_else(|| DomainError::invariant("monetary amount overflow"))
    }

    /// Multiply by a unit count (line subtotal = unit price × quantity).
    pub fn checked_mul(self, count: u32) -> DomainResult<Money> {
        self.0
            .checked_mul(i64::from(count))
            .map(Money)
            .ok_or_else(|| DomainError::invariant("monetary amount overflow"))
    }

    pub fn saturating_sub(self, other: Money) -> Money {
        Money(self.0.saturating_sub(other.0))
    }
}

impl core::fmt::Display for Money {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{sign}{}.{:02}", abs / 100, abs % 100)
    }
}

impl ValueObject for Money {}

/// A percentage in `[0, 100]`, stored in basis points for exact math.
///
/// `Percent::from_basis_points(1250)` is 12.5%.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Percent(u32);

const BASIS_POINTS_PER_UNIT: u32 = 10_000;

impl Percent {
    pub const ZERO: Percent = Percent(0);

    /// Build from basis points; fails validation outside `[0, 10_000]`.
    pub fn from_basis_points(bp: u32) -> DomainResult<Self> {
        if bp > BASIS_POINTS_PER_UNIT {
            return Err(DomainError::validation(format!(
                "percentage out of range: {bp} basis points (max {BASIS_POINTS_PER_UNIT})"
            )));
        }
        Ok(Self(bp))
    }

    /// Build from whole percent units; fails validation above 100.
    pub fn from_percent(pct: u32) -> DomainResult<Self> {
        if pct > 100 {
            return Err(DomainError::validation(format!(
                "percentage out of range: {pct}% (max 100%)"
            )));
        }
        Ok(Self(pct * 100))
    }

    pub const fn basis_points(&self) -> u32 {
        self.0
    }

    /// Apply the percentage to an amount, rounding half-up to the minor unit.
    ///
    /// Ties round toward positive infinity, so 32.405 becomes 32.41 on the
    /// receipt rather than 32.40.
    pub fn of(&self, amount: Money) -> Money {
        let numerator = i128::from(amount.minor()) * i128::from(self.0);
        let denominator = i128::from(BASIS_POINTS_PER_UNIT);
        let rounded = (numerator + denominator / 2).div_euclid(denominator);
        // A [0,100]% slice of an i64 amount always fits back into i64.
        Money::from_minor(rounded as i64)
    }
}

impl core::fmt::Display for Percent {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if self.0 % 100 == 0 {
            write!(f, "{}%", self.0 / 100)
        } else {
            write!(f, "{}.{:02}%", self.0 / 100, self.0 % 100)
        }
    }
}

impl ValueObject for Percent {}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn percent_rejects_out_of_range() {
        assert!(Percent::from_percent(100).is_ok());
        assert!(Percent::from_percent(101).is_err());
        assert!(Percent::from_basis_points(10_000).is_ok());
        assert!(Percent::from_basis_points(10_001).is_err());
    }

    #[test]
    fn percent_of_rounds_half_up() {
        // 12% of 270.00 = 32.40 exactly.
        let tax = Percent::from_percent(12).unwrap();
        assert_eq!(tax.of(Money::from_minor(27_000)), Money::from_minor(3_240));

        // 12.5% of 0.50 = 0.0625 -> rounds to 0.06.
        let half = Percent::from_basis_points(1_250).unwrap();
        assert_eq!(half.of(Money::from_minor(50)), Money::from_minor(6));

        // 50% of 0.03 = 0.015 -> ties round up to 0.02.
        let fifty = Percent::from_percent(50).unwrap();
        assert_eq!(fifty.of(Money::from_minor(3)), Money::from_minor(2));
    }

    #[test]
    fn money_display_shows_minor_units() {
        assert_eq!(Money::from_minor(30_240).to_string(), "302.40");
        assert_eq!(Money::from_minor(-5).to_string(), "-0.05");
    }

    #[test]
    fn checked_mul_detects_overflow() {
        let price = Money::from_minor(i64::MAX / 2);
        assert!(price.checked_mul(3).is_err());
        assert!(price.checked_mul(1).is_ok());
    }

    proptest! {
        /// A percentage slice of a non-negative amount never exceeds the
        /// amount and is never negative.
        #[test]
        fn percent_of_is_bounded(minor in 0i64..1_000_000_000, bp in 0u32..=10_000) {
            let amount = Money::from_minor(minor);
            let pct = Percent::from_basis_points(bp).unwrap();
            let slice = pct.of(amount);
            prop_assert!(slice >= Money::ZERO);
            prop_assert!(slice <= amount);
        }

        /// 100% of an amount is exactly the amount; 0% is exactly zero.
        #[test]
        fn percent_of_identity_edges(minor in 0i64..1_000_000_000) {
            let amount = Money::from_minor(minor);
            prop_assert_eq!(Percent::from_percent(100).unwrap().of(amount), amount);
            prop_assert_eq!(Percent::ZERO.of(amount), Money::ZERO);
        }
    }
}
