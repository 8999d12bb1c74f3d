//! Value objects: equality by value, not identity.

use serde::{Deserialize, Serialize};

/// Marker trait for immutable values compared by their attributes.
pub trait ValueObject: Clone + PartialEq + core::fmt::Debug {}

/// An amount of money in minor units (cents).
///
/// Single currency: multi-currency pricing is not modelled.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Money(i64);

impl ValueObject for Money {}

impl Money {
    pub const ZERO: Money = Money(0);

    pub fn from_cents(cents: i64) -> Self {
        Self(cents)
    }

    pub fn cents(self) -> i64 {
        self.0
    }

    pub fn is_negative(self) -> bool {
        self.0 < 0
    }

    /// `self × quantity`, saturating instead of overflowing.
    ///
    /// Callers that store the result should bound it first with [`Money::checked_times`].
    pub fn times(self, quantity: i64) -> Money {
        Money(self.0.saturating_mul(quantity))
    }

    pub fn checked_times(self, quantity: i64) -> Option<Money> {
        self.0.checked_mul(quantity).map(Money)
    }

    pub fn checked_add(self, rhs: Money) -> Option<Money> {
        self.0.checked_add(rhs.0).map(Money)
    }
}

impl core::ops::Add for Money {
    type Output = Money;

    fn add(self, rhs: Money) -> Money {
        Money(self.0.saturating_add(rhs.0))
    }
}

impl core::iter::Sum for Money {
    fn sum<I: Iterator<Item = Money>>(iter: I) -> Money {
        iter.fold(Money::ZERO, |acc, m| acc + m)
    }
}

impl core::fmt::Display for Money {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{sign}{}.{:02}", abs / 100, abs % 100)
    }
}

/// A tax rate in basis points (1 bp = 0.01 %).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaxRate(u32);

impl ValueObject for TaxRate {}

impl TaxRate {
    pub const ZERO: TaxRate = TaxRate(0);

    pub fn from_basis_points(bp: u32) -> Self {
        Self(bp)
    }

    pub fn basis_points(self) -> u32 {
        self.0
    }

    /// Tax owed on `subtotal`, rounded half away from zero to the nearest cent.
    pub fn tax_on(self, subtotal: Money) -> Money {
        let rounded = self.raw_tax(subtotal);
        Money::from_cents(rounded.clamp(i64::MIN as i128, i64::MAX as i128) as i64)
    }

    /// [`TaxRate::tax_on`], or `None` when the tax does not fit in [`Money`].
    pub fn checked_tax_on(self, subtotal: Money) -> Option<Money> {
        i64::try_from(self.raw_tax(subtotal)).ok().map(Money::from_cents)
    }

    fn raw_tax(self, subtotal: Money) -> i128 {
        let raw = subtotal.cents() as i128 * self.0 as i128;
        if raw >= 0 {
            (raw + 5_000) / 10_000
        } else {
            (raw - 5_000) / 10_000
        }
    }
}
