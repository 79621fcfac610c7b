//! Value objects: equality by value, not identity.
//!
//! Quantities and prices are exact fixed-point decimals with two fractional
//! digits (the `NUMERIC(10,2)` shape of the stored columns). Binary floating
//! point never appears in the domain, so repeated increase/decrease cycles
//! cannot drift.

use core::fmt;
use core::iter::Sum;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

/// Number of fractional digits carried by quantities and prices.
pub const SCALE: u32 = 2;

/// Largest stored quantity or price: 99 999 999.99.
pub const MAX_AMOUNT: Decimal = Decimal::from_parts(999_999_999, 0, 0, false, SCALE);

fn fixed_point(value: Decimal, what: &'static str) -> DomainResult<Decimal> {
    if value.is_sign_negative() && !value.is_zero() {
        return Err(DomainError::Negative { what, value });
    }
    if value.normalize().scale() > SCALE {
        return Err(DomainError::TooPrecise { what, value });
    }
    if value > MAX_AMOUNT {
        return Err(DomainError::TooLarge { what, value });
    }
    let mut scaled = value.abs();
    scaled.rescale(SCALE);
    Ok(scaled)
}

/// Non-negative amount of stock, in the product's unit of measure.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "Decimal", into = "Decimal")]
pub struct Quantity(Decimal);

/// Non-negative unit price.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "Decimal", into = "Decimal")]
pub struct Price(Decimal);

impl Quantity {
    pub const ZERO: Quantity = Quantity(Decimal::ZERO);

    pub fn new(value: Decimal) -> DomainResult<Self> {
        fixed_point(value, "quantity").map(Self)
    }

    /// Whole number of units; always within `MAX_AMOUNT`.
    pub fn units(units: u16) -> Self {
        let mut value = Decimal::from(units);
        value.rescale(SCALE);
        Self(value)
    }

    pub fn value(self) -> Decimal {
        self.0
    }

    pub fn is_zero(self) -> bool {
        self.0.is_zero()
    }

    pub fn is_positive(self) -> bool {
        !self.0.is_zero()
    }

    /// `None` when the result would exceed `MAX_AMOUNT`.
    pub fn checked_add(self, other: Quantity) -> Option<Quantity> {
        self.0
            .checked_add(other.0)
            .filter(|sum| *sum <= MAX_AMOUNT)
            .map(Quantity)
    }

    /// `None` when the result would be negative.
    pub fn checked_sub(self, other: Quantity) -> Option<Quantity> {
        if other.0 > self.0 {
            return None;
        }
        self.0.checked_sub(other.0).map(Quantity)
    }

    /// Monetary value of this quantity at `price`.
    ///
    /// Prices are capped at `MAX_AMOUNT` and quantities at `MAX_AMOUNT` per
    /// balance row, so even a total summed over many cells multiplied by a
    /// price stays far below `Decimal::MAX` (about 7.9e28).
    pub fn times(self, price: Price) -> Decimal {
        self.0 * price.0
    }
}

impl Price {
    pub const ZERO: Price = Price(Decimal::ZERO);

    pub fn new(value: Decimal) -> DomainResult<Self> {
        fixed_point(value, "price").map(Self)
    }

    pub fn value(self) -> Decimal {
        self.0
    }
}

macro_rules! impl_decimal_conversions {
    ($t:ty) => {
        impl TryFrom<Decimal> for $t {
            type Error = DomainError;

            fn try_from(value: Decimal) -> Result<Self, Self::Error> {
                <$t>::new(value)
            }
        }

        impl From<$t> for Decimal {
            fn from(value: $t) -> Self {
                value.0
            }
        }

        impl fmt::Display for $t {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }

        impl Default for $t {
            fn default() -> Self {
                Self::ZERO
            }
        }
    };
}

impl_decimal_conversions!(Quantity);
impl_decimal_conversions!(Price);

impl Sum for Quantity {
    fn sum<I: Iterator<Item = Quantity>>(iter: I) -> Self {
        let mut total = Decimal::ZERO;
        for q in iter {
            total += q.0;
        }
        total.rescale(SCALE);
        Quantity(total)
    }
}

impl<'a> Sum<&'a Quantity> for Quantity {
    fn sum<I: Iterator<Item = &'a Quantity>>(iter: I) -> Self {
        iter.copied().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    #[test]
    fn quantities_are_rescaled_to_two_places() {
        let q = Quantity::new(dec!(10)).unwrap();
        assert_eq!(q.to_string(), "10.00");
        assert_eq!(q, Quantity::units(10));
    }

    #[test]
    fn negative_values_are_rejected() {
        assert!(matches!(Quantity::new(dec!(-0.01)), Err(DomainError::Negative { what: "quantity", .. })));
        assert!(matches!(Price::new(dec!(-5)), Err(DomainError::Negative { what: "price", .. })));
    }

    #[test]
    fn excess_precision_is_rejected() {
        assert!(matches!(Quantity::new(dec!(1.005)), Err(DomainError::TooPrecise { .. })));
        // Trailing zeros are not extra precision.
        assert!(Quantity::new(dec!(1.5000)).is_ok());
    }

    #[test]
    fn amounts_are_capped_at_the_column_limit() {
        assert_eq!(MAX_AMOUNT, dec!(99999999.99));
        assert_eq!(Quantity::new(dec!(99999999.99)).unwrap().value(), MAX_AMOUNT);
        assert!(matches!(
            Quantity::new(dec!(100000000)),
            Err(DomainError::TooLarge { what: "quantity", .. })
        ));
        assert!(matches!(
            Price::new(dec!(100000000000000000000)),
            Err(DomainError::TooLarge { what: "price", .. })
        ));
    }

    #[test]
    fn checked_add_stops_at_the_limit() {
        let max = Quantity::new(MAX_AMOUNT).unwrap();
        assert_eq!(max.checked_add(Quantity::new(dec!(0.01)).unwrap()), None);
        assert_eq!(Quantity::ZERO.checked_add(max), Some(max));
    }

    #[test]
    fn times_at_both_limits_does_not_overflow() {
        let q = Quantity::new(MAX_AMOUNT).unwrap();
        let p = Price::new(MAX_AMOUNT).unwrap();
        assert_eq!(q.times(p), MAX_AMOUNT * MAX_AMOUNT);

        let many_cells: Quantity = std::iter::repeat(q).take(1_000).sum();
        assert!(many_cells.times(p) > Decimal::ZERO);
    }

    #[test]
    fn checked_sub_refuses_to_go_negative() {
        let ten = Quantity::units(10);
        let fifteen = Quantity::units(15);
        assert_eq!(ten.checked_sub(fifteen), None);
        assert_eq!(fifteen.checked_sub(ten), Some(Quantity::units(5)));
    }

    #[test]
    fn times_price_gives_line_value() {
        let q = Quantity::new(dec!(2.5)).unwrap();
        let p = Price::new(dec!(100)).unwrap();
        assert_eq!(q.times(p), dec!(250));
    }

    #[test]
    fn sum_of_quantities_keeps_scale() {
        let total: Quantity = [Quantity::units(1), Quantity::new(dec!(0.25)).unwrap()]
            .iter()
            .sum();
        assert_eq!(total.to_string(), "1.25");
    }

    proptest! {
        /// Property: adding then subtracting the same amount is exact.
        #[test]
        fn add_then_sub_is_identity(a in 0i64..10_000_000, b in 0i64..10_000_000) {
            let qa = Quantity::new(Decimal::new(a, 2)).unwrap();
            let qb = Quantity::new(Decimal::new(b, 2)).unwrap();
            let sum = qa.checked_add(qb).unwrap();
            prop_assert_eq!(sum.checked_sub(qb), Some(qa));
        }
    }
}
