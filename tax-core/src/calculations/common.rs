//! Rounding shared by the tax calculations.

use rust_decimal::{Decimal, RoundingStrategy};

/// Rounds a money amount to cents, midpoints away from zero.
///
/// Used once per reported line and once per total; running totals stay
/// unrounded.
///
/// ```
/// use rust_decimal_macros::dec;
/// use tax_core::calculations::common::round_half_up;
///
/// assert_eq!(round_half_up(dec!(9.909909)), dec!(9.91));
/// assert_eq!(round_half_up(dec!(0.005)), dec!(0.01));
/// ```
pub fn round_half_up(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}
