//! Price-level tax calculation over an ordered list of resolved rates.
//!
//! # Algorithm
//!
//! A single forward pass over the rates, which must already be sorted by
//! ascending priority:
//!
//! | Step | Description |
//! |------|-------------|
//! | 1    | Base is the running total for `total_after_previous_tax` rates, otherwise the price |
//! | 2a   | Inclusive percentage: `base - base / (1 + rate/100)` |
//! | 2b   | Exclusive percentage: `base × rate/100` |
//! | 2c   | Fixed: `rate`, independent of the base |
//! | 3    | The reported line amount is rounded to two places |
//! | 4    | Exclusive amounts are added, unrounded, to the running total and the total tax |
//!
//! The total tax and the grand total are rounded once, at the end, so later
//! bases never inherit rounding error from earlier lines.
//!
//! # Example
//!
//! ```
//! use rust_decimal_macros::dec;
//! use tax_core::calculations::{RateEntry, TaxCalculator};
//! use tax_core::{RateBasis, RateType};
//!
//! let rates = vec![
//!     RateEntry {
//!         id: 1,
//!         tax_id: 1,
//!         tax_group_id: 1,
//!         name: "Service".to_string(),
//!         rate: dec!(10),
//!         rate_type: RateType::Percentage,
//!         is_inclusive: false,
//!         priority: 1,
//!         based_on: RateBasis::Price,
//!     },
//!     RateEntry {
//!         id: 2,
//!         tax_id: 2,
//!         tax_group_id: 2,
//!         name: "VAT".to_string(),
//!         rate: dec!(5),
//!         rate_type: RateType::Percentage,
//!         is_inclusive: false,
//!         priority: 2,
//!         based_on: RateBasis::TotalAfterPreviousTax,
//!     },
//! ];
//!
//! let result = TaxCalculator::new(&rates).calculate(dec!(100000)).unwrap();
//!
//! assert_eq!(result.taxes[1].amount, dec!(5500.00));
//! assert_eq!(result.total_tax, dec!(15500.00));
//! assert_eq!(result.grand_total, dec!(115500.00));
//! ```

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::calculations::common::round_half_up;
use crate::models::{RateBasis, RateType};

/// Errors that can occur during a price-level tax calculation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CalculationError {
    /// Prices are non-negative.
    #[error("price must not be negative, got {0}")]
    NegativePrice(Decimal),

    /// A percentage rate below zero.
    #[error("percentage rate {rate_id} must not be negative, got {rate}")]
    NegativeRate { rate_id: i64, rate: Decimal },

    /// An amount or running total left the representable decimal range.
    #[error("tax amount for rate {rate_id} overflows")]
    Overflow { rate_id: i64 },
}

/// One resolved, applicable rate, carrying the name of the tax it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateEntry {
    /// Id of the underlying `TaxRate`.
    pub id: i64,
    pub tax_id: i64,
    pub tax_group_id: i64,
    pub name: String,
    pub rate: Decimal,
    pub rate_type: RateType,
    pub is_inclusive: bool,
    pub priority: i32,
    pub based_on: RateBasis,
}

/// One reported line of a calculation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaxLine {
    pub rate_id: i64,
    pub tax_id: i64,
    pub name: String,
    pub rate: Decimal,
    pub rate_type: RateType,
    pub is_inclusive: bool,
    /// Rounded to two decimal places.
    pub amount: Decimal,
    pub priority: i32,
}

/// Result of a price-level tax calculation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaxCalculation {
    /// The price the calculation started from.
    pub base_amount: Decimal,

    /// One line per applied rate, in application order.
    pub taxes: Vec<TaxLine>,

    /// Sum of exclusive tax amounts, rounded once.
    pub total_tax: Decimal,

    /// Price plus exclusive taxes, rounded once. Inclusive taxes are already
    /// part of the price and never raise it.
    pub grand_total: Decimal,
}

impl TaxCalculation {
    /// The result for a price no rate applies to.
    pub fn untaxed(price: Decimal) -> Self {
        Self {
            base_amount: price,
            taxes: Vec::new(),
            total_tax: Decimal::ZERO,
            grand_total: price,
        }
    }

    /// Sum of the reported inclusive line amounts.
    pub fn inclusive_tax(&self) -> Decimal {
        self.taxes
            .iter()
            .filter(|line| line.is_inclusive)
            .map(|line| line.amount)
            .sum()
    }
}

/// Calculator for a fixed, priority-ordered list of rates.
#[derive(Debug, Clone)]
pub struct TaxCalculator<'a> {
    rates: &'a [RateEntry],
}

impl<'a> TaxCalculator<'a> {
    /// Creates a calculator over `rates`, which must be sorted by ascending
    /// priority; they are applied exactly in the given order.
    pub fn new(rates: &'a [RateEntry]) -> Self {
        Self { rates }
    }

    /// Calculates the taxes owed on `price`.
    ///
    /// # Errors
    ///
    /// Returns [`CalculationError`] if:
    /// - `price` is negative
    /// - a percentage rate is negative
    /// - a tax amount or the running total overflows
    pub fn calculate(
        &self,
        price: Decimal,
    ) -> Result<TaxCalculation, CalculationError> {
        if price < Decimal::ZERO {
            return Err(CalculationError::NegativePrice(price));
        }

        let mut running_total = price;
        let mut total_tax = Decimal::ZERO;
        let mut taxes = Vec::with_capacity(self.rates.len());

        for entry in self.rates {
            let base = self.calculation_base(entry, price, running_total);
            let amount = self.amount(entry, base)?;

            if !entry.is_inclusive {
                let overflow = || CalculationError::Overflow { rate_id: entry.id };
                total_tax = total_tax.checked_add(amount).ok_or_else(overflow)?;
                running_total = running_total.checked_add(amount).ok_or_else(overflow)?;
            }

            taxes.push(TaxLine {
                rate_id: entry.id,
                tax_id: entry.tax_id,
                name: entry.name.clone(),
                rate: entry.rate,
                rate_type: entry.rate_type,
                is_inclusive: entry.is_inclusive,
                amount: round_half_up(amount),
                priority: entry.priority,
            });
        }

        // The running total is the price plus every exclusive amount.
        Ok(TaxCalculation {
            base_amount: price,
            taxes,
            total_tax: round_half_up(total_tax),
            grand_total: round_half_up(running_total),
        })
    }

    /// Chooses the amount a rate is applied to.
    fn calculation_base(
        &self,
        entry: &RateEntry,
        price: Decimal,
        running_total: Decimal,
    ) -> Decimal {
        match entry.based_on {
            RateBasis::Price => price,
            RateBasis::TotalAfterPreviousTax => running_total,
        }
    }

    /// Unrounded tax amount for one rate.
    fn amount(
        &self,
        entry: &RateEntry,
        base: Decimal,
    ) -> Result<Decimal, CalculationError> {
        match entry.rate_type {
            RateType::Percentage => {
                if entry.rate < Decimal::ZERO {
                    return Err(CalculationError::NegativeRate {
                        rate_id: entry.id,
                        rate: entry.rate,
                    });
                }
                let amount = entry
                    .rate
                    .checked_div(Decimal::ONE_HUNDRED)
                    .and_then(|fraction| {
                        if entry.is_inclusive {
                            self.embedded_tax(base, fraction)
                        } else {
                            base.checked_mul(fraction)
                        }
                    });
                amount.ok_or(CalculationError::Overflow { rate_id: entry.id })
            }
            RateType::Fixed => Ok(entry.rate),
        }
    }

    /// Portion of `gross` that is tax at `fraction`, or `None` on overflow.
    fn embedded_tax(
        &self,
        gross: Decimal,
        fraction: Decimal,
    ) -> Option<Decimal> {
        let net = gross.checked_div(Decimal::ONE.checked_add(fraction)?)?;
        gross.checked_sub(net)
    }
}
