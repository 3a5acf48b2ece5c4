//! Rate resolution and price-level tax arithmetic.
//!
//! The [`resolver`] walks the owner hierarchy and uses the [`matcher`] to
//! decide which groups apply to a transaction; the [`calculator`] turns the
//! resulting priority-ordered rates into line items and totals.

pub mod calculator;
pub mod common;
pub mod matcher;
pub mod resolver;

pub use calculator::{CalculationError, RateEntry, TaxCalculation, TaxCalculator, TaxLine};
pub use resolver::{HierarchyResolver, deduplicate_by_priority};
