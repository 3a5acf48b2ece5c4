//! Multi-tenant tax resolution and calculation.
//!
//! Taxes and tax groups belong to an [`Owner`]: the system or one scoped
//! owner such as a merchant. Groups hold the rates, back one or more taxes
//! and may be scoped to transaction-context entities (regions, categories,
//! ...). [`TaxEngine`] resolves the rates that apply to an owner and context
//! and computes line items and totals for a price.

pub mod calculations;
pub mod db;
pub mod engine;
pub mod models;

pub use calculations::{CalculationError, RateEntry, TaxCalculation, TaxLine};
pub use db::repository::{RepositoryError, TaxRepository};
pub use engine::{EngineConfig, EngineError, TaxEngine};
pub use models::*;
