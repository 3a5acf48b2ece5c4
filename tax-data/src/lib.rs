//! Import of tax tables from CSV into any tax repository backend.

mod loader;

pub use loader::{LoadSummary, TaxTableLoader, TaxTableLoaderError, TaxTableRecord, parse_context};
