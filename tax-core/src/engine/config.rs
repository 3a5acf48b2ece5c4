use serde::{Deserialize, Serialize};

/// Behaviour switches for [`TaxEngine`](super::TaxEngine).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Drop rates whose `[min_price, max_price]` band excludes the price
    /// before priority deduplication. Off by default: bands are stored and
    /// reported but do not affect calculations.
    pub enforce_price_band: bool,
}

impl EngineConfig {
    pub fn with_price_band(mut self) -> Self {
        self.enforce_price_band = true;
        self
    }
}
