use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// How a rate's `rate` value is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateType {
    /// `rate` is a percentage of the calculation base.
    Percentage,
    /// `rate` is an absolute amount, independent of price.
    Fixed,
}

impl RateType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Percentage => "percentage",
            Self::Fixed => "fixed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "percentage" => Some(Self::Percentage),
            "fixed" => Some(Self::Fixed),
            _ => None,
        }
    }
}

/// Which amount a rate is applied to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateBasis {
    /// The original price.
    Price,
    /// The price plus every exclusive tax applied earlier in the same pass.
    TotalAfterPreviousTax,
}

impl RateBasis {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Price => "price",
            Self::TotalAfterPreviousTax => "total_after_previous_tax",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "price" => Some(Self::Price),
            "total_after_previous_tax" => Some(Self::TotalAfterPreviousTax),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaxRate {
    pub id: i64,
    pub tax_group_id: i64,
    pub tax_id: i64,
    pub rate: Decimal,
    pub rate_type: RateType,
    pub is_inclusive: bool,
    /// Ascending: lower priorities are applied first.
    pub priority: i32,
    pub based_on: RateBasis,
    pub valid_from: Option<DateTime<Utc>>,
    pub valid_until: Option<DateTime<Utc>>,
    pub min_price: Option<Decimal>,
    pub max_price: Option<Decimal>,
    /// Bumped on every update; stale writers get a `Conflict`.
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaxRate {
    /// True when `at` lies inside the validity window. Both bounds are
    /// inclusive; an absent bound is open.
    pub fn is_valid_at(
        &self,
        at: DateTime<Utc>,
    ) -> bool {
        self.valid_from.is_none_or(|from| from <= at)
            && self.valid_until.is_none_or(|until| at <= until)
    }

    /// True when `price` lies inside `[min_price, max_price]`.
    pub fn covers_price(
        &self,
        price: Decimal,
    ) -> bool {
        self.min_price.is_none_or(|min| min <= price)
            && self.max_price.is_none_or(|max| price <= max)
    }
}

/// For creating new rates (no id or timestamps).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTaxRate {
    pub tax_group_id: i64,
    pub tax_id: i64,
    pub rate: Decimal,
    pub rate_type: RateType,
    pub is_inclusive: bool,
    pub priority: i32,
    pub based_on: RateBasis,
    pub valid_from: Option<DateTime<Utc>>,
    pub valid_until: Option<DateTime<Utc>>,
    pub min_price: Option<Decimal>,
    pub max_price: Option<Decimal>,
}

impl NewTaxRate {
    /// An exclusive percentage rate on the price, valid forever.
    pub fn percentage(
        tax_group_id: i64,
        tax_id: i64,
        rate: Decimal,
        priority: i32,
    ) -> Self {
        Self {
            tax_group_id,
            tax_id,
            rate,
            rate_type: RateType::Percentage,
            is_inclusive: false,
            priority,
            based_on: RateBasis::Price,
            valid_from: None,
            valid_until: None,
            min_price: None,
            max_price: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaxRateUpdate {
    pub tax_id: Option<i64>,
    pub rate: Option<Decimal>,
    pub rate_type: Option<RateType>,
    pub is_inclusive: Option<bool>,
    pub priority: Option<i32>,
    pub based_on: Option<RateBasis>,
    pub valid_from: Option<Option<DateTime<Utc>>>,
    pub valid_until: Option<Option<DateTime<Utc>>>,
    pub min_price: Option<Option<Decimal>>,
    pub max_price: Option<Option<Decimal>>,
}

impl TaxRateUpdate {
    pub fn apply_to(
        &self,
        rate: &mut TaxRate,
    ) {
        if let Some(tax_id) = self.tax_id {
            rate.tax_id = tax_id;
        }
        if let Some(value) = self.rate {
            rate.rate = value;
        }
        if let Some(rate_type) = self.rate_type {
            rate.rate_type = rate_type;
        }
        if let Some(is_inclusive) = self.is_inclusive {
            rate.is_inclusive = is_inclusive;
        }
        if let Some(priority) = self.priority {
            rate.priority = priority;
        }
        if let Some(based_on) = self.based_on {
            rate.based_on = based_on;
        }
        if let Some(valid_from) = self.valid_from {
            rate.valid_from = valid_from;
        }
        if let Some(valid_until) = self.valid_until {
            rate.valid_until = valid_until;
        }
        if let Some(min_price) = self.min_price {
            rate.min_price = min_price;
        }
        if let Some(max_price) = self.max_price {
            rate.max_price = max_price;
        }
    }
}
