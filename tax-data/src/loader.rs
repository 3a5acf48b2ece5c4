use std::collections::HashMap;
use std::fmt::Display;
use std::io::Read;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use tax_core::models::{
    NewTaxRate, Owner, RateBasis, RateType, Tax, TaxGroup, TaxGroupInput, TaxInput,
    TransactionContext, slugify,
};
use tax_core::engine::validate_new_rate;
use tax_core::{EngineError, TaxEngine};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors that can occur when loading a tax table.
#[derive(Debug, Error)]
pub enum TaxTableLoaderError {
    #[error("CSV parse error: {0}")]
    CsvParse(String),

    #[error("Record {record}: invalid owner: {reason}")]
    InvalidOwner { record: usize, reason: String },

    #[error("Record {record}: invalid context '{value}'")]
    InvalidContext { record: usize, value: String },

    #[error("Record {record}: invalid rate: {reason}")]
    InvalidRate { record: usize, reason: String },

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),
}

impl From<csv::Error> for TaxTableLoaderError {
    fn from(err: csv::Error) -> Self {
        TaxTableLoaderError::CsvParse(err.to_string())
    }
}

/// A single row of a tax table CSV file.
///
/// Each row contributes one rate to the group `group_name`, which backs the
/// tax identified by `tax_slug` (or the slug derived from `tax_name`):
/// - `owner_type`, `owner_id`: `system` with an empty id, or e.g. `merchant,m1`
/// - `rate`, `rate_type`: a percentage or a fixed amount
/// - `inclusive`: whether the tax is embedded in the price
/// - `priority`, `based_on`: ordering and calculation base
/// - `valid_from`, `valid_until`: RFC 3339 timestamps, empty for open bounds
/// - `min_price`, `max_price`: optional price band
/// - `context`: `regions:jakarta|bandung;categories:food`, empty for a global group
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct TaxTableRecord {
    pub owner_type: String,
    #[serde(deserialize_with = "deserialize_optional")]
    pub owner_id: Option<String>,
    pub tax_name: String,
    #[serde(deserialize_with = "deserialize_optional")]
    pub tax_slug: Option<String>,
    pub group_name: String,
    pub rate: Decimal,
    pub rate_type: RateType,
    pub inclusive: bool,
    pub priority: i32,
    pub based_on: RateBasis,
    #[serde(deserialize_with = "deserialize_optional")]
    pub valid_from: Option<DateTime<Utc>>,
    #[serde(deserialize_with = "deserialize_optional")]
    pub valid_until: Option<DateTime<Utc>>,
    #[serde(deserialize_with = "deserialize_optional")]
    pub min_price: Option<Decimal>,
    #[serde(deserialize_with = "deserialize_optional")]
    pub max_price: Option<Decimal>,
    #[serde(default)]
    pub context: String,
}

impl TaxTableRecord {
    pub fn slug(&self) -> String {
        self.tax_slug
            .clone()
            .unwrap_or_else(|| slugify(&self.tax_name))
    }
}

fn deserialize_optional<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: serde::Deserializer<'de>,
    T: FromStr,
    T::Err: Display,
{
    let s: Option<String> = Option::deserialize(deserializer)?;
    match s {
        Some(s) if s.trim().is_empty() => Ok(None),
        Some(s) => s
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(serde::de::Error::custom),
        None => Ok(None),
    }
}

/// Parses the `context` column: `;`-separated `type:id|id` entries.
pub fn parse_context(value: &str) -> Option<TransactionContext> {
    let mut context = TransactionContext::new();

    for entry in value.split(';').map(str::trim).filter(|e| !e.is_empty()) {
        let (entity_type, ids) = entry.split_once(':')?;
        let ids: Vec<&str> = ids
            .split('|')
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .collect();
        if entity_type.trim().is_empty() || ids.is_empty() {
            return None;
        }
        context.insert(entity_type, ids);
    }

    Some(context)
}

/// What a [`TaxTableLoader::load`] call changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadSummary {
    pub taxes_created: usize,
    pub groups_created: usize,
    pub rates_loaded: usize,
    pub rates_replaced: usize,
    pub assignments_created: usize,
}

/// Loader for tax tables from CSV files.
///
/// Records are written through a [`TaxEngine`], so every ownership and
/// validation rule of the engine applies to imported data and the loader
/// works with any repository backend.
pub struct TaxTableLoader;

impl TaxTableLoader {
    /// Parse tax table records from a CSV reader.
    pub fn parse<R: Read>(reader: R) -> Result<Vec<TaxTableRecord>, TaxTableLoaderError> {
        let mut csv_reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(reader);
        let mut records = Vec::new();

        for result in csv_reader.deserialize() {
            let record: TaxTableRecord = result?;
            records.push(record);
        }

        Ok(records)
    }

    /// Load tax table records through the engine.
    ///
    /// Every record's owner, context and rate is checked before anything is
    /// written. Then, for each unique (owner, tax slug, group name)
    /// combination, in order of first appearance, this method will:
    /// 1. Reuse the owner's tax with that slug, or create it
    /// 2. Reuse the owner's group with that name, or create it
    /// 3. Link the group to the tax
    /// 4. Insert the records' rates, then drop the rates they replace
    /// 5. Merge the records' context entries into the group's scope
    ///
    /// Loading the same records again yields the same taxes, groups, rates and
    /// scopes; only the replaced rates get new ids. If inserting a batch's
    /// rates fails, the rates already inserted for it are removed and the
    /// previous rates stay in place.
    pub async fn load(
        engine: &TaxEngine,
        records: &[TaxTableRecord],
    ) -> Result<LoadSummary, TaxTableLoaderError> {
        let mut summary = LoadSummary::default();

        let mut order = Vec::new();
        let mut batches: HashMap<(Owner, String, String), Vec<(usize, &TaxTableRecord)>> =
            HashMap::new();

        for (index, record) in records.iter().enumerate() {
            let number = index + 1;
            let owner = Owner::parse(&record.owner_type, record.owner_id.as_deref()).map_err(
                |e| TaxTableLoaderError::InvalidOwner {
                    record: number,
                    reason: e.to_string(),
                },
            )?;
            let key = (owner, record.slug(), record.group_name.trim().to_string());
            if !batches.contains_key(&key) {
                order.push(key.clone());
            }
            batches.entry(key).or_default().push((number, record));
        }

        let mut scopes = Vec::with_capacity(order.len());
        for key in &order {
            let mut scope = TransactionContext::new();
            for (number, record) in &batches[key] {
                let context = parse_context(&record.context).ok_or_else(|| {
                    TaxTableLoaderError::InvalidContext {
                        record: *number,
                        value: record.context.clone(),
                    }
                })?;
                for entry in context.keys() {
                    scope.insert(&entry.entity_type, [entry.entity_id]);
                }
                validate_new_rate(&new_rate(0, 0, record)).map_err(|e| {
                    TaxTableLoaderError::InvalidRate {
                        record: *number,
                        reason: e.to_string(),
                    }
                })?;
            }
            scopes.push(scope);
        }

        for (key, scope) in order.iter().zip(scopes) {
            let batch = &batches[key];
            let (owner, slug, group_name) = key;
            let (_, first) = batch[0];

            let tax = Self::find_or_create_tax(engine, owner, slug, first, &mut summary).await?;
            let group =
                Self::find_or_create_group(engine, owner, group_name, &mut summary).await?;
            engine.assign_group_to_tax(owner, group.id, tax.id).await?;

            let previous: Vec<i64> = engine
                .list_tax_rates(group.id)
                .await?
                .into_iter()
                .filter(|rate| rate.tax_id == tax.id)
                .map(|rate| rate.id)
                .collect();

            let mut inserted = Vec::with_capacity(batch.len());
            for (number, record) in batch {
                match engine
                    .create_tax_rate(owner, new_rate(group.id, tax.id, record))
                    .await
                {
                    Ok(rate) => inserted.push(rate.id),
                    Err(e) => {
                        warn!(record = number, error = %e, "Rolling back tax table batch");
                        for id in inserted {
                            engine.delete_tax_rate(owner, id).await?;
                        }
                        return Err(e.into());
                    }
                }
            }
            summary.rates_loaded += inserted.len();

            for id in previous {
                engine.delete_tax_rate(owner, id).await?;
                summary.rates_replaced += 1;
            }

            if !scope.is_empty() {
                let created = engine.assign_tax_to_context(owner, group.id, &scope).await?;
                summary.assignments_created += created.len();
            }

            debug!(
                owner = %owner,
                tax = %tax.slug,
                group = %group.name,
                rates = batch.len(),
                "Loaded tax table batch"
            );
        }

        info!(
            taxes_created = summary.taxes_created,
            groups_created = summary.groups_created,
            rates_loaded = summary.rates_loaded,
            "Tax table loaded"
        );
        Ok(summary)
    }

    async fn find_or_create_tax(
        engine: &TaxEngine,
        owner: &Owner,
        slug: &str,
        record: &TaxTableRecord,
        summary: &mut LoadSummary,
    ) -> Result<Tax, TaxTableLoaderError> {
        let existing = engine
            .list_taxes(owner)
            .await?
            .into_iter()
            .find(|tax| tax.slug == slug);
        if let Some(tax) = existing {
            return Ok(tax);
        }

        let tax = engine
            .create_tax(
                owner,
                TaxInput {
                    slug: Some(slug.to_string()),
                    ..TaxInput::named(record.tax_name.trim())
                },
            )
            .await?;
        summary.taxes_created += 1;
        Ok(tax)
    }

    async fn find_or_create_group(
        engine: &TaxEngine,
        owner: &Owner,
        name: &str,
        summary: &mut LoadSummary,
    ) -> Result<TaxGroup, TaxTableLoaderError> {
        let existing = engine
            .list_tax_groups(owner)
            .await?
            .into_iter()
            .find(|group| group.name == name);
        if let Some(group) = existing {
            return Ok(group);
        }

        let group = engine
            .create_tax_group(owner, TaxGroupInput::named(name))
            .await?;
        summary.groups_created += 1;
        Ok(group)
    }
}

fn new_rate(
    group_id: i64,
    tax_id: i64,
    record: &TaxTableRecord,
) -> NewTaxRate {
    NewTaxRate {
        tax_group_id: group_id,
        tax_id,
        rate: record.rate,
        rate_type: record.rate_type,
        is_inclusive: record.inclusive,
        priority: record.priority,
        based_on: record.based_on,
        valid_from: record.valid_from,
        valid_until: record.valid_until,
        min_price: record.min_price,
        max_price: record.max_price,
    }
}
