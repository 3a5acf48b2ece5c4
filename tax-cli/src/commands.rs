//! Subcommand handlers. Each renders its result as text for stdout.

use std::fmt::Write as _;
use std::fs::File;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tax_core::engine::{TaxHierarchy, TaxStatistics};
use tax_core::models::{Owner, RateType, Tax, TaxRate, TransactionContext};
use tax_core::{TaxCalculation, TaxEngine};
use tax_data::TaxTableLoader;

pub async fn calculate(
    engine: &TaxEngine,
    owner: &Owner,
    price: Decimal,
    context: &TransactionContext,
    at: Option<DateTime<Utc>>,
) -> Result<String> {
    let calculation = match at {
        Some(as_of) => {
            engine
                .calculate_tax_for_owner_at(price, owner, context, as_of)
                .await
        }
        None => engine.calculate_tax_for_owner(price, owner, context).await,
    }
    .context("Calculation failed")?;

    Ok(render_calculation(&calculation))
}

pub async fn hierarchy(
    engine: &TaxEngine,
    owner: &Owner,
) -> Result<String> {
    let hierarchy = engine
        .get_tax_hierarchy(owner)
        .await
        .with_context(|| format!("Failed to load tax hierarchy for {owner}"))?;
    Ok(render_hierarchy(&hierarchy))
}

pub async fn stats(
    engine: &TaxEngine,
    owner: &Owner,
) -> Result<String> {
    let stats = engine
        .get_tax_statistics(owner)
        .await
        .with_context(|| format!("Failed to load tax statistics for {owner}"))?;
    Ok(render_statistics(owner, &stats))
}

pub async fn search(
    engine: &TaxEngine,
    owner: &Owner,
    query: &str,
) -> Result<String> {
    let taxes = engine
        .search_taxes(owner, query)
        .await
        .with_context(|| format!("Failed to search taxes for {owner}"))?;
    Ok(render_taxes(&taxes))
}

pub async fn import(
    engine: &TaxEngine,
    path: &Path,
) -> Result<String> {
    let file =
        File::open(path).with_context(|| format!("Failed to open: {}", path.display()))?;
    let records = TaxTableLoader::parse(file)
        .with_context(|| format!("Failed to parse CSV: {}", path.display()))?;
    let summary = TaxTableLoader::load(engine, &records)
        .await
        .context("Failed to load tax table")?;

    Ok(format!(
        "Loaded {} rates ({} replaced) from {} records: {} taxes and {} groups created, {} context assignments added.\n",
        summary.rates_loaded,
        summary.rates_replaced,
        records.len(),
        summary.taxes_created,
        summary.groups_created,
        summary.assignments_created
    ))
}

fn format_rate(
    rate: Decimal,
    rate_type: RateType,
) -> String {
    match rate_type {
        RateType::Percentage => format!("{}%", rate.normalize()),
        RateType::Fixed => format!("{} fixed", rate.normalize()),
    }
}

pub fn render_calculation(calculation: &TaxCalculation) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{:<32} {:>16}", "Price", calculation.base_amount);

    for line in &calculation.taxes {
        let label = format!(
            "{} ({}{})",
            line.name,
            format_rate(line.rate, line.rate_type),
            if line.is_inclusive { ", included" } else { "" }
        );
        let _ = writeln!(out, "  {:<30} {:>16}", label, line.amount);
    }

    let inclusive = calculation.inclusive_tax();
    if !inclusive.is_zero() {
        let _ = writeln!(out, "{:<32} {:>16}", "Included tax", inclusive);
    }
    let _ = writeln!(out, "{:<32} {:>16}", "Total tax", calculation.total_tax);
    let _ = writeln!(out, "{:<32} {:>16}", "Grand total", calculation.grand_total);
    out
}

fn render_rate(rate: &TaxRate) -> String {
    let mut text = format!(
        "rate #{} {} priority {} on {}",
        rate.id,
        format_rate(rate.rate, rate.rate_type),
        rate.priority,
        rate.based_on.as_str()
    );
    if rate.is_inclusive {
        text.push_str(", included");
    }
    if rate.valid_from.is_some() || rate.valid_until.is_some() {
        let bound = |d: Option<DateTime<Utc>>| d.map(|d| d.to_rfc3339()).unwrap_or_default();
        let _ = write!(text, ", valid {}..{}", bound(rate.valid_from), bound(rate.valid_until));
    }
    if rate.min_price.is_some() || rate.max_price.is_some() {
        let bound = |p: Option<Decimal>| p.map(|p| p.to_string()).unwrap_or_default();
        let _ = write!(text, ", price {}..{}", bound(rate.min_price), bound(rate.max_price));
    }
    text
}

pub fn render_hierarchy(hierarchy: &TaxHierarchy) -> String {
    let mut out = String::new();
    for level in &hierarchy.levels {
        let _ = writeln!(out, "[{}]", level.owner);
        if level.taxes.is_empty() {
            let _ = writeln!(out, "  (no taxes)");
        }
        for node in &level.taxes {
            let status = if node.tax.is_active { "" } else { " (inactive)" };
            let _ = writeln!(out, "  {} <{}>{}", node.tax.name, node.tax.slug, status);
            for group in &node.groups {
                let scope = if group.scope.is_empty() {
                    "global".to_string()
                } else {
                    group
                        .scope
                        .iter()
                        .map(|key| format!("{}:{}", key.entity_type, key.entity_id))
                        .collect::<Vec<_>>()
                        .join(", ")
                };
                let _ = writeln!(out, "    group {} [{}]", group.group.name, scope);
                for rate in &group.rates {
                    let _ = writeln!(out, "      {}", render_rate(rate));
                }
            }
        }
    }
    out
}

pub fn render_statistics(
    owner: &Owner,
    stats: &TaxStatistics,
) -> String {
    let rows = [
        ("System taxes", stats.system_taxes),
        ("Owner taxes", stats.owner_taxes),
        ("Active taxes", stats.active_taxes),
        ("Inactive taxes", stats.inactive_taxes),
        ("Tax groups", stats.tax_groups),
        ("Active tax groups", stats.active_tax_groups),
        ("Global tax groups", stats.global_tax_groups),
        ("Scoped tax groups", stats.scoped_tax_groups),
        ("Rates", stats.rates),
        ("Inclusive rates", stats.inclusive_rates),
        ("Fixed rates", stats.fixed_rates),
    ];

    let mut out = format!("Taxes visible to {owner}\n");
    for (label, count) in rows {
        let _ = writeln!(out, "  {:<20} {:>6}", label, count);
    }
    out
}

pub fn render_taxes(taxes: &[Tax]) -> String {
    if taxes.is_empty() {
        return "No matching taxes.\n".to_string();
    }

    let mut out = String::new();
    for tax in taxes {
        let status = if tax.is_active { "active" } else { "inactive" };
        let _ = writeln!(
            out,
            "{:>6}  {:<24} {:<24} {:<16} {}",
            tax.id, tax.name, tax.slug, tax.owner, status
        );
    }
    out
}
