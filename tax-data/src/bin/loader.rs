use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tax_core::TaxEngine;
use tax_core::db::{DbConfig, MemoryRepositoryFactory, RepositoryRegistry};
use tax_data::TaxTableLoader;
use tax_db_sqlite::SqliteRepositoryFactory;
use tracing_subscriber::EnvFilter;

/// Load a tax table from a CSV file into a tax repository.
///
/// The CSV file should have the following columns:
/// - owner_type, owner_id: `system` with an empty id, or e.g. `merchant,m1`
/// - tax_name, tax_slug: the tax the rate belongs to (slug derived when empty)
/// - group_name: the group carrying the rate
/// - rate, rate_type: a number and `percentage` or `fixed`
/// - inclusive: `true` when the tax is embedded in the price
/// - priority, based_on: ordering and `price` or `total_after_previous_tax`
/// - valid_from, valid_until: RFC 3339 timestamps (empty for open bounds)
/// - min_price, max_price: optional price band
/// - context: e.g. `regions:jakarta|bandung;categories:food` (empty for global)
#[derive(Parser, Debug)]
#[command(name = "tax-data-loader")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the CSV file containing the tax table
    #[arg(short, long)]
    file: PathBuf,

    /// Database location (a file path, a sqlite: URL or :memory:)
    #[arg(short, long, default_value = "tax.db")]
    database: String,

    /// Repository backend
    #[arg(short, long, default_value = "sqlite")]
    backend: String,

    /// Parse and validate the file without writing anything
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let args = Args::parse();

    println!("Loading tax table from: {}", args.file.display());

    let file = File::open(&args.file)
        .with_context(|| format!("Failed to open: {}", args.file.display()))?;

    let records = TaxTableLoader::parse(file)
        .with_context(|| format!("Failed to parse CSV: {}", args.file.display()))?;

    println!("Parsed {} records from CSV", records.len());

    if args.dry_run {
        println!("Dry run, nothing written.");
        return Ok(());
    }

    let mut registry = RepositoryRegistry::new();
    registry.register(Box::new(SqliteRepositoryFactory));
    registry.register(Box::new(MemoryRepositoryFactory));

    let config = DbConfig {
        backend: args.backend.clone(),
        connection_string: args.database.clone(),
    };
    let repository = registry
        .create(&config)
        .await
        .with_context(|| format!("Failed to open {} database: {}", args.backend, args.database))?;
    let engine = TaxEngine::new(Arc::from(repository));

    let summary = TaxTableLoader::load(&engine, &records)
        .await
        .context("Failed to load tax table into database")?;

    println!(
        "Loaded {} rates ({} replaced): {} taxes and {} groups created, {} context assignments added.",
        summary.rates_loaded,
        summary.rates_replaced,
        summary.taxes_created,
        summary.groups_created,
        summary.assignments_created
    );

    Ok(())
}
