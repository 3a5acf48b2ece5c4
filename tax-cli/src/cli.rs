use std::path::PathBuf;

use anyhow::{Result, bail};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use tax_core::models::{Owner, TransactionContext};

/// Multi-tenant tax resolution and calculation.
///
/// Opens the configured repository and resolves taxes for an owner: the
/// system taxes plus the owner's own, narrowed by the transaction context.
#[derive(Debug, Parser)]
#[command(name = "tax-engine", version, about, long_about = None)]
pub struct Cli {
    /// TOML configuration file.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Repository backend (`sqlite` or `memory`).
    #[arg(long, global = true)]
    pub backend: Option<String>,

    /// Database connection string.
    /// For SQLite this is a file path (e.g. `taxes.db`) or `:memory:`.
    #[arg(short, long, global = true)]
    pub database: Option<String>,

    /// Drop rates whose price band excludes the price.
    #[arg(long, global = true)]
    pub enforce_price_band: bool,

    /// Log level or `EnvFilter` directive.
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Also append log output to this file.
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Calculate the taxes an owner charges on a price.
    Calculate {
        /// `system` or `type:id`, e.g. `merchant:m1`.
        #[arg(long, value_parser = parse_owner)]
        owner: Owner,

        #[arg(long)]
        price: Decimal,

        /// Context entities as `type:id|id`, e.g. `regions:jakarta`.
        /// Repeat or separate with `;` for several types.
        #[arg(long = "context", value_name = "ENTITIES")]
        context: Vec<String>,

        /// Use the rates valid at this RFC 3339 instant instead of now.
        #[arg(long)]
        at: Option<DateTime<Utc>>,
    },

    /// Show the taxes visible to an owner with their groups and rates.
    Hierarchy {
        #[arg(long, value_parser = parse_owner)]
        owner: Owner,
    },

    /// Count the taxes, groups and rates visible to an owner.
    Stats {
        #[arg(long, value_parser = parse_owner)]
        owner: Owner,
    },

    /// Search the taxes visible to an owner by name or slug.
    Search {
        #[arg(long, value_parser = parse_owner)]
        owner: Owner,

        /// Case-insensitive fragment; empty lists everything.
        #[arg(default_value = "")]
        query: String,
    },

    /// Import a tax table CSV file.
    Import {
        #[arg(short, long)]
        file: PathBuf,
    },
}

/// Parses `system` or `type:id`.
pub fn parse_owner(value: &str) -> Result<Owner, String> {
    let owner = match value.trim().split_once(':') {
        None => Owner::parse(value, None),
        Some((owner_type, owner_id)) => Owner::parse(owner_type, Some(owner_id)),
    };
    owner.map_err(|e| e.to_string())
}

/// Merges every `--context` value into one context.
pub fn parse_context_args(values: &[String]) -> Result<TransactionContext> {
    let mut context = TransactionContext::new();
    for value in values {
        let Some(parsed) = tax_data::parse_context(value) else {
            bail!("invalid context '{value}', expected type:id|id");
        };
        for key in parsed.keys() {
            context.insert(&key.entity_type, [key.entity_id]);
        }
    }
    Ok(context)
}
