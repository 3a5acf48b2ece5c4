mod cli;
mod commands;
mod config;
mod logging;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tax_core::TaxEngine;
use tax_core::db::{MemoryRepositoryFactory, RepositoryRegistry};
use tax_db_sqlite::SqliteRepositoryFactory;
use tracing::debug;

use crate::cli::{Cli, Command, parse_context_args};
use crate::config::AppConfig;

fn build_registry() -> RepositoryRegistry {
    let mut registry = RepositoryRegistry::new();
    registry.register(Box::new(SqliteRepositoryFactory));
    registry.register(Box::new(MemoryRepositoryFactory));
    registry
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::resolve(&cli)?;
    logging::init_logging(&config.logging)?;

    debug!(
        backend = %config.database.backend,
        enforce_price_band = config.engine.enforce_price_band,
        "Opening repository"
    );
    let repository = build_registry()
        .create(&config.database)
        .await
        .with_context(|| {
            format!(
                "Failed to open {} database: {}",
                config.database.backend, config.database.connection_string
            )
        })?;
    let engine = TaxEngine::new(Arc::from(repository)).with_config(config.engine.clone());

    let output = match cli.command {
        Command::Calculate {
            owner,
            price,
            context,
            at,
        } => {
            let context = parse_context_args(&context)?;
            commands::calculate(&engine, &owner, price, &context, at).await?
        }
        Command::Hierarchy { owner } => commands::hierarchy(&engine, &owner).await?,
        Command::Stats { owner } => commands::stats(&engine, &owner).await?,
        Command::Search { owner, query } => commands::search(&engine, &owner, &query).await?,
        Command::Import { file } => commands::import(&engine, &file).await?,
    };

    print!("{output}");
    Ok(())
}
