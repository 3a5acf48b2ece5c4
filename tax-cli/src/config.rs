//! `tax-engine.toml` loading.
//!
//! ```toml
//! [database]
//! backend = "sqlite"
//! connection_string = "taxes.db"
//!
//! [engine]
//! enforce_price_band = true
//!
//! [logging]
//! level = "debug"
//! file = "tax-engine.log"
//! ```
//!
//! Every table and key is optional. Command-line flags win over the file.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tax_core::EngineConfig;
use tax_core::db::DbConfig;

use crate::cli::Cli;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AppConfig {
    pub database: DbConfig,
    pub engine: EngineConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    /// Bare level or full `EnvFilter` directive. `RUST_LOG` takes precedence.
    pub level: String,
    /// Log file to append to, in addition to stderr.
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
            file: None,
        }
    }
}

impl AppConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).context("Invalid configuration")
    }

    pub fn load_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// The file named by `--config`, if any, with the command-line overrides
    /// applied on top.
    pub fn resolve(cli: &Cli) -> Result<Self> {
        let mut config = match &cli.config {
            Some(path) => Self::load_file(path)?,
            None => Self::default(),
        };
        config.apply_overrides(cli);
        Ok(config)
    }

    pub fn apply_overrides(
        &mut self,
        cli: &Cli,
    ) {
        if let Some(backend) = &cli.backend {
            self.database.backend = backend.clone();
        }
        if let Some(database) = &cli.database {
            self.database.connection_string = database.clone();
        }
        if cli.enforce_price_band {
            self.engine.enforce_price_band = true;
        }
        if let Some(level) = &cli.log_level {
            self.logging.level = level.clone();
        }
        if let Some(file) = &cli.log_file {
            self.logging.file = Some(file.clone());
        }
    }
}
