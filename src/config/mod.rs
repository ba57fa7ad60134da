//! Configuration management for the subaccount ledger.
//!
//! Loads settings from an optional `config` file and `SUBLEDGER__*`
//! environment variables (a `.env` file is honoured).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Protocol parameters of the ledger core
    #[serde(default)]
    pub ledger: LedgerConfig,
    /// Where state is persisted
    #[serde(default)]
    pub storage: StorageConfig,
    /// Log output
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Blocks during which withdrawals and transfers stay blocked after a
    /// negative-TNC subaccount (or a chain outage) was seen for a pool
    #[serde(default = "default_negative_tnc_block_window")]
    pub negative_tnc_block_window: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// SQLite database file
    #[serde(default = "default_db_path")]
    pub db_path: String,
    /// JSON file with the perpetual markets known to the registry
    #[serde(default)]
    pub markets_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset
    #[serde(default = "default_log_filter")]
    pub filter: String,
    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

fn default_negative_tnc_block_window() -> u32 {
    50
}

fn default_db_path() -> String {
    "subledger.db".to_string()
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from environment variables and config files.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::default().separator("__").prefix("SUBLEDGER"))
            .build()
            .context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.ledger.negative_tnc_block_window > 0,
            "negative_tnc_block_window must be at least 1 block"
        );

        anyhow::ensure!(
            !self.storage.db_path.trim().is_empty(),
            "storage.db_path must not be empty"
        );

        anyhow::ensure!(
            !self.logging.filter.trim().is_empty(),
            "logging.filter must not be empty"
        );

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ledger: LedgerConfig::default(),
            storage: StorageConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            negative_tnc_block_window: default_negative_tnc_block_window(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            markets_path: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.ledger.negative_tnc_block_window, 50);
    }

    #[test]
    fn test_zero_window_is_rejected() {
        let mut config = Config::default();
        config.ledger.negative_tnc_block_window = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_sections_use_defaults() {
        let config: Config = serde_json::from_str(r#"{"ledger": {}}"#).unwrap();
        assert_eq!(config.ledger.negative_tnc_block_window, 50);
        assert_eq!(config.storage.db_path, "subledger.db");
        assert!(!config.logging.json);
    }
}
