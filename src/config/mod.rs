//! Application configuration.
//!
//! Aggregates storage, messaging and tracker settings into a single Config
//! struct that can be loaded from YAML files or environment variables.

mod messaging;
mod storage;
mod tracker;

pub use messaging::{AmqpConfig, MessagingConfig, MessagingType};
pub use storage::{SqliteConfig, StorageConfig, StorageType};
pub use tracker::{AreaCheckType, LabelRuleConfig, TrackerConfig};

use serde::Deserialize;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "OSMTRACKER_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "OSMTRACKER";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "OSMTRACKER_LOG";
/// Environment variable overriding the polygon file of every area label rule.
pub const REGION_ENV_VAR: &str = "OSMTRACKER_REGION";

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Changeset store configuration.
    pub storage: StorageConfig,
    /// Fetcher, analysis and label rule configuration.
    pub tracker: TrackerConfig,
    /// Messaging configuration (optional).
    pub messaging: Option<MessagingConfig>,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `config.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let mut config: Config = config.try_deserialize()?;
        if let Ok(region) = std::env::var(REGION_ENV_VAR) {
            config.tracker.override_area_files(&region);
        }
        config.tracker.validate()?;
        Ok(config)
    }

    /// Create config for testing.
    pub fn for_test() -> Self {
        Self {
            storage: StorageConfig {
                storage_type: StorageType::Memory,
                ..Default::default()
            },
            ..Default::default()
        }
    }
}
