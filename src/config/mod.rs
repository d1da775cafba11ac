//! Application configuration.
//!
//! Aggregates the management, broker, profiling, executor and data source
//! sections into a single `Config` loaded from YAML files and environment
//! variables.

mod management;
mod pools;

pub use management::{BrokerConfig, CachingConfig, ManagementConfig, ProfilingConfig};
pub use pools::{DataSourceConfig, ExecutorConfig, PoolSize, RejectionPolicy};

use serde::Deserialize;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "warden.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "WARDEN_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "WARDEN";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "WARDEN_LOG";

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid pool size '{value}': {reason}")]
    InvalidPoolSize { value: String, reason: String },

    #[error("{field} must be positive, got {value}")]
    NonPositive { field: &'static str, value: i64 },

    #[error("Maximum pool size {max} is below core pool size {core}")]
    MaxBelowCore { core: usize, max: usize },

    #[error("Unknown rejection policy '{value}'")]
    UnknownRejectionPolicy { value: String },

    #[error("Unknown class name style '{value}'")]
    UnknownClassNameStyle { value: String },

    #[error("Missing required field '{field}' in {section}")]
    MissingField {
        section: &'static str,
        field: &'static str,
    },
}

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Management bus naming.
    pub management: ManagementConfig,
    /// Managed broker connection factories.
    pub brokers: Vec<BrokerConfig>,
    /// Profiling interceptor.
    pub profiling: ProfilingConfig,
    /// Managed thread pools.
    pub executors: Vec<ExecutorConfig>,
    /// Managed relational pools.
    pub datasources: Vec<DataSourceConfig>,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `warden.yaml` in current directory (if exists)
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
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML document, without file or
    /// environment sources.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Structural checks that do not depend on building the pools.
    ///
    /// Pool sizes are checked when the executor factory is built.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for broker in &self.brokers {
            if broker.name.is_empty() {
                return Err(ConfigError::MissingField {
                    section: "brokers",
                    field: "name",
                });
            }
            if let Some(caching) = &broker.caching {
                if caching.session_cache_size == 0 {
                    return Err(ConfigError::NonPositive {
                        field: "session_cache_size",
                        value: 0,
                    });
                }
            }
        }
        for executor in &self.executors {
            if executor.name.is_empty() {
                return Err(ConfigError::MissingField {
                    section: "executors",
                    field: "name",
                });
            }
        }
        for datasource in &self.datasources {
            datasource.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests;
