//! Application configuration.
//!
//! Aggregates configuration for the Job renderer and the executor into a single
//! Config struct that can be loaded from YAML files or environment variables.

mod executor;
mod job;

pub use executor::ExecutorConfig;
pub use job::{JobConfig, DEFAULT_MANAGER_PATH, DEFAULT_SOCKET_DIR};

use serde::Deserialize;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "pgmajor.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "PGMAJOR_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "PGMAJOR";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "PGMAJOR_LOG";

/// Environment variable for the data directory.
pub const PGDATA_ENV_VAR: &str = "PGDATA";
/// Environment variable for the pod name.
pub const POD_NAME_ENV_VAR: &str = "POD_NAME";
/// Environment variable for the cluster name.
pub const CLUSTER_NAME_ENV_VAR: &str = "CLUSTER_NAME";
/// Environment variable for the Kubernetes namespace.
pub const NAMESPACE_ENV_VAR: &str = "NAMESPACE";
/// Environment variable for the major version being downgraded to.
pub const TARGET_MAJOR_ENV_VAR: &str = "TARGET_MAJOR_VERSION";

/// Errors raised while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),
}

/// Main application configuration.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Downgrade Job rendering.
    pub job: JobConfig,
    /// Executor defaults.
    pub executor: ExecutorConfig,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `pgmajor.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix, e.g. `PGMAJOR__JOB__REQUEUE_SECS`
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            if path != Some(config_path.as_str()) {
                builder =
                    builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
            }
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }
}
