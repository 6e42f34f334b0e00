//! Defaults for the downgrade executor.

use std::path::PathBuf;

use serde::Deserialize;

use super::job::DEFAULT_SOCKET_DIR;

/// Executor configuration that is not supplied per invocation.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Unix socket directory used by the temporary instances.
    pub socket_dir: PathBuf,
    /// Superuser created by initdb and used by every tool.
    pub superuser: String,
    /// Database psql connects to when replaying the dump.
    pub database: String,
    /// Binaries of the version currently on disk. Unset means PATH lookup.
    pub old_bin_dir: Option<PathBuf>,
    /// Binaries of the target version. Unset means PATH lookup.
    pub new_bin_dir: Option<PathBuf>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            socket_dir: PathBuf::from(DEFAULT_SOCKET_DIR),
            superuser: "postgres".to_string(),
            database: "postgres".to_string(),
            old_bin_dir: None,
            new_bin_dir: None,
        }
    }
}
