//! Major version downgrade executor.
//!
//! Runs on the node holding the primary's data volume and moves the data directory
//! through dump, reinitialization and restore:
//!
//! ```text
//! Original -> Dumped -> BackedUp -> Reinitialized -> Restored -> Finalized
//! ```
//!
//! Each transition is one method on [`Downgrade`]. The first failure ends the run and
//! leaves the directory in the state of the last completed transition. Nothing is
//! retried; an interrupted run after the backup rename needs an operator.

mod config_file;
mod inspect;
mod sanitize;


pub use config_file::{remove_custom_conf, strip_custom_include, CUSTOM_CONF, POSTGRESQL_CONF};
pub use inspect::{backup_path, inspect};
pub use sanitize::{DumpSanitizer, SanitizeRule};

use std::fmt;
use std::path::{Path, PathBuf};

use tracing::{info, info_span, warn, Instrument};

use crate::config::ExecutorConfig;
use crate::process::{Invocation, ProcessRunner, Tool, ToolError};

/// File name of the logical dump inside the data directory.
pub const DUMP_FILE: &str = "downgrade_dump.sql";
/// Suffix appended to the data directory while the new one is built.
pub const BACKUP_SUFFIX: &str = ".old";

/// Everything the executor needs, supplied explicitly by the entry point.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecuteConfig {
    /// Data directory to downgrade.
    pub pg_data: PathBuf,
    pub pod_name: String,
    pub cluster_name: String,
    pub namespace: String,
    /// Major version being downgraded to, when known. Selects dump sanitizer rules.
    pub target_major: Option<u32>,
    pub socket_dir: PathBuf,
    pub superuser: String,
    pub database: String,
    pub old_bin_dir: Option<PathBuf>,
    pub new_bin_dir: Option<PathBuf>,
}

impl ExecuteConfig {
    /// Build a configuration for `pg_data` from executor defaults.
    pub fn new(pg_data: impl Into<PathBuf>, defaults: &ExecutorConfig) -> Self {
        Self {
            pg_data: pg_data.into(),
            pod_name: String::new(),
            cluster_name: String::new(),
            namespace: String::new(),
            target_major: None,
            socket_dir: defaults.socket_dir.clone(),
            superuser: defaults.superuser.clone(),
            database: defaults.database.clone(),
            old_bin_dir: defaults.old_bin_dir.clone(),
            new_bin_dir: defaults.new_bin_dir.clone(),
        }
    }

    pub fn with_identity(
        mut self,
        pod_name: impl Into<String>,
        cluster_name: impl Into<String>,
        namespace: impl Into<String>,
    ) -> Self {
        self.pod_name = pod_name.into();
        self.cluster_name = cluster_name.into();
        self.namespace = namespace.into();
        self
    }

    pub fn with_target_major(mut self, target_major: Option<u32>) -> Self {
        self.target_major = target_major;
        self
    }
}

/// Progress of the data directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataDirectoryState {
    /// Untouched, still in the newer on-disk format.
    Original,
    /// Dump written and the original instance stopped.
    Dumped,
    /// Original directory renamed aside.
    BackedUp,
    /// Fresh directory created by the target version's initdb.
    Reinitialized,
    /// Dump replayed into the new directory.
    Restored,
    /// Backup removed. Terminal.
    Finalized,
}

impl fmt::Display for DataDirectoryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataDirectoryState::Original => "Original",
            DataDirectoryState::Dumped => "Dumped",
            DataDirectoryState::BackedUp => "Backed-Up",
            DataDirectoryState::Reinitialized => "Reinitialized",
            DataDirectoryState::Restored => "Restored",
            DataDirectoryState::Finalized => "Finalized",
        };
        f.write_str(name)
    }
}

/// Errors that end a downgrade run.
#[derive(Debug, thiserror::Error)]
pub enum DowngradeError {
    #[error("PGDATA not set")]
    MissingPgData,

    #[error("while creating socket directory {}: {source}", .path.display())]
    SocketDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("while inspecting {}: {source}", .path.display())]
    Inspect {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("backup directory {} already exists (data directory is {state}), manual recovery required", .backup.display())]
    PartialDowngrade {
        backup: PathBuf,
        state: DataDirectoryState,
    },

    #[error("failed to remove custom.conf: {0}")]
    RemoveCustomConf(#[source] std::io::Error),

    #[error("failed to rewrite postgresql.conf: {0}")]
    RewriteConfig(#[source] std::io::Error),

    #[error("{action} failed: {source}")]
    Tool {
        action: &'static str,
        #[source]
        source: ToolError,
    },

    #[error("failed to sanitize dump file: {0}")]
    SanitizeDump(#[source] std::io::Error),

    #[error("failed to rename PGDATA: {0}")]
    RenamePgData(#[source] std::io::Error),

    #[error("failed to remove old PGDATA: {0}")]
    RemoveOldPgData(#[source] std::io::Error),
}

impl DowngradeError {
    /// The tool failure behind this error, if any.
    pub fn tool_error(&self) -> Option<&ToolError> {
        match self {
            DowngradeError::Tool { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Which binaries an instance runs with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Generation {
    Old,
    New,
}

/// One downgrade run over a single data directory.
pub struct Downgrade<'a> {
    config: &'a ExecuteConfig,
    runner: &'a dyn ProcessRunner,
    state: DataDirectoryState,
    backup_dir: PathBuf,
    dump_file: PathBuf,
    suppressed: Vec<ToolError>,
}

impl<'a> Downgrade<'a> {
    /// Validate preconditions. No tool is invoked and nothing is touched on failure.
    pub fn new(
        config: &'a ExecuteConfig,
        runner: &'a dyn ProcessRunner,
    ) -> Result<Self, DowngradeError> {
        if config.pg_data.as_os_str().is_empty() {
            return Err(DowngradeError::MissingPgData);
        }

        Ok(Self {
            config,
            runner,
            state: DataDirectoryState::Original,
            backup_dir: backup_path(&config.pg_data),
            dump_file: config.pg_data.join(DUMP_FILE),
            suppressed: Vec::new(),
        })
    }

    /// State reached by the last completed transition.
    pub fn state(&self) -> DataDirectoryState {
        self.state
    }

    /// Errors from best-effort stops that were not reported.
    pub fn suppressed(&self) -> &[ToolError] {
        &self.suppressed
    }

    /// Current location of the dump file. It moves with the backup rename.
    pub fn dump_file(&self) -> &Path {
        &self.dump_file
    }

    /// Run every transition in order.
    pub async fn run(&mut self) -> Result<DataDirectoryState, DowngradeError> {
        let span = info_span!(
            "downgrade",
            pg_data = %self.config.pg_data.display(),
            pod = %self.config.pod_name,
            cluster = %self.config.cluster_name,
            namespace = %self.config.namespace,
        );

        async {
            self.prepare().await?;
            self.strip_incompatible_config().await?;
            self.start_instance(Generation::Old).await?;
            self.export().await?;
            self.stop_instance(Generation::Old).await?;
            self.transition(DataDirectoryState::Dumped);
            self.sanitize_dump().await?;
            self.back_up().await?;
            self.initialize().await?;
            self.start_instance(Generation::New).await?;
            self.restore().await?;
            self.stop_instance(Generation::New).await?;
            self.finalize().await?;
            Ok::<_, DowngradeError>(self.state)
        }
        .instrument(span)
        .await
    }

    /// Create the socket directory and refuse to run over a previous partial run.
    async fn prepare(&mut self) -> Result<(), DowngradeError> {
        let socket_dir = &self.config.socket_dir;
        tokio::fs::create_dir_all(socket_dir)
            .await
            .map_err(|source| DowngradeError::SocketDir {
                path: socket_dir.clone(),
                source,
            })?;

        let pg_data = &self.config.pg_data;
        let observed = inspect(pg_data)
            .await
            .map_err(|source| DowngradeError::Inspect {
                path: pg_data.clone(),
                source,
            })?;

        match observed {
            DataDirectoryState::BackedUp | DataDirectoryState::Reinitialized => {
                Err(DowngradeError::PartialDowngrade {
                    backup: self.backup_dir.clone(),
                    state: observed,
                })
            }
            DataDirectoryState::Dumped => {
                warn!(dump = %self.dump_file.display(), "Leftover dump from a previous run will be overwritten");
                Ok(())
            }
            _ => Ok(()),
        }
    }

    async fn strip_incompatible_config(&mut self) -> Result<(), DowngradeError> {
        remove_custom_conf(&self.config.pg_data)
            .await
            .map_err(DowngradeError::RemoveCustomConf)?;
        strip_custom_include(&self.config.pg_data)
            .await
            .map_err(DowngradeError::RewriteConfig)?;
        Ok(())
    }

    async fn start_instance(&mut self, generation: Generation) -> Result<(), DowngradeError> {
        let options = format!(
            "-c listen_addresses='' -c unix_socket_directories='{}'",
            self.config.socket_dir.display()
        );
        let invocation = self
            .pg_ctl(generation)
            .arg("-w")
            .arg("-o")
            .arg(options)
            .arg("start");
        self.invoke("pg_ctl start", invocation).await
    }

    async fn stop_instance(&mut self, generation: Generation) -> Result<(), DowngradeError> {
        let invocation = self.pg_ctl(generation).arg("-w").arg("stop");
        self.invoke("pg_ctl stop", invocation).await
    }

    /// Stop without waiting, keeping any failure out of the reported error.
    async fn stop_quietly(&mut self, generation: Generation) {
        let invocation = self.pg_ctl(generation).arg("stop");
        if let Err(e) = self.runner.run(&invocation).await {
            warn!(error = %e, "Best-effort stop failed");
            self.suppressed.push(e);
        }
    }

    async fn export(&mut self) -> Result<(), DowngradeError> {
        let invocation = self
            .tool(Tool::PgDumpall, Generation::Old)
            .arg("-f")
            .arg(&self.dump_file);

        if let Err(e) = self.invoke("pg_dumpall", invocation).await {
            self.stop_quietly(Generation::Old).await;
            return Err(e);
        }
        Ok(())
    }

    async fn sanitize_dump(&mut self) -> Result<(), DowngradeError> {
        DumpSanitizer::for_target(self.config.target_major)
            .rewrite(&self.dump_file)
            .await
            .map_err(DowngradeError::SanitizeDump)?;
        Ok(())
    }

    async fn back_up(&mut self) -> Result<(), DowngradeError> {
        tokio::fs::rename(&self.config.pg_data, &self.backup_dir)
            .await
            .map_err(DowngradeError::RenamePgData)?;
        self.dump_file = self.backup_dir.join(DUMP_FILE);
        self.transition(DataDirectoryState::BackedUp);
        Ok(())
    }

    async fn initialize(&mut self) -> Result<(), DowngradeError> {
        let invocation = self
            .tool(Tool::Initdb, Generation::New)
            .arg("-D")
            .arg(&self.config.pg_data)
            .arg("--username")
            .arg(&self.config.superuser);
        self.invoke("initdb", invocation).await?;
        self.transition(DataDirectoryState::Reinitialized);
        Ok(())
    }

    async fn restore(&mut self) -> Result<(), DowngradeError> {
        let invocation = self
            .tool(Tool::Psql, Generation::New)
            .arg("-f")
            .arg(&self.dump_file)
            .arg(&self.config.database);

        if let Err(e) = self.invoke("restore", invocation).await {
            self.stop_quietly(Generation::New).await;
            return Err(e);
        }
        self.transition(DataDirectoryState::Restored);
        Ok(())
    }

    async fn finalize(&mut self) -> Result<(), DowngradeError> {
        tokio::fs::remove_dir_all(&self.backup_dir)
            .await
            .map_err(DowngradeError::RemoveOldPgData)?;
        self.transition(DataDirectoryState::Finalized);
        Ok(())
    }

    fn transition(&mut self, next: DataDirectoryState) {
        info!(from = %self.state, to = %next, "Data directory state changed");
        self.state = next;
    }

    fn tool(&self, tool: Tool, generation: Generation) -> Invocation {
        let bin_dir = match generation {
            Generation::Old => self.config.old_bin_dir.as_deref(),
            Generation::New => self.config.new_bin_dir.as_deref(),
        };
        Invocation::new(tool, bin_dir)
            .env("PGHOST", &self.config.socket_dir)
            .env("PGUSER", &self.config.superuser)
    }

    fn pg_ctl(&self, generation: Generation) -> Invocation {
        self.tool(Tool::PgCtl, generation)
            .arg("-D")
            .arg(&self.config.pg_data)
    }

    async fn invoke(
        &self,
        action: &'static str,
        invocation: Invocation,
    ) -> Result<(), DowngradeError> {
        self.runner
            .run(&invocation)
            .await
            .map_err(|source| DowngradeError::Tool { action, source })
    }
}

/// Execute the full downgrade of `config.pg_data`.
///
/// Returns `Finalized` on success. On failure the data directory is left in the
/// state of the last completed step; see [`inspect`] for classifying it afterwards.
pub async fn execute(
    config: &ExecuteConfig,
    runner: &dyn ProcessRunner,
) -> Result<DataDirectoryState, DowngradeError> {
    let mut downgrade = Downgrade::new(config, runner)?;
    match downgrade.run().await {
        Ok(state) => {
            info!(pg_data = %config.pg_data.display(), "Major version downgrade completed");
            Ok(state)
        }
        Err(e) => {
            warn!(
                error = %e,
                state = %downgrade.state(),
                pg_data = %config.pg_data.display(),
                "Major version downgrade failed"
            );
            Err(e)
        }
    }
}
