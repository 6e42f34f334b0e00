//! manager: in-pod entry point
//!
//! Runs inside the downgrade Job created by the reconciler.
//!
//! ## Commands
//! - `manager instance downgrade execute`: downgrade PGDATA to the binaries in PATH
//! - `manager instance downgrade inspect`: report how far a previous run got
//! - `manager bootstrap <dest>`: copy this binary to `dest` (init container)
//!
//! ## Configuration
//! - PGDATA, POD_NAME, CLUSTER_NAME, NAMESPACE, TARGET_MAJOR_VERSION: set on the Job
//! - PGMAJOR_CONFIG: optional YAML file with executor defaults
//! - PGMAJOR_LOG: tracing filter (default: info)

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use tracing::info;

use pgmajor::config::Config;
use pgmajor::executor::{self, DowngradeError, ExecuteConfig};
use pgmajor::process::StreamingRunner;
use pgmajor::utils::bootstrap::{init_tracing, install_self};

/// PostgreSQL instance manager.
#[derive(Parser)]
#[command(name = "manager")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Operations on the local PostgreSQL instance
    Instance {
        #[command(subcommand)]
        action: InstanceAction,
    },

    /// Copy this binary to a shared volume
    Bootstrap {
        /// Destination path
        dest: PathBuf,
    },
}

#[derive(Subcommand)]
enum InstanceAction {
    /// Major version downgrade
    Downgrade {
        #[command(subcommand)]
        action: DowngradeAction,
    },
}

#[derive(Subcommand)]
enum DowngradeAction {
    /// Dump, reinitialize and restore the data directory
    Execute {
        #[command(flatten)]
        target: DataDirArgs,

        /// Name of this pod
        #[arg(long, env = "POD_NAME", default_value = "")]
        pod_name: String,

        /// Name of the owning cluster
        #[arg(long, env = "CLUSTER_NAME", default_value = "")]
        cluster_name: String,

        /// Namespace of the cluster
        #[arg(long, env = "NAMESPACE", default_value = "")]
        namespace: String,

        /// Major version being downgraded to
        #[arg(long, env = "TARGET_MAJOR_VERSION")]
        target_major: Option<u32>,

        /// Configuration file
        #[arg(short, long, env = "PGMAJOR_CONFIG")]
        config: Option<String>,
    },

    /// Print the state of the data directory
    Inspect {
        #[command(flatten)]
        target: DataDirArgs,
    },
}

#[derive(clap::Args)]
struct DataDirArgs {
    /// Data directory
    #[arg(long, env = "PGDATA", default_value = "")]
    pg_data: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Commands::Bootstrap { dest } => install_self(&dest).await?,
        Commands::Instance {
            action: InstanceAction::Downgrade { action },
        } => match action {
            DowngradeAction::Execute {
                target,
                pod_name,
                cluster_name,
                namespace,
                target_major,
                config,
            } => {
                let settings = Config::load(config.as_deref())?;
                let execute_config = ExecuteConfig::new(target.pg_data, &settings.executor)
                    .with_identity(pod_name, cluster_name, namespace)
                    .with_target_major(target_major);

                let state = executor::execute(&execute_config, &StreamingRunner::new()).await?;
                info!(%state, "Downgrade finished");
            }
            DowngradeAction::Inspect { target } => {
                if target.pg_data.is_empty() {
                    return Err(DowngradeError::MissingPgData.into());
                }
                let state = executor::inspect(Path::new(&target.pg_data)).await?;
                println!("{state}");
            }
        },
    }

    Ok(())
}
