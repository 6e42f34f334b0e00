//! Bootstrap utilities for the manager binary.
//!
//! Shared initialization for every subcommand, plus the self-copy performed by the
//! Job's init container.

use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LOG_ENV_VAR;

/// Mode of the installed manager binary.
const EXECUTABLE_MODE: u32 = 0o755;

/// Initialize tracing with PGMAJOR_LOG environment variable.
///
/// Defaults to "info" level if PGMAJOR_LOG is not set.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env(LOG_ENV_VAR)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Copy the running executable to `dest` so another container can run it.
pub async fn install_self(dest: &Path) -> io::Result<()> {
    let current = std::env::current_exe()?;
    install_executable(&current, dest).await
}

/// Copy `source` to `dest` and mark it executable, creating parent directories.
pub async fn install_executable(source: &Path, dest: &Path) -> io::Result<()> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let bytes = tokio::fs::copy(source, dest).await?;
    tokio::fs::set_permissions(dest, std::fs::Permissions::from_mode(EXECUTABLE_MODE)).await?;

    info!(
        source = %source.display(),
        dest = %dest.display(),
        bytes,
        "Installed manager binary"
    );
    Ok(())
}
