//! On-disk progress detection.
//!
//! The data directory layout is the only record of how far a downgrade got.

use std::path::{Path, PathBuf};

use super::{DataDirectoryState, BACKUP_SUFFIX, DUMP_FILE};

/// Path the original data directory is renamed to.
pub fn backup_path(pg_data: &Path) -> PathBuf {
    let mut name = pg_data.as_os_str().to_os_string();
    name.push(BACKUP_SUFFIX);
    PathBuf::from(name)
}

/// Classify the layout around `pg_data`.
///
/// Whether a dump was already replayed into a reinitialized directory cannot be
/// told from the filesystem, so both cases report `Reinitialized`.
pub async fn inspect(pg_data: &Path) -> std::io::Result<DataDirectoryState> {
    let backup = backup_path(pg_data);

    if tokio::fs::try_exists(&backup).await? {
        return Ok(if tokio::fs::try_exists(pg_data).await? {
            DataDirectoryState::Reinitialized
        } else {
            DataDirectoryState::BackedUp
        });
    }

    if tokio::fs::try_exists(pg_data.join(DUMP_FILE)).await? {
        Ok(DataDirectoryState::Dumped)
    } else {
        Ok(DataDirectoryState::Original)
    }
}
