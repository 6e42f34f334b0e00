//! Removal of version-specific configuration before the original instance starts.

use std::io::ErrorKind;
use std::path::Path;
use std::sync::LazyLock;

use regex::bytes::Regex;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use super::sanitize::sibling_tmp;

/// Configuration file holding settings that may not exist in the target version.
pub const CUSTOM_CONF: &str = "custom.conf";
/// Main configuration file of a data directory.
pub const POSTGRESQL_CONF: &str = "postgresql.conf";

static INCLUDE_CUSTOM_CONF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?-u)include.*custom\.conf").unwrap_or_else(|e| {
        panic!("Static pattern 'INCLUDE_CUSTOM_CONF' failed to compile: {e}")
    })
});

/// Delete `custom.conf`. A missing file is not an error.
pub async fn remove_custom_conf(pg_data: &Path) -> std::io::Result<()> {
    let path = pg_data.join(CUSTOM_CONF);
    match tokio::fs::remove_file(&path).await {
        Ok(()) => {
            info!(path = %path.display(), "Removed custom configuration");
            Ok(())
        }
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!(path = %path.display(), "No custom configuration to remove");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Drop every line of `postgresql.conf` that includes `custom.conf`.
///
/// Returns the number of removed lines. The file must exist. The new content is
/// written next to it and renamed over it, keeping the original mode.
pub async fn strip_custom_include(pg_data: &Path) -> std::io::Result<usize> {
    let path = pg_data.join(POSTGRESQL_CONF);
    let content = tokio::fs::read(&path).await?;

    let (kept, removed) = without_custom_include(&content);
    if removed > 0 {
        let tmp_path = sibling_tmp(&path);
        if let Err(e) = replace_file(&path, &tmp_path, &kept).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(e);
        }
        info!(path = %path.display(), removed, "Removed custom.conf include");
    }
    Ok(removed)
}

async fn replace_file(path: &Path, tmp_path: &Path, content: &[u8]) -> std::io::Result<()> {
    let permissions = tokio::fs::metadata(path).await?.permissions();
    let mut file = tokio::fs::File::create(tmp_path).await?;
    file.write_all(content).await?;
    file.sync_all().await?;
    tokio::fs::set_permissions(tmp_path, permissions).await?;
    tokio::fs::rename(tmp_path, path).await
}

fn without_custom_include(content: &[u8]) -> (Vec<u8>, usize) {
    let mut kept = Vec::with_capacity(content.len());
    let mut removed = 0;

    for line in content.split_inclusive(|b| *b == b'\n') {
        if INCLUDE_CUSTOM_CONF.is_match(line) {
            removed += 1;
        } else {
            kept.extend_from_slice(line);
        }
    }
    (kept, removed)
}
