//! Dump rewriting for older target versions.
//!
//! `pg_dumpall` from a newer major emits syntax an older server rejects. Each rule
//! removes one such construct and records the major version that introduced it, so
//! only the rules newer than the target are applied.

use std::borrow::Cow;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::bytes::Regex;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tracing::{debug, info};

/// A construct removed from the dump.
pub struct SanitizeRule {
    /// Short name used in logs.
    pub name: &'static str,
    /// First major version whose `pg_dumpall` emits the construct.
    pub introduced_in: u32,
    pattern: Regex,
}

impl SanitizeRule {
    fn new(name: &'static str, introduced_in: u32, pattern: &str) -> Self {
        let pattern = Regex::new(pattern).unwrap_or_else(|e| {
            panic!("Static sanitizer pattern '{name}' failed to compile: {e}")
        });
        Self {
            name,
            introduced_in,
            pattern,
        }
    }
}

// Patterns run on raw bytes: each database is dumped in its own encoding.
static RULES: LazyLock<Vec<SanitizeRule>> = LazyLock::new(|| {
    vec![
        // CREATE DATABASE ... LOCALE_PROVIDER = libc LOCALE = 'C'
        SanitizeRule::new("locale_provider", 15, r"LOCALE_PROVIDER = \w+ "),
        // GRANT role TO member WITH INHERIT TRUE GRANTED BY postgres;
        SanitizeRule::new("inherit_grant", 16, r" WITH INHERIT TRUE GRANTED BY \w+"),
        SanitizeRule::new("transaction_timeout", 17, r"(?m)^SET transaction_timeout = 0;"),
    ]
});

/// Applies the rules relevant to one target version.
pub struct DumpSanitizer {
    rules: Vec<&'static SanitizeRule>,
}

impl DumpSanitizer {
    /// Select rules for `target_major`. Without a known target every rule applies.
    pub fn for_target(target_major: Option<u32>) -> Self {
        let rules = RULES
            .iter()
            .filter(|rule| target_major.map_or(true, |target| rule.introduced_in > target))
            .collect();
        Self { rules }
    }

    /// Names of the active rules.
    pub fn rule_names(&self) -> Vec<&'static str> {
        self.rules.iter().map(|r| r.name).collect()
    }

    /// Rewrite a single line. The line terminator, if any, is kept as is.
    pub fn sanitize_line<'a>(&self, line: &'a [u8]) -> Cow<'a, [u8]> {
        let mut current = Cow::Borrowed(line);
        for rule in &self.rules {
            let replaced = match rule.pattern.replace_all(&current, &b""[..]) {
                Cow::Owned(replaced) => Some(replaced),
                Cow::Borrowed(_) => None,
            };
            if let Some(replaced) = replaced {
                debug!(rule = rule.name, "Removed incompatible clause");
                current = Cow::Owned(replaced);
            }
        }
        current
    }

    /// Rewrite the dump file in place and return the number of modified lines.
    ///
    /// The output goes to a sibling file that is renamed over the original, so a
    /// failure never leaves a half-written dump behind. Bytes outside the matched
    /// clauses, line terminators included, are copied unchanged.
    pub async fn rewrite(&self, path: &Path) -> std::io::Result<usize> {
        let tmp_path = sibling_tmp(path);
        let result = self.rewrite_into(path, &tmp_path).await;

        match result {
            Ok(changed) => {
                tokio::fs::rename(&tmp_path, path).await?;
                info!(path = %path.display(), changed, rules = ?self.rule_names(), "Dump sanitized");
                Ok(changed)
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&tmp_path).await;
                Err(e)
            }
        }
    }

    async fn rewrite_into(&self, source: &Path, target: &Path) -> std::io::Result<usize> {
        let mut reader = BufReader::new(File::open(source).await?);
        let mut out = BufWriter::new(File::create(target).await?);
        let mut line = Vec::new();
        let mut changed = 0;

        loop {
            line.clear();
            if reader.read_until(b'\n', &mut line).await? == 0 {
                break;
            }
            let sanitized = self.sanitize_line(&line);
            if matches!(sanitized, Cow::Owned(_)) {
                changed += 1;
            }
            out.write_all(&sanitized).await?;
        }

        out.flush().await?;
        out.into_inner().sync_all().await?;
        Ok(changed)
    }
}

/// `<file>.tmp` next to `path`.
pub(super) fn sibling_tmp(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}
