//! In-memory process runner for tests.

use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;

use super::{Invocation, ProcessRunner, Tool, ToolError};

/// Dump content containing every clause the sanitizer knows about.
pub const SAMPLE_DUMP: &str = "\
SET default_transaction_read_only = off;
SET transaction_timeout = 0;
CREATE ROLE app;
GRANT pg_read_all_data TO app WITH INHERIT TRUE GRANTED BY postgres;
CREATE DATABASE app WITH TEMPLATE = template0 ENCODING = 'UTF8' LOCALE_PROVIDER = libc LOCALE = 'C';
";

type Predicate = Box<dyn Fn(&Invocation) -> bool + Send + Sync>;
type Hook = Box<dyn Fn(&Invocation) + Send + Sync>;

/// Records invocations and simulates the filesystem effects of the PostgreSQL tools.
///
/// `pg_dumpall -f <file>` writes [`SAMPLE_DUMP`] and `initdb -D <dir>` creates a
/// minimal data directory. Failures are injected with [`FakeRunner::fail_when`];
/// a failing invocation has no effect.
pub struct FakeRunner {
    invocations: Mutex<Vec<Invocation>>,
    failures: Mutex<Vec<Predicate>>,
    hooks: Mutex<Vec<Hook>>,
    initdb_version: u32,
}

impl Default for FakeRunner {
    fn default() -> Self {
        Self::new(15)
    }
}

impl FakeRunner {
    /// Create a runner whose `initdb` writes `PG_VERSION` = `initdb_version`.
    pub fn new(initdb_version: u32) -> Self {
        Self {
            invocations: Mutex::new(Vec::new()),
            failures: Mutex::new(Vec::new()),
            hooks: Mutex::new(Vec::new()),
            initdb_version,
        }
    }

    /// Fail every invocation matching the predicate with exit status 1.
    pub fn fail_when(&self, predicate: impl Fn(&Invocation) -> bool + Send + Sync + 'static) {
        lock(&self.failures).push(Box::new(predicate));
    }

    /// Fail every invocation of `tool`.
    pub fn fail_tool(&self, tool: Tool) {
        self.fail_when(move |inv| inv.tool == tool);
    }

    /// Run `hook` before each invocation is evaluated.
    pub fn on_invoke(&self, hook: impl Fn(&Invocation) + Send + Sync + 'static) {
        lock(&self.hooks).push(Box::new(hook));
    }

    /// All invocations received so far, failed ones included.
    pub fn invocations(&self) -> Vec<Invocation> {
        lock(&self.invocations).clone()
    }

    /// Invocations rendered as `<tool> <args...>` for compact assertions.
    pub fn commands(&self) -> Vec<String> {
        self.invocations()
            .iter()
            .map(|inv| {
                std::iter::once(inv.tool.binary().to_string())
                    .chain(inv.args_lossy())
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .collect()
    }

    /// Number of `pg_ctl` calls with the given action (`start`/`stop`).
    pub fn pg_ctl_count(&self, action: &str) -> usize {
        self.invocations()
            .iter()
            .filter(|inv| inv.tool == Tool::PgCtl && inv.has_arg(action))
            .count()
    }

    fn simulate(&self, invocation: &Invocation) -> std::io::Result<()> {
        match invocation.tool {
            Tool::PgDumpall => {
                if let Some(file) = invocation.flag_value("-f") {
                    std::fs::write(file, SAMPLE_DUMP)?;
                }
            }
            Tool::Initdb => {
                if let Some(dir) = invocation.flag_value("-D") {
                    let dir = Path::new(dir);
                    std::fs::create_dir_all(dir)?;
                    std::fs::write(dir.join("PG_VERSION"), format!("{}\n", self.initdb_version))?;
                    std::fs::write(dir.join("postgresql.conf"), "max_connections = 100\n")?;
                }
            }
            Tool::PgCtl | Tool::Psql => {}
        }
        Ok(())
    }
}

#[async_trait]
impl ProcessRunner for FakeRunner {
    async fn run(&self, invocation: &Invocation) -> Result<(), ToolError> {
        lock(&self.invocations).push(invocation.clone());

        for hook in lock(&self.hooks).iter() {
            hook(invocation);
        }

        let tool = invocation.tool;
        if lock(&self.failures).iter().any(|fail| fail(invocation)) {
            return Err(ToolError::Exit { tool, code: 1 });
        }

        self.simulate(invocation)
            .map_err(|source| ToolError::Spawn { tool, source })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
