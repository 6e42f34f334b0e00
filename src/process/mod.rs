//! External tool execution.
//!
//! PostgreSQL binaries are driven as opaque processes: the exit status is the only
//! contract. Output is forwarded line by line to tracing so it shows up in the Job
//! logs, but never parsed.

#[cfg(any(test, feature = "test-utils"))]
mod fake;

#[cfg(any(test, feature = "test-utils"))]
pub use fake::{FakeRunner, SAMPLE_DUMP};

use std::ffi::{OsStr, OsString};
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, error, info, warn};

/// PostgreSQL binaries used by the downgrade sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tool {
    PgCtl,
    PgDumpall,
    Initdb,
    Psql,
}

impl Tool {
    /// Executable name.
    pub fn binary(&self) -> &'static str {
        match self {
            Tool::PgCtl => "pg_ctl",
            Tool::PgDumpall => "pg_dumpall",
            Tool::Initdb => "initdb",
            Tool::Psql => "psql",
        }
    }
}

impl fmt::Display for Tool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.binary())
    }
}

/// Errors raised by a single tool invocation.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("failed to spawn {tool}: {source}")]
    Spawn {
        tool: Tool,
        #[source]
        source: std::io::Error,
    },

    #[error("{tool} exited with status {code}")]
    Exit { tool: Tool, code: i32 },

    #[error("{tool} was terminated by a signal")]
    Signaled { tool: Tool },
}

impl ToolError {
    /// Tool that failed.
    pub fn tool(&self) -> Tool {
        match self {
            ToolError::Spawn { tool, .. }
            | ToolError::Exit { tool, .. }
            | ToolError::Signaled { tool } => *tool,
        }
    }
}

/// A fully resolved command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub tool: Tool,
    /// Executable path, either bare (PATH lookup) or inside a bin directory.
    pub program: PathBuf,
    pub args: Vec<OsString>,
    /// Variables added on top of the inherited environment.
    pub env: Vec<(String, OsString)>,
}

impl Invocation {
    /// Build an invocation, resolving the executable inside `bin_dir` when given.
    pub fn new(tool: Tool, bin_dir: Option<&Path>) -> Self {
        let program = match bin_dir {
            Some(dir) => dir.join(tool.binary()),
            None => PathBuf::from(tool.binary()),
        };
        Self {
            tool,
            program,
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn env(mut self, key: &str, value: impl AsRef<OsStr>) -> Self {
        self.env.push((key.to_string(), value.as_ref().to_os_string()));
        self
    }

    /// Arguments as lossy UTF-8, for logs and assertions.
    pub fn args_lossy(&self) -> Vec<String> {
        self.args
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    /// Value following `flag` in the argument list.
    pub fn flag_value(&self, flag: &str) -> Option<&OsStr> {
        self.args
            .iter()
            .position(|a| a == flag)
            .and_then(|i| self.args.get(i + 1))
            .map(OsString::as_os_str)
    }

    /// Whether any argument equals `arg`.
    pub fn has_arg(&self, arg: &str) -> bool {
        self.args.iter().any(|a| a == arg)
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

/// Runs external tools to completion.
///
/// Implementations:
/// - `StreamingRunner`: spawns real processes
/// - `FakeRunner`: records invocations and simulates their effects (tests only)
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    /// Run the invocation and wait for it to exit.
    ///
    /// A non-zero exit is an error. There is no timeout and no retry.
    async fn run(&self, invocation: &Invocation) -> Result<(), ToolError>;
}

/// Spawns processes and streams their output into tracing.
#[derive(Debug, Default, Clone)]
pub struct StreamingRunner;

impl StreamingRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ProcessRunner for StreamingRunner {
    async fn run(&self, invocation: &Invocation) -> Result<(), ToolError> {
        let tool = invocation.tool;
        info!(command = %invocation, "Running {}", tool);

        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args)
            .envs(invocation.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|source| {
            error!(program = %invocation.program.display(), error = %source, "Failed to spawn process");
            ToolError::Spawn { tool, source }
        })?;

        let stdout = child
            .stdout
            .take()
            .map(|out| tokio::spawn(forward(tool, "stdout", out)));
        let stderr = child
            .stderr
            .take()
            .map(|err| tokio::spawn(forward(tool, "stderr", err)));

        let status = child
            .wait()
            .await
            .map_err(|source| ToolError::Spawn { tool, source })?;

        for handle in [stdout, stderr].into_iter().flatten() {
            if let Err(e) = handle.await {
                warn!(tool = %tool, error = %e, "Output forwarding task failed");
            }
        }

        debug!(tool = %tool, status = ?status, "Process exited");

        if status.success() {
            Ok(())
        } else {
            match status.code() {
                Some(code) => Err(ToolError::Exit { tool, code }),
                None => Err(ToolError::Signaled { tool }),
            }
        }
    }
}

/// Forward every line of a child stream to tracing.
///
/// Lines are decoded lossily; the stream is drained to the end so the child never
/// blocks on a full pipe.
async fn forward<R>(tool: Tool, stream: &'static str, reader: R)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&line);
                info!(tool = %tool, stream, "{}", text.trim_end_matches(['\r', '\n']));
            }
            Err(e) => {
                debug!(tool = %tool, stream, error = %e, "Stopped reading process output");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invocation_resolves_bin_dir() {
        let inv = Invocation::new(Tool::Initdb, Some(Path::new("/usr/lib/postgresql/15/bin")));
        assert_eq!(inv.program, PathBuf::from("/usr/lib/postgresql/15/bin/initdb"));

        let inv = Invocation::new(Tool::PgCtl, None);
        assert_eq!(inv.program, PathBuf::from("pg_ctl"));
    }

    #[test]
    fn test_invocation_flag_value_and_display() {
        let inv = Invocation::new(Tool::PgDumpall, None)
            .arg("-f")
            .arg("/data/dump.sql");
        assert_eq!(inv.flag_value("-f"), Some(OsStr::new("/data/dump.sql")));
        assert_eq!(inv.flag_value("-D"), None);
        assert!(inv.has_arg("-f"));
        assert_eq!(inv.to_string(), "pg_dumpall -f /data/dump.sql");
    }

    #[tokio::test]
    async fn test_streaming_runner_success() {
        let inv = Invocation {
            tool: Tool::Psql,
            program: PathBuf::from("sh"),
            args: vec!["-c".into(), "echo hello; echo oops >&2".into()],
            env: vec![],
        };
        StreamingRunner::new().run(&inv).await.unwrap();
    }

    #[tokio::test]
    async fn test_streaming_runner_drains_non_utf8_output() {
        // Far more than a pipe buffer of LATIN1 text.
        let inv = Invocation {
            tool: Tool::PgDumpall,
            program: PathBuf::from("sh"),
            args: vec![
                "-c".into(),
                "yes \"$(printf 'caf\\351')\" | head -n 50000; printf 'r\\351sum\\351' >&2".into(),
            ],
            env: vec![],
        };
        let result = tokio::time::timeout(
            std::time::Duration::from_secs(30),
            StreamingRunner::new().run(&inv),
        )
        .await
        .expect("runner should not block on undrained output");
        result.unwrap();
    }

    #[tokio::test]
    async fn test_streaming_runner_reports_exit_code() {
        let inv = Invocation {
            tool: Tool::PgDumpall,
            program: PathBuf::from("sh"),
            args: vec!["-c".into(), "exit 3".into()],
            env: vec![],
        };
        let err = StreamingRunner::new().run(&inv).await.unwrap_err();
        assert!(matches!(err, ToolError::Exit { tool: Tool::PgDumpall, code: 3 }));
        assert_eq!(err.to_string(), "pg_dumpall exited with status 3");
    }

    #[tokio::test]
    async fn test_streaming_runner_passes_env() {
        let inv = Invocation {
            tool: Tool::Psql,
            program: PathBuf::from("sh"),
            args: vec!["-c".into(), "test \"$PGHOST\" = /tmp/sock".into()],
            env: vec![("PGHOST".into(), "/tmp/sock".into())],
        };
        StreamingRunner::new().run(&inv).await.unwrap();
    }

    #[tokio::test]
    async fn test_streaming_runner_spawn_failure() {
        let inv = Invocation::new(Tool::Initdb, Some(Path::new("/nonexistent/bin")));
        let err = StreamingRunner::new().run(&inv).await.unwrap_err();
        assert!(matches!(err, ToolError::Spawn { tool: Tool::Initdb, .. }));
        assert_eq!(err.tool(), Tool::Initdb);
    }
}
