//! Settings for rendering the downgrade Job.

use serde::Deserialize;

/// Default location of the manager binary inside the Job pod.
pub const DEFAULT_MANAGER_PATH: &str = "/controller/manager";
/// Default directory for the PostgreSQL unix socket.
pub const DEFAULT_SOCKET_DIR: &str = "/controller/run";

/// Job rendering configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct JobConfig {
    /// Path the manager binary is copied to and executed from.
    pub manager_path: String,
    /// Image providing the manager binary for the bootstrap init container.
    pub operator_image: String,
    /// Mount point of the instance data volume.
    pub pgdata_mount_path: String,
    /// PGDATA inside the mounted volume.
    pub pgdata_path: String,
    /// Directory for the unix socket, backed by an emptyDir.
    pub socket_dir: String,
    /// Delay before the follow-up reconciliation pass.
    pub requeue_secs: u64,
    /// Job backoff limit. Retries are the control loop's business, so 0.
    pub backoff_limit: i32,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            manager_path: DEFAULT_MANAGER_PATH.to_string(),
            operator_image: "ghcr.io/pgmajor/manager:latest".to_string(),
            pgdata_mount_path: "/var/lib/postgresql/data".to_string(),
            pgdata_path: "/var/lib/postgresql/data/pgdata".to_string(),
            socket_dir: DEFAULT_SOCKET_DIR.to_string(),
            requeue_secs: 5,
            backoff_limit: 0,
        }
    }
}

impl JobConfig {
    /// Directory holding the manager binary, shared with the init container.
    pub fn controller_dir(&self) -> &str {
        std::path::Path::new(&self.manager_path)
            .parent()
            .and_then(|p| p.to_str())
            .filter(|p| !p.is_empty())
            .unwrap_or("/controller")
    }
}
