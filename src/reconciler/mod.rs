//! Reconciliation logic for Cluster resources.
//!
//! Only the major version downgrade path lives here. The surrounding control loop
//! fetches the Cluster and its PVCs and calls [`reconcile_downgrade`] on every pass:
//!
//! ```ignore
//! let client = KubeDowngradeClient::new(kube_client.clone());
//! if let Some(action) = reconcile_downgrade(&client, &cluster, &pvcs, &config.job).await? {
//!     return Ok(action.into());
//! }
//! ```

mod downgrade;

#[cfg(any(test, feature = "test-utils"))]
mod mock;

#[cfg(test)]
mod tests;

pub use downgrade::{
    primary_serial, reconcile_downgrade, DowngradeRequest, ExecutionUnit, JOB_MAJOR_DOWNGRADE,
};

#[cfg(any(test, feature = "test-utils"))]
pub use mock::{MockDowngradeClient, RecordedPhase};

use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use kube::api::{Patch, PatchParams, PostParams};
use kube::runtime::controller::Action;
use kube::{Api, Client, ResourceExt};
use serde_json::json;
use tracing::debug;

use crate::crd::Cluster;
use crate::version::VersionError;

/// Errors that abort a reconciliation pass.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("Invalid PostgreSQL image: {0}")]
    Version(#[from] VersionError),

    #[error("Invalid node serial on PVC {pvc}: {reason}")]
    NodeSerial { pvc: String, reason: String },

    #[error("Cluster {0} must be namespaced")]
    MissingNamespace(String),

    #[error("Cluster {0} has no uid and cannot own the downgrade job")]
    MissingOwner(String),

    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),
}

/// What the control loop should do after this pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileAction {
    /// Requeue after the specified duration.
    Requeue(Duration),
    /// Don't requeue until the Cluster changes.
    Done,
}

impl From<ReconcileAction> for Action {
    fn from(action: ReconcileAction) -> Self {
        match action {
            ReconcileAction::Requeue(after) => Action::requeue(after),
            ReconcileAction::Done => Action::await_change(),
        }
    }
}

/// Lifecycle of an existing Job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Active,
    Succeeded,
    Failed,
}

impl JobState {
    /// Derive the state from the Job's terminal conditions.
    pub fn of(job: &Job) -> Self {
        let conditions = job
            .status
            .as_ref()
            .and_then(|s| s.conditions.as_ref())
            .map(Vec::as_slice)
            .unwrap_or_default();

        let holds = |kind: &str| {
            conditions
                .iter()
                .any(|c| c.type_ == kind && c.status == "True")
        };

        if holds("Complete") {
            JobState::Succeeded
        } else if holds("Failed") {
            JobState::Failed
        } else {
            JobState::Active
        }
    }
}

/// Cluster API operations the downgrade trigger needs.
///
/// Implementations:
/// - `KubeDowngradeClient`: Kubernetes API server
/// - `MockDowngradeClient`: in-memory (tests only)
#[async_trait]
pub trait DowngradeClient: Send + Sync {
    /// Record the phase and its reason on the Cluster status.
    async fn register_phase(
        &self,
        cluster: &Cluster,
        phase: &str,
        reason: &str,
    ) -> Result<(), kube::Error>;

    /// Look up a Job by name.
    async fn job_state(&self, namespace: &str, name: &str)
        -> Result<Option<JobState>, kube::Error>;

    /// Create a Job. An existing Job with the same name is a 409 API error.
    async fn create_job(&self, namespace: &str, job: &Job) -> Result<(), kube::Error>;
}

/// Field manager used for status patches.
const FIELD_MANAGER: &str = "pgmajor";

/// Kubernetes-backed client.
#[derive(Clone)]
pub struct KubeDowngradeClient {
    client: Client,
}

impl KubeDowngradeClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl DowngradeClient for KubeDowngradeClient {
    async fn register_phase(
        &self,
        cluster: &Cluster,
        phase: &str,
        reason: &str,
    ) -> Result<(), kube::Error> {
        let namespace = cluster.namespace().unwrap_or_default();
        let clusters: Api<Cluster> = Api::namespaced(self.client.clone(), &namespace);
        let patch = json!({
            "status": {
                "phase": phase,
                "phaseReason": reason,
            }
        });

        debug!(cluster = %cluster.name_any(), phase, "Patching cluster status");
        clusters
            .patch_status(
                &cluster.name_any(),
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&patch),
            )
            .await?;
        Ok(())
    }

    async fn job_state(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<JobState>, kube::Error> {
        let jobs: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        Ok(jobs.get_opt(name).await?.as_ref().map(JobState::of))
    }

    async fn create_job(&self, namespace: &str, job: &Job) -> Result<(), kube::Error> {
        let jobs: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        jobs.create(&PostParams::default(), job).await?;
        Ok(())
    }
}
