//! Mock DowngradeClient implementation for testing.

use std::collections::HashMap;

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use kube::core::ErrorResponse;
use kube::ResourceExt;
use tokio::sync::RwLock;

use super::{DowngradeClient, JobState};
use crate::crd::Cluster;

/// Phase change recorded on a cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedPhase {
    pub cluster: String,
    pub phase: String,
    pub reason: String,
}

/// Mock client that keeps phases and Jobs in memory.
#[derive(Default)]
pub struct MockDowngradeClient {
    phases: RwLock<Vec<RecordedPhase>>,
    jobs: RwLock<HashMap<(String, String), (Job, JobState)>>,
    fail_on_register: RwLock<bool>,
    fail_on_create: RwLock<bool>,
    stale_lookup: RwLock<bool>,
}

fn api_error(code: u16, reason: &str, message: String) -> kube::Error {
    kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message,
        reason: reason.to_string(),
        code,
    })
}

impl MockDowngradeClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_fail_on_register(&self, fail: bool) {
        *self.fail_on_register.write().await = fail;
    }

    pub async fn set_fail_on_create(&self, fail: bool) {
        *self.fail_on_create.write().await = fail;
    }

    /// Make Job lookups miss, like a lagging cache.
    pub async fn set_stale_lookup(&self, stale: bool) {
        *self.stale_lookup.write().await = stale;
    }

    /// Move an existing Job to `state`. Unknown Jobs are ignored.
    pub async fn set_job_state(&self, namespace: &str, name: &str, state: JobState) {
        let key = (namespace.to_string(), name.to_string());
        if let Some(entry) = self.jobs.write().await.get_mut(&key) {
            entry.1 = state;
        }
    }

    /// Seed a Job as if created by an earlier pass.
    pub async fn insert_job(&self, namespace: &str, job: Job, state: JobState) {
        let key = (namespace.to_string(), job.name_any());
        self.jobs.write().await.insert(key, (job, state));
    }

    /// Recorded phase changes, oldest first.
    pub async fn phases(&self) -> Vec<RecordedPhase> {
        self.phases.read().await.clone()
    }

    /// Created Jobs, sorted by name.
    pub async fn jobs(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self
            .jobs
            .read()
            .await
            .values()
            .map(|(job, _)| job.clone())
            .collect();
        jobs.sort_by_key(|j| j.name_any());
        jobs
    }
}

#[async_trait]
impl DowngradeClient for MockDowngradeClient {
    async fn register_phase(
        &self,
        cluster: &Cluster,
        phase: &str,
        reason: &str,
    ) -> Result<(), kube::Error> {
        if *self.fail_on_register.read().await {
            return Err(api_error(
                500,
                "InternalError",
                "simulated status patch failure".to_string(),
            ));
        }
        self.phases.write().await.push(RecordedPhase {
            cluster: cluster.name_any(),
            phase: phase.to_string(),
            reason: reason.to_string(),
        });
        Ok(())
    }

    async fn job_state(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<JobState>, kube::Error> {
        if *self.stale_lookup.read().await {
            return Ok(None);
        }
        let key = (namespace.to_string(), name.to_string());
        Ok(self.jobs.read().await.get(&key).map(|(_, state)| *state))
    }

    async fn create_job(&self, namespace: &str, job: &Job) -> Result<(), kube::Error> {
        if *self.fail_on_create.read().await {
            return Err(api_error(
                500,
                "InternalError",
                "simulated job creation failure".to_string(),
            ));
        }
        let key = (namespace.to_string(), job.name_any());
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&key) {
            return Err(api_error(
                409,
                "AlreadyExists",
                format!("jobs.batch \"{}\" already exists", key.1),
            ));
        }
        jobs.insert(key, (job.clone(), JobState::Active));
        Ok(())
    }
}
