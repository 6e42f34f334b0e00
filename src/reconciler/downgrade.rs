//! Major version downgrade trigger.
//!
//! Compares the major version recorded for the on-disk data with the one declared by
//! the Cluster image and, when the declared one is older, schedules a single Job on
//! the primary's data volume that runs `manager instance downgrade execute`.

use std::collections::BTreeMap;
use std::time::Duration;

use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, EmptyDirVolumeSource, EnvVar, PersistentVolumeClaim,
    PersistentVolumeClaimVolumeSource, PodSpec, PodTemplateSpec, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::{Resource, ResourceExt};
use tracing::{info, warn};

use super::{DowngradeClient, JobState, ReconcileAction, ReconcileError};
use crate::config::{
    JobConfig, CLUSTER_NAME_ENV_VAR, NAMESPACE_ENV_VAR, PGDATA_ENV_VAR, POD_NAME_ENV_VAR,
    TARGET_MAJOR_ENV_VAR,
};
use crate::crd::{
    Cluster, CLUSTER_LABEL, INSTANCE_NAME_LABEL, INSTANCE_ROLE_LABEL, JOB_ROLE_LABEL,
    LEGACY_ROLE_LABEL, NODE_SERIAL_ANNOTATION, PHASE_MAJOR_UPGRADE, ROLE_PRIMARY,
};

/// Job role of the downgrade Job.
pub const JOB_MAJOR_DOWNGRADE: &str = "major-downgrade";

const PGDATA_VOLUME: &str = "pgdata";
const SOCKET_VOLUME: &str = "socket";
const CONTROLLER_VOLUME: &str = "controller";

/// A downgrade decided in this reconciliation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DowngradeRequest {
    pub current_major: u32,
    pub target_major: u32,
    /// Serial of the primary instance whose volume is downgraded.
    pub node_serial: u32,
}

impl DowngradeRequest {
    /// Phase reason recorded on the Cluster.
    pub fn message(&self) -> String {
        format!(
            "Downgrading cluster from version {} to {}",
            self.current_major, self.target_major
        )
    }
}

/// Serial of the primary instance, or 0 when no PVC is labelled primary.
///
/// A primary PVC whose serial annotation is missing or malformed is an error.
pub fn primary_serial(pvcs: &[PersistentVolumeClaim]) -> Result<u32, ReconcileError> {
    for pvc in pvcs {
        let role = pvc.metadata.labels.as_ref().and_then(|labels| {
            labels
                .get(INSTANCE_ROLE_LABEL)
                .or_else(|| labels.get(LEGACY_ROLE_LABEL))
        });
        if role.map(String::as_str) != Some(ROLE_PRIMARY) {
            continue;
        }

        let serial = pvc
            .annotations()
            .get(NODE_SERIAL_ANNOTATION)
            .ok_or_else(|| ReconcileError::NodeSerial {
                pvc: pvc.name_any(),
                reason: format!("missing {NODE_SERIAL_ANNOTATION} annotation"),
            })?;

        return serial.parse().map_err(|e| ReconcileError::NodeSerial {
            pvc: pvc.name_any(),
            reason: format!("{serial:?}: {e}"),
        });
    }
    Ok(0)
}

/// One-shot, node-pinned task running the downgrade executor.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionUnit {
    pub name: String,
    pub command: Vec<String>,
    pub owner: OwnerReference,
    /// Serial of the instance whose volume the Job mounts.
    pub target_node: u32,
    pub target_major: u32,
}

impl ExecutionUnit {
    /// Deterministic Job name, so a second scheduling attempt collides.
    pub fn job_name(cluster_name: &str, serial: u32) -> String {
        format!("{cluster_name}-{serial}-{JOB_MAJOR_DOWNGRADE}")
    }

    /// Describe the unit for `request`, owned by `cluster`.
    pub fn for_request(
        cluster: &Cluster,
        request: &DowngradeRequest,
        config: &JobConfig,
    ) -> Result<Self, ReconcileError> {
        let owner = cluster
            .controller_owner_ref(&())
            .ok_or_else(|| ReconcileError::MissingOwner(cluster.name_any()))?;

        Ok(Self {
            name: Self::job_name(&cluster.name_any(), request.node_serial),
            command: vec![
                config.manager_path.clone(),
                "instance".to_string(),
                "downgrade".to_string(),
                "execute".to_string(),
            ],
            owner,
            target_node: request.node_serial,
            target_major: request.target_major,
        })
    }

    /// Render the batch/v1 Job.
    ///
    /// The instance PVC is mounted read-write, so the pod lands where the primary's
    /// data lives. Runtime parameters reach the executor through the environment.
    pub fn to_job(&self, cluster: &Cluster, config: &JobConfig) -> Job {
        let cluster_name = cluster.name_any();
        let namespace = cluster.namespace().unwrap_or_default();
        let instance_name = cluster.instance_name(self.target_node);

        let labels = BTreeMap::from([
            (CLUSTER_LABEL.to_string(), cluster_name.clone()),
            (INSTANCE_NAME_LABEL.to_string(), instance_name.clone()),
            (JOB_ROLE_LABEL.to_string(), JOB_MAJOR_DOWNGRADE.to_string()),
        ]);

        let env = [
            (PGDATA_ENV_VAR, config.pgdata_path.clone()),
            (POD_NAME_ENV_VAR, instance_name.clone()),
            (CLUSTER_NAME_ENV_VAR, cluster_name),
            (NAMESPACE_ENV_VAR, namespace.clone()),
            (TARGET_MAJOR_ENV_VAR, self.target_major.to_string()),
        ]
        .into_iter()
        .map(|(name, value)| EnvVar {
            name: name.to_string(),
            value: Some(value),
            value_from: None,
        })
        .collect();

        let controller_mount = VolumeMount {
            name: CONTROLLER_VOLUME.to_string(),
            mount_path: config.controller_dir().to_string(),
            ..Default::default()
        };

        let bootstrap = Container {
            name: "bootstrap-controller".to_string(),
            image: Some(config.operator_image.clone()),
            command: Some(vec![
                "/manager".to_string(),
                "bootstrap".to_string(),
                config.manager_path.clone(),
            ]),
            volume_mounts: Some(vec![controller_mount.clone()]),
            ..Default::default()
        };

        let downgrade = Container {
            name: JOB_MAJOR_DOWNGRADE.to_string(),
            image: Some(cluster.spec.image_name.clone()),
            command: Some(self.command.clone()),
            env: Some(env),
            volume_mounts: Some(vec![
                VolumeMount {
                    name: PGDATA_VOLUME.to_string(),
                    mount_path: config.pgdata_mount_path.clone(),
                    ..Default::default()
                },
                VolumeMount {
                    name: SOCKET_VOLUME.to_string(),
                    mount_path: config.socket_dir.clone(),
                    ..Default::default()
                },
                controller_mount,
            ]),
            ..Default::default()
        };

        let volumes = vec![
            Volume {
                name: PGDATA_VOLUME.to_string(),
                persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                    claim_name: instance_name,
                    read_only: None,
                }),
                ..Default::default()
            },
            Volume {
                name: SOCKET_VOLUME.to_string(),
                empty_dir: Some(EmptyDirVolumeSource::default()),
                ..Default::default()
            },
            Volume {
                name: CONTROLLER_VOLUME.to_string(),
                empty_dir: Some(EmptyDirVolumeSource::default()),
                ..Default::default()
            },
        ];

        Job {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(namespace),
                labels: Some(labels.clone()),
                owner_references: Some(vec![self.owner.clone()]),
                ..Default::default()
            },
            spec: Some(JobSpec {
                backoff_limit: Some(config.backoff_limit),
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(labels),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        restart_policy: Some("Never".to_string()),
                        init_containers: Some(vec![bootstrap]),
                        containers: vec![downgrade],
                        volumes: Some(volumes),
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            status: None,
        }
    }
}

/// Start a major version downgrade when the declared version is older than the data.
///
/// Returns `Ok(None)` when there is nothing to do here, so the caller continues with
/// the rest of its reconciliation. Returns an action once a downgrade is scheduled or
/// already outstanding. The downgrade itself runs asynchronously in the Job.
pub async fn reconcile_downgrade(
    client: &dyn DowngradeClient,
    cluster: &Cluster,
    pvcs: &[PersistentVolumeClaim],
    config: &JobConfig,
) -> Result<Option<ReconcileAction>, ReconcileError> {
    let requested_major = cluster.requested_major_version()?;

    let Some(current_major) = cluster.recorded_major_version() else {
        return Ok(None);
    };
    if requested_major >= current_major {
        return Ok(None);
    }

    let node_serial = primary_serial(pvcs)?;
    if node_serial == 0 {
        info!(cluster = %cluster.name_any(), "No primary volume found, postponing downgrade");
        return Ok(None);
    }

    let namespace = cluster
        .namespace()
        .ok_or_else(|| ReconcileError::MissingNamespace(cluster.name_any()))?;

    let request = DowngradeRequest {
        current_major,
        target_major: requested_major,
        node_serial,
    };
    let unit = ExecutionUnit::for_request(cluster, &request, config)?;
    let requeue = ReconcileAction::Requeue(Duration::from_secs(config.requeue_secs));

    match client.job_state(&namespace, &unit.name).await? {
        Some(JobState::Failed) => {
            warn!(
                job = %unit.name,
                "Downgrade job failed, delete it after inspecting the data directory to retry"
            );
            return Ok(Some(ReconcileAction::Done));
        }
        Some(state) => {
            info!(job = %unit.name, ?state, "Downgrade job already scheduled");
            return Ok(Some(requeue));
        }
        None => {}
    }

    client
        .register_phase(cluster, PHASE_MAJOR_UPGRADE, &request.message())
        .await?;

    let job = unit.to_job(cluster, config);
    match client.create_job(&namespace, &job).await {
        Ok(()) => {
            info!(
                job = %unit.name,
                from = current_major,
                to = requested_major,
                node_serial,
                "Scheduled major version downgrade"
            );
        }
        Err(kube::Error::Api(err)) if err.code == 409 => {
            info!(job = %unit.name, "Downgrade job created concurrently");
        }
        Err(e) => return Err(e.into()),
    }

    Ok(Some(requeue))
}
