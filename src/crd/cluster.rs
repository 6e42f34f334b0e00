//! PostgreSQL Cluster Custom Resource Definition.
//!
//! Only the fields the major version machinery reads or writes are modelled here.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::version::{self, VersionError};

/// Label carrying the owning cluster name.
pub const CLUSTER_LABEL: &str = "pgmajor.io/cluster";
/// Label carrying the instance name (`<cluster>-<serial>`).
pub const INSTANCE_NAME_LABEL: &str = "pgmajor.io/instanceName";
/// Label carrying the replication role of an instance and its volumes.
pub const INSTANCE_ROLE_LABEL: &str = "pgmajor.io/instanceRole";
/// Older role label still present on volumes created by earlier releases.
pub const LEGACY_ROLE_LABEL: &str = "role";
/// Label identifying the purpose of a Job created for a cluster.
pub const JOB_ROLE_LABEL: &str = "pgmajor.io/jobRole";
/// Annotation holding the node serial of an instance volume.
pub const NODE_SERIAL_ANNOTATION: &str = "pgmajor.io/nodeSerial";

/// Role value of the read/write leader.
pub const ROLE_PRIMARY: &str = "primary";

/// Phase recorded while the on-disk major version is being changed.
pub const PHASE_MAJOR_UPGRADE: &str = "Upgrading Postgres major version";

/// Cluster is the Schema for the clusters API.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "pgmajor.io",
    version = "v1",
    kind = "Cluster",
    plural = "clusters",
    namespaced,
    status = "ClusterStatus",
    printcolumn = r#"{"name":"Instances", "type":"integer", "jsonPath":".spec.instances"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// PostgreSQL image. Its tag declares the desired major version.
    pub image_name: String,

    /// Number of instances in the cluster.
    #[serde(default = "default_instances")]
    pub instances: i32,
}

fn default_instances() -> i32 {
    1
}

/// Observed state of a Cluster.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    /// Current phase.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,

    /// Human readable reason for the current phase.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase_reason: Option<String>,

    /// Image and major version the data directory was last written with.
    #[serde(
        default,
        rename = "pgDataImageInfo",
        skip_serializing_if = "Option::is_none"
    )]
    pub pg_data_image_info: Option<ImageInfo>,
}

/// Image a data directory was initialized or last upgraded with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ImageInfo {
    pub image: String,
    pub major_version: u32,
}

impl Cluster {
    /// Major version declared by `spec.imageName`.
    pub fn requested_major_version(&self) -> Result<u32, VersionError> {
        version::major_from_image(&self.spec.image_name)
    }

    /// Major version recorded for the on-disk data, if any.
    pub fn recorded_major_version(&self) -> Option<u32> {
        self.status
            .as_ref()
            .and_then(|s| s.pg_data_image_info.as_ref())
            .map(|info| info.major_version)
    }

    /// Name of the instance (and its data volume) with the given serial.
    pub fn instance_name(&self, serial: u32) -> String {
        format!("{}-{}", kube::ResourceExt::name_any(self), serial)
    }
}
