//! Custom Resource Definitions.

mod cluster;

pub use cluster::{
    Cluster, ClusterSpec, ClusterStatus, ImageInfo, CLUSTER_LABEL, INSTANCE_NAME_LABEL,
    INSTANCE_ROLE_LABEL, JOB_ROLE_LABEL, LEGACY_ROLE_LABEL, NODE_SERIAL_ANNOTATION,
    PHASE_MAJOR_UPGRADE, ROLE_PRIMARY,
};
