use std::collections::BTreeMap;
use std::time::Duration;

use k8s_openapi::api::batch::v1::{Job, JobCondition, JobStatus};
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::runtime::controller::Action;
use kube::ResourceExt;

use super::*;
use crate::config::JobConfig;
use crate::crd::{
    Cluster, ClusterSpec, ClusterStatus, ImageInfo, CLUSTER_LABEL, INSTANCE_ROLE_LABEL,
    JOB_ROLE_LABEL, LEGACY_ROLE_LABEL, NODE_SERIAL_ANNOTATION, PHASE_MAJOR_UPGRADE,
};

fn cluster(image: &str, recorded: Option<u32>) -> Cluster {
    let mut cluster = Cluster::new(
        "pg",
        ClusterSpec {
            image_name: image.to_string(),
            instances: 3,
        },
    );
    cluster.metadata.namespace = Some("db".to_string());
    cluster.metadata.uid = Some("0d7a6d43-uid".to_string());
    cluster.status = recorded.map(|major| ClusterStatus {
        pg_data_image_info: Some(ImageInfo {
            image: format!("postgres:{major}"),
            major_version: major,
        }),
        ..Default::default()
    });
    cluster
}

fn pvc(name: &str, role_label: &str, role: &str, serial: Option<&str>) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(BTreeMap::from([(role_label.to_string(), role.to_string())])),
            annotations: serial.map(|s| {
                BTreeMap::from([(NODE_SERIAL_ANNOTATION.to_string(), s.to_string())])
            }),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn instance_pvcs() -> Vec<PersistentVolumeClaim> {
    vec![
        pvc("pg-1", INSTANCE_ROLE_LABEL, "replica", Some("1")),
        pvc("pg-2", INSTANCE_ROLE_LABEL, "primary", Some("2")),
        pvc("pg-3", INSTANCE_ROLE_LABEL, "replica", Some("3")),
    ]
}

fn requeue(config: &JobConfig) -> Option<ReconcileAction> {
    Some(ReconcileAction::Requeue(Duration::from_secs(
        config.requeue_secs,
    )))
}

#[test]
fn test_primary_serial_from_instance_role() {
    assert_eq!(primary_serial(&instance_pvcs()).unwrap(), 2);
}

#[test]
fn test_primary_serial_from_legacy_role() {
    let pvcs = vec![
        pvc("pg-1", LEGACY_ROLE_LABEL, "replica", Some("1")),
        pvc("pg-4", LEGACY_ROLE_LABEL, "primary", Some("4")),
    ];
    assert_eq!(primary_serial(&pvcs).unwrap(), 4);
}

#[test]
fn test_primary_serial_without_primary() {
    let pvcs = vec![pvc("pg-1", INSTANCE_ROLE_LABEL, "replica", Some("1"))];
    assert_eq!(primary_serial(&pvcs).unwrap(), 0);
    assert_eq!(primary_serial(&[]).unwrap(), 0);
}

#[test]
fn test_primary_serial_invalid_annotation() {
    let pvcs = vec![pvc("pg-2", INSTANCE_ROLE_LABEL, "primary", Some("two"))];
    let err = primary_serial(&pvcs).unwrap_err();
    assert!(matches!(err, ReconcileError::NodeSerial { ref pvc, .. } if pvc == "pg-2"));

    let pvcs = vec![pvc("pg-2", INSTANCE_ROLE_LABEL, "primary", None)];
    assert!(matches!(
        primary_serial(&pvcs),
        Err(ReconcileError::NodeSerial { .. })
    ));
}

#[test]
fn test_request_message() {
    let request = DowngradeRequest {
        current_major: 17,
        target_major: 15,
        node_serial: 2,
    };
    assert_eq!(
        request.message(),
        "Downgrading cluster from version 17 to 15"
    );
}

#[tokio::test]
async fn test_no_action_when_not_older() {
    let config = JobConfig::default();
    let cases = [
        ("postgres:17", Some(17)),
        ("postgres:18.1", Some(17)),
        ("postgres:15", None),
    ];

    for (image, recorded) in cases {
        let client = MockDowngradeClient::new();
        let result = reconcile_downgrade(&client, &cluster(image, recorded), &instance_pvcs(), &config)
            .await
            .unwrap();
        assert_eq!(result, None, "image {image} recorded {recorded:?}");
        assert!(client.phases().await.is_empty());
        assert!(client.jobs().await.is_empty());
    }
}

#[tokio::test]
async fn test_invalid_image_is_an_error_without_side_effects() {
    let client = MockDowngradeClient::new();
    let result = reconcile_downgrade(
        &client,
        &cluster("postgres:latest", Some(17)),
        &instance_pvcs(),
        &JobConfig::default(),
    )
    .await;

    assert!(matches!(result, Err(ReconcileError::Version(_))));
    assert!(client.phases().await.is_empty());
    assert!(client.jobs().await.is_empty());
}

#[tokio::test]
async fn test_no_primary_defers_without_side_effects() {
    let client = MockDowngradeClient::new();
    let pvcs = vec![pvc("pg-1", INSTANCE_ROLE_LABEL, "replica", Some("1"))];
    let result = reconcile_downgrade(
        &client,
        &cluster("postgres:15", Some(17)),
        &pvcs,
        &JobConfig::default(),
    )
    .await
    .unwrap();

    assert_eq!(result, None);
    assert!(client.phases().await.is_empty());
    assert!(client.jobs().await.is_empty());
}

#[tokio::test]
async fn test_bad_serial_aborts_before_status_change() {
    let client = MockDowngradeClient::new();
    let pvcs = vec![pvc("pg-2", INSTANCE_ROLE_LABEL, "primary", Some("-1"))];
    let result = reconcile_downgrade(
        &client,
        &cluster("postgres:15", Some(17)),
        &pvcs,
        &JobConfig::default(),
    )
    .await;

    assert!(matches!(result, Err(ReconcileError::NodeSerial { .. })));
    assert!(client.phases().await.is_empty());
}

#[tokio::test]
async fn test_downgrade_17_to_15_schedules_job_on_primary() {
    let client = MockDowngradeClient::new();
    let config = JobConfig::default();
    let cluster = cluster("postgres:15.4", Some(17));

    let result = reconcile_downgrade(&client, &cluster, &instance_pvcs(), &config)
        .await
        .unwrap();
    assert_eq!(result, requeue(&config));

    let phases = client.phases().await;
    assert_eq!(phases.len(), 1);
    assert_eq!(phases[0].cluster, "pg");
    assert_eq!(phases[0].phase, PHASE_MAJOR_UPGRADE);
    assert_eq!(phases[0].reason, "Downgrading cluster from version 17 to 15");

    let jobs = client.jobs().await;
    assert_eq!(jobs.len(), 1);
    let job = &jobs[0];
    assert_eq!(job.name_any(), "pg-2-major-downgrade");
    assert_eq!(job.namespace().as_deref(), Some("db"));
    assert_eq!(job.labels().get(CLUSTER_LABEL).map(String::as_str), Some("pg"));
    assert_eq!(
        job.labels().get(JOB_ROLE_LABEL).map(String::as_str),
        Some(JOB_MAJOR_DOWNGRADE)
    );

    let owner = &job.owner_references()[0];
    assert_eq!(owner.kind, "Cluster");
    assert_eq!(owner.name, "pg");
    assert_eq!(owner.uid, "0d7a6d43-uid");
    assert_eq!(owner.controller, Some(true));

    let spec = job.spec.as_ref().unwrap();
    assert_eq!(spec.backoff_limit, Some(0));
    let pod = spec.template.spec.as_ref().unwrap();
    assert_eq!(pod.restart_policy.as_deref(), Some("Never"));

    let container = &pod.containers[0];
    assert_eq!(container.image.as_deref(), Some("postgres:15.4"));
    assert_eq!(
        container.command.as_deref().unwrap(),
        [
            "/controller/manager",
            "instance",
            "downgrade",
            "execute"
        ]
    );

    let env: BTreeMap<_, _> = container
        .env
        .as_ref()
        .unwrap()
        .iter()
        .map(|e| (e.name.as_str(), e.value.as_deref().unwrap_or_default()))
        .collect();
    assert_eq!(env["PGDATA"], "/var/lib/postgresql/data/pgdata");
    assert_eq!(env["POD_NAME"], "pg-2");
    assert_eq!(env["CLUSTER_NAME"], "pg");
    assert_eq!(env["NAMESPACE"], "db");
    assert_eq!(env["TARGET_MAJOR_VERSION"], "15");

    let claims: Vec<_> = pod
        .volumes
        .as_ref()
        .unwrap()
        .iter()
        .filter_map(|v| v.persistent_volume_claim.as_ref())
        .map(|c| c.claim_name.as_str())
        .collect();
    assert_eq!(claims, ["pg-2"]);

    let init = &pod.init_containers.as_ref().unwrap()[0];
    assert_eq!(init.image.as_deref(), Some(config.operator_image.as_str()));
    assert_eq!(
        init.command.as_deref().unwrap(),
        ["/manager", "bootstrap", "/controller/manager"]
    );
}

#[tokio::test]
async fn test_repeated_passes_create_one_job() {
    let client = MockDowngradeClient::new();
    let config = JobConfig::default();
    let cluster = cluster("postgres:15", Some(17));

    for _ in 0..3 {
        let result = reconcile_downgrade(&client, &cluster, &instance_pvcs(), &config)
            .await
            .unwrap();
        assert_eq!(result, requeue(&config));
    }

    assert_eq!(client.jobs().await.len(), 1);
    assert_eq!(client.phases().await.len(), 1);
}

#[tokio::test]
async fn test_succeeded_job_requeues_without_rescheduling() {
    let client = MockDowngradeClient::new();
    let config = JobConfig::default();
    let cluster = cluster("postgres:15", Some(17));

    reconcile_downgrade(&client, &cluster, &instance_pvcs(), &config)
        .await
        .unwrap();
    client
        .set_job_state("db", "pg-2-major-downgrade", JobState::Succeeded)
        .await;

    let result = reconcile_downgrade(&client, &cluster, &instance_pvcs(), &config)
        .await
        .unwrap();
    assert_eq!(result, requeue(&config));
    assert_eq!(client.phases().await.len(), 1);
}

#[tokio::test]
async fn test_failed_job_stops_requeueing() {
    let client = MockDowngradeClient::new();
    let config = JobConfig::default();
    let cluster = cluster("postgres:15", Some(17));

    reconcile_downgrade(&client, &cluster, &instance_pvcs(), &config)
        .await
        .unwrap();
    client
        .set_job_state("db", "pg-2-major-downgrade", JobState::Failed)
        .await;

    let result = reconcile_downgrade(&client, &cluster, &instance_pvcs(), &config)
        .await
        .unwrap();
    assert_eq!(result, Some(ReconcileAction::Done));
    assert_eq!(client.jobs().await.len(), 1);
    assert_eq!(client.phases().await.len(), 1);
}

#[tokio::test]
async fn test_concurrent_creation_counts_as_scheduled() {
    let client = MockDowngradeClient::new();
    let config = JobConfig::default();
    let cluster = cluster("postgres:15", Some(17));

    reconcile_downgrade(&client, &cluster, &instance_pvcs(), &config)
        .await
        .unwrap();

    // The lookup misses the Job, so the create collides with it.
    client.set_stale_lookup(true).await;
    let result = reconcile_downgrade(&client, &cluster, &instance_pvcs(), &config)
        .await
        .unwrap();

    assert_eq!(result, requeue(&config));
    assert_eq!(client.jobs().await.len(), 1);
}

#[tokio::test]
async fn test_mock_rejects_duplicate_job() {
    let client = MockDowngradeClient::new();
    let config = JobConfig::default();
    let cluster = cluster("postgres:15", Some(17));
    let request = DowngradeRequest {
        current_major: 17,
        target_major: 15,
        node_serial: 2,
    };
    let job = ExecutionUnit::for_request(&cluster, &request, &config)
        .unwrap()
        .to_job(&cluster, &config);

    client.create_job("db", &job).await.unwrap();
    let err = client.create_job("db", &job).await.unwrap_err();
    assert!(matches!(err, kube::Error::Api(ref e) if e.code == 409));
}

#[tokio::test]
async fn test_status_patch_failure_creates_no_job() {
    let client = MockDowngradeClient::new();
    client.set_fail_on_register(true).await;

    let result = reconcile_downgrade(
        &client,
        &cluster("postgres:15", Some(17)),
        &instance_pvcs(),
        &JobConfig::default(),
    )
    .await;

    assert!(matches!(result, Err(ReconcileError::Kube(_))));
    assert!(client.jobs().await.is_empty());
}

#[tokio::test]
async fn test_job_creation_failure_is_reported() {
    let client = MockDowngradeClient::new();
    client.set_fail_on_create(true).await;

    let result = reconcile_downgrade(
        &client,
        &cluster("postgres:15", Some(17)),
        &instance_pvcs(),
        &JobConfig::default(),
    )
    .await;

    assert!(matches!(result, Err(ReconcileError::Kube(_))));
}

#[tokio::test]
async fn test_cluster_without_uid_cannot_own_job() {
    let client = MockDowngradeClient::new();
    let mut cluster = cluster("postgres:15", Some(17));
    cluster.metadata.uid = None;

    let result =
        reconcile_downgrade(&client, &cluster, &instance_pvcs(), &JobConfig::default()).await;

    assert!(matches!(result, Err(ReconcileError::MissingOwner(_))));
    assert!(client.phases().await.is_empty());
}

#[test]
fn test_job_state_from_conditions() {
    let job = |kind: &str, status: &str| Job {
        status: Some(JobStatus {
            conditions: Some(vec![JobCondition {
                type_: kind.to_string(),
                status: status.to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    };

    assert_eq!(JobState::of(&Job::default()), JobState::Active);
    assert_eq!(JobState::of(&job("Complete", "True")), JobState::Succeeded);
    assert_eq!(JobState::of(&job("Failed", "True")), JobState::Failed);
    assert_eq!(JobState::of(&job("Failed", "False")), JobState::Active);
}

#[test]
fn test_reconcile_action_into_controller_action() {
    assert_eq!(
        Action::from(ReconcileAction::Requeue(Duration::from_secs(5))),
        Action::requeue(Duration::from_secs(5))
    );
    assert_eq!(Action::from(ReconcileAction::Done), Action::await_change());
}
