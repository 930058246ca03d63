//! `TestCSIStorage`: a 1Gi ReadWriteOnce claim binds, and a pod can mount it and
//! write a file.

use super::{delete_if_present, labelled_meta, shell};
use crate::kube_cluster::KubeCluster;
use e2e_harness::cluster::{wait_for_workload_terminal, ClusterError, WorkloadObserver};
use e2e_harness::environment::{EnvHandle, TestCase};
use e2e_harness::feature::{ensure, Feature, StepError, StepResult};
use e2e_harness::poll::PollBudget;
use k8s_openapi::api::core::v1::{
    Container, PersistentVolumeClaim, PersistentVolumeClaimSpec, PersistentVolumeClaimVolumeSource,
    Pod, PodSpec, Volume, VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

pub const TEST_NAME: &str = "TestCSIStorage";
pub const FEATURE_NAME: &str = "csi/storage";

const PVC_NAME: &str = "test-storage-pvc";
const POD_NAME: &str = "test-storage-pod";
const APP_LABEL: &str = "test-storage";
const CLAIM_SIZE: &str = "1Gi";
const CLAIM_BOUND: &str = "Bound";
const MOUNT_PATH: &str = "/data";

const WRITE_SCRIPT: &str = "echo 'CSI storage test data' > /data/test-file.txt && \
     cat /data/test-file.txt && \
     echo 'Storage test completed successfully'";

#[derive(Default)]
pub struct StorageState {
    claim: Option<String>,
    pod: Option<String>,
}

pub fn test_case() -> TestCase<KubeCluster> {
    TestCase::new(TEST_NAME).feature(
        Feature::<StorageState, KubeCluster>::new(FEATURE_NAME)
            .setup(|s, e| Box::pin(setup(s, e)))
            .assess("storage functionality", |s, e| Box::pin(assess_storage(s, e)))
            .teardown(|s, e| Box::pin(teardown(s, e))),
    )
}

async fn setup(state: &mut StorageState, env: &EnvHandle<KubeCluster>) -> StepResult {
    let claim = new_claim(env.namespace(), PVC_NAME);
    env.client().create(env.namespace(), &claim).await?;
    state.claim = Some(PVC_NAME.to_string());

    wait_for_claim_bound(env, PVC_NAME).await?;

    let pod = new_writer_pod(env.namespace(), POD_NAME, PVC_NAME);
    env.client().create(env.namespace(), &pod).await?;
    state.pod = Some(POD_NAME.to_string());

    // Failed counts as terminal here; Assess reports why
    let status = wait_for_workload_terminal(env, POD_NAME, PollBudget::WorkloadCompletion).await?;
    debug!(pod = %POD_NAME, phase = %status.phase, "Writer pod finished");
    Ok(())
}

async fn assess_storage(state: &mut StorageState, env: &EnvHandle<KubeCluster>) -> StepResult {
    let pod_name = state
        .pod
        .as_deref()
        .ok_or_else(|| StepError::failed("writer pod was not created"))?;
    let status = env
        .client()
        .workload_status(env.namespace(), pod_name)
        .await?;

    ensure(
        status.succeeded_cleanly(),
        format!(
            "pod {pod_name} did not succeed: phase {}, exit code {:?}",
            status.phase, status.exit_code
        ),
    )?;
    info!(pod = %pod_name, "Pod completed successfully (exit code 0)");

    let claim_name = state
        .claim
        .as_deref()
        .ok_or_else(|| StepError::failed("claim was not created"))?;
    let claim: PersistentVolumeClaim = env.client().get(env.namespace(), claim_name).await?;
    let phase = claim_phase(&claim);
    ensure(
        phase == Some(CLAIM_BOUND),
        format!("PVC not bound: expected phase {CLAIM_BOUND}, got {phase:?}"),
    )?;

    let volume = claim
        .spec
        .as_ref()
        .and_then(|spec| spec.volume_name.as_deref())
        .unwrap_or("<unknown>");
    info!(claim = %claim_name, %volume, "PVC is bound");
    Ok(())
}

async fn teardown(state: &mut StorageState, env: &EnvHandle<KubeCluster>) -> StepResult {
    // Pod first so the claim is released
    let pod = delete_if_present::<Pod>(env, state.pod.take()).await;
    let claim = delete_if_present::<PersistentVolumeClaim>(env, state.claim.take()).await;
    pod.and(claim)?;
    Ok(())
}

async fn wait_for_claim_bound(env: &EnvHandle<KubeCluster>, name: &str) -> StepResult {
    PollBudget::VolumeBinding
        .poll(env.cancel_token(), move || async move {
            let claim: PersistentVolumeClaim = env.client().get(env.namespace(), name).await?;
            let phase = claim_phase(&claim);
            debug!(claim = %name, ?phase, "Checked claim phase");
            Ok::<_, ClusterError>(phase == Some(CLAIM_BOUND))
        })
        .await
        .map_err(|e| {
            warn!(claim = %name, error = %e, "PVC not bound");
            StepError::poll(format!("claim {name} to bind"), e)
        })
}

fn claim_phase(claim: &PersistentVolumeClaim) -> Option<&str> {
    claim.status.as_ref().and_then(|s| s.phase.as_deref())
}

pub fn new_claim(namespace: &str, name: &str) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: labelled_meta(namespace, name, APP_LABEL),
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(CLAIM_SIZE.to_string()),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// One-shot pod that writes and reads back a file on the claim.
pub fn new_writer_pod(namespace: &str, name: &str, claim_name: &str) -> Pod {
    Pod {
        metadata: labelled_meta(namespace, name, APP_LABEL),
        spec: Some(PodSpec {
            restart_policy: Some("Never".to_string()),
            containers: vec![Container {
                name: "storage-test".to_string(),
                image: Some("alpine:latest".to_string()),
                command: Some(shell(WRITE_SCRIPT)),
                volume_mounts: Some(vec![VolumeMount {
                    name: "data".to_string(),
                    mount_path: MOUNT_PATH.to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }],
            volumes: Some(vec![Volume {
                name: "data".to_string(),
                persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                    claim_name: claim_name.to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::PersistentVolumeClaimStatus;

    #[test]
    fn test_claim_requests_one_gibibyte_rwo() {
        let spec = new_claim("e2e-ns-abc", PVC_NAME).spec.unwrap();

        assert_eq!(spec.access_modes, Some(vec!["ReadWriteOnce".to_string()]));
        let requests = spec.resources.unwrap().requests.unwrap();
        assert_eq!(requests.get("storage"), Some(&Quantity("1Gi".to_string())));
    }

    #[test]
    fn test_writer_pod_mounts_claim() {
        let spec = new_writer_pod("e2e-ns-abc", POD_NAME, PVC_NAME).spec.unwrap();

        assert_eq!(spec.restart_policy.as_deref(), Some("Never"));
        let volumes = spec.volumes.unwrap();
        assert_eq!(
            volumes[0].persistent_volume_claim.as_ref().unwrap().claim_name,
            PVC_NAME
        );

        let container = &spec.containers[0];
        let mounts = container.volume_mounts.as_ref().unwrap();
        assert_eq!(mounts[0].name, volumes[0].name);
        assert_eq!(mounts[0].mount_path, MOUNT_PATH);
        assert!(container.command.as_ref().unwrap()[2].contains("/data/test-file.txt"));
    }

    #[test]
    fn test_claim_phase() {
        assert_eq!(claim_phase(&PersistentVolumeClaim::default()), None);

        let claim = PersistentVolumeClaim {
            status: Some(PersistentVolumeClaimStatus {
                phase: Some("Bound".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(claim_phase(&claim), Some(CLAIM_BOUND));
    }
}
