//! The conformance checks and the helpers they share.

pub mod deployment;
pub mod network;
pub mod rbac;
pub mod storage;

use crate::kube_cluster::{KubeCluster, NamespacedObject};
use e2e_harness::cluster::ClusterError;
use e2e_harness::environment::{EnvHandle, TestCase};
use e2e_harness::feature::StepError;
use e2e_harness::poll::PollBudget;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Every check in run order.
pub fn suite() -> Vec<TestCase<KubeCluster>> {
    vec![
        deployment::test_case(),
        storage::test_case(),
        network::test_case(),
        rbac::test_case(),
    ]
}

/// Metadata with a name and a single `app` label.
pub(crate) fn labelled_meta(namespace: &str, name: &str, app: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        labels: Some(app_labels(app)),
        ..Default::default()
    }
}

pub(crate) fn app_labels(app: &str) -> BTreeMap<String, String> {
    BTreeMap::from([("app".to_string(), app.to_string())])
}

pub(crate) fn shell(script: impl Into<String>) -> Vec<String> {
    vec!["sh".to_string(), "-c".to_string(), script.into()]
}

/// All desired replicas report ready. A missing replica count means the default of one.
pub(crate) fn deployment_ready(deployment: &Deployment) -> bool {
    let desired = deployment
        .spec
        .as_ref()
        .and_then(|spec| spec.replicas)
        .unwrap_or(1);
    let ready = deployment
        .status
        .as_ref()
        .and_then(|status| status.ready_replicas)
        .unwrap_or(0);
    ready == desired
}

pub(crate) async fn wait_for_deployment_ready(
    env: &EnvHandle<KubeCluster>,
    name: &str,
) -> Result<(), StepError> {
    PollBudget::DeploymentReady
        .poll(env.cancel_token(), move || async move {
            let deployment: Deployment = env.client().get(env.namespace(), name).await?;
            let ready = deployment_ready(&deployment);
            debug!(deployment = %name, ready, "Checked deployment readiness");
            Ok::<_, ClusterError>(ready)
        })
        .await
        .map_err(|e| StepError::poll(format!("deployment {name} to become ready"), e))
}

/// Delete `name` if a step recorded it. An object that is already gone is not an error.
pub(crate) async fn delete_if_present<K: NamespacedObject>(
    env: &EnvHandle<KubeCluster>,
    name: Option<String>,
) -> Result<(), ClusterError> {
    let Some(name) = name else {
        return Ok(());
    };
    match env.client().delete::<K>(env.namespace(), &name).await {
        Err(e) if e.is_not_found() => Ok(()),
        Err(e) => {
            warn!(object = %name, error = %e, "Failed to delete object");
            Err(e)
        }
        Ok(()) => Ok(()),
    }
}
