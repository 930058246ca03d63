//! `TestRealCluster`: a single-replica deployment can be created, becomes ready and
//! can be read back.

use super::{app_labels, delete_if_present, labelled_meta, wait_for_deployment_ready};
use crate::kube_cluster::KubeCluster;
use e2e_harness::environment::{EnvHandle, TestCase};
use e2e_harness::feature::{ensure, Feature, StepResult};
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use tracing::info;

pub const TEST_NAME: &str = "TestRealCluster";
pub const FEATURE_NAME: &str = "appsv1/deployment";

const DEPLOYMENT_NAME: &str = "test-deployment";
const APP_LABEL: &str = "test-app";

#[derive(Default)]
pub struct DeploymentState {
    created: Option<String>,
    observed: Option<Deployment>,
}

pub fn test_case() -> TestCase<KubeCluster> {
    TestCase::new(TEST_NAME).feature(
        Feature::<DeploymentState, KubeCluster>::new(FEATURE_NAME)
            .setup(|s, e| Box::pin(setup(s, e)))
            .assess("deployment creation", |s, e| Box::pin(assess_created(s, e)))
            .teardown(|s, e| Box::pin(teardown(s, e))),
    )
}

async fn setup(state: &mut DeploymentState, env: &EnvHandle<KubeCluster>) -> StepResult {
    let deployment = new_deployment(env.namespace(), DEPLOYMENT_NAME, 1);
    env.client().create(env.namespace(), &deployment).await?;
    state.created = Some(DEPLOYMENT_NAME.to_string());

    wait_for_deployment_ready(env, DEPLOYMENT_NAME).await
}

async fn assess_created(state: &mut DeploymentState, env: &EnvHandle<KubeCluster>) -> StepResult {
    let deployment: Deployment = env.client().get(env.namespace(), DEPLOYMENT_NAME).await?;

    let name = deployment.metadata.name.as_deref().unwrap_or_default();
    ensure(
        name == DEPLOYMENT_NAME,
        format!("expected deployment {DEPLOYMENT_NAME}, got '{name}'"),
    )?;

    info!(
        deployment = %name,
        ready_replicas = deployment.status.as_ref().and_then(|s| s.ready_replicas).unwrap_or(0),
        "Deployment is present"
    );
    state.observed = Some(deployment);
    Ok(())
}

async fn teardown(state: &mut DeploymentState, env: &EnvHandle<KubeCluster>) -> StepResult {
    // Prefer the object read back by Assess; fall back to what Setup created
    let observed = state.observed.take().and_then(|d| d.metadata.name);
    let created = state.created.take();
    delete_if_present::<Deployment>(env, observed.or(created)).await?;
    Ok(())
}

pub fn new_deployment(namespace: &str, name: &str, replicas: i32) -> Deployment {
    Deployment {
        metadata: labelled_meta(namespace, name, APP_LABEL),
        spec: Some(DeploymentSpec {
            replicas: Some(replicas),
            selector: LabelSelector {
                match_labels: Some(app_labels(APP_LABEL)),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(app_labels(APP_LABEL)),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: "nginx".to_string(),
                        image: Some("nginx".to_string()),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    #[test]
    fn test_deployment_selector_matches_template() {
        let deployment = new_deployment("e2e-ns-abc", DEPLOYMENT_NAME, 1);
        let spec = deployment.spec.unwrap();

        assert_eq!(spec.replicas, Some(1));
        assert_eq!(
            spec.selector.match_labels,
            spec.template.metadata.unwrap().labels
        );
        assert_eq!(deployment.metadata.namespace.as_deref(), Some("e2e-ns-abc"));

        let containers = spec.template.spec.unwrap().containers;
        assert_eq!(containers.len(), 1);
        assert_eq!(containers[0].image.as_deref(), Some("nginx"));
    }
}
