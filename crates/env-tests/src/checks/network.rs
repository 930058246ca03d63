//! `TestNetworkConnectivity`: a client pod reaches an nginx deployment through a
//! ClusterIP service.

use super::{app_labels, delete_if_present, labelled_meta, shell, wait_for_deployment_ready};
use crate::kube_cluster::KubeCluster;
use e2e_harness::cluster::wait_for_workload_terminal;
use e2e_harness::environment::{EnvHandle, TestCase};
use e2e_harness::feature::{ensure, Feature, StepError, StepResult};
use e2e_harness::poll::PollBudget;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, Pod, PodSpec, PodTemplateSpec, Service, ServicePort, ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use tracing::{info, warn};

pub const TEST_NAME: &str = "TestNetworkConnectivity";
pub const FEATURE_NAME: &str = "network/connectivity";

const DEPLOYMENT_NAME: &str = "network-test-nginx";
const SERVICE_NAME: &str = "network-test-service";
const CLIENT_POD_NAME: &str = "network-test-client";
const APP_LABEL: &str = "network-test";
const CLIENT_APP_LABEL: &str = "network-test-client";

const SERVER_IMAGE: &str = "cgr.dev/chainguard/nginx";
const CLIENT_IMAGE: &str = "curlimages/curl:latest";
const CONTAINER_PORT: i32 = 8080;
const SERVICE_PORT: i32 = 80;

#[derive(Default)]
pub struct NetworkState {
    deployment: Option<String>,
    service: Option<String>,
}

pub fn test_case() -> TestCase<KubeCluster> {
    TestCase::new(TEST_NAME).feature(
        Feature::<NetworkState, KubeCluster>::new(FEATURE_NAME)
            .setup(|s, e| Box::pin(setup(s, e)))
            .assess("network connectivity", |s, e| {
                Box::pin(assess_connectivity(s, e))
            })
            .teardown(|s, e| Box::pin(teardown(s, e))),
    )
}

async fn setup(state: &mut NetworkState, env: &EnvHandle<KubeCluster>) -> StepResult {
    let deployment = new_server_deployment(env.namespace(), DEPLOYMENT_NAME);
    env.client().create(env.namespace(), &deployment).await?;
    state.deployment = Some(DEPLOYMENT_NAME.to_string());

    wait_for_deployment_ready(env, DEPLOYMENT_NAME).await?;

    let service = new_service(env.namespace(), SERVICE_NAME);
    env.client().create(env.namespace(), &service).await?;
    state.service = Some(SERVICE_NAME.to_string());
    Ok(())
}

async fn assess_connectivity(state: &mut NetworkState, env: &EnvHandle<KubeCluster>) -> StepResult {
    let service = state
        .service
        .as_deref()
        .ok_or_else(|| StepError::failed("service was not created"))?;

    let client = new_client_pod(env.namespace(), CLIENT_POD_NAME, service);
    env.client().create(env.namespace(), &client).await?;

    let outcome =
        wait_for_workload_terminal(env, CLIENT_POD_NAME, PollBudget::WorkloadCompletion).await;

    // The client pod is scoped to this step
    if let Err(e) = env
        .client()
        .delete::<Pod>(env.namespace(), CLIENT_POD_NAME)
        .await
    {
        warn!(pod = %CLIENT_POD_NAME, error = %e, "Failed to delete client pod");
    }

    let status = outcome?;
    ensure(
        status.succeeded_cleanly(),
        format!(
            "client pod did not succeed: phase {}, exit code {:?}",
            status.phase, status.exit_code
        ),
    )?;

    info!(%service, "Client pod successfully connected to service");
    Ok(())
}

async fn teardown(state: &mut NetworkState, env: &EnvHandle<KubeCluster>) -> StepResult {
    let service = delete_if_present::<Service>(env, state.service.take()).await;
    let deployment = delete_if_present::<Deployment>(env, state.deployment.take()).await;
    service.and(deployment)?;
    Ok(())
}

pub fn new_server_deployment(namespace: &str, name: &str) -> Deployment {
    Deployment {
        metadata: labelled_meta(namespace, name, APP_LABEL),
        spec: Some(DeploymentSpec {
            replicas: Some(1),
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
                        image: Some(SERVER_IMAGE.to_string()),
                        ports: Some(vec![ContainerPort {
                            container_port: CONTAINER_PORT,
                            protocol: Some("TCP".to_string()),
                            ..Default::default()
                        }]),
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

pub fn new_service(namespace: &str, name: &str) -> Service {
    Service {
        metadata: labelled_meta(namespace, name, APP_LABEL),
        spec: Some(ServiceSpec {
            selector: Some(app_labels(APP_LABEL)),
            ports: Some(vec![ServicePort {
                port: SERVICE_PORT,
                target_port: Some(IntOrString::Int(CONTAINER_PORT)),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            type_: Some("ClusterIP".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// One-shot pod that curls `service` and exits non-zero on any HTTP or connection error.
pub fn new_client_pod(namespace: &str, name: &str, service: &str) -> Pod {
    let script = format!(
        "echo 'Testing network connectivity to {service}...' && \
         curl -f --max-time 30 --connect-timeout 10 http://{service} && \
         echo 'Network connectivity test successful'"
    );

    Pod {
        metadata: labelled_meta(namespace, name, CLIENT_APP_LABEL),
        spec: Some(PodSpec {
            restart_policy: Some("Never".to_string()),
            containers: vec![Container {
                name: "curl-test".to_string(),
                image: Some(CLIENT_IMAGE.to_string()),
                command: Some(shell(script)),
                ..Default::default()
            }],
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
    fn test_service_routes_to_server_pods() {
        let service = new_service("e2e-ns-abc", SERVICE_NAME).spec.unwrap();
        let deployment = new_server_deployment("e2e-ns-abc", DEPLOYMENT_NAME)
            .spec
            .unwrap();

        assert_eq!(service.type_.as_deref(), Some("ClusterIP"));
        assert_eq!(service.selector, deployment.template.metadata.unwrap().labels);

        let ports = service.ports.unwrap();
        assert_eq!(ports[0].port, 80);
        assert_eq!(ports[0].target_port, Some(IntOrString::Int(8080)));

        let containers = deployment.template.spec.unwrap().containers;
        let container = &containers[0];
        assert_eq!(container.image.as_deref(), Some(SERVER_IMAGE));
        assert_eq!(container.ports.as_ref().unwrap()[0].container_port, 8080);
    }

    #[test]
    fn test_client_pod_targets_service() {
        let pod = new_client_pod("e2e-ns-abc", CLIENT_POD_NAME, SERVICE_NAME);
        let spec = pod.spec.unwrap();

        assert_eq!(spec.restart_policy.as_deref(), Some("Never"));
        let command = spec.containers[0].command.clone().unwrap();
        assert_eq!(command[..2], ["sh".to_string(), "-c".to_string()]);
        assert!(command[2].contains("curl -f --max-time 30 --connect-timeout 10"));
        assert!(command[2].contains("http://network-test-service"));
        // Client pods must not be picked up by the service selector
        assert_ne!(pod.metadata.labels, Some(app_labels(APP_LABEL)));
    }
}
