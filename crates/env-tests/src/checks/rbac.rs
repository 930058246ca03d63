//! `TestRBACPermissions`: a service account with no bindings is refused
//! cluster-wide reads and writes but can still use discovery.
//!
//! Each check runs one kubectl command in a pod under the service account. A
//! denied check is recognised by the pod failing, or its container exiting
//! non-zero. Any non-zero exit counts, so a check pod that crashes for unrelated
//! reasons also reads as "denied".

use super::{delete_if_present, labelled_meta, shell};
use crate::kube_cluster::KubeCluster;
use e2e_harness::cluster::{wait_for_workload_terminal, WorkloadStatus};
use e2e_harness::environment::{EnvHandle, TestCase};
use e2e_harness::feature::{Feature, StepError, StepResult};
use e2e_harness::poll::PollBudget;
use k8s_openapi::api::core::v1::{Container, Pod, PodSpec, ServiceAccount};
use tracing::{info, warn};

pub const TEST_NAME: &str = "TestRBACPermissions";
pub const FEATURE_NAME: &str = "rbac/permissions";

const SERVICE_ACCOUNT_NAME: &str = "rbac-test-sa";
const APP_LABEL: &str = "rbac-test";
const KUBECTL_IMAGE: &str = "bitnami/kubectl:latest";

/// What a check's outcome has to be for it to pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expectation {
    Denied,
    Allowed,
    /// Outcome is logged only; clusters differ here.
    Informational,
}

/// One kubectl command run under the service account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionCheck {
    pub pod_name: &'static str,
    pub description: &'static str,
    pub command: String,
    pub expectation: Expectation,
}

impl PermissionCheck {
    /// Compare the check pod's terminal status against its expectation.
    pub fn evaluate(&self, status: &WorkloadStatus) -> StepResult {
        let denied = status.failed_as_expected();
        match (self.expectation, denied) {
            (Expectation::Denied, true) => {
                info!(check = %self.pod_name, "ServiceAccount correctly denied: {}", self.description);
                Ok(())
            }
            (Expectation::Denied, false) => Err(StepError::failed(format!(
                "ServiceAccount should not be able to {}, but it succeeded",
                self.description
            ))),
            (Expectation::Allowed, false) => {
                info!(check = %self.pod_name, "ServiceAccount can {}", self.description);
                Ok(())
            }
            (Expectation::Allowed, true) => Err(StepError::failed(format!(
                "ServiceAccount should be able to {}, but it failed",
                self.description
            ))),
            (Expectation::Informational, true) => {
                warn!(
                    check = %self.pod_name,
                    "ServiceAccount cannot {} (this may be expected in restrictive clusters)",
                    self.description
                );
                Ok(())
            }
            (Expectation::Informational, false) => {
                info!(check = %self.pod_name, "ServiceAccount can {}", self.description);
                Ok(())
            }
        }
    }
}

/// Permission checks in run order.
pub fn permission_checks(service_account: &str) -> Vec<PermissionCheck> {
    vec![
        PermissionCheck {
            pod_name: "rbac-test-namespaces",
            description: "list all namespaces",
            command: "kubectl get namespaces".to_string(),
            expectation: Expectation::Denied,
        },
        PermissionCheck {
            pod_name: "rbac-test-secret",
            description: "create secrets in kube-system",
            command: "kubectl create secret generic test-secret --from-literal=key=value -n kube-system"
                .to_string(),
            expectation: Expectation::Denied,
        },
        PermissionCheck {
            pod_name: "rbac-test-nodes",
            description: "list nodes",
            command: "kubectl get nodes".to_string(),
            expectation: Expectation::Denied,
        },
        PermissionCheck {
            pod_name: "rbac-test-version",
            description: "get the API server version",
            command: "kubectl get --raw /version".to_string(),
            expectation: Expectation::Allowed,
        },
        PermissionCheck {
            pod_name: "rbac-test-self",
            description: "get basic info about itself",
            command: format!("kubectl get serviceaccount/{service_account}"),
            expectation: Expectation::Informational,
        },
    ]
}

#[derive(Default)]
pub struct RbacState {
    service_account: Option<String>,
    check_pods: Vec<String>,
}

pub fn test_case() -> TestCase<KubeCluster> {
    TestCase::new(TEST_NAME).feature(
        Feature::<RbacState, KubeCluster>::new(FEATURE_NAME)
            .setup(|s, e| Box::pin(setup(s, e)))
            .assess("rbac restrictions", |s, e| Box::pin(assess_restrictions(s, e)))
            .teardown(|s, e| Box::pin(teardown(s, e))),
    )
}

async fn setup(state: &mut RbacState, env: &EnvHandle<KubeCluster>) -> StepResult {
    let service_account = ServiceAccount {
        metadata: labelled_meta(env.namespace(), SERVICE_ACCOUNT_NAME, APP_LABEL),
        ..Default::default()
    };
    env.client()
        .create(env.namespace(), &service_account)
        .await?;
    state.service_account = Some(SERVICE_ACCOUNT_NAME.to_string());
    Ok(())
}

async fn assess_restrictions(state: &mut RbacState, env: &EnvHandle<KubeCluster>) -> StepResult {
    let service_account = state
        .service_account
        .clone()
        .ok_or_else(|| StepError::failed("service account was not created"))?;

    for check in permission_checks(&service_account) {
        info!(check = %check.pod_name, "Testing: ServiceAccount {:?} to {}", check.expectation, check.description);

        let pod = new_check_pod(env.namespace(), check.pod_name, &service_account, &check.command);
        env.client().create(env.namespace(), &pod).await?;
        state.check_pods.push(check.pod_name.to_string());

        let status =
            wait_for_workload_terminal(env, check.pod_name, PollBudget::PermissionCheckCompletion).await?;
        check.evaluate(&status)?;
    }
    Ok(())
}

async fn teardown(state: &mut RbacState, env: &EnvHandle<KubeCluster>) -> StepResult {
    // PermissionCheck pods are best-effort; only the service account counts
    for pod in state.check_pods.drain(..) {
        if let Err(e) = delete_if_present::<Pod>(env, Some(pod.clone())).await {
            warn!(%pod, error = %e, "Failed to delete check pod");
        }
    }

    delete_if_present::<ServiceAccount>(env, state.service_account.take()).await?;
    Ok(())
}

/// One-shot kubectl pod running `command` as `service_account`.
pub fn new_check_pod(namespace: &str, name: &str, service_account: &str, command: &str) -> Pod {
    Pod {
        metadata: labelled_meta(namespace, name, APP_LABEL),
        spec: Some(PodSpec {
            service_account_name: Some(service_account.to_string()),
            restart_policy: Some("Never".to_string()),
            containers: vec![Container {
                name: "kubectl-test".to_string(),
                image: Some(KUBECTL_IMAGE.to_string()),
                command: Some(shell(command)),
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
    use e2e_harness::cluster::WorkloadPhase;

    fn failed_with(code: i32) -> WorkloadStatus {
        WorkloadStatus::new(WorkloadPhase::Failed, Some(code))
    }

    fn succeeded() -> WorkloadStatus {
        WorkloadStatus::new(WorkloadPhase::Succeeded, Some(0))
    }

    fn check(expectation: Expectation) -> PermissionCheck {
        PermissionCheck {
            pod_name: "rbac-test-check",
            description: "do something",
            command: "kubectl auth can-i --list".to_string(),
            expectation,
        }
    }

    #[test]
    fn test_check_order_and_expectations() {
        let checks = permission_checks(SERVICE_ACCOUNT_NAME);
        let expectations: Vec<Expectation> = checks.iter().map(|p| p.expectation).collect();

        assert_eq!(
            expectations,
            vec![
                Expectation::Denied,
                Expectation::Denied,
                Expectation::Denied,
                Expectation::Allowed,
                Expectation::Informational,
            ]
        );
        assert_eq!(checks[0].command, "kubectl get namespaces");
        assert!(checks[1].command.ends_with("-n kube-system"));
        assert_eq!(checks[3].command, "kubectl get --raw /version");
        assert_eq!(checks[4].command, "kubectl get serviceaccount/rbac-test-sa");
    }

    #[test]
    fn test_denied_check_passes_on_failure() {
        assert!(check(Expectation::Denied).evaluate(&failed_with(1)).is_ok());

        // Succeeded phase but non-zero exit still reads as denied
        let status = WorkloadStatus::new(WorkloadPhase::Succeeded, Some(1));
        assert!(check(Expectation::Denied).evaluate(&status).is_ok());
    }

    #[test]
    fn test_denied_check_fails_on_success() {
        let err = check(Expectation::Denied)
            .evaluate(&succeeded())
            .unwrap_err();
        assert!(err.to_string().contains("should not be able to do something"));
    }

    #[test]
    fn test_allowed_check() {
        assert!(check(Expectation::Allowed).evaluate(&succeeded()).is_ok());
        assert!(check(Expectation::Allowed).evaluate(&failed_with(1)).is_err());
    }

    #[test]
    fn test_informational_check_never_fails() {
        assert!(check(Expectation::Informational)
            .evaluate(&succeeded())
            .is_ok());
        assert!(check(Expectation::Informational)
            .evaluate(&failed_with(1))
            .is_ok());
    }

    #[test]
    fn test_check_pod_runs_as_service_account() {
        let spec = new_check_pod("e2e-ns-abc", "rbac-test-nodes", "rbac-test-sa", "kubectl get nodes")
            .spec
            .unwrap();

        assert_eq!(spec.service_account_name.as_deref(), Some("rbac-test-sa"));
        assert_eq!(spec.restart_policy.as_deref(), Some("Never"));
        assert_eq!(spec.containers[0].image.as_deref(), Some(KUBECTL_IMAGE));
        assert_eq!(
            spec.containers[0].command,
            Some(vec![
                "sh".to_string(),
                "-c".to_string(),
                "kubectl get nodes".to_string()
            ])
        );
    }
}
