//! Kubernetes backend for the harness collaborator traits.
//!
//! Besides namespace provisioning and pod observation, [`KubeCluster`] offers the
//! small create/get/delete surface the checks use for their own objects, with
//! `kube` errors folded into [`ClusterError`].

use async_trait::async_trait;
use e2e_harness::cluster::{
    Cluster, ClusterError, WorkloadObserver, WorkloadPhase, WorkloadStatus,
};
use k8s_openapi::api::core::v1::{Namespace, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, DeleteParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config, Resource};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;
use std::path::Path;
use tracing::{debug, info};

/// Namespaced object kinds the checks create.
pub trait NamespacedObject:
    Resource<Scope = NamespaceResourceScope, DynamicType = ()>
    + Clone
    + Debug
    + DeserializeOwned
    + Serialize
    + Send
    + Sync
    + 'static
{
}

impl<K> NamespacedObject for K where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + Debug
        + DeserializeOwned
        + Serialize
        + Send
        + Sync
        + 'static
{
}

/// Cluster reached through a `kube` client.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Build a client from `kubeconfig`, or from the environment when `None`
    /// (in-cluster service account, then `$KUBECONFIG` / `~/.kube/config`).
    ///
    /// # Errors
    ///
    /// Returns `ClusterError::Client` if the configuration cannot be loaded.
    pub async fn connect(kubeconfig: Option<&Path>) -> Result<Self, ClusterError> {
        let client = match kubeconfig {
            Some(path) => {
                info!(path = %path.display(), "Loading kubeconfig");
                let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                    ClusterError::Client(format!(
                        "failed to read kubeconfig {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                let config =
                    Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                        .await
                        .map_err(|e| {
                            ClusterError::Client(format!("invalid kubeconfig: {}", e))
                        })?;
                Client::try_from(config)
                    .map_err(|e| ClusterError::Client(format!("failed to build client: {}", e)))?
            }
            None => Client::try_default()
                .await
                .map_err(|e| ClusterError::Client(format!("failed to build client: {}", e)))?,
        };

        Ok(Self::new(client))
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    fn api<K: NamespacedObject>(&self, namespace: &str) -> Api<K> {
        Api::namespaced(self.client.clone(), namespace)
    }

    /// Create `object` in `namespace` and return the stored version.
    pub async fn create<K: NamespacedObject>(
        &self,
        namespace: &str,
        object: &K,
    ) -> Result<K, ClusterError> {
        let name = object.meta().name.clone().unwrap_or_default();
        let created = self
            .api::<K>(namespace)
            .create(&PostParams::default(), object)
            .await
            .map_err(|e| map_kube_error(&kind_of::<K>(), &name, e))?;
        info!(kind = %kind_of::<K>(), %name, %namespace, "Created object");
        Ok(created)
    }

    pub async fn get<K: NamespacedObject>(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<K, ClusterError> {
        self.api::<K>(namespace)
            .get(name)
            .await
            .map_err(|e| map_kube_error(&kind_of::<K>(), name, e))
    }

    /// Delete the named object. Deletion is asynchronous on the server side.
    pub async fn delete<K: NamespacedObject>(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<(), ClusterError> {
        self.api::<K>(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map_err(|e| map_kube_error(&kind_of::<K>(), name, e))?;
        info!(kind = %kind_of::<K>(), %name, %namespace, "Deleted object");
        Ok(())
    }
}

#[async_trait]
impl Cluster for KubeCluster {
    async fn create_namespace(&self, name: &str) -> Result<(), ClusterError> {
        let namespaces: Api<Namespace> = Api::all(self.client.clone());
        let namespace = Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            ..Default::default()
        };

        match namespaces.create(&PostParams::default(), &namespace).await {
            Ok(_) => {
                info!(namespace = %name, "Created namespace");
                Ok(())
            }
            Err(kube::Error::Api(response)) if response.code == 409 => {
                info!(namespace = %name, "Namespace already exists, reusing it");
                Ok(())
            }
            Err(e) => Err(map_kube_error("Namespace", name, e)),
        }
    }

    async fn delete_namespace(&self, name: &str) -> Result<(), ClusterError> {
        let namespaces: Api<Namespace> = Api::all(self.client.clone());
        match namespaces.delete(name, &DeleteParams::default()).await {
            Ok(_) => {
                info!(namespace = %name, "Deleted namespace");
                Ok(())
            }
            Err(kube::Error::Api(response)) if response.code == 404 => {
                debug!(namespace = %name, "Namespace already gone");
                Ok(())
            }
            Err(e) => Err(map_kube_error("Namespace", name, e)),
        }
    }
}

#[async_trait]
impl WorkloadObserver for KubeCluster {
    async fn workload_status(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<WorkloadStatus, ClusterError> {
        let pod: Pod = self.get(namespace, name).await?;
        Ok(pod_status(&pod))
    }
}

/// Phase of `pod` plus the exit code of its first container, if that container terminated.
pub fn pod_status(pod: &Pod) -> WorkloadStatus {
    let status = pod.status.as_ref();

    let phase = match status.and_then(|s| s.phase.as_deref()) {
        None | Some("Pending") => WorkloadPhase::Pending,
        Some("Running") => WorkloadPhase::Running,
        Some("Succeeded") => WorkloadPhase::Succeeded,
        Some("Failed") => WorkloadPhase::Failed,
        Some(_) => WorkloadPhase::Unknown,
    };

    let exit_code = status
        .and_then(|s| s.container_statuses.as_ref())
        .and_then(|containers| containers.first())
        .and_then(|container| container.state.as_ref())
        .and_then(|state| state.terminated.as_ref())
        .map(|terminated| terminated.exit_code);

    WorkloadStatus::new(phase, exit_code)
}

fn kind_of<K: Resource<DynamicType = ()>>() -> String {
    K::kind(&()).into_owned()
}

fn map_kube_error(kind: &str, name: &str, err: kube::Error) -> ClusterError {
    match err {
        kube::Error::Api(response) if response.code == 404 => ClusterError::NotFound {
            kind: kind.to_string(),
            name: name.to_string(),
        },
        kube::Error::Api(response) if response.code == 409 => ClusterError::AlreadyExists {
            kind: kind.to_string(),
            name: name.to_string(),
        },
        kube::Error::Api(response) => ClusterError::Api {
            kind: kind.to_string(),
            name: name.to_string(),
            message: format!("{} ({})", response.message, response.code),
        },
        other => ClusterError::Client(other.to_string()),
    }
}
