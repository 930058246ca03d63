//! In-memory cluster used by the harness integration tests.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use e2e_harness::cluster::{Cluster, ClusterError, WorkloadObserver, WorkloadStatus};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

/// Records namespaces and named objects; failures can be switched on per operation.
#[derive(Default)]
pub struct FakeCluster {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    namespaces: HashSet<String>,
    deleted_namespaces: Vec<String>,
    objects: HashSet<(String, String)>,
    fail_namespace_create: bool,
    fail_namespace_delete: bool,
    workloads: HashMap<String, VecDeque<WorkloadStatus>>,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_namespace_create() -> Self {
        let cluster = Self::default();
        cluster.inner.lock().unwrap().fail_namespace_create = true;
        cluster
    }

    pub fn failing_namespace_delete() -> Self {
        let cluster = Self::default();
        cluster.inner.lock().unwrap().fail_namespace_delete = true;
        cluster
    }

    pub fn create_object(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.namespaces.contains(namespace) {
            return Err(ClusterError::NotFound {
                kind: "Namespace".to_string(),
                name: namespace.to_string(),
            });
        }
        if !inner
            .objects
            .insert((namespace.to_string(), name.to_string()))
        {
            return Err(ClusterError::AlreadyExists {
                kind: "Object".to_string(),
                name: name.to_string(),
            });
        }
        Ok(())
    }

    pub fn delete_object(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        let mut inner = self.inner.lock().unwrap();
        if inner
            .objects
            .remove(&(namespace.to_string(), name.to_string()))
        {
            Ok(())
        } else {
            Err(ClusterError::NotFound {
                kind: "Object".to_string(),
                name: name.to_string(),
            })
        }
    }

    pub fn has_object(&self, namespace: &str, name: &str) -> bool {
        self.inner
            .lock()
            .unwrap()
            .objects
            .contains(&(namespace.to_string(), name.to_string()))
    }

    pub fn namespace_exists(&self, name: &str) -> bool {
        self.inner.lock().unwrap().namespaces.contains(name)
    }

    pub fn deleted_namespaces(&self) -> Vec<String> {
        self.inner.lock().unwrap().deleted_namespaces.clone()
    }

    /// Script the statuses a workload reports, one per observation. The last one repeats.
    pub fn script_workload(&self, name: &str, statuses: Vec<WorkloadStatus>) {
        self.inner
            .lock()
            .unwrap()
            .workloads
            .insert(name.to_string(), statuses.into());
    }
}

#[async_trait]
impl Cluster for FakeCluster {
    async fn create_namespace(&self, name: &str) -> Result<(), ClusterError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_namespace_create {
            return Err(ClusterError::Api {
                kind: "Namespace".to_string(),
                name: name.to_string(),
                message: "forbidden".to_string(),
            });
        }
        inner.namespaces.insert(name.to_string());
        Ok(())
    }

    async fn delete_namespace(&self, name: &str) -> Result<(), ClusterError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_namespace_delete {
            return Err(ClusterError::Client("connection reset".to_string()));
        }
        inner.namespaces.remove(name);
        inner.objects.retain(|(namespace, _)| namespace != name);
        inner.deleted_namespaces.push(name.to_string());
        Ok(())
    }
}

#[async_trait]
impl WorkloadObserver for FakeCluster {
    async fn workload_status(
        &self,
        _namespace: &str,
        name: &str,
    ) -> Result<WorkloadStatus, ClusterError> {
        let mut inner = self.inner.lock().unwrap();
        let script = inner
            .workloads
            .get_mut(name)
            .ok_or_else(|| ClusterError::NotFound {
                kind: "Pod".to_string(),
                name: name.to_string(),
            })?;
        let status = if script.len() > 1 {
            script.pop_front()
        } else {
            script.front().copied()
        };
        status.ok_or_else(|| ClusterError::Client(format!("no status scripted for {name}")))
    }
}
