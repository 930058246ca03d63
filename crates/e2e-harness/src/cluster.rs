//! Collaborator interfaces for the remote cluster.
//!
//! The harness never talks to a cluster API directly. Namespace provisioning and
//! workload observation go through the [`Cluster`] and [`WorkloadObserver`] traits;
//! everything else a check does against the cluster stays inside the check itself.

use crate::environment::EnvHandle;
use crate::feature::StepError;
use crate::poll::PollBudget;
use async_trait::async_trait;
use std::fmt;
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, info};

/// Errors returned by cluster collaborators.
///
/// The harness treats these as opaque; the variants exist so callers can tell
/// "object is gone" from "the call itself failed".
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClusterError {
    #[error("{kind} {name} not found")]
    NotFound { kind: String, name: String },

    #[error("{kind} {name} already exists")]
    AlreadyExists { kind: String, name: String },

    #[error("{kind} {name}: API request failed: {message}")]
    Api {
        kind: String,
        name: String,
        message: String,
    },

    #[error("Cluster client error: {0}")]
    Client(String),
}

impl ClusterError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClusterError::NotFound { .. })
    }
}

/// Provisioning of the ambient namespace shared by every test in a run.
#[async_trait]
pub trait Cluster: Send + Sync + 'static {
    /// Create the namespace. An existing namespace with the same name is success.
    async fn create_namespace(&self, name: &str) -> Result<(), ClusterError>;

    /// Delete the namespace and everything left inside it.
    async fn delete_namespace(&self, name: &str) -> Result<(), ClusterError>;
}

/// Observation of one-shot workloads (pods) launched by a check.
#[async_trait]
pub trait WorkloadObserver: Send + Sync {
    async fn workload_status(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<WorkloadStatus, ClusterError>;
}

/// Lifecycle phase of a workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkloadPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl WorkloadPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkloadPhase::Succeeded | WorkloadPhase::Failed)
    }
}

impl fmt::Display for WorkloadPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let phase = match self {
            WorkloadPhase::Pending => "Pending",
            WorkloadPhase::Running => "Running",
            WorkloadPhase::Succeeded => "Succeeded",
            WorkloadPhase::Failed => "Failed",
            WorkloadPhase::Unknown => "Unknown",
        };
        f.write_str(phase)
    }
}

/// Observed status of a workload: its phase plus the first container's exit code
/// once that container has terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkloadStatus {
    pub phase: WorkloadPhase,
    pub exit_code: Option<i32>,
}

impl WorkloadStatus {
    pub fn new(phase: WorkloadPhase, exit_code: Option<i32>) -> Self {
        Self { phase, exit_code }
    }

    /// Succeeded, and the container (if it reported one) exited with code 0.
    pub fn succeeded_cleanly(&self) -> bool {
        self.phase == WorkloadPhase::Succeeded && self.exit_code.unwrap_or(0) == 0
    }

    /// Whether the workload was refused what it tried to do.
    ///
    /// Any failed phase or non-zero exit counts, including crashes unrelated to
    /// permissions. Denial checks rely on exactly this reading.
    pub fn failed_as_expected(&self) -> bool {
        self.phase == WorkloadPhase::Failed || self.exit_code.is_some_and(|code| code != 0)
    }
}

/// Poll a workload until it reaches Succeeded or Failed and return that status.
///
/// Fetch errors abort the wait. Whether a Failed outcome is good news is the
/// caller's decision.
pub async fn wait_for_workload_terminal<C>(
    env: &EnvHandle<C>,
    name: &str,
    budget: PollBudget,
) -> Result<WorkloadStatus, StepError>
where
    C: WorkloadObserver,
{
    let observed: Mutex<Option<WorkloadStatus>> = Mutex::new(None);
    let observed_ref = &observed;

    budget
        .poll(env.cancel_token(), move || async move {
            let status = env.client().workload_status(env.namespace(), name).await?;
            debug!(workload = %name, phase = %status.phase, "Observed workload phase");
            if let Ok(mut slot) = observed_ref.lock() {
                *slot = Some(status);
            }
            Ok::<_, ClusterError>(status.phase.is_terminal())
        })
        .await
        .map_err(|source| StepError::poll(format!("workload {name} to terminate"), source))?;

    let status = observed
        .into_inner()
        .ok()
        .flatten()
        .ok_or_else(|| StepError::failed(format!("workload {name} was never observed")))?;
    info!(
        workload = %name,
        phase = %status.phase,
        exit_code = ?status.exit_code,
        "Workload reached terminal phase"
    );
    Ok(status)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_phases() {
        assert!(WorkloadPhase::Succeeded.is_terminal());
        assert!(WorkloadPhase::Failed.is_terminal());
        assert!(!WorkloadPhase::Running.is_terminal());
        assert!(!WorkloadPhase::Pending.is_terminal());
        assert!(!WorkloadPhase::Unknown.is_terminal());
    }

    #[test]
    fn test_failed_as_expected_on_failed_phase() {
        let status = WorkloadStatus::new(WorkloadPhase::Failed, None);
        assert!(status.failed_as_expected());
        assert!(!status.succeeded_cleanly());
    }

    #[test]
    fn test_failed_as_expected_on_nonzero_exit() {
        // Exit code wins even if the phase was reported as Succeeded
        let status = WorkloadStatus::new(WorkloadPhase::Succeeded, Some(1));
        assert!(status.failed_as_expected());
        assert!(!status.succeeded_cleanly());
    }

    #[test]
    fn test_clean_success() {
        let status = WorkloadStatus::new(WorkloadPhase::Succeeded, Some(0));
        assert!(status.succeeded_cleanly());
        assert!(!status.failed_as_expected());

        let no_container = WorkloadStatus::new(WorkloadPhase::Succeeded, None);
        assert!(no_container.succeeded_cleanly());
    }

    #[test]
    fn test_running_is_neither() {
        let status = WorkloadStatus::new(WorkloadPhase::Running, None);
        assert!(!status.succeeded_cleanly());
        assert!(!status.failed_as_expected());
    }

    #[test]
    fn test_cluster_error_display() {
        let err = ClusterError::NotFound {
            kind: "Pod".to_string(),
            name: "writer".to_string(),
        };
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "Pod writer not found");
    }
}
