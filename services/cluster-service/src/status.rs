//! Observed virtual cluster status.
//!
//! Nothing about a cluster's progress is stored. The reported status is the
//! phase of the workload's first pod, and the provisioning state is derived
//! from what the host control plane shows right now.

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::control_plane::{ControlPlane, NamespacePhase};
use crate::descriptor::namespace_for;
use crate::error::ServiceError;

/// Where a virtual cluster is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProvisioningState {
    Placing,
    Creating,
    WaitingForService,
    WaitingForPods,
    Ready,
    Updating,
    Stopped,
    Deleting,
    Failed,
}

impl ProvisioningState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Placing => "Placing",
            Self::Creating => "Creating",
            Self::WaitingForService => "WaitingForService",
            Self::WaitingForPods => "WaitingForPods",
            Self::Ready => "Ready",
            Self::Updating => "Updating",
            Self::Stopped => "Stopped",
            Self::Deleting => "Deleting",
            Self::Failed => "Failed",
        }
    }
}

impl std::fmt::Display for ProvisioningState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status reported for one virtual cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterStatus {
    /// Phase of the first workload pod, `Creating`, `Terminating` or `Failed`.
    pub status: String,
    pub state: ProvisioningState,
}

impl ClusterStatus {
    fn new(status: impl Into<String>, state: ProvisioningState) -> Self {
        Self {
            status: status.into(),
            state,
        }
    }
}

fn state_for_phase(phase: &str) -> ProvisioningState {
    match phase {
        "Running" => ProvisioningState::Ready,
        "Failed" => ProvisioningState::Failed,
        _ => ProvisioningState::WaitingForPods,
    }
}

/// State of a cluster whose first pod does not exist.
async fn state_without_pod(
    control_plane: &dyn ControlPlane,
    namespace: &str,
    name: &str,
) -> ProvisioningState {
    match control_plane.statefulset_replicas(namespace, name).await {
        Ok(0) => return ProvisioningState::Stopped,
        Ok(_) => return ProvisioningState::WaitingForPods,
        Err(e) if !e.is_not_found() => return ProvisioningState::Creating,
        Err(_) => {}
    }
    match control_plane.service_exists(namespace, name).await {
        Ok(false) => ProvisioningState::WaitingForService,
        Ok(true) => ProvisioningState::WaitingForPods,
        Err(_) => ProvisioningState::Creating,
    }
}

/// Observe virtual cluster `name` on a host.
///
/// A missing namespace reports `Failed` and a terminating one `Deleting`; a
/// pod that cannot be read reports `Creating`. Only a failure to look up the
/// namespace is an error.
#[instrument(skip(control_plane))]
pub async fn observe(
    control_plane: &dyn ControlPlane,
    name: &str,
) -> Result<ClusterStatus, ServiceError> {
    let namespace = namespace_for(name);
    match control_plane.namespace_phase(&namespace).await? {
        None => return Ok(ClusterStatus::new("Failed", ProvisioningState::Failed)),
        Some(NamespacePhase::Terminating) => {
            return Ok(ClusterStatus::new("Terminating", ProvisioningState::Deleting))
        }
        Some(NamespacePhase::Active) => {}
    }

    let pod = format!("{name}-0");
    let status = match control_plane.get_pod(&namespace, &pod).await {
        Ok(Some(p)) => {
            let phase = p.phase.unwrap_or_else(|| "Unknown".to_string());
            let state = state_for_phase(&phase);
            ClusterStatus::new(phase, state)
        }
        Ok(None) => ClusterStatus::new(
            "Creating",
            state_without_pod(control_plane, &namespace, name).await,
        ),
        Err(e) => {
            debug!(error = %e, "Pod could not be read");
            ClusterStatus::new("Creating", ProvisioningState::Creating)
        }
    };
    Ok(status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control_plane::MockControlPlane;

    #[tokio::test]
    async fn test_running_pod_is_ready() {
        let cp = MockControlPlane::new();
        cp.add_namespace("alpha-vcluster");
        cp.set_pod_phase("alpha-vcluster", "alpha-0", Some("Running"));

        let status = observe(&cp, "alpha").await.unwrap();
        assert_eq!(status, ClusterStatus::new("Running", ProvisioningState::Ready));
    }

    #[tokio::test]
    async fn test_pending_pod_reports_phase() {
        let cp = MockControlPlane::new();
        cp.add_namespace("alpha-vcluster");
        cp.set_pod_phase("alpha-vcluster", "alpha-0", Some("Pending"));

        let status = observe(&cp, "alpha").await.unwrap();
        assert_eq!(status.status, "Pending");
        assert_eq!(status.state, ProvisioningState::WaitingForPods);
    }

    #[tokio::test]
    async fn test_missing_namespace_is_failed() {
        let cp = MockControlPlane::new();

        let status = observe(&cp, "alpha").await.unwrap();
        assert_eq!(status, ClusterStatus::new("Failed", ProvisioningState::Failed));
    }

    #[tokio::test]
    async fn test_terminating_namespace_is_deleting() {
        let cp = MockControlPlane::new().with_deletion_polls(3);
        cp.add_namespace("alpha-vcluster");
        cp.set_pod_phase("alpha-vcluster", "alpha-0", Some("Running"));
        cp.delete_namespace("alpha-vcluster").await.unwrap();

        let status = observe(&cp, "alpha").await.unwrap();
        assert_eq!(status, ClusterStatus::new("Terminating", ProvisioningState::Deleting));
        assert!(cp.has_namespace("alpha-vcluster"));
    }

    #[tokio::test]
    async fn test_unreadable_pod_is_creating() {
        let cp = MockControlPlane::new();
        cp.add_namespace("alpha-vcluster");
        cp.fail_on("get", "Pod");

        let status = observe(&cp, "alpha").await.unwrap();
        assert_eq!(status, ClusterStatus::new("Creating", ProvisioningState::Creating));
    }

    #[tokio::test]
    async fn test_missing_pod_derives_state() {
        let cp = MockControlPlane::new();
        cp.add_namespace("alpha-vcluster");
        let status = observe(&cp, "alpha").await.unwrap();
        assert_eq!(status.status, "Creating");
        assert_eq!(status.state, ProvisioningState::WaitingForService);

        cp.add_service("alpha-vcluster", "alpha");
        let status = observe(&cp, "alpha").await.unwrap();
        assert_eq!(status.state, ProvisioningState::WaitingForPods);

        cp.add_statefulset("alpha-vcluster", "alpha", 0);
        let status = observe(&cp, "alpha").await.unwrap();
        assert_eq!(status.state, ProvisioningState::Stopped);
    }

    #[tokio::test]
    async fn test_namespace_lookup_failure_is_error() {
        let cp = MockControlPlane::new();
        cp.fail_on("get", "Namespace");

        assert!(observe(&cp, "alpha").await.is_err());
    }

    #[test]
    fn test_state_serializes_as_name() {
        assert_eq!(
            serde_json::to_value(ProvisioningState::WaitingForPods).unwrap(),
            "WaitingForPods"
        );
        assert_eq!(ProvisioningState::Updating.to_string(), "Updating");
    }
}
