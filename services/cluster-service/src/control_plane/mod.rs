//! Control plane interface and implementations.
//!
//! The control plane interface abstracts every call the lifecycle pipelines
//! make against a Kubernetes API server:
//! - Host clusters: nodes, namespaces, declarations, quotas, workloads
//! - Virtual clusters: identities and short-lived tokens
//!
//! The kube-rs implementation talks to real clusters; the mock implementation
//! keeps everything in memory for tests and local development.

mod kubernetes;
mod mock;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::descriptor::IngressDescriptor;
use crate::quota::QuotaDescriptor;

pub use self::kubernetes::{KubeAccessControl, KubeConnector, KubeControlPlane};
pub use self::mock::{
    kubeconfig_for, MockAccessControl, MockConnector, MockControlPlane, MockStatefulSet,
};

/// Errors returned by control plane calls.
#[derive(Debug, Error)]
pub enum ControlPlaneError {
    /// The stored kubeconfig could not be turned into a client.
    #[error("invalid kubeconfig: {0}")]
    InvalidKubeconfig(String),

    /// The API server rejected or failed a call.
    #[error("failed to {operation} {kind} {resource}: {message}")]
    Api {
        operation: &'static str,
        kind: &'static str,
        resource: String,
        status: Option<u16>,
        message: String,
    },

    /// A response could not be interpreted.
    #[error("unexpected {kind} {resource}: {message}")]
    Malformed {
        kind: &'static str,
        resource: String,
        message: String,
    },
}

impl ControlPlaneError {
    /// API failure on a namespaced or cluster-scoped resource.
    pub fn api(
        operation: &'static str,
        kind: &'static str,
        namespace: Option<&str>,
        name: &str,
        status: Option<u16>,
        message: impl Into<String>,
    ) -> Self {
        Self::Api {
            operation,
            kind,
            resource: qualified(namespace, name),
            status,
            message: message.into(),
        }
    }

    pub fn malformed(
        kind: &'static str,
        namespace: Option<&str>,
        name: &str,
        message: impl Into<String>,
    ) -> Self {
        Self::Malformed {
            kind,
            resource: qualified(namespace, name),
            message: message.into(),
        }
    }

    /// HTTP status reported by the API server, if the call got that far.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } => *status,
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status() == Some(404)
    }

    pub fn is_already_exists(&self) -> bool {
        self.status() == Some(409)
    }
}

fn qualified(namespace: Option<&str>, name: &str) -> String {
    match namespace {
        Some(ns) => format!("{ns}/{name}"),
        None => name.to_string(),
    }
}

/// Untyped declarations the provisioner manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DeclarationKind {
    /// Cluster API `Cluster`.
    Cluster,
    /// vcluster infrastructure provider `VCluster`.
    VCluster,
}

impl DeclarationKind {
    pub fn group(&self) -> &'static str {
        match self {
            Self::Cluster => "cluster.x-k8s.io",
            Self::VCluster => "infrastructure.cluster.x-k8s.io",
        }
    }

    pub fn version(&self) -> &'static str {
        match self {
            Self::Cluster => "v1beta1",
            Self::VCluster => "v1alpha1",
        }
    }

    pub fn api_version(&self) -> &'static str {
        match self {
            Self::Cluster => "cluster.x-k8s.io/v1beta1",
            Self::VCluster => "infrastructure.cluster.x-k8s.io/v1alpha1",
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Cluster => "Cluster",
            Self::VCluster => "VCluster",
        }
    }

    pub fn plural(&self) -> &'static str {
        match self {
            Self::Cluster => "clusters",
            Self::VCluster => "vclusters",
        }
    }
}

/// Raw CPU and memory quantities reported for one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeQuantities {
    pub node: String,
    pub cpu: String,
    pub memory: String,
}

impl NodeQuantities {
    pub fn new(node: impl Into<String>, cpu: impl Into<String>, memory: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            cpu: cpu.into(),
            memory: memory.into(),
        }
    }
}

/// Name and phase of a pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodPhase {
    pub name: String,
    pub phase: Option<String>,
}

impl PodPhase {
    pub fn is_running(&self) -> bool {
        self.phase.as_deref() == Some("Running")
    }
}

/// Lifecycle phase of a namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamespacePhase {
    Active,
    /// Deletion was requested and the namespace is being emptied.
    Terminating,
}

impl NamespacePhase {
    /// Kubernetes reports any phase other than `Terminating` as usable.
    pub fn from_status(phase: Option<&str>) -> Self {
        match phase {
            Some("Terminating") => Self::Terminating,
            _ => Self::Active,
        }
    }
}

/// Identity, role and binding that back issued credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessGrant {
    pub namespace: String,
    pub identity_name: String,
    pub role_name: String,
    pub binding_name: String,
    pub token_expiry_seconds: i64,
}

impl AccessGrant {
    /// Grant for a virtual cluster, living in its `default` namespace.
    pub fn for_cluster(name: &str, token_expiry_seconds: i64) -> Self {
        Self {
            namespace: "default".to_string(),
            identity_name: name.to_string(),
            role_name: name.to_string(),
            binding_name: format!("{name}-binding"),
            token_expiry_seconds,
        }
    }
}

/// Operations against a host cluster.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Allocatable capacity of every node.
    async fn list_node_allocatable(&self) -> Result<Vec<NodeQuantities>, ControlPlaneError>;

    /// Current usage samples from the metrics API.
    async fn list_node_usage(&self) -> Result<Vec<NodeQuantities>, ControlPlaneError>;

    /// Fetch a declaration as JSON, or `None` if it does not exist.
    async fn get_declaration(
        &self,
        kind: DeclarationKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<serde_json::Value>, ControlPlaneError>;

    async fn create_declaration(
        &self,
        kind: DeclarationKind,
        namespace: &str,
        body: &serde_json::Value,
    ) -> Result<(), ControlPlaneError>;

    /// Replace a declaration. `body` must carry the current `resourceVersion`.
    async fn replace_declaration(
        &self,
        kind: DeclarationKind,
        namespace: &str,
        name: &str,
        body: &serde_json::Value,
    ) -> Result<(), ControlPlaneError>;

    async fn namespace_exists(&self, name: &str) -> Result<bool, ControlPlaneError>;

    /// Phase of namespace `name`, `None` if it does not exist.
    async fn namespace_phase(&self, name: &str)
        -> Result<Option<NamespacePhase>, ControlPlaneError>;

    async fn create_namespace(&self, name: &str) -> Result<(), ControlPlaneError>;

    /// Request namespace deletion. Returns before the namespace is gone.
    async fn delete_namespace(&self, name: &str) -> Result<(), ControlPlaneError>;

    async fn list_quota_names(&self, namespace: &str) -> Result<Vec<String>, ControlPlaneError>;

    async fn create_quota(&self, quota: &QuotaDescriptor) -> Result<(), ControlPlaneError>;

    async fn delete_quota(&self, namespace: &str, name: &str) -> Result<(), ControlPlaneError>;

    async fn service_exists(&self, namespace: &str, name: &str)
        -> Result<bool, ControlPlaneError>;

    async fn list_pods(&self, namespace: &str) -> Result<Vec<PodPhase>, ControlPlaneError>;

    async fn get_pod(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PodPhase>, ControlPlaneError>;

    /// Desired replicas of a stateful workload.
    async fn statefulset_replicas(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<i32, ControlPlaneError>;

    async fn set_statefulset_replicas(
        &self,
        namespace: &str,
        name: &str,
        replicas: i32,
    ) -> Result<(), ControlPlaneError>;

    /// Merge labels into the stateful workload's pod template.
    async fn label_pod_template(
        &self,
        namespace: &str,
        name: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<(), ControlPlaneError>;

    async fn ingress_exists(&self, namespace: &str, name: &str)
        -> Result<bool, ControlPlaneError>;

    async fn create_ingress(&self, ingress: &IngressDescriptor) -> Result<(), ControlPlaneError>;

    /// Decoded value of one key of a secret, or `None` if the secret or key
    /// is absent.
    async fn read_secret_key(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
    ) -> Result<Option<Vec<u8>>, ControlPlaneError>;
}

/// Operations against a virtual cluster's own API server.
#[async_trait]
pub trait AccessControl: Send + Sync {
    async fn service_account_exists(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<bool, ControlPlaneError>;

    /// Create the identity, an all-verbs cluster role and the binding.
    async fn create_access_grant(&self, grant: &AccessGrant) -> Result<(), ControlPlaneError>;

    /// Mint a token for the grant's identity.
    async fn request_token(
        &self,
        grant: &AccessGrant,
        audiences: &[&str],
    ) -> Result<String, ControlPlaneError>;
}

/// Builds clients from kubeconfig documents.
#[async_trait]
pub trait ClusterConnector: Send + Sync {
    /// Client for a host cluster.
    async fn host(&self, kubeconfig: &[u8]) -> Result<Arc<dyn ControlPlane>, ControlPlaneError>;

    /// Client for a virtual cluster.
    async fn virtual_cluster(
        &self,
        kubeconfig: &[u8],
    ) -> Result<Arc<dyn AccessControl>, ControlPlaneError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_includes_resource() {
        let err = ControlPlaneError::api(
            "create",
            "ResourceQuota",
            Some("alpha-vcluster"),
            "starter",
            Some(403),
            "forbidden",
        );
        assert_eq!(
            err.to_string(),
            "failed to create ResourceQuota alpha-vcluster/starter: forbidden"
        );
        assert_eq!(err.status(), Some(403));
        assert!(!err.is_not_found());
    }

    #[test]
    fn test_error_cluster_scoped_resource() {
        let err = ControlPlaneError::api("delete", "Namespace", None, "alpha-vcluster", Some(404), "gone");
        assert_eq!(err.to_string(), "failed to delete Namespace alpha-vcluster: gone");
        assert!(err.is_not_found());
    }

    #[test]
    fn test_declaration_kinds() {
        assert_eq!(DeclarationKind::VCluster.plural(), "vclusters");
        assert_eq!(
            DeclarationKind::Cluster.api_version(),
            format!("{}/{}", DeclarationKind::Cluster.group(), DeclarationKind::Cluster.version())
        );
    }

    #[test]
    fn test_namespace_phase_from_status() {
        assert_eq!(NamespacePhase::from_status(Some("Terminating")), NamespacePhase::Terminating);
        assert_eq!(NamespacePhase::from_status(Some("Active")), NamespacePhase::Active);
        assert_eq!(NamespacePhase::from_status(None), NamespacePhase::Active);
    }

    #[test]
    fn test_access_grant_names() {
        let grant = AccessGrant::for_cluster("alpha", 3600);
        assert_eq!(grant.namespace, "default");
        assert_eq!(grant.identity_name, "alpha");
        assert_eq!(grant.role_name, "alpha");
        assert_eq!(grant.binding_name, "alpha-binding");
    }
}
