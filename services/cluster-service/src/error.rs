//! Service-level error taxonomy.

use thiserror::Error;

use crate::control_plane::ControlPlaneError;
use crate::credentials::CredentialError;
use crate::metrics::MetricsError;
use crate::secrets::SecretStoreError;

/// Errors surfaced by lifecycle pipelines and synchronous queries.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// The addressed cluster, host or resource does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The control plane refused a write because of concurrent state.
    #[error("conflict: {0}")]
    Conflict(String),

    /// No candidate host has spare capacity.
    #[error("no capacity: {0}")]
    ResourceExhausted(String),

    /// A bounded wait elapsed.
    #[error("timed out: {0}")]
    Timeout(String),

    /// The request itself is unusable.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The service is shutting down.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// A collaborator failed; not retried.
    #[error("upstream failure: {0}")]
    Upstream(String),
}

impl From<ControlPlaneError> for ServiceError {
    fn from(e: ControlPlaneError) -> Self {
        match e.status() {
            Some(404) => Self::NotFound(e.to_string()),
            Some(409) => Self::Conflict(e.to_string()),
            _ => Self::Upstream(e.to_string()),
        }
    }
}

impl From<SecretStoreError> for ServiceError {
    fn from(e: SecretStoreError) -> Self {
        match e {
            SecretStoreError::Missing(_) => Self::NotFound(e.to_string()),
            other => Self::Upstream(other.to_string()),
        }
    }
}

impl From<MetricsError> for ServiceError {
    fn from(e: MetricsError) -> Self {
        Self::Upstream(e.to_string())
    }
}

impl From<CredentialError> for ServiceError {
    fn from(e: CredentialError) -> Self {
        match e {
            CredentialError::InvalidLifetime(_) | CredentialError::LifetimeTooShort { .. } => {
                Self::InvalidRequest(e.to_string())
            }
            CredentialError::KubeconfigMissing { .. } => Self::NotFound(e.to_string()),
            CredentialError::ControlPlane(inner) => inner.into(),
            other => Self::Upstream(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_plane_status_mapping() {
        let not_found = ControlPlaneError::api("get", "StatefulSet", Some("a-vcluster"), "a", Some(404), "nope");
        assert!(matches!(ServiceError::from(not_found), ServiceError::NotFound(_)));

        let conflict = ControlPlaneError::api("replace", "VCluster", Some("a-vcluster"), "a", Some(409), "stale");
        assert!(matches!(ServiceError::from(conflict), ServiceError::Conflict(_)));

        let broken = ControlPlaneError::InvalidKubeconfig("garbage".to_string());
        assert!(matches!(ServiceError::from(broken), ServiceError::Upstream(_)));
    }

    #[test]
    fn test_write_errors_keep_context() {
        let err: ServiceError =
            ControlPlaneError::api("create", "ResourceQuota", Some("a-vcluster"), "starter", Some(422), "invalid")
                .into();
        assert_eq!(
            err.to_string(),
            "upstream failure: failed to create ResourceQuota a-vcluster/starter: invalid"
        );
    }

    #[test]
    fn test_missing_secret_is_not_found() {
        let err: ServiceError = SecretStoreError::Missing("host-x".to_string()).into();
        assert!(matches!(err, ServiceError::NotFound(_)));
    }
}
