//! Host cluster sessions.
//!
//! A session is a control plane client for one host cluster, built from the
//! host's stored kubeconfig. Nothing is cached: every acquisition pays the
//! secret fetch and kubeconfig decode. The registry only tracks which
//! sessions are open so readiness probes can report them; an entry is added
//! when acquisition starts and removed when the session is dropped or the
//! acquisition fails.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, instrument};

use crate::control_plane::{ClusterConnector, ControlPlane};
use crate::error::ServiceError;
use crate::secrets::{decode_kubeconfig, SecretStore};

/// An open session as reported by the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    pub host_cluster_id: String,
    pub cluster: Option<String>,
    pub acquired_at: DateTime<Utc>,
}

struct RegistryInner {
    secrets: Arc<dyn SecretStore>,
    connector: Arc<dyn ClusterConnector>,
    active: Mutex<BTreeMap<u64, SessionInfo>>,
    next_id: AtomicU64,
}

impl RegistryInner {
    fn active(&self) -> std::sync::MutexGuard<'_, BTreeMap<u64, SessionInfo>> {
        self.active.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Removes its entry from the registry when dropped.
struct Registration {
    id: u64,
    registry: Arc<RegistryInner>,
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let Some(info) = self.registry.active().remove(&self.id) {
            debug!(host_cluster_id = %info.host_cluster_id, "Released host session");
        }
    }
}

/// A live host cluster client. Released on drop.
pub struct HostSession {
    host_cluster_id: String,
    control_plane: Arc<dyn ControlPlane>,
    _registration: Registration,
}

impl HostSession {
    pub fn host_cluster_id(&self) -> &str {
        &self.host_cluster_id
    }

    pub fn control_plane(&self) -> &dyn ControlPlane {
        self.control_plane.as_ref()
    }
}

/// Opens and tracks host sessions.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

impl SessionRegistry {
    pub fn new(secrets: Arc<dyn SecretStore>, connector: Arc<dyn ClusterConnector>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                secrets,
                connector,
                active: Mutex::new(BTreeMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn connector(&self) -> Arc<dyn ClusterConnector> {
        self.inner.connector.clone()
    }

    /// Open a session on `host_cluster_id`, optionally on behalf of `cluster`.
    #[instrument(skip(self))]
    pub async fn acquire(
        &self,
        host_cluster_id: &str,
        cluster: Option<&str>,
    ) -> Result<HostSession, ServiceError> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.active().insert(
            id,
            SessionInfo {
                host_cluster_id: host_cluster_id.to_string(),
                cluster: cluster.map(str::to_string),
                acquired_at: Utc::now(),
            },
        );
        let registration = Registration {
            id,
            registry: self.inner.clone(),
        };

        let encoded = self.inner.secrets.host_kubeconfig(host_cluster_id).await?;
        let kubeconfig = decode_kubeconfig(&encoded)?;
        let control_plane = self.inner.connector.host(&kubeconfig).await?;
        debug!("Opened host session");

        Ok(HostSession {
            host_cluster_id: host_cluster_id.to_string(),
            control_plane,
            _registration: registration,
        })
    }

    /// Sessions currently open, oldest first.
    pub fn active(&self) -> Vec<SessionInfo> {
        self.inner.active().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.active().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control_plane::{kubeconfig_for, MockConnector, MockControlPlane};
    use crate::secrets::StaticSecretStore;

    fn registry() -> (Arc<MockControlPlane>, Arc<MockConnector>, SessionRegistry) {
        let kubeconfig = kubeconfig_for("host-a", "https://host-a.test");
        let host = Arc::new(MockControlPlane::new());
        let connector = Arc::new(MockConnector::new().with_host(&kubeconfig, host.clone()));
        let secrets = StaticSecretStore::default()
            .with_kubeconfig("host-a", &kubeconfig)
            .with_kubeconfig("host-broken", "not a registered kubeconfig");
        let registry = SessionRegistry::new(Arc::new(secrets), connector.clone());
        (host, connector, registry)
    }

    #[tokio::test]
    async fn test_session_tracked_until_dropped() {
        let (host, _connector, registry) = registry();

        let session = registry.acquire("host-a", Some("alpha")).await.unwrap();
        assert_eq!(session.host_cluster_id(), "host-a");
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.active()[0].cluster.as_deref(), Some("alpha"));

        session.control_plane().namespace_exists("x").await.unwrap();
        assert_eq!(host.call_count("get", "Namespace"), 1);

        drop(session);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_no_caching_between_acquisitions() {
        let (_host, connector, registry) = registry();

        let first = registry.acquire("host-a", None).await.unwrap();
        let second = registry.acquire("host-a", None).await.unwrap();
        assert_eq!(connector.connections(), 2);
        assert_eq!(registry.len(), 2);

        drop(first);
        drop(second);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_failed_acquisition_is_removed() {
        let (_host, _connector, registry) = registry();

        let err = registry.acquire("host-missing", None).await.err().unwrap();
        assert!(matches!(err, ServiceError::NotFound(_)));
        assert!(registry.is_empty());

        let err = registry.acquire("host-broken", None).await.err().unwrap();
        assert!(matches!(err, ServiceError::Upstream(_)));
        assert!(registry.is_empty());
    }
}
