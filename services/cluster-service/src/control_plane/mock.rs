//! In-memory control plane for tests and local development.
//!
//! The mock keeps every object in a single mutex-guarded store and plays the
//! part of the vcluster provider: creating a `VCluster` declaration
//! materializes its service, stateful workload, first pod and kubeconfig
//! secret, so lifecycle pipelines converge without a real cluster.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tracing::debug;

use super::{
    AccessControl, AccessGrant, ClusterConnector, ControlPlane, ControlPlaneError,
    DeclarationKind, NamespacePhase, NodeQuantities, PodPhase,
};
use crate::descriptor::IngressDescriptor;
use crate::quota::QuotaDescriptor;

type Key = (String, String);

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

fn not_found(
    operation: &'static str,
    kind: &'static str,
    namespace: Option<&str>,
    name: &str,
) -> ControlPlaneError {
    ControlPlaneError::api(operation, kind, namespace, name, Some(404), "not found")
}

fn already_exists(
    operation: &'static str,
    kind: &'static str,
    namespace: Option<&str>,
    name: &str,
) -> ControlPlaneError {
    ControlPlaneError::api(operation, kind, namespace, name, Some(409), "already exists")
}

/// Stateful workload as tracked by the mock.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MockStatefulSet {
    pub replicas: i32,
    pub template_labels: BTreeMap<String, String>,
}

#[derive(Default)]
struct MockState {
    nodes: Vec<NodeQuantities>,
    usage: Vec<NodeQuantities>,
    /// `None` while active, `Some(polls_left)` while terminating.
    namespaces: BTreeMap<String, Option<u32>>,
    declarations: BTreeMap<(DeclarationKind, String, String), serde_json::Value>,
    quotas: BTreeMap<Key, QuotaDescriptor>,
    services: BTreeSet<Key>,
    pods: BTreeMap<Key, Option<String>>,
    statefulsets: BTreeMap<Key, MockStatefulSet>,
    ingresses: BTreeMap<Key, IngressDescriptor>,
    secrets: BTreeMap<Key, BTreeMap<String, Vec<u8>>>,
    failures: BTreeSet<(String, String)>,
    calls: Vec<String>,
    revision: u64,
}

impl MockState {
    fn purge_namespace(&mut self, namespace: &str) {
        self.namespaces.remove(namespace);
        self.declarations.retain(|(_, ns, _), _| ns != namespace);
        self.quotas.retain(|(ns, _), _| ns != namespace);
        self.services.retain(|(ns, _)| ns != namespace);
        self.pods.retain(|(ns, _), _| ns != namespace);
        self.statefulsets.retain(|(ns, _), _| ns != namespace);
        self.ingresses.retain(|(ns, _), _| ns != namespace);
        self.secrets.retain(|(ns, _), _| ns != namespace);
    }

    fn next_revision(&mut self) -> String {
        self.revision += 1;
        self.revision.to_string()
    }
}

/// In-memory host cluster.
pub struct MockControlPlane {
    state: Mutex<MockState>,
    auto_converge: bool,
    converged_pod_phase: String,
    deletion_polls: u32,
}

impl MockControlPlane {
    /// Create a mock that converges every declared virtual cluster at once.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            auto_converge: true,
            converged_pod_phase: "Running".to_string(),
            deletion_polls: 0,
        }
    }

    /// Do not materialize workloads for new declarations.
    pub fn without_auto_converge(mut self) -> Self {
        self.auto_converge = false;
        self
    }

    /// Phase given to pods materialized for new declarations.
    pub fn with_pod_phase(mut self, phase: &str) -> Self {
        self.converged_pod_phase = phase.to_string();
        self
    }

    /// Keep deleted namespaces visible for `polls` existence checks.
    pub fn with_deletion_polls(mut self, polls: u32) -> Self {
        self.deletion_polls = polls;
        self
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        // A panicking test thread must not wedge the remaining assertions.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record the call and fail it if a failure was injected for it.
    fn enter(
        &self,
        operation: &'static str,
        kind: &'static str,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<MutexGuard<'_, MockState>, ControlPlaneError> {
        let mut state = self.lock();
        let resource = match namespace {
            Some(ns) => format!("{ns}/{name}"),
            None => name.to_string(),
        };
        state.calls.push(format!("{operation} {kind} {resource}"));
        debug!(operation, kind, resource = %resource, "[MOCK] Control plane call");

        if state
            .failures
            .contains(&(operation.to_string(), kind.to_string()))
        {
            return Err(ControlPlaneError::api(
                operation,
                kind,
                namespace,
                name,
                Some(500),
                "injected failure",
            ));
        }
        Ok(state)
    }

    fn require_namespace(
        state: &MockState,
        operation: &'static str,
        kind: &'static str,
        namespace: &str,
        name: &str,
    ) -> Result<(), ControlPlaneError> {
        match state.namespaces.get(namespace) {
            Some(None) => Ok(()),
            Some(Some(_)) => Err(ControlPlaneError::api(
                operation,
                kind,
                Some(namespace),
                name,
                Some(403),
                "namespace is terminating",
            )),
            None => Err(not_found(operation, kind, Some(namespace), name)),
        }
    }

    /// Play the provider: materialize the workload behind a declaration.
    fn converge(&self, state: &mut MockState, namespace: &str, name: &str, body: &serde_json::Value) {
        if !self.auto_converge {
            return;
        }
        state.services.insert(key(namespace, name));
        state
            .statefulsets
            .entry(key(namespace, name))
            .or_insert_with(|| MockStatefulSet {
                replicas: 1,
                template_labels: BTreeMap::from([("app".to_string(), "vcluster".to_string())]),
            });
        state.pods.insert(
            key(namespace, &format!("{name}-0")),
            Some(self.converged_pod_phase.clone()),
        );

        let endpoint = body["spec"]["controlPlaneEndpoint"]["host"]
            .as_str()
            .unwrap_or("localhost");
        state.secrets.insert(
            key(namespace, &format!("{name}-kubeconfig")),
            BTreeMap::from([(
                "value".to_string(),
                kubeconfig_for(name, &format!("https://{endpoint}")).into_bytes(),
            )]),
        );
    }

    // =========================================================================
    // Setup
    // =========================================================================

    /// Add a node with its allocatable capacity.
    pub fn add_node(&self, name: &str, cpu: &str, memory: &str) {
        self.lock().nodes.push(NodeQuantities::new(name, cpu, memory));
    }

    /// Add a usage sample for a node.
    pub fn set_usage(&self, name: &str, cpu: &str, memory: &str) {
        let mut state = self.lock();
        state.usage.retain(|u| u.node != name);
        state.usage.push(NodeQuantities::new(name, cpu, memory));
    }

    pub fn add_namespace(&self, name: &str) {
        self.lock().namespaces.insert(name.to_string(), None);
    }

    pub fn add_service(&self, namespace: &str, name: &str) {
        self.lock().services.insert(key(namespace, name));
    }

    pub fn add_statefulset(&self, namespace: &str, name: &str, replicas: i32) {
        self.lock().statefulsets.insert(
            key(namespace, name),
            MockStatefulSet {
                replicas,
                ..Default::default()
            },
        );
    }

    pub fn set_pod_phase(&self, namespace: &str, name: &str, phase: Option<&str>) {
        self.lock()
            .pods
            .insert(key(namespace, name), phase.map(str::to_string));
    }

    pub fn insert_secret(&self, namespace: &str, name: &str, secret_key: &str, value: &[u8]) {
        self.lock()
            .secrets
            .entry(key(namespace, name))
            .or_default()
            .insert(secret_key.to_string(), value.to_vec());
    }

    pub fn insert_quota(&self, quota: QuotaDescriptor) {
        self.lock()
            .quotas
            .insert(key(&quota.namespace, &quota.name), quota);
    }

    /// Make every `operation` on `kind` fail with a 500.
    pub fn fail_on(&self, operation: &str, kind: &str) {
        self.lock()
            .failures
            .insert((operation.to_string(), kind.to_string()));
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    /// Calls made so far, as `"<operation> <kind> <resource>"`.
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    /// Number of calls matching `operation` and `kind`.
    pub fn call_count(&self, operation: &str, kind: &str) -> usize {
        let prefix = format!("{operation} {kind} ");
        self.lock()
            .calls
            .iter()
            .filter(|c| c.starts_with(&prefix))
            .count()
    }

    pub fn has_namespace(&self, name: &str) -> bool {
        self.lock().namespaces.contains_key(name)
    }

    pub fn declaration(
        &self,
        kind: DeclarationKind,
        namespace: &str,
        name: &str,
    ) -> Option<serde_json::Value> {
        self.lock()
            .declarations
            .get(&(kind, namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn declaration_count(&self, kind: DeclarationKind) -> usize {
        self.lock()
            .declarations
            .keys()
            .filter(|(k, _, _)| *k == kind)
            .count()
    }

    pub fn quotas(&self, namespace: &str) -> Vec<QuotaDescriptor> {
        self.lock()
            .quotas
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, q)| q.clone())
            .collect()
    }

    pub fn statefulset(&self, namespace: &str, name: &str) -> Option<MockStatefulSet> {
        self.lock().statefulsets.get(&key(namespace, name)).cloned()
    }

    pub fn ingress(&self, namespace: &str, name: &str) -> Option<IngressDescriptor> {
        self.lock().ingresses.get(&key(namespace, name)).cloned()
    }
}

impl Default for MockControlPlane {
    fn default() -> Self {
        Self::new()
    }
}

/// A minimal kubeconfig pointing at `server`.
pub fn kubeconfig_for(name: &str, server: &str) -> String {
    format!(
        "apiVersion: v1\n\
         kind: Config\n\
         clusters:\n\
         - name: {name}\n  \
           cluster:\n    \
             server: {server}\n    \
             certificate-authority-data: bW9jay1jYQ==\n\
         contexts:\n\
         - name: {name}\n  \
           context:\n    \
             cluster: {name}\n    \
             user: {name}\n\
         current-context: {name}\n\
         users:\n\
         - name: {name}\n  \
           user:\n    \
             token: mock\n"
    )
}

#[async_trait]
impl ControlPlane for MockControlPlane {
    async fn list_node_allocatable(&self) -> Result<Vec<NodeQuantities>, ControlPlaneError> {
        let state = self.enter("list", "Node", None, "*")?;
        Ok(state.nodes.clone())
    }

    async fn list_node_usage(&self) -> Result<Vec<NodeQuantities>, ControlPlaneError> {
        let state = self.enter("list", "NodeMetrics", None, "*")?;
        Ok(state.usage.clone())
    }

    async fn get_declaration(
        &self,
        kind: DeclarationKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<serde_json::Value>, ControlPlaneError> {
        let state = self.enter("get", kind.kind(), Some(namespace), name)?;
        Ok(state
            .declarations
            .get(&(kind, namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn create_declaration(
        &self,
        kind: DeclarationKind,
        namespace: &str,
        body: &serde_json::Value,
    ) -> Result<(), ControlPlaneError> {
        let name = body["metadata"]["name"].as_str().unwrap_or_default();
        let mut state = self.enter("create", kind.kind(), Some(namespace), name)?;
        Self::require_namespace(&state, "create", kind.kind(), namespace, name)?;

        let id = (kind, namespace.to_string(), name.to_string());
        if state.declarations.contains_key(&id) {
            return Err(already_exists("create", kind.kind(), Some(namespace), name));
        }

        let mut stored = body.clone();
        stored["metadata"]["resourceVersion"] = serde_json::json!(state.next_revision());
        state.declarations.insert(id, stored);

        if kind == DeclarationKind::VCluster {
            self.converge(&mut state, namespace, name, body);
        }
        Ok(())
    }

    async fn replace_declaration(
        &self,
        kind: DeclarationKind,
        namespace: &str,
        name: &str,
        body: &serde_json::Value,
    ) -> Result<(), ControlPlaneError> {
        let mut state = self.enter("replace", kind.kind(), Some(namespace), name)?;
        let id = (kind, namespace.to_string(), name.to_string());

        let current = state
            .declarations
            .get(&id)
            .ok_or_else(|| not_found("replace", kind.kind(), Some(namespace), name))?;
        if current["metadata"]["resourceVersion"] != body["metadata"]["resourceVersion"] {
            return Err(ControlPlaneError::api(
                "replace",
                kind.kind(),
                Some(namespace),
                name,
                Some(409),
                "resourceVersion mismatch",
            ));
        }

        let mut stored = body.clone();
        stored["metadata"]["resourceVersion"] = serde_json::json!(state.next_revision());
        state.declarations.insert(id, stored);

        if kind == DeclarationKind::VCluster {
            self.converge(&mut state, namespace, name, body);
        }
        Ok(())
    }

    async fn namespace_exists(&self, name: &str) -> Result<bool, ControlPlaneError> {
        let mut state = self.enter("get", "Namespace", None, name)?;
        match state.namespaces.get(name).copied() {
            None => Ok(false),
            Some(None) => Ok(true),
            Some(Some(0)) => {
                state.purge_namespace(name);
                Ok(false)
            }
            Some(Some(left)) => {
                state.namespaces.insert(name.to_string(), Some(left - 1));
                Ok(true)
            }
        }
    }

    async fn namespace_phase(
        &self,
        name: &str,
    ) -> Result<Option<NamespacePhase>, ControlPlaneError> {
        let state = self.enter("get", "Namespace", None, name)?;
        Ok(state.namespaces.get(name).map(|terminating| match terminating {
            Some(_) => NamespacePhase::Terminating,
            None => NamespacePhase::Active,
        }))
    }

    async fn create_namespace(&self, name: &str) -> Result<(), ControlPlaneError> {
        let mut state = self.enter("create", "Namespace", None, name)?;
        if state.namespaces.contains_key(name) {
            return Err(already_exists("create", "Namespace", None, name));
        }
        state.namespaces.insert(name.to_string(), None);
        Ok(())
    }

    async fn delete_namespace(&self, name: &str) -> Result<(), ControlPlaneError> {
        let mut state = self.enter("delete", "Namespace", None, name)?;
        match state.namespaces.get(name).copied() {
            None => Err(not_found("delete", "Namespace", None, name)),
            Some(Some(_)) => Ok(()),
            Some(None) if self.deletion_polls == 0 => {
                state.purge_namespace(name);
                Ok(())
            }
            Some(None) => {
                state
                    .namespaces
                    .insert(name.to_string(), Some(self.deletion_polls));
                Ok(())
            }
        }
    }

    async fn list_quota_names(&self, namespace: &str) -> Result<Vec<String>, ControlPlaneError> {
        let state = self.enter("list", "ResourceQuota", Some(namespace), "*")?;
        Ok(state
            .quotas
            .keys()
            .filter(|(ns, _)| ns == namespace)
            .map(|(_, name)| name.clone())
            .collect())
    }

    async fn create_quota(&self, quota: &QuotaDescriptor) -> Result<(), ControlPlaneError> {
        let ns = quota.namespace.as_str();
        let mut state = self.enter("create", "ResourceQuota", Some(ns), &quota.name)?;
        Self::require_namespace(&state, "create", "ResourceQuota", ns, &quota.name)?;

        let id = key(ns, &quota.name);
        if state.quotas.contains_key(&id) {
            return Err(already_exists("create", "ResourceQuota", Some(ns), &quota.name));
        }
        state.quotas.insert(id, quota.clone());
        Ok(())
    }

    async fn delete_quota(&self, namespace: &str, name: &str) -> Result<(), ControlPlaneError> {
        let mut state = self.enter("delete", "ResourceQuota", Some(namespace), name)?;
        state
            .quotas
            .remove(&key(namespace, name))
            .map(|_| ())
            .ok_or_else(|| not_found("delete", "ResourceQuota", Some(namespace), name))
    }

    async fn service_exists(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<bool, ControlPlaneError> {
        let state = self.enter("get", "Service", Some(namespace), name)?;
        Ok(state.services.contains(&key(namespace, name)))
    }

    async fn list_pods(&self, namespace: &str) -> Result<Vec<PodPhase>, ControlPlaneError> {
        let state = self.enter("list", "Pod", Some(namespace), "*")?;
        Ok(state
            .pods
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|((_, name), phase)| PodPhase {
                name: name.clone(),
                phase: phase.clone(),
            })
            .collect())
    }

    async fn get_pod(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PodPhase>, ControlPlaneError> {
        let state = self.enter("get", "Pod", Some(namespace), name)?;
        Ok(state.pods.get(&key(namespace, name)).map(|phase| PodPhase {
            name: name.to_string(),
            phase: phase.clone(),
        }))
    }

    async fn statefulset_replicas(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<i32, ControlPlaneError> {
        let state = self.enter("get", "StatefulSet", Some(namespace), name)?;
        state
            .statefulsets
            .get(&key(namespace, name))
            .map(|sts| sts.replicas)
            .ok_or_else(|| not_found("get", "StatefulSet", Some(namespace), name))
    }

    async fn set_statefulset_replicas(
        &self,
        namespace: &str,
        name: &str,
        replicas: i32,
    ) -> Result<(), ControlPlaneError> {
        let mut state = self.enter("scale", "StatefulSet", Some(namespace), name)?;
        let sts = state
            .statefulsets
            .get_mut(&key(namespace, name))
            .ok_or_else(|| not_found("scale", "StatefulSet", Some(namespace), name))?;
        sts.replicas = replicas;
        Ok(())
    }

    async fn label_pod_template(
        &self,
        namespace: &str,
        name: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<(), ControlPlaneError> {
        let mut state = self.enter("label", "StatefulSet", Some(namespace), name)?;
        let sts = state
            .statefulsets
            .get_mut(&key(namespace, name))
            .ok_or_else(|| not_found("label", "StatefulSet", Some(namespace), name))?;
        sts.template_labels
            .extend(labels.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(())
    }

    async fn ingress_exists(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<bool, ControlPlaneError> {
        let state = self.enter("get", "Ingress", Some(namespace), name)?;
        Ok(state.ingresses.contains_key(&key(namespace, name)))
    }

    async fn create_ingress(&self, ingress: &IngressDescriptor) -> Result<(), ControlPlaneError> {
        let ns = ingress.namespace.as_str();
        let mut state = self.enter("create", "Ingress", Some(ns), &ingress.name)?;
        Self::require_namespace(&state, "create", "Ingress", ns, &ingress.name)?;

        let id = key(ns, &ingress.name);
        if state.ingresses.contains_key(&id) {
            return Err(already_exists("create", "Ingress", Some(ns), &ingress.name));
        }
        state.ingresses.insert(id, ingress.clone());
        Ok(())
    }

    async fn read_secret_key(
        &self,
        namespace: &str,
        name: &str,
        secret_key: &str,
    ) -> Result<Option<Vec<u8>>, ControlPlaneError> {
        let state = self.enter("get", "Secret", Some(namespace), name)?;
        Ok(state
            .secrets
            .get(&key(namespace, name))
            .and_then(|data| data.get(secret_key))
            .cloned())
    }
}

/// In-memory virtual cluster access control.
pub struct MockAccessControl {
    accounts: Mutex<BTreeSet<Key>>,
    grants: Mutex<Vec<AccessGrant>>,
    tokens: Mutex<Vec<(AccessGrant, Vec<String>)>>,
}

impl MockAccessControl {
    pub fn new() -> Self {
        Self {
            accounts: Mutex::new(BTreeSet::new()),
            grants: Mutex::new(Vec::new()),
            tokens: Mutex::new(Vec::new()),
        }
    }

    /// Grants created so far.
    pub fn grants(&self) -> Vec<AccessGrant> {
        self.grants
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Tokens issued so far with the audiences they were issued for.
    pub fn issued(&self) -> Vec<(AccessGrant, Vec<String>)> {
        self.tokens
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }
}

impl Default for MockAccessControl {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AccessControl for MockAccessControl {
    async fn service_account_exists(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<bool, ControlPlaneError> {
        Ok(self
            .accounts
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains(&key(namespace, name)))
    }

    async fn create_access_grant(&self, grant: &AccessGrant) -> Result<(), ControlPlaneError> {
        self.accounts
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(key(&grant.namespace, &grant.identity_name));
        self.grants
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(grant.clone());
        Ok(())
    }

    async fn request_token(
        &self,
        grant: &AccessGrant,
        audiences: &[&str],
    ) -> Result<String, ControlPlaneError> {
        let exists = self
            .accounts
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains(&key(&grant.namespace, &grant.identity_name));
        if !exists {
            return Err(not_found(
                "request token for",
                "ServiceAccount",
                Some(&grant.namespace),
                &grant.identity_name,
            ));
        }

        self.tokens.lock().unwrap_or_else(|p| p.into_inner()).push((
            grant.clone(),
            audiences.iter().map(|a| a.to_string()).collect(),
        ));
        Ok(format!(
            "token-{}-{}",
            grant.identity_name, grant.token_expiry_seconds
        ))
    }
}

/// Resolves kubeconfig documents to registered mocks.
#[derive(Default)]
pub struct MockConnector {
    hosts: HashMap<Vec<u8>, Arc<MockControlPlane>>,
    virtual_clusters: HashMap<Vec<u8>, Arc<MockAccessControl>>,
    connections: AtomicU64,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `host` for `kubeconfig`.
    pub fn with_host(mut self, kubeconfig: &str, host: Arc<MockControlPlane>) -> Self {
        self.hosts.insert(kubeconfig.as_bytes().to_vec(), host);
        self
    }

    /// Serve `access` for `kubeconfig`.
    pub fn with_virtual_cluster(mut self, kubeconfig: &str, access: Arc<MockAccessControl>) -> Self {
        self.virtual_clusters
            .insert(kubeconfig.as_bytes().to_vec(), access);
        self
    }

    /// Number of clients handed out.
    pub fn connections(&self) -> u64 {
        self.connections.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ClusterConnector for MockConnector {
    async fn host(&self, kubeconfig: &[u8]) -> Result<Arc<dyn ControlPlane>, ControlPlaneError> {
        let host = self
            .hosts
            .get(kubeconfig)
            .cloned()
            .ok_or_else(|| ControlPlaneError::InvalidKubeconfig("unknown host".to_string()))?;
        self.connections.fetch_add(1, Ordering::SeqCst);
        Ok(host)
    }

    async fn virtual_cluster(
        &self,
        kubeconfig: &[u8],
    ) -> Result<Arc<dyn AccessControl>, ControlPlaneError> {
        let access = self
            .virtual_clusters
            .get(kubeconfig)
            .cloned()
            .ok_or_else(|| {
                ControlPlaneError::InvalidKubeconfig("unknown virtual cluster".to_string())
            })?;
        self.connections.fetch_add(1, Ordering::SeqCst);
        Ok(access)
    }
}
