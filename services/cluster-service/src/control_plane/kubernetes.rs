//! kube-rs implementation of the control plane interface.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::authentication::v1::{TokenRequest, TokenRequestSpec};
use k8s_openapi::api::core::v1::{
    Namespace, Node, Pod, ResourceQuota, ResourceQuotaSpec, Secret, Service, ServiceAccount,
};
use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
    IngressServiceBackend, IngressSpec, IngressTLS, ServiceBackendPort,
};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, PolicyRule, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::discovery::ApiResource;
use kube::{Client, Config};
use tracing::debug;

use super::{
    AccessControl, AccessGrant, ClusterConnector, ControlPlane, ControlPlaneError,
    DeclarationKind, NamespacePhase, NodeQuantities, PodPhase,
};
use crate::descriptor::IngressDescriptor;
use crate::quota::QuotaDescriptor;

/// Map a kube error onto a control plane error for one resource.
fn api_err<'a>(
    operation: &'static str,
    kind: &'static str,
    namespace: Option<&'a str>,
    name: &'a str,
) -> impl FnOnce(kube::Error) -> ControlPlaneError + 'a {
    move |e| {
        let status = match &e {
            kube::Error::Api(response) => Some(response.code),
            _ => None,
        };
        ControlPlaneError::api(operation, kind, namespace, name, status, e.to_string())
    }
}

/// Treat "already exists" as success.
fn tolerate_conflict(result: Result<(), ControlPlaneError>) -> Result<(), ControlPlaneError> {
    match result {
        Err(e) if e.is_already_exists() => Ok(()),
        other => other,
    }
}

fn declaration_resource(kind: DeclarationKind) -> ApiResource {
    ApiResource {
        group: kind.group().to_string(),
        version: kind.version().to_string(),
        api_version: kind.api_version().to_string(),
        kind: kind.kind().to_string(),
        plural: kind.plural().to_string(),
    }
}

fn node_metrics_resource() -> ApiResource {
    ApiResource {
        group: "metrics.k8s.io".to_string(),
        version: "v1beta1".to_string(),
        api_version: "metrics.k8s.io/v1beta1".to_string(),
        kind: "NodeMetrics".to_string(),
        plural: "nodes".to_string(),
    }
}

fn meta(name: &str, namespace: Option<&str>) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: namespace.map(str::to_string),
        ..Default::default()
    }
}

fn quota_object(quota: &QuotaDescriptor) -> ResourceQuota {
    ResourceQuota {
        metadata: meta(&quota.name, Some(quota.namespace.as_str())),
        spec: Some(ResourceQuotaSpec {
            hard: Some(
                quota
                    .hard
                    .iter()
                    .map(|(resource, limit)| (resource.clone(), Quantity(limit.clone())))
                    .collect(),
            ),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn ingress_object(ingress: &IngressDescriptor) -> Ingress {
    let backend = IngressBackend {
        service: Some(IngressServiceBackend {
            name: ingress.service_name.clone(),
            port: Some(ServiceBackendPort {
                number: Some(ingress.service_port),
                ..Default::default()
            }),
        }),
        ..Default::default()
    };

    Ingress {
        metadata: ObjectMeta {
            annotations: Some(ingress.annotations.clone()),
            ..meta(&ingress.name, Some(ingress.namespace.as_str()))
        },
        spec: Some(IngressSpec {
            ingress_class_name: Some(ingress.class_name.clone()),
            tls: Some(vec![IngressTLS {
                hosts: Some(vec![ingress.host.clone()]),
                secret_name: Some(ingress.tls_secret.clone()),
            }]),
            rules: Some(vec![IngressRule {
                host: Some(ingress.host.clone()),
                http: Some(HTTPIngressRuleValue {
                    paths: vec![HTTPIngressPath {
                        path: Some("/".to_string()),
                        path_type: "ImplementationSpecific".to_string(),
                        backend,
                    }],
                }),
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn usage_quantity(data: &serde_json::Value, resource: &str) -> Option<String> {
    data.get("usage")?
        .get(resource)?
        .as_str()
        .map(str::to_string)
}

/// Control plane backed by a host cluster's API server.
#[derive(Clone)]
pub struct KubeControlPlane {
    client: Client,
}

impl KubeControlPlane {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn declarations(&self, kind: DeclarationKind, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &declaration_resource(kind))
    }
}

#[async_trait]
impl ControlPlane for KubeControlPlane {
    async fn list_node_allocatable(&self) -> Result<Vec<NodeQuantities>, ControlPlaneError> {
        let nodes = Api::<Node>::all(self.client.clone())
            .list(&ListParams::default())
            .await
            .map_err(api_err("list", "Node", None, "*"))?;

        nodes
            .items
            .into_iter()
            .map(|node| {
                let name = node.metadata.name.unwrap_or_default();
                let allocatable = node
                    .status
                    .and_then(|s| s.allocatable)
                    .unwrap_or_default();
                let quantity = |resource: &str| {
                    allocatable.get(resource).map(|q| q.0.clone()).ok_or_else(|| {
                        ControlPlaneError::malformed(
                            "Node",
                            None,
                            &name,
                            format!("missing allocatable {resource}"),
                        )
                    })
                };
                let cpu = quantity("cpu")?;
                let memory = quantity("memory")?;
                Ok(NodeQuantities::new(name.clone(), cpu, memory))
            })
            .collect()
    }

    async fn list_node_usage(&self) -> Result<Vec<NodeQuantities>, ControlPlaneError> {
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &node_metrics_resource());
        let samples = api
            .list(&ListParams::default())
            .await
            .map_err(api_err("list", "NodeMetrics", None, "*"))?;

        samples
            .items
            .into_iter()
            .map(|sample| {
                let name = sample.metadata.name.unwrap_or_default();
                match (
                    usage_quantity(&sample.data, "cpu"),
                    usage_quantity(&sample.data, "memory"),
                ) {
                    (Some(cpu), Some(memory)) => Ok(NodeQuantities::new(name, cpu, memory)),
                    _ => Err(ControlPlaneError::malformed(
                        "NodeMetrics",
                        None,
                        &name,
                        "missing usage",
                    )),
                }
            })
            .collect()
    }

    async fn get_declaration(
        &self,
        kind: DeclarationKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<serde_json::Value>, ControlPlaneError> {
        let found = self
            .declarations(kind, namespace)
            .get_opt(name)
            .await
            .map_err(api_err("get", kind.kind(), Some(namespace), name))?;

        found
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| ControlPlaneError::malformed(kind.kind(), Some(namespace), name, e.to_string()))
    }

    async fn create_declaration(
        &self,
        kind: DeclarationKind,
        namespace: &str,
        body: &serde_json::Value,
    ) -> Result<(), ControlPlaneError> {
        let name = body["metadata"]["name"].as_str().unwrap_or_default();
        let object: DynamicObject = serde_json::from_value(body.clone()).map_err(|e| {
            ControlPlaneError::malformed(kind.kind(), Some(namespace), name, e.to_string())
        })?;

        self.declarations(kind, namespace)
            .create(&PostParams::default(), &object)
            .await
            .map_err(api_err("create", kind.kind(), Some(namespace), name))?;
        debug!(kind = kind.kind(), namespace, name, "Created declaration");
        Ok(())
    }

    async fn replace_declaration(
        &self,
        kind: DeclarationKind,
        namespace: &str,
        name: &str,
        body: &serde_json::Value,
    ) -> Result<(), ControlPlaneError> {
        let object: DynamicObject = serde_json::from_value(body.clone()).map_err(|e| {
            ControlPlaneError::malformed(kind.kind(), Some(namespace), name, e.to_string())
        })?;

        self.declarations(kind, namespace)
            .replace(name, &PostParams::default(), &object)
            .await
            .map_err(api_err("replace", kind.kind(), Some(namespace), name))?;
        debug!(kind = kind.kind(), namespace, name, "Replaced declaration");
        Ok(())
    }

    async fn namespace_exists(&self, name: &str) -> Result<bool, ControlPlaneError> {
        Api::<Namespace>::all(self.client.clone())
            .get_opt(name)
            .await
            .map(|ns| ns.is_some())
            .map_err(api_err("get", "Namespace", None, name))
    }

    async fn namespace_phase(
        &self,
        name: &str,
    ) -> Result<Option<NamespacePhase>, ControlPlaneError> {
        let namespace = Api::<Namespace>::all(self.client.clone())
            .get_opt(name)
            .await
            .map_err(api_err("get", "Namespace", None, name))?;
        Ok(namespace.map(|ns| {
            NamespacePhase::from_status(ns.status.and_then(|s| s.phase).as_deref())
        }))
    }

    async fn create_namespace(&self, name: &str) -> Result<(), ControlPlaneError> {
        let namespace = Namespace {
            metadata: meta(name, None),
            ..Default::default()
        };
        Api::<Namespace>::all(self.client.clone())
            .create(&PostParams::default(), &namespace)
            .await
            .map_err(api_err("create", "Namespace", None, name))?;
        Ok(())
    }

    async fn delete_namespace(&self, name: &str) -> Result<(), ControlPlaneError> {
        Api::<Namespace>::all(self.client.clone())
            .delete(name, &DeleteParams::default())
            .await
            .map_err(api_err("delete", "Namespace", None, name))?;
        Ok(())
    }

    async fn list_quota_names(&self, namespace: &str) -> Result<Vec<String>, ControlPlaneError> {
        let quotas = Api::<ResourceQuota>::namespaced(self.client.clone(), namespace)
            .list(&ListParams::default())
            .await
            .map_err(api_err("list", "ResourceQuota", Some(namespace), "*"))?;

        Ok(quotas
            .items
            .into_iter()
            .filter_map(|q| q.metadata.name)
            .collect())
    }

    async fn create_quota(&self, quota: &QuotaDescriptor) -> Result<(), ControlPlaneError> {
        Api::<ResourceQuota>::namespaced(self.client.clone(), &quota.namespace)
            .create(&PostParams::default(), &quota_object(quota))
            .await
            .map_err(api_err("create", "ResourceQuota", Some(quota.namespace.as_str()), &quota.name))?;
        Ok(())
    }

    async fn delete_quota(&self, namespace: &str, name: &str) -> Result<(), ControlPlaneError> {
        Api::<ResourceQuota>::namespaced(self.client.clone(), namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map_err(api_err("delete", "ResourceQuota", Some(namespace), name))?;
        Ok(())
    }

    async fn service_exists(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<bool, ControlPlaneError> {
        Api::<Service>::namespaced(self.client.clone(), namespace)
            .get_opt(name)
            .await
            .map(|svc| svc.is_some())
            .map_err(api_err("get", "Service", Some(namespace), name))
    }

    async fn list_pods(&self, namespace: &str) -> Result<Vec<PodPhase>, ControlPlaneError> {
        let pods = Api::<Pod>::namespaced(self.client.clone(), namespace)
            .list(&ListParams::default())
            .await
            .map_err(api_err("list", "Pod", Some(namespace), "*"))?;

        Ok(pods
            .items
            .into_iter()
            .map(|pod| PodPhase {
                name: pod.metadata.name.unwrap_or_default(),
                phase: pod.status.and_then(|s| s.phase),
            })
            .collect())
    }

    async fn get_pod(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PodPhase>, ControlPlaneError> {
        let pod = Api::<Pod>::namespaced(self.client.clone(), namespace)
            .get_opt(name)
            .await
            .map_err(api_err("get", "Pod", Some(namespace), name))?;

        Ok(pod.map(|pod| PodPhase {
            name: name.to_string(),
            phase: pod.status.and_then(|s| s.phase),
        }))
    }

    async fn statefulset_replicas(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<i32, ControlPlaneError> {
        let sts = Api::<StatefulSet>::namespaced(self.client.clone(), namespace)
            .get(name)
            .await
            .map_err(api_err("get", "StatefulSet", Some(namespace), name))?;

        // The API server defaults unset replicas to 1.
        Ok(sts.spec.and_then(|s| s.replicas).unwrap_or(1))
    }

    async fn set_statefulset_replicas(
        &self,
        namespace: &str,
        name: &str,
        replicas: i32,
    ) -> Result<(), ControlPlaneError> {
        let patch = serde_json::json!({ "spec": { "replicas": replicas } });
        Api::<StatefulSet>::namespaced(self.client.clone(), namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(api_err("scale", "StatefulSet", Some(namespace), name))?;
        Ok(())
    }

    async fn label_pod_template(
        &self,
        namespace: &str,
        name: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<(), ControlPlaneError> {
        let patch = serde_json::json!({
            "spec": { "template": { "metadata": { "labels": labels } } }
        });
        Api::<StatefulSet>::namespaced(self.client.clone(), namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(api_err("label", "StatefulSet", Some(namespace), name))?;
        Ok(())
    }

    async fn ingress_exists(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<bool, ControlPlaneError> {
        Api::<Ingress>::namespaced(self.client.clone(), namespace)
            .get_opt(name)
            .await
            .map(|ing| ing.is_some())
            .map_err(api_err("get", "Ingress", Some(namespace), name))
    }

    async fn create_ingress(&self, ingress: &IngressDescriptor) -> Result<(), ControlPlaneError> {
        Api::<Ingress>::namespaced(self.client.clone(), &ingress.namespace)
            .create(&PostParams::default(), &ingress_object(ingress))
            .await
            .map_err(api_err("create", "Ingress", Some(ingress.namespace.as_str()), &ingress.name))?;
        Ok(())
    }

    async fn read_secret_key(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
    ) -> Result<Option<Vec<u8>>, ControlPlaneError> {
        let secret = Api::<Secret>::namespaced(self.client.clone(), namespace)
            .get_opt(name)
            .await
            .map_err(api_err("get", "Secret", Some(namespace), name))?;

        Ok(secret
            .and_then(|s| s.data)
            .and_then(|mut data| data.remove(key))
            .map(|bytes| bytes.0))
    }
}

/// Access control backed by a virtual cluster's API server.
#[derive(Clone)]
pub struct KubeAccessControl {
    client: Client,
}

impl KubeAccessControl {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl AccessControl for KubeAccessControl {
    async fn service_account_exists(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<bool, ControlPlaneError> {
        Api::<ServiceAccount>::namespaced(self.client.clone(), namespace)
            .get_opt(name)
            .await
            .map(|sa| sa.is_some())
            .map_err(api_err("get", "ServiceAccount", Some(namespace), name))
    }

    async fn create_access_grant(&self, grant: &AccessGrant) -> Result<(), ControlPlaneError> {
        let ns = grant.namespace.as_str();

        let account = ServiceAccount {
            metadata: meta(&grant.identity_name, Some(ns)),
            ..Default::default()
        };
        tolerate_conflict(
            Api::<ServiceAccount>::namespaced(self.client.clone(), ns)
                .create(&PostParams::default(), &account)
                .await
                .map(|_| ())
                .map_err(api_err("create", "ServiceAccount", Some(ns), &grant.identity_name)),
        )?;

        let role = ClusterRole {
            metadata: meta(&grant.role_name, None),
            rules: Some(vec![PolicyRule {
                api_groups: Some(vec!["*".to_string()]),
                resources: Some(vec!["*".to_string()]),
                verbs: vec!["*".to_string()],
                ..Default::default()
            }]),
            ..Default::default()
        };
        tolerate_conflict(
            Api::<ClusterRole>::all(self.client.clone())
                .create(&PostParams::default(), &role)
                .await
                .map(|_| ())
                .map_err(api_err("create", "ClusterRole", None, &grant.role_name)),
        )?;

        let binding = ClusterRoleBinding {
            metadata: meta(&grant.binding_name, None),
            role_ref: RoleRef {
                api_group: "rbac.authorization.k8s.io".to_string(),
                kind: "ClusterRole".to_string(),
                name: grant.role_name.clone(),
            },
            subjects: Some(vec![Subject {
                kind: "ServiceAccount".to_string(),
                name: grant.identity_name.clone(),
                namespace: Some(ns.to_string()),
                ..Default::default()
            }]),
        };
        tolerate_conflict(
            Api::<ClusterRoleBinding>::all(self.client.clone())
                .create(&PostParams::default(), &binding)
                .await
                .map(|_| ())
                .map_err(api_err("create", "ClusterRoleBinding", None, &grant.binding_name)),
        )
    }

    async fn request_token(
        &self,
        grant: &AccessGrant,
        audiences: &[&str],
    ) -> Result<String, ControlPlaneError> {
        let ns = grant.namespace.as_str();
        let name = grant.identity_name.as_str();

        let request = TokenRequest {
            metadata: meta(name, Some(ns)),
            spec: TokenRequestSpec {
                audiences: audiences.iter().map(|a| a.to_string()).collect(),
                expiration_seconds: Some(grant.token_expiry_seconds),
                ..Default::default()
            },
            status: None,
        };
        let body = serde_json::to_vec(&request)
            .map_err(|e| ControlPlaneError::malformed("TokenRequest", Some(ns), name, e.to_string()))?;

        let response: TokenRequest = Api::<ServiceAccount>::namespaced(self.client.clone(), ns)
            .create_subresource("token", name, &PostParams::default(), body)
            .await
            .map_err(api_err("request token for", "ServiceAccount", Some(ns), name))?;

        response
            .status
            .map(|s| s.token)
            .ok_or_else(|| ControlPlaneError::malformed("TokenRequest", Some(ns), name, "no token issued"))
    }
}

/// Builds kube-rs clients from kubeconfig documents.
#[derive(Debug, Clone, Default)]
pub struct KubeConnector;

impl KubeConnector {
    pub fn new() -> Self {
        Self
    }

    async fn client(kubeconfig: &[u8]) -> Result<Client, ControlPlaneError> {
        let text = std::str::from_utf8(kubeconfig)
            .map_err(|e| ControlPlaneError::InvalidKubeconfig(format!("not UTF-8: {e}")))?;
        let kubeconfig: Kubeconfig = serde_yaml::from_str(text)
            .map_err(|e| ControlPlaneError::InvalidKubeconfig(format!("invalid YAML: {e}")))?;
        let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| ControlPlaneError::InvalidKubeconfig(e.to_string()))?;
        Client::try_from(config).map_err(|e| ControlPlaneError::InvalidKubeconfig(e.to_string()))
    }
}

#[async_trait]
impl ClusterConnector for KubeConnector {
    async fn host(&self, kubeconfig: &[u8]) -> Result<Arc<dyn ControlPlane>, ControlPlaneError> {
        Ok(Arc::new(KubeControlPlane::new(Self::client(kubeconfig).await?)))
    }

    async fn virtual_cluster(
        &self,
        kubeconfig: &[u8],
    ) -> Result<Arc<dyn AccessControl>, ControlPlaneError> {
        Ok(Arc::new(KubeAccessControl::new(Self::client(kubeconfig).await?)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::VirtualClusterDescriptor;

    #[test]
    fn test_declaration_resource() {
        let ar = declaration_resource(DeclarationKind::VCluster);
        assert_eq!(ar.group, "infrastructure.cluster.x-k8s.io");
        assert_eq!(ar.plural, "vclusters");
        assert_eq!(ar.api_version, "infrastructure.cluster.x-k8s.io/v1alpha1");
    }

    #[test]
    fn test_quota_object() {
        let quota = QuotaDescriptor {
            name: "starter".to_string(),
            namespace: "alpha-vcluster".to_string(),
            hard: BTreeMap::from([("pods".to_string(), "10".to_string())]),
        };
        let object = quota_object(&quota);
        assert_eq!(object.metadata.namespace.as_deref(), Some("alpha-vcluster"));
        let hard = object.spec.unwrap().hard.unwrap();
        assert_eq!(hard["pods"], Quantity("10".to_string()));
    }

    #[test]
    fn test_ingress_object() {
        let descriptor =
            VirtualClusterDescriptor::new("alpha", "host-a", "eu-1", "example.com", "v1.30.2", "c-1");
        let object = ingress_object(&descriptor.ingress());

        let spec = object.spec.unwrap();
        assert_eq!(spec.ingress_class_name.as_deref(), Some("nginx"));
        let rule = &spec.rules.unwrap()[0];
        assert_eq!(rule.host.as_deref(), Some("alpha.eu-1.example.com"));
        let path = &rule.http.as_ref().unwrap().paths[0];
        let service = path.backend.service.as_ref().unwrap();
        assert_eq!(service.name, "alpha");
        assert_eq!(service.port.as_ref().unwrap().number, Some(443));
        assert_eq!(spec.tls.unwrap()[0].secret_name.as_deref(), Some("tls-secret"));
    }

    #[test]
    fn test_usage_quantity() {
        let data = serde_json::json!({"usage": {"cpu": "250m", "memory": "512Mi"}});
        assert_eq!(usage_quantity(&data, "cpu").as_deref(), Some("250m"));
        assert_eq!(usage_quantity(&serde_json::json!({}), "cpu"), None);
    }

    #[tokio::test]
    async fn test_connector_rejects_garbage() {
        let err = KubeConnector::client(b"\xff\xfe").await.err().unwrap();
        assert!(matches!(err, ControlPlaneError::InvalidKubeconfig(_)));
    }
}
