//! Virtual cluster descriptors and the manifests rendered from them.
//!
//! A descriptor is the resolved identity of one virtual cluster on one host:
//! its namespace, public endpoint and the correlation id used to find its
//! workload again. Manifests are rendered from descriptors, never stored.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::control_plane::DeclarationKind;

/// Suffix appended to a cluster name to form its host namespace.
pub const NAMESPACE_SUFFIX: &str = "-vcluster";

/// Public port of every virtual cluster endpoint.
pub const ENDPOINT_PORT: u16 = 443;

/// Label marking a workload as managed by the cluster manager.
pub const MANAGER_LABEL: &str = "status-controller-vcluster";
pub const MANAGER_LABEL_VALUE: &str = "cluster-manager";

/// Label carrying the cluster's correlation id.
pub const CORRELATION_LABEL: &str = "status-controller";

/// Host namespace of a virtual cluster.
pub fn namespace_for(name: &str) -> String {
    format!("{name}{NAMESPACE_SUFFIX}")
}

/// Helm chart the vcluster provider installs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChartConfig {
    pub name: String,
    pub repo: String,
    pub version: String,
}

impl Default for ChartConfig {
    fn default() -> Self {
        Self {
            name: "vcluster".to_string(),
            repo: "https://charts.loft.sh".to_string(),
            version: "0.20.0".to_string(),
        }
    }
}

/// A virtual cluster placed on a host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VirtualClusterDescriptor {
    pub name: String,
    pub namespace: String,
    pub host_id: String,
    pub kube_version: String,
    pub endpoint_host: String,
    pub correlation_id: String,
}

impl VirtualClusterDescriptor {
    /// Build a descriptor. `host_label` names the host in the endpoint,
    /// `domain` is the fleet's public domain.
    pub fn new(
        name: &str,
        host_id: &str,
        host_label: &str,
        domain: &str,
        kube_version: &str,
        correlation_id: &str,
    ) -> Self {
        Self {
            name: name.to_string(),
            namespace: namespace_for(name),
            host_id: host_id.to_string(),
            kube_version: kube_version.to_string(),
            endpoint_host: format!("{name}.{host_label}.{domain}"),
            correlation_id: correlation_id.to_string(),
        }
    }

    /// CAPI `Cluster` referencing the VCluster as control plane and
    /// infrastructure.
    pub fn cluster_manifest(&self) -> serde_json::Value {
        let vcluster = DeclarationKind::VCluster;
        let reference = serde_json::json!({
            "apiVersion": vcluster.api_version(),
            "kind": vcluster.kind(),
            "name": self.name,
        });

        serde_json::json!({
            "apiVersion": DeclarationKind::Cluster.api_version(),
            "kind": DeclarationKind::Cluster.kind(),
            "metadata": {
                "name": self.name,
                "namespace": self.namespace,
            },
            "spec": {
                "controlPlaneRef": reference,
                "infrastructureRef": reference,
            }
        })
    }

    /// Desired `spec` of the VCluster declaration.
    pub fn vcluster_spec(&self, chart: &ChartConfig) -> Result<serde_json::Value, serde_yaml::Error> {
        let values = serde_json::json!({
            "controlPlane": {
                "distro": {
                    "k8s": {
                        "enabled": false,
                        "version": "",
                        "apiServer": {
                            "enabled": true,
                            "image": {
                                "registry": "registry.k8s.io",
                                "repository": "kube-apiserver",
                                "tag": self.kube_version,
                            }
                        },
                        "controllerManager": {
                            "enabled": true,
                            "image": {
                                "registry": "registry.k8s.io",
                                "repository": "kube-controller-manager",
                                "tag": self.kube_version,
                            }
                        }
                    }
                },
                "proxy": {
                    "extraSANs": [self.endpoint_host],
                }
            }
        });

        Ok(serde_json::json!({
            "controlPlaneEndpoint": {
                "host": self.endpoint_host,
                "port": ENDPOINT_PORT,
            },
            "helmRelease": {
                "chart": {
                    "name": chart.name,
                    "repo": chart.repo,
                    "version": chart.version,
                },
                "values": serde_yaml::to_string(&values)?,
            }
        }))
    }

    /// Full VCluster declaration.
    pub fn vcluster_manifest(
        &self,
        chart: &ChartConfig,
    ) -> Result<serde_json::Value, serde_yaml::Error> {
        Ok(serde_json::json!({
            "apiVersion": DeclarationKind::VCluster.api_version(),
            "kind": DeclarationKind::VCluster.kind(),
            "metadata": {
                "name": self.name,
                "namespace": self.namespace,
            },
            "spec": self.vcluster_spec(chart)?,
        }))
    }

    /// Labels stamped on the workload's pod template once it is running.
    pub fn workload_labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (MANAGER_LABEL.to_string(), MANAGER_LABEL_VALUE.to_string()),
            (CORRELATION_LABEL.to_string(), self.correlation_id.clone()),
        ])
    }

    /// Ingress exposing the virtual cluster's API server.
    pub fn ingress(&self) -> IngressDescriptor {
        IngressDescriptor {
            name: self.name.clone(),
            namespace: self.namespace.clone(),
            host: self.endpoint_host.clone(),
            service_name: self.name.clone(),
            service_port: i32::from(ENDPOINT_PORT),
            class_name: "nginx".to_string(),
            tls_secret: "tls-secret".to_string(),
            annotations: BTreeMap::from([
                (
                    "nginx.ingress.kubernetes.io/backend-protocol".to_string(),
                    "HTTPS".to_string(),
                ),
                (
                    "nginx.ingress.kubernetes.io/ssl-passthrough".to_string(),
                    "true".to_string(),
                ),
                (
                    "nginx.ingress.kubernetes.io/ssl-redirect".to_string(),
                    "true".to_string(),
                ),
                (
                    "cert-manager.io/cluster-issuer".to_string(),
                    "letsencrypt-prod".to_string(),
                ),
            ]),
        }
    }
}

/// A TLS-passthrough ingress routing one host to one service port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngressDescriptor {
    pub name: String,
    pub namespace: String,
    pub host: String,
    pub service_name: String,
    pub service_port: i32,
    pub class_name: String,
    pub tls_secret: String,
    pub annotations: BTreeMap<String, String>,
}
