//! Subscription plan to resource quota translation.

use std::collections::BTreeMap;

use fleet_events::SubscriptionPlan;

/// A namespace resource quota derived from a subscription plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaDescriptor {
    /// Quota object name; the plan's name.
    pub name: String,
    pub namespace: String,
    /// Hard limits keyed by quota resource name.
    pub hard: BTreeMap<String, String>,
}

impl QuotaDescriptor {
    /// Translate `plan` into a quota for `namespace`.
    pub fn from_plan(plan: &SubscriptionPlan, namespace: &str) -> Self {
        let hard = [
            ("pods", plan.pods),
            ("services", plan.services),
            ("configmaps", plan.config_maps),
            ("persistentvolumeclaims", plan.persistent_volume_claims),
            ("replicationcontrollers", plan.replication_controllers),
            ("secrets", plan.secrets),
            ("services.loadbalancers", plan.load_balancers),
            ("services.nodeports", plan.node_ports),
        ]
        .into_iter()
        .map(|(resource, count)| (resource.to_string(), count.to_string()))
        .collect();

        Self {
            name: plan.name.clone(),
            namespace: namespace.to_string(),
            hard,
        }
    }

    /// The quota as a `v1/ResourceQuota` manifest.
    pub fn to_manifest(&self) -> serde_json::Value {
        serde_json::json!({
            "apiVersion": "v1",
            "kind": "ResourceQuota",
            "metadata": {
                "name": self.name,
                "namespace": self.namespace,
            },
            "spec": {
                "hard": self.hard,
            }
        })
    }
}
