//! Lifecycle topics and their payloads.
//!
//! Field names follow the JSON published by the cluster API, so the structs
//! here rename heavily rather than exposing the wire spelling to callers.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};

use crate::envelope::{EventEnvelope, PUBSUB_NAME};
use crate::error::EventError;

// =============================================================================
// Topics
// =============================================================================

/// A lifecycle topic the cluster service subscribes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Topic {
    ClusterCreate,
    ClusterStart,
    ClusterStop,
    ClusterDelete,
    ClusterPlanUpgrade,
}

impl Topic {
    /// Every subscribed topic, in subscription order.
    pub const ALL: [Topic; 5] = [
        Topic::ClusterCreate,
        Topic::ClusterStart,
        Topic::ClusterStop,
        Topic::ClusterDelete,
        Topic::ClusterPlanUpgrade,
    ];

    /// Topic name on the bus.
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::ClusterCreate => "cluster-create",
            Topic::ClusterStart => "cluster-start",
            Topic::ClusterStop => "cluster-stop",
            Topic::ClusterDelete => "cluster-delete",
            Topic::ClusterPlanUpgrade => "cluster-plan-upgrade",
        }
    }

    /// HTTP route (without leading slash) the bus delivers this topic to.
    pub fn route(&self) -> &'static str {
        match self {
            Topic::ClusterCreate => "create-cluster",
            Topic::ClusterStart => "start-cluster",
            Topic::ClusterStop => "stop-cluster",
            Topic::ClusterDelete => "delete-cluster",
            Topic::ClusterPlanUpgrade => "update-cluster-plan",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Topic {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Topic::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| EventError::UnknownTopic(s.to_string()))
    }
}

/// One entry of the programmatic subscription table served to the bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub pubsubname: String,
    pub topic: String,
    pub route: String,
}

/// The full subscription table for the cluster service.
pub fn subscriptions() -> Vec<Subscription> {
    Topic::ALL
        .iter()
        .map(|topic| Subscription {
            pubsubname: PUBSUB_NAME.to_string(),
            topic: topic.as_str().to_string(),
            route: topic.route().to_string(),
        })
        .collect()
}

// =============================================================================
// Subscription plan
// =============================================================================

/// Resource counts granted by a subscription plan.
///
/// Owned by the billing domain; the cluster service only reads it to build
/// namespace quotas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionPlan {
    pub name: String,

    #[serde(deserialize_with = "count")]
    pub pods: u64,

    #[serde(rename = "service", alias = "services", deserialize_with = "count")]
    pub services: u64,

    #[serde(rename = "config_map", alias = "config_maps", deserialize_with = "count")]
    pub config_maps: u64,

    #[serde(
        rename = "persistance_vol_claims",
        alias = "persistent_volume_claims",
        deserialize_with = "count"
    )]
    pub persistent_volume_claims: u64,

    #[serde(
        rename = "replication_ctl",
        alias = "replication_controllers",
        deserialize_with = "count"
    )]
    pub replication_controllers: u64,

    #[serde(deserialize_with = "count")]
    pub secrets: u64,

    #[serde(rename = "loadbalancer", alias = "load_balancers", deserialize_with = "count")]
    pub load_balancers: u64,

    #[serde(rename = "node_port", alias = "node_ports", deserialize_with = "count")]
    pub node_ports: u64,
}

/// Plans are stored by the API with counts as either numbers or strings.
fn count<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Count {
        Number(u64),
        Text(String),
    }

    match Count::deserialize(deserializer)? {
        Count::Number(n) => Ok(n),
        Count::Text(s) => s
            .trim()
            .parse()
            .map_err(|_| serde::de::Error::custom(format!("invalid resource count {s:?}"))),
    }
}

// =============================================================================
// Payloads
// =============================================================================

/// The virtual cluster named by a create event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterRef {
    /// Record id in the cluster API; used as the correlation id.
    pub id: String,
    pub name: String,
    pub kube_version: String,
}

/// Payload of `cluster-create`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterCreate {
    /// Host chosen by the API, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_cluster_id: Option<String>,

    /// Display name of `host_cluster_id`, used in the endpoint host.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_cluster_name: Option<String>,

    /// Candidate hosts of the requested region.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub host_cluster_ids: Vec<String>,

    pub subscription: SubscriptionPlan,

    pub cluster: ClusterRef,
}

impl ClusterCreate {
    /// Hosts to consider for placement, in preference order.
    pub fn candidates(&self) -> Vec<String> {
        if !self.host_cluster_ids.is_empty() {
            return self.host_cluster_ids.clone();
        }
        self.host_cluster_id.iter().cloned().collect()
    }
}

/// Payload of `cluster-start`, `cluster-stop` and `cluster-delete`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterTarget {
    pub host_cluster_id: String,
    pub cluster_name: String,
}

/// The `cluster` field of a plan upgrade: a bare name or a cluster record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PlanUpgradeCluster {
    Name(String),
    Record { name: String },
}

impl PlanUpgradeCluster {
    pub fn name(&self) -> &str {
        match self {
            PlanUpgradeCluster::Name(name) => name,
            PlanUpgradeCluster::Record { name } => name,
        }
    }
}

/// Payload of `cluster-plan-upgrade`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterPlanUpgrade {
    pub host_cluster_id: String,
    pub cluster: PlanUpgradeCluster,
    pub subscription: SubscriptionPlan,
}

// =============================================================================
// Commands
// =============================================================================

/// A decoded lifecycle command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleCommand {
    Create(ClusterCreate),
    Start(ClusterTarget),
    Stop(ClusterTarget),
    Delete(ClusterTarget),
    PlanUpgrade(ClusterPlanUpgrade),
}

impl LifecycleCommand {
    /// Decode the envelope delivered on `topic`.
    pub fn decode(topic: Topic, raw: serde_json::Value) -> Result<Self, EventError> {
        Ok(match topic {
            Topic::ClusterCreate => Self::Create(EventEnvelope::decode(raw)?.data),
            Topic::ClusterStart => Self::Start(EventEnvelope::decode(raw)?.data),
            Topic::ClusterStop => Self::Stop(EventEnvelope::decode(raw)?.data),
            Topic::ClusterDelete => Self::Delete(EventEnvelope::decode(raw)?.data),
            Topic::ClusterPlanUpgrade => Self::PlanUpgrade(EventEnvelope::decode(raw)?.data),
        })
    }

    pub fn topic(&self) -> Topic {
        match self {
            Self::Create(_) => Topic::ClusterCreate,
            Self::Start(_) => Topic::ClusterStart,
            Self::Stop(_) => Topic::ClusterStop,
            Self::Delete(_) => Topic::ClusterDelete,
            Self::PlanUpgrade(_) => Topic::ClusterPlanUpgrade,
        }
    }

    /// Name of the virtual cluster the command acts on.
    pub fn cluster_name(&self) -> &str {
        match self {
            Self::Create(c) => &c.cluster.name,
            Self::Start(t) | Self::Stop(t) | Self::Delete(t) => &t.cluster_name,
            Self::PlanUpgrade(u) => u.cluster.name(),
        }
    }
}
