//! Lifecycle command dispatcher.
//!
//! Routes each decoded command to its pipeline and reports a structured
//! outcome:
//!
//! - `create`: look for a host that already declares the cluster and update
//!   it in place; otherwise metrics for every candidate host (concurrently),
//!   placement, then provisioning and readiness on the chosen host
//! - `start` / `stop`: scale the workload to 1 / 0 if it is not already there
//! - `delete`: request namespace deletion and return at once
//! - `plan-upgrade`: replace the namespace's quotas
//!
//! Commands for the same cluster name are serialized; everything else runs
//! independently.

mod locks;
mod progress;

use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument, warn};

use fleet_events::{ClusterCreate, ClusterPlanUpgrade, ClusterTarget, LifecycleCommand, Topic};

use crate::control_plane::DeclarationKind;
use crate::credentials::{ClusterCredentials, CredentialIssuer, Lifetime};
use crate::descriptor::{namespace_for, VirtualClusterDescriptor};
use crate::error::ServiceError;
use crate::metrics;
use crate::placement::{HostMetrics, PlacementSelector};
use crate::provisioner::{ProvisionAction, Provisioner};
use crate::sessions::{HostSession, SessionRegistry};
use crate::status::{self, ClusterStatus, ProvisioningState};

pub use locks::{ClusterGuard, ClusterLocks};
pub use progress::Progress;
use progress::ProgressBoard;

/// Result of one lifecycle command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleOutcome {
    pub topic: Topic,
    pub cluster: String,
    pub host_cluster_id: String,
    pub state: ProvisioningState,
    /// False when the command completed but the cluster is not serving.
    pub ready: bool,
    pub message: String,
}

impl LifecycleOutcome {
    fn new(
        topic: Topic,
        cluster: &str,
        host_cluster_id: &str,
        state: ProvisioningState,
        message: impl Into<String>,
    ) -> Self {
        Self {
            topic,
            cluster: cluster.to_string(),
            host_cluster_id: host_cluster_id.to_string(),
            state,
            ready: state == ProvisioningState::Ready,
            message: message.into(),
        }
    }
}

/// Least loaded host of a capacity check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapacityReport {
    pub id: String,
    pub best_cpu: f64,
    pub best_memory: f64,
}

impl From<HostMetrics> for CapacityReport {
    fn from(host: HostMetrics) -> Self {
        Self {
            id: host.host_id,
            best_cpu: host.cpu_pct,
            best_memory: host.mem_pct,
        }
    }
}

/// Host name used in a new cluster's endpoint: the event's display name
/// when the chosen host is the one the event named, otherwise its id.
fn host_label(event: &ClusterCreate, host_cluster_id: &str) -> String {
    match (&event.host_cluster_id, &event.host_cluster_name) {
        (Some(id), Some(name)) if id == host_cluster_id => name.clone(),
        _ => host_cluster_id.to_string(),
    }
}

/// Drives lifecycle pipelines.
#[derive(Clone)]
pub struct Dispatcher {
    sessions: SessionRegistry,
    placement: PlacementSelector,
    provisioner: Provisioner,
    credentials: CredentialIssuer,
    locks: ClusterLocks,
    progress: ProgressBoard,
    domain: String,
}

impl Dispatcher {
    /// `domain` is the public domain endpoints are published under.
    pub fn new(
        sessions: SessionRegistry,
        placement: PlacementSelector,
        provisioner: Provisioner,
        domain: impl Into<String>,
    ) -> Self {
        let credentials = CredentialIssuer::new(sessions.connector());
        Self {
            sessions,
            placement,
            provisioner,
            credentials,
            locks: ClusterLocks::new(),
            progress: ProgressBoard::new(),
            domain: domain.into(),
        }
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    /// Cluster names with a command running or queued.
    pub fn in_flight(&self) -> Vec<String> {
        self.locks.active()
    }

    /// Provisioning state of every create still running.
    pub fn progress(&self) -> Vec<Progress> {
        self.progress.snapshot()
    }

    /// Run one command to completion.
    #[instrument(skip_all, fields(topic = %command.topic(), cluster = %command.cluster_name()))]
    pub async fn dispatch(&self, command: &LifecycleCommand) -> Result<LifecycleOutcome, ServiceError> {
        let _guard = self.locks.lock(command.cluster_name()).await;

        let result = match command {
            LifecycleCommand::Create(event) => self.create(event).await,
            LifecycleCommand::Start(target) => self.start(target).await,
            LifecycleCommand::Stop(target) => self.stop(target).await,
            LifecycleCommand::Delete(target) => self.delete(target).await,
            LifecycleCommand::PlanUpgrade(upgrade) => self.plan_upgrade(upgrade).await,
        };

        match &result {
            Ok(outcome) => info!(
                host_cluster_id = %outcome.host_cluster_id,
                state = %outcome.state,
                ready = outcome.ready,
                "{}",
                outcome.message
            ),
            Err(e) => error!(error = %e, "Lifecycle command failed"),
        }
        result
    }

    // =========================================================================
    // Create
    // =========================================================================

    async fn create(&self, event: &ClusterCreate) -> Result<LifecycleOutcome, ServiceError> {
        let name = event.cluster.name.as_str();
        let progress = self.progress.track(name, ProvisioningState::Placing);

        if let Some(session) = self.find_existing(event).await {
            info!(
                host_cluster_id = %session.host_cluster_id(),
                "Cluster already declared, updating in place"
            );
            progress.advance(ProvisioningState::Updating);
            return self.provision_on(&session, event).await;
        }

        let candidates = event.candidates();
        let metrics = self.collect_metrics(&candidates).await;
        let host = self.placement.place(&metrics).await?;
        progress.advance(ProvisioningState::Creating);

        let session = self.sessions.acquire(&host.host_id, Some(name)).await?;
        self.provision_on(&session, event).await
    }

    /// Session on a host that already declares the event's cluster.
    ///
    /// The named host is asked first, then every other candidate
    /// concurrently; the first candidate in order wins. Hosts that cannot be
    /// inspected are skipped.
    async fn find_existing(&self, event: &ClusterCreate) -> Option<HostSession> {
        let name = event.cluster.name.as_str();
        let pinned = event.host_cluster_id.as_deref();

        if let Some(host_id) = pinned {
            match self.existing_on(host_id, name).await {
                Ok(Some(session)) => return Some(session),
                Ok(None) => {}
                Err(e) => warn!(host_cluster_id = %host_id, error = %e, "Could not inspect named host"),
            }
        }

        let others: Vec<String> = event
            .candidates()
            .into_iter()
            .filter(|host_id| Some(host_id.as_str()) != pinned)
            .collect();
        let results = join_all(others.iter().map(|host_id| self.existing_on(host_id, name))).await;

        others
            .iter()
            .zip(results)
            .find_map(|(host_id, result)| match result {
                Ok(found) => found,
                Err(e) => {
                    warn!(host_cluster_id = %host_id, error = %e, "Could not inspect candidate host");
                    None
                }
            })
    }

    /// Session on `host_id` if it already declares cluster `name`.
    async fn existing_on(
        &self,
        host_id: &str,
        name: &str,
    ) -> Result<Option<HostSession>, ServiceError> {
        let session = self.sessions.acquire(host_id, Some(name)).await?;
        let existing = session
            .control_plane()
            .get_declaration(DeclarationKind::VCluster, &namespace_for(name), name)
            .await?;
        Ok(existing.map(|_| session))
    }

    async fn provision_on(
        &self,
        session: &HostSession,
        event: &ClusterCreate,
    ) -> Result<LifecycleOutcome, ServiceError> {
        let host_id = session.host_cluster_id();
        let descriptor = VirtualClusterDescriptor::new(
            &event.cluster.name,
            host_id,
            &host_label(event, host_id),
            &self.domain,
            &event.cluster.kube_version,
            &event.cluster.id,
        );

        let report = self
            .provisioner
            .provision(session.control_plane(), &descriptor, &event.subscription)
            .await?;

        let (state, message) = if !report.service.is_present() {
            (
                ProvisioningState::WaitingForService,
                "Cluster declared but its service was not created",
            )
        } else {
            match (report.action, report.is_ready()) {
                (ProvisionAction::Created, true) => (ProvisioningState::Ready, "Cluster created"),
                (ProvisionAction::Created, false) => (
                    ProvisioningState::WaitingForPods,
                    "Cluster created but its pods are not running",
                ),
                (ProvisionAction::Updated, true) => (ProvisioningState::Ready, "Cluster updated"),
                (ProvisionAction::Updated, false) => (
                    ProvisioningState::Updating,
                    "Cluster updated but its pods are not running",
                ),
            }
        };
        Ok(LifecycleOutcome::new(
            Topic::ClusterCreate,
            &descriptor.name,
            host_id,
            state,
            message,
        ))
    }

    /// Utilization of every reachable candidate. Unreachable hosts are left
    /// out.
    async fn collect_metrics(&self, candidates: &[String]) -> Vec<HostMetrics> {
        let results = join_all(candidates.iter().map(|host_id| async move {
            let session = self.sessions.acquire(host_id, None).await?;
            metrics::collect(host_id, session.control_plane())
                .await
                .map_err(ServiceError::from)
        }))
        .await;

        candidates
            .iter()
            .zip(results)
            .filter_map(|(host_id, result)| match result {
                Ok(m) => Some(m),
                Err(e) => {
                    warn!(host_cluster_id = %host_id, error = %e, "Host excluded from placement");
                    None
                }
            })
            .collect()
    }

    // =========================================================================
    // Start / stop / delete
    // =========================================================================

    async fn start(&self, target: &ClusterTarget) -> Result<LifecycleOutcome, ServiceError> {
        self.scale(Topic::ClusterStart, target, 1).await
    }

    async fn stop(&self, target: &ClusterTarget) -> Result<LifecycleOutcome, ServiceError> {
        self.scale(Topic::ClusterStop, target, 0).await
    }

    async fn scale(
        &self,
        topic: Topic,
        target: &ClusterTarget,
        replicas: i32,
    ) -> Result<LifecycleOutcome, ServiceError> {
        let name = target.cluster_name.as_str();
        let namespace = namespace_for(name);
        let session = self
            .sessions
            .acquire(&target.host_cluster_id, Some(name))
            .await?;
        let control_plane = session.control_plane();

        let (running, stopped) = if replicas == 0 {
            ("Cluster stopped", "Cluster already stopped")
        } else {
            ("Cluster started", "Cluster already started")
        };
        let state = if replicas == 0 {
            ProvisioningState::Stopped
        } else {
            ProvisioningState::Ready
        };

        let current = control_plane.statefulset_replicas(&namespace, name).await?;
        let message = if (current == 0) == (replicas == 0) {
            stopped
        } else {
            control_plane
                .set_statefulset_replicas(&namespace, name, replicas)
                .await?;
            running
        };

        Ok(LifecycleOutcome::new(
            topic,
            name,
            &target.host_cluster_id,
            state,
            message,
        ))
    }

    async fn delete(&self, target: &ClusterTarget) -> Result<LifecycleOutcome, ServiceError> {
        let name = target.cluster_name.as_str();
        let session = self
            .sessions
            .acquire(&target.host_cluster_id, Some(name))
            .await?;

        let message = match session
            .control_plane()
            .delete_namespace(&namespace_for(name))
            .await
        {
            Ok(()) => "Cluster deletion accepted",
            Err(e) if e.is_not_found() => "Cluster already deleted",
            Err(e) => return Err(e.into()),
        };

        Ok(LifecycleOutcome::new(
            Topic::ClusterDelete,
            name,
            &target.host_cluster_id,
            ProvisioningState::Deleting,
            message,
        ))
    }

    // =========================================================================
    // Plan upgrade
    // =========================================================================

    async fn plan_upgrade(
        &self,
        upgrade: &ClusterPlanUpgrade,
    ) -> Result<LifecycleOutcome, ServiceError> {
        let name = upgrade.cluster.name();
        let session = self
            .sessions
            .acquire(&upgrade.host_cluster_id, Some(name))
            .await?;

        let quota = self
            .provisioner
            .replace_quotas(session.control_plane(), &namespace_for(name), &upgrade.subscription)
            .await?;

        Ok(LifecycleOutcome::new(
            Topic::ClusterPlanUpgrade,
            name,
            &upgrade.host_cluster_id,
            ProvisioningState::Ready,
            format!("Plan changed to {}", quota.name),
        ))
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Least loaded host among `host_cluster_ids` that is below thresholds.
    #[instrument(skip(self))]
    pub async fn check_capacity(
        &self,
        host_cluster_ids: &[String],
    ) -> Result<CapacityReport, ServiceError> {
        let metrics = self.collect_metrics(host_cluster_ids).await;
        let host = self.placement.place(&metrics).await?;
        Ok(host.into())
    }

    /// Observed status of cluster `name`. While a create for the cluster is
    /// running, its provisioning state takes precedence over the observed one.
    #[instrument(skip(self))]
    pub async fn status(
        &self,
        host_cluster_id: &str,
        name: &str,
    ) -> Result<ClusterStatus, ServiceError> {
        let session = self.sessions.acquire(host_cluster_id, Some(name)).await?;
        let mut status = status::observe(session.control_plane(), name).await?;
        if let Some(state) = self.progress.get(name) {
            status.state = state;
        }
        Ok(status)
    }

    /// Mint credentials for cluster `name`.
    #[instrument(skip(self))]
    pub async fn generate_config(
        &self,
        host_cluster_id: &str,
        name: &str,
        lifetime: &Lifetime,
    ) -> Result<ClusterCredentials, ServiceError> {
        lifetime.seconds()?;
        let session = self.sessions.acquire(host_cluster_id, Some(name)).await?;
        Ok(self
            .credentials
            .issue(session.control_plane(), name, lifetime)
            .await?)
    }
}
