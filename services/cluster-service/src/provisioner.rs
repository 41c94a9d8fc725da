//! Idempotent virtual cluster provisioning.
//!
//! `provision` converges one descriptor onto a host:
//!
//! ```text
//! VCluster exists?
//!   yes -> replace spec (current resourceVersion) -> wait for service
//!          -> wait for pods
//!   no  -> [delete stale namespace, wait] -> namespace -> Cluster -> VCluster
//!          -> ResourceQuota -> wait for service -> ingress -> wait for pods
//! ```
//!
//! The pod wait is skipped when the service never appeared.
//!
//! Every step tolerates objects left behind by an earlier attempt, so a
//! redelivered create converges instead of failing.

use fleet_events::SubscriptionPlan;
use tracing::{debug, info, instrument, warn};

use crate::control_plane::{ControlPlane, ControlPlaneError, DeclarationKind};
use crate::descriptor::{ChartConfig, VirtualClusterDescriptor};
use crate::error::ServiceError;
use crate::quota::QuotaDescriptor;
use crate::readiness::{PodReadiness, ReadinessWatcher, ServiceReadiness};

/// What `provision` did to the declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionAction {
    Created,
    Updated,
}

/// Result of converging one virtual cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionReport {
    pub action: ProvisionAction,
    pub descriptor: VirtualClusterDescriptor,
    pub service: ServiceReadiness,
    /// `None` when the service never appeared and pods were not awaited.
    pub pods: Option<PodReadiness>,
}

impl ProvisionReport {
    /// True once the service exists and every workload pod is running.
    pub fn is_ready(&self) -> bool {
        self.service.is_present() && self.pods.as_ref().is_some_and(PodReadiness::is_ready)
    }
}

/// Treat "already exists" as success. Returns whether the object was created.
fn tolerate_existing(result: Result<(), ControlPlaneError>) -> Result<bool, ControlPlaneError> {
    match result {
        Ok(()) => Ok(true),
        Err(e) if e.is_already_exists() => Ok(false),
        Err(e) => Err(e),
    }
}

/// Creates and updates virtual clusters on a host.
#[derive(Debug, Clone)]
pub struct Provisioner {
    chart: ChartConfig,
    watcher: ReadinessWatcher,
}

impl Provisioner {
    pub fn new(chart: ChartConfig, watcher: ReadinessWatcher) -> Self {
        Self { chart, watcher }
    }

    /// Create or update the virtual cluster described by `descriptor`.
    #[instrument(skip_all, fields(cluster = %descriptor.name, namespace = %descriptor.namespace, host_cluster_id = %descriptor.host_id))]
    pub async fn provision(
        &self,
        control_plane: &dyn ControlPlane,
        descriptor: &VirtualClusterDescriptor,
        plan: &SubscriptionPlan,
    ) -> Result<ProvisionReport, ServiceError> {
        let existing = control_plane
            .get_declaration(DeclarationKind::VCluster, &descriptor.namespace, &descriptor.name)
            .await?;

        match existing {
            Some(current) => self.update(control_plane, descriptor, current).await,
            None => self.create(control_plane, descriptor, plan).await,
        }
    }

    async fn update(
        &self,
        control_plane: &dyn ControlPlane,
        descriptor: &VirtualClusterDescriptor,
        mut current: serde_json::Value,
    ) -> Result<ProvisionReport, ServiceError> {
        let spec = descriptor
            .vcluster_spec(&self.chart)
            .map_err(|e| ServiceError::Upstream(format!("failed to render vcluster values: {e}")))?;
        let revision = current["metadata"]["resourceVersion"].clone();
        current["spec"] = spec;

        control_plane
            .replace_declaration(
                DeclarationKind::VCluster,
                &descriptor.namespace,
                &descriptor.name,
                &current,
            )
            .await?;
        info!(resource_version = %revision, "Updated existing VCluster declaration");

        let service = self
            .watcher
            .wait_for_service(control_plane, &descriptor.namespace, &descriptor.name)
            .await?;
        let pods = self.await_pods(control_plane, descriptor, service).await?;

        Ok(ProvisionReport {
            action: ProvisionAction::Updated,
            descriptor: descriptor.clone(),
            service,
            pods,
        })
    }

    async fn await_pods(
        &self,
        control_plane: &dyn ControlPlane,
        descriptor: &VirtualClusterDescriptor,
        service: ServiceReadiness,
    ) -> Result<Option<PodReadiness>, ServiceError> {
        if !service.is_present() {
            warn!("Skipping pod wait, service is missing");
            return Ok(None);
        }
        let pods = self.watcher.wait_for_pods(control_plane, descriptor).await?;
        Ok(Some(pods))
    }

    async fn create(
        &self,
        control_plane: &dyn ControlPlane,
        descriptor: &VirtualClusterDescriptor,
        plan: &SubscriptionPlan,
    ) -> Result<ProvisionReport, ServiceError> {
        let namespace = descriptor.namespace.as_str();
        let vcluster = descriptor
            .vcluster_manifest(&self.chart)
            .map_err(|e| ServiceError::Upstream(format!("failed to render vcluster values: {e}")))?;

        if control_plane.namespace_exists(namespace).await? {
            warn!("Namespace left over from an earlier cluster, deleting it first");
            control_plane.delete_namespace(namespace).await?;
            self.watcher
                .wait_for_namespace_deletion(control_plane, namespace)
                .await?;
        }

        control_plane.create_namespace(namespace).await?;
        debug!("Created namespace");

        let created = tolerate_existing(
            control_plane
                .create_declaration(DeclarationKind::Cluster, namespace, &descriptor.cluster_manifest())
                .await,
        )?;
        debug!(created, "Ensured Cluster declaration");

        let created = tolerate_existing(
            control_plane
                .create_declaration(DeclarationKind::VCluster, namespace, &vcluster)
                .await,
        )?;
        debug!(created, "Ensured VCluster declaration");

        let quota = QuotaDescriptor::from_plan(plan, namespace);
        let created = tolerate_existing(control_plane.create_quota(&quota).await)?;
        debug!(quota = %quota.name, created, "Ensured resource quota");

        let service = self
            .watcher
            .wait_for_service(control_plane, namespace, &descriptor.name)
            .await?;
        self.ensure_ingress(control_plane, descriptor).await?;

        let pods = self.await_pods(control_plane, descriptor, service).await?;
        let report = ProvisionReport {
            action: ProvisionAction::Created,
            descriptor: descriptor.clone(),
            service,
            pods,
        };
        info!(ready = report.is_ready(), "Provisioned virtual cluster");
        Ok(report)
    }

    async fn ensure_ingress(
        &self,
        control_plane: &dyn ControlPlane,
        descriptor: &VirtualClusterDescriptor,
    ) -> Result<(), ServiceError> {
        if control_plane
            .ingress_exists(&descriptor.namespace, &descriptor.name)
            .await?
        {
            debug!("Ingress already present");
            return Ok(());
        }

        let ingress = descriptor.ingress();
        tolerate_existing(control_plane.create_ingress(&ingress).await)?;
        info!(host = %ingress.host, "Exposed virtual cluster endpoint");
        Ok(())
    }

    /// Swap the namespace's quotas for the one derived from `plan`.
    ///
    /// Existing quotas are removed first so the namespace never carries two
    /// sets of limits.
    #[instrument(skip(self, control_plane, plan), fields(plan = %plan.name))]
    pub async fn replace_quotas(
        &self,
        control_plane: &dyn ControlPlane,
        namespace: &str,
        plan: &SubscriptionPlan,
    ) -> Result<QuotaDescriptor, ServiceError> {
        let quota = QuotaDescriptor::from_plan(plan, namespace);

        for name in control_plane.list_quota_names(namespace).await? {
            match control_plane.delete_quota(namespace, &name).await {
                Ok(()) => debug!(quota = %name, "Deleted quota"),
                Err(e) if e.is_not_found() => debug!(quota = %name, "Quota already gone"),
                Err(e) => return Err(e.into()),
            }
        }

        control_plane.create_quota(&quota).await?;
        info!(quota = %quota.name, "Applied subscription plan");
        Ok(quota)
    }
}
