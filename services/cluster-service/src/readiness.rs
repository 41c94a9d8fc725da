//! Readiness waits for provisioned virtual clusters.
//!
//! Every wait polls the host control plane on a fixed interval, stops early
//! when the service shuts down, and gives up at its ceiling:
//!
//! | Wait               | Ceiling                     | On ceiling           |
//! |--------------------|-----------------------------|----------------------|
//! | Service exists     | `service_timeout`           | negative result      |
//! | Pods running       | `pod_ready_timeout`         | negative result      |
//! | Namespace deleted  | `namespace_deletion_timeout`| `Timeout` error      |

use std::time::Duration;

use fleet_reconcile::{poll_until, ConvergenceStatus, PollOutcome, PollPolicy};
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::control_plane::{ControlPlane, PodPhase};
use crate::descriptor::VirtualClusterDescriptor;
use crate::error::ServiceError;

/// Poll intervals and ceilings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessConfig {
    pub poll_interval: Duration,
    pub pod_ready_timeout: Duration,
    pub service_timeout: Duration,
    pub namespace_deletion_timeout: Duration,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            poll_interval: fleet_reconcile::DEFAULT_POLL_INTERVAL,
            pod_ready_timeout: fleet_reconcile::DEFAULT_READY_TIMEOUT,
            service_timeout: Duration::from_secs(600),
            namespace_deletion_timeout: Duration::from_secs(600),
        }
    }
}

/// Result of waiting for a workload's pods.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PodReadiness {
    /// Every pod reported Running and the pod template was labelled.
    Ready { pods: usize },
    /// The ceiling elapsed first.
    NotReady { elapsed: Duration },
}

impl PodReadiness {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready { .. })
    }
}

/// Result of waiting for the cluster's Service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceReadiness {
    Present,
    /// The ceiling elapsed before the Service was created.
    Missing { elapsed: Duration },
}

impl ServiceReadiness {
    pub fn is_present(&self) -> bool {
        matches!(self, Self::Present)
    }
}

/// True if `pod` belongs to the stateful workload `name`: the pod is called
/// `name` or `name-<ordinal>`.
pub fn is_workload_pod(name: &str, pod: &str) -> bool {
    match pod.strip_prefix(name) {
        Some("") => true,
        Some(rest) => rest
            .strip_prefix('-')
            .is_some_and(|ordinal| !ordinal.is_empty() && ordinal.bytes().all(|b| b.is_ascii_digit())),
        None => false,
    }
}

/// Classify the workload's pods.
pub fn workload_status(name: &str, pods: &[PodPhase]) -> ConvergenceStatus {
    ConvergenceStatus::from_members(
        pods.iter().filter(|p| is_workload_pod(name, &p.name)),
        |p| p.is_running(),
    )
}

fn cancelled(what: &str) -> ServiceError {
    ServiceError::Cancelled(format!("shutdown while waiting for {what}"))
}

/// Blocks provisioning until the control plane converges.
#[derive(Debug, Clone)]
pub struct ReadinessWatcher {
    config: ReadinessConfig,
    shutdown: watch::Receiver<bool>,
}

impl ReadinessWatcher {
    pub fn new(config: ReadinessConfig, shutdown: watch::Receiver<bool>) -> Self {
        Self { config, shutdown }
    }

    /// Wait until the Service named after the cluster exists.
    ///
    /// Reaching the ceiling is a negative result, not an error.
    #[instrument(skip(self, control_plane))]
    pub async fn wait_for_service(
        &self,
        control_plane: &dyn ControlPlane,
        namespace: &str,
        name: &str,
    ) -> Result<ServiceReadiness, ServiceError> {
        let policy = PollPolicy::new(self.config.poll_interval, self.config.service_timeout);
        let outcome = poll_until(&policy, self.shutdown.clone(), || async move {
            let exists = control_plane.service_exists(namespace, name).await?;
            if !exists {
                debug!("Service not created yet");
            }
            Ok::<_, ServiceError>(exists.then_some(()))
        })
        .await?;

        match outcome {
            PollOutcome::Converged { elapsed, .. } => {
                info!(elapsed_ms = elapsed.as_millis() as u64, "Service is present");
                Ok(ServiceReadiness::Present)
            }
            PollOutcome::TimedOut { elapsed, attempts } => {
                warn!(
                    elapsed_s = elapsed.as_secs(),
                    attempts, "Service was not created"
                );
                Ok(ServiceReadiness::Missing { elapsed })
            }
            PollOutcome::Cancelled => Err(cancelled("service")),
        }
    }

    /// Wait until every pod of the workload is Running, then stamp the
    /// workload labels on its pod template.
    ///
    /// Reaching the ceiling is a negative result, not an error.
    #[instrument(skip_all, fields(cluster = %descriptor.name, namespace = %descriptor.namespace))]
    pub async fn wait_for_pods(
        &self,
        control_plane: &dyn ControlPlane,
        descriptor: &VirtualClusterDescriptor,
    ) -> Result<PodReadiness, ServiceError> {
        let policy = PollPolicy::new(self.config.poll_interval, self.config.pod_ready_timeout);
        let name = descriptor.name.as_str();

        let outcome = poll_until(&policy, self.shutdown.clone(), || async move {
            let pods = control_plane.list_pods(&descriptor.namespace).await?;
            let status = workload_status(name, &pods);
            debug!(?status, pods = pods.len(), "Observed workload pods");
            Ok::<_, ServiceError>(
                status
                    .is_converged()
                    .then(|| pods.iter().filter(|p| is_workload_pod(name, &p.name)).count()),
            )
        })
        .await?;

        match outcome {
            PollOutcome::Converged { value, elapsed, .. } => {
                control_plane
                    .label_pod_template(&descriptor.namespace, name, &descriptor.workload_labels())
                    .await?;
                info!(
                    pods = value,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Workload pods are running"
                );
                Ok(PodReadiness::Ready { pods: value })
            }
            PollOutcome::TimedOut { elapsed, attempts } => {
                warn!(
                    elapsed_s = elapsed.as_secs(),
                    attempts, "Workload pods did not reach Running"
                );
                Ok(PodReadiness::NotReady { elapsed })
            }
            PollOutcome::Cancelled => Err(cancelled("pods")),
        }
    }

    /// Wait until a namespace is fully gone.
    #[instrument(skip(self, control_plane))]
    pub async fn wait_for_namespace_deletion(
        &self,
        control_plane: &dyn ControlPlane,
        namespace: &str,
    ) -> Result<(), ServiceError> {
        let policy = PollPolicy::new(
            self.config.poll_interval,
            self.config.namespace_deletion_timeout,
        );
        let outcome = poll_until(&policy, self.shutdown.clone(), || async move {
            let exists = control_plane.namespace_exists(namespace).await?;
            Ok::<_, ServiceError>((!exists).then_some(()))
        })
        .await?;

        match outcome {
            PollOutcome::Converged { .. } => {
                info!("Namespace deleted");
                Ok(())
            }
            PollOutcome::TimedOut { elapsed, .. } => Err(ServiceError::Timeout(format!(
                "namespace {namespace} still terminating after {}s",
                elapsed.as_secs()
            ))),
            PollOutcome::Cancelled => Err(cancelled("namespace deletion")),
        }
    }
}
