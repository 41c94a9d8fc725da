//! Out-of-band capacity alerts.
//!
//! Raised by the placement selector when every candidate host is over its
//! thresholds. Delivery is best effort: a failed sink is logged, never
//! surfaced to the lifecycle command that triggered it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, warn};

use crate::placement::{HostMetrics, Thresholds};

#[derive(Debug, Error)]
pub enum AlertError {
    #[error("alert delivery failed: {0}")]
    Delivery(String),
}

/// Every candidate host is over capacity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapacityAlert {
    /// The least loaded of the overloaded hosts.
    pub best: HostMetrics,
    pub thresholds: Thresholds,
    pub candidates: usize,
    pub raised_at: DateTime<Utc>,
}

/// A sink for capacity alerts.
#[async_trait]
pub trait CapacityAlerter: Send + Sync {
    async fn raise(&self, alert: &CapacityAlert) -> Result<(), AlertError>;
}

/// Writes alerts to the service log.
#[derive(Debug, Clone, Default)]
pub struct LogAlerter;

#[async_trait]
impl CapacityAlerter for LogAlerter {
    async fn raise(&self, alert: &CapacityAlert) -> Result<(), AlertError> {
        warn!(
            host_cluster_id = %alert.best.host_id,
            cpu_pct = alert.best.cpu_pct,
            mem_pct = alert.best.mem_pct,
            cpu_threshold = alert.thresholds.cpu_pct,
            mem_threshold = alert.thresholds.mem_pct,
            candidates = alert.candidates,
            "All host clusters are over capacity"
        );
        Ok(())
    }
}

/// Posts alerts as JSON to an operator webhook.
pub struct WebhookAlerter {
    client: reqwest::Client,
    url: String,
}

impl WebhookAlerter {
    pub fn new(url: impl Into<String>) -> Result<Self, AlertError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| AlertError::Delivery(e.to_string()))?;

        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl CapacityAlerter for WebhookAlerter {
    async fn raise(&self, alert: &CapacityAlert) -> Result<(), AlertError> {
        let response = self
            .client
            .post(&self.url)
            .json(alert)
            .send()
            .await
            .map_err(|e| AlertError::Delivery(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AlertError::Delivery(format!("{status}: {body}")));
        }
        Ok(())
    }
}

/// Delivers each alert to every configured sink.
#[derive(Clone, Default)]
pub struct AlertFanout {
    sinks: Vec<Arc<dyn CapacityAlerter>>,
}

impl AlertFanout {
    pub fn new(sinks: Vec<Arc<dyn CapacityAlerter>>) -> Self {
        Self { sinks }
    }

    /// Raise on every sink; failures are logged.
    pub async fn raise(&self, alert: &CapacityAlert) {
        for sink in &self.sinks {
            if let Err(e) = sink.raise(alert).await {
                error!(error = %e, "Failed to deliver capacity alert");
            }
        }
    }
}
