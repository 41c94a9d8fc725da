use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::descriptor::ChartConfig;
use crate::placement::Thresholds;
use crate::readiness::ReadinessConfig;
use crate::secrets::DaprSecretsConfig;

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub log_level: String,
    /// Public domain virtual cluster endpoints live under.
    pub domain: String,
    pub thresholds: Thresholds,
    pub readiness: ReadinessConfig,
    pub chart: ChartConfig,
    pub dapr: DaprSecretsConfig,
    /// Development only: read host kubeconfigs from this JSON file instead
    /// of the Dapr secret store.
    pub host_secrets_file: Option<PathBuf>,
    pub alert_webhook_url: Option<String>,
    pub shutdown_timeout: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let listen_addr = var("FLEET_LISTEN_ADDR")
            .unwrap_or_else(|| "127.0.0.1:8080".to_string())
            .parse()
            .context("FLEET_LISTEN_ADDR")?;

        let log_level = var("FLEET_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        let domain = var("FLEET_DOMAIN")
            .or_else(|| var("HOST_NAME"))
            .unwrap_or_else(|| "vcluster.local".to_string());

        let defaults = Thresholds::default();
        let thresholds = Thresholds {
            cpu_pct: parse_or(var("FLEET_CPU_THRESHOLD"), defaults.cpu_pct, "FLEET_CPU_THRESHOLD")?,
            mem_pct: parse_or(
                var("FLEET_MEMORY_THRESHOLD"),
                defaults.mem_pct,
                "FLEET_MEMORY_THRESHOLD",
            )?,
        };

        let defaults = ReadinessConfig::default();
        let readiness = ReadinessConfig {
            poll_interval: seconds_or(
                var("FLEET_POLL_INTERVAL_SECS"),
                defaults.poll_interval,
                "FLEET_POLL_INTERVAL_SECS",
            )?,
            pod_ready_timeout: seconds_or(
                var("FLEET_POD_READY_TIMEOUT_SECS"),
                defaults.pod_ready_timeout,
                "FLEET_POD_READY_TIMEOUT_SECS",
            )?,
            service_timeout: seconds_or(
                var("FLEET_SERVICE_TIMEOUT_SECS"),
                defaults.service_timeout,
                "FLEET_SERVICE_TIMEOUT_SECS",
            )?,
            namespace_deletion_timeout: seconds_or(
                var("FLEET_NAMESPACE_DELETION_TIMEOUT_SECS"),
                defaults.namespace_deletion_timeout,
                "FLEET_NAMESPACE_DELETION_TIMEOUT_SECS",
            )?,
        };

        let defaults = ChartConfig::default();
        let chart = ChartConfig {
            name: defaults.name,
            repo: var("FLEET_CHART_REPO").unwrap_or(defaults.repo),
            version: var("FLEET_CHART_VERSION").unwrap_or(defaults.version),
        };

        // Dapr injects DAPR_HTTP_PORT into the app container.
        let defaults = DaprSecretsConfig::default();
        let dapr = DaprSecretsConfig {
            endpoint: var("FLEET_DAPR_ENDPOINT")
                .or_else(|| var("DAPR_HTTP_PORT").map(|port| format!("http://127.0.0.1:{port}")))
                .unwrap_or(defaults.endpoint),
            store: var("FLEET_SECRET_STORE").unwrap_or(defaults.store),
            key: var("FLEET_SECRET_KEY").unwrap_or(defaults.key),
            api_token: var("DAPR_API_TOKEN"),
        };

        let host_secrets_file = var("FLEET_HOST_SECRETS_FILE").map(PathBuf::from);
        let alert_webhook_url = var("FLEET_ALERT_WEBHOOK_URL");

        let shutdown_timeout = seconds_or(
            var("FLEET_SHUTDOWN_TIMEOUT_SECS"),
            Duration::from_secs(30),
            "FLEET_SHUTDOWN_TIMEOUT_SECS",
        )?;

        Ok(Self {
            listen_addr,
            log_level,
            domain,
            thresholds,
            readiness,
            chart,
            dapr,
            host_secrets_file,
            alert_webhook_url,
            shutdown_timeout,
        })
    }
}

fn parse_or(value: Option<String>, default: f64, key: &str) -> Result<f64> {
    match value {
        None => Ok(default),
        Some(v) => {
            let parsed: f64 = v.trim().parse().with_context(|| format!("{key}={v}"))?;
            anyhow::ensure!((0.0..=100.0).contains(&parsed), "{key} must be a percentage, got {v}");
            Ok(parsed)
        }
    }
}

fn seconds_or(value: Option<String>, default: Duration, key: &str) -> Result<Duration> {
    match value {
        None => Ok(default),
        Some(v) => {
            let secs: u64 = v.trim().parse().with_context(|| format!("{key}={v}"))?;
            Ok(Duration::from_secs(secs))
        }
    }
}
