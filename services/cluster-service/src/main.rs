//! vcluster fleet cluster service
//!
//! Places virtual clusters on the least loaded host cluster of a region and
//! drives their lifecycle in response to events delivered over pub/sub.

use std::sync::Arc;

use anyhow::{Context, Result};
use fleet_cluster_service::{
    alert::{AlertFanout, CapacityAlerter, LogAlerter, WebhookAlerter},
    api, config,
    control_plane::{ClusterConnector, KubeConnector},
    dispatcher::Dispatcher,
    placement::PlacementSelector,
    provisioner::Provisioner,
    readiness::ReadinessWatcher,
    secrets::{DaprSecretStore, SecretStore, StaticSecretStore},
    sessions::SessionRegistry,
    state::AppState,
};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = config::Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to FLEET_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting vcluster fleet cluster service");
    info!(
        listen_addr = %config.listen_addr,
        domain = %config.domain,
        cpu_threshold = config.thresholds.cpu_pct,
        memory_threshold = config.thresholds.mem_pct,
        "Configuration loaded"
    );

    // Host kubeconfigs
    let secrets: Arc<dyn SecretStore> = match &config.host_secrets_file {
        Some(path) => {
            warn!(path = %path.display(), "Reading host kubeconfigs from a static file");
            Arc::new(
                StaticSecretStore::from_file(path)
                    .with_context(|| format!("loading {}", path.display()))?,
            )
        }
        None => {
            info!(
                endpoint = %config.dapr.endpoint,
                store = %config.dapr.store,
                "Using Dapr secret store"
            );
            Arc::new(DaprSecretStore::new(config.dapr.clone())?)
        }
    };
    let connector: Arc<dyn ClusterConnector> = Arc::new(KubeConnector::new());

    // Capacity alert sinks
    let mut sinks: Vec<Arc<dyn CapacityAlerter>> = vec![Arc::new(LogAlerter)];
    if let Some(url) = &config.alert_webhook_url {
        info!(url = %url, "Capacity alerts will be posted to webhook");
        sinks.push(Arc::new(WebhookAlerter::new(url.clone())?));
    }

    // Create shutdown channel for graceful shutdown; it also cancels
    // in-flight readiness polling.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let watcher = ReadinessWatcher::new(config.readiness, shutdown_rx.clone());
    let provisioner = Provisioner::new(config.chart.clone(), watcher);
    let placement = PlacementSelector::new(config.thresholds, AlertFanout::new(sinks));
    let sessions = SessionRegistry::new(secrets, connector);
    let dispatcher = Dispatcher::new(sessions, placement, provisioner, config.domain.clone());

    // Create application state
    let state = AppState::new(dispatcher);

    // Build and run the server
    let app = api::create_router(state);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "Listening for connections");

    // Spawn the server with graceful shutdown
    let mut server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let mut shutdown_rx = shutdown_rx;
                loop {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
                info!("HTTP server shutting down");
            })
            .await
    });

    // Wait for shutdown signal (Ctrl+C)
    let server_exited = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
            false
        }
        result = &mut server_handle => {
            match result {
                Ok(Ok(())) => info!("Server exited normally"),
                Ok(Err(e)) => error!(error = %e, "Server error"),
                Err(e) => error!(error = %e, "Server task panicked"),
            }
            true
        }
    };

    // Signal shutdown to the server and every polling loop
    let _ = shutdown_tx.send(true);

    if !server_exited {
        info!("Waiting for in-flight requests to finish...");
        if tokio::time::timeout(config.shutdown_timeout, server_handle)
            .await
            .is_err()
        {
            warn!("HTTP server did not shut down in time");
        }
    }

    info!("Cluster service shutdown complete");
    Ok(())
}
