//! Health check endpoints.
//!
//! These endpoints are used by load balancers and orchestration systems
//! to determine if the service is healthy and ready to receive traffic.

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::dispatcher::Progress;
use crate::sessions::SessionInfo;
use crate::state::AppState;

const SERVICE: &str = "cluster-service";

/// Health check response.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(Deserialize))]
pub struct HealthResponse {
    /// Service status: "ok".
    pub status: String,

    pub service: String,

    pub version: String,

    /// Current timestamp (ISO 8601).
    pub timestamp: String,

    /// Work in progress (readiness only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activity: Option<Activity>,
}

/// Lifecycle work currently in progress.
#[derive(Debug, Serialize, Deserialize)]
pub struct Activity {
    /// Clusters with a lifecycle command running or queued.
    pub operations: Vec<String>,

    /// Provisioning state of creates still running.
    pub progress: Vec<Progress>,

    /// Open host sessions.
    pub sessions: Vec<SessionInfoView>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SessionInfoView {
    pub host_cluster_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster: Option<String>,
    pub acquired_at: String,
}

impl From<SessionInfo> for SessionInfoView {
    fn from(info: SessionInfo) -> Self {
        Self {
            host_cluster_id: info.host_cluster_id,
            cluster: info.cluster,
            acquired_at: info.acquired_at.to_rfc3339(),
        }
    }
}

fn response(activity: Option<Activity>) -> HealthResponse {
    HealthResponse {
        status: "ok".to_string(),
        service: SERVICE.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now().to_rfc3339(),
        activity,
    }
}

/// Create health check routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(banner))
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/livez", get(livez))
}

async fn banner() -> impl IntoResponse {
    format!("vcluster fleet {SERVICE} {}", env!("CARGO_PKG_VERSION"))
}

/// Basic health check - is the service running?
async fn healthz() -> impl IntoResponse {
    Json(response(None))
}

/// Readiness check, reporting in-flight lifecycle work.
async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let dispatcher = state.dispatcher();
    let activity = Activity {
        operations: dispatcher.in_flight(),
        progress: dispatcher.progress(),
        sessions: dispatcher
            .sessions()
            .active()
            .into_iter()
            .map(SessionInfoView::from)
            .collect(),
    };

    (StatusCode::OK, Json(response(Some(activity))))
}

/// Liveness check - is the service alive?
async fn livez() -> impl IntoResponse {
    StatusCode::OK
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_healthz_returns_ok() {
        let response = healthz().await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_livez_returns_ok() {
        let response = livez().await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_banner_names_service() {
        let response = banner().await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
