//! Synchronous cluster queries used by the cluster API.

use axum::{extract::rejection::JsonRejection, extract::State, routing::post, Json, Router};
use serde::Deserialize;

use crate::api::error::ApiError;
use crate::credentials::{ClusterCredentials, Lifetime};
use crate::dispatcher::CapacityReport;
use crate::state::AppState;
use crate::status::ClusterStatus;

#[derive(Debug, Deserialize)]
pub struct CapacityRequest {
    pub host_cluster_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusRequest {
    pub name: String,
    pub host_cluster_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateConfigRequest {
    pub name: String,
    pub host_cluster_id: String,
    pub expiration_time: Lifetime,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/cluster-check", post(check_capacity))
        .route("/host-cluster/cluster/status", post(cluster_status))
        .route("/generate-config", post(generate_config))
}

async fn check_capacity(
    State(state): State<AppState>,
    payload: Result<Json<CapacityRequest>, JsonRejection>,
) -> Result<Json<CapacityReport>, ApiError> {
    let Json(req) = payload?;
    let report = state.dispatcher().check_capacity(&req.host_cluster_ids).await?;
    Ok(Json(report))
}

async fn cluster_status(
    State(state): State<AppState>,
    payload: Result<Json<StatusRequest>, JsonRejection>,
) -> Result<Json<ClusterStatus>, ApiError> {
    let Json(req) = payload?;
    let status = state
        .dispatcher()
        .status(&req.host_cluster_id, &req.name)
        .await?;
    Ok(Json(status))
}

async fn generate_config(
    State(state): State<AppState>,
    payload: Result<Json<GenerateConfigRequest>, JsonRejection>,
) -> Result<Json<ClusterCredentials>, ApiError> {
    let Json(req) = payload?;
    let credentials = state
        .dispatcher()
        .generate_config(&req.host_cluster_id, &req.name, &req.expiration_time)
        .await?;
    Ok(Json(credentials))
}
