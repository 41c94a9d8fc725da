//! Pub/sub delivery endpoints.
//!
//! The sidecar reads the subscription table from `GET /dapr/subscribe` and
//! then POSTs every event envelope to the route registered for its topic.
//! The response body tells the bus what to do with the delivery:
//!
//! - `SUCCESS`: the command ran; the outcome is attached
//! - `DROP`: the envelope can never be decoded; redelivery would not help
//!
//! Pipeline failures are answered with a problem document.

use axum::{body::Bytes, extract::State, routing::{get, post}, Json, Router};
use serde::{Deserialize, Serialize};
use tracing::warn;

use fleet_events::{subscriptions, EventError, LifecycleCommand, Subscription, Topic};

use crate::api::error::ApiError;
use crate::dispatcher::LifecycleOutcome;
use crate::state::AppState;

/// Delivery verdict understood by the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DeliveryStatus {
    Success,
    Drop,
}

/// Response to one delivered event.
#[derive(Debug, Serialize, Deserialize)]
pub struct DeliveryResponse {
    pub status: DeliveryStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<LifecycleOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl DeliveryResponse {
    fn success(outcome: LifecycleOutcome) -> Self {
        Self {
            status: DeliveryStatus::Success,
            outcome: Some(outcome),
            reason: None,
        }
    }

    fn dropped(reason: impl Into<String>) -> Self {
        Self {
            status: DeliveryStatus::Drop,
            outcome: None,
            reason: Some(reason.into()),
        }
    }
}

pub fn routes() -> Router<AppState> {
    let router = Router::new().route("/dapr/subscribe", get(subscribe));

    Topic::ALL.into_iter().fold(router, |router, topic| {
        router.route(
            &format!("/{}", topic.route()),
            post(move |State(state): State<AppState>, body: Bytes| deliver(state, topic, body)),
        )
    })
}

async fn subscribe() -> Json<Vec<Subscription>> {
    Json(subscriptions())
}

async fn deliver(
    state: AppState,
    topic: Topic,
    body: Bytes,
) -> Result<Json<DeliveryResponse>, ApiError> {
    let command = match decode(topic, &body) {
        Ok(command) => command,
        Err(e) => {
            warn!(%topic, error = %e, "Dropping undecodable event");
            return Ok(Json(DeliveryResponse::dropped(e.to_string())));
        }
    };

    let outcome = state.dispatcher().dispatch(&command).await?;
    Ok(Json(DeliveryResponse::success(outcome)))
}

fn decode(topic: Topic, body: &[u8]) -> Result<LifecycleCommand, EventError> {
    let raw: serde_json::Value = serde_json::from_slice(body)?;
    LifecycleCommand::decode(topic, raw)
}
