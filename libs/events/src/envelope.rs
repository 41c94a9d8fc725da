//! Event envelope - the pub/sub wrapper around every lifecycle payload.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::EventError;

/// Name of the pub/sub component the cluster service subscribes through.
pub const PUBSUB_NAME: &str = "messagebus";

/// The event envelope as delivered by the message bus.
///
/// The bus wraps published data in a CloudEvents document; only `data` is
/// required; the remaining attributes are kept for tracing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope<P> {
    /// Delivery identifier assigned by the bus.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Topic the event was published to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,

    /// Pub/sub component name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pubsubname: Option<String>,

    /// Publishing application.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,

    /// W3C trace context propagated by the bus.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traceparent: Option<String>,

    /// Event-specific payload.
    pub data: P,
}

impl<P> EventEnvelope<P> {
    /// Map the payload while keeping the delivery metadata.
    pub fn map<Q>(self, f: impl FnOnce(P) -> Q) -> EventEnvelope<Q> {
        EventEnvelope {
            id: self.id,
            topic: self.topic,
            pubsubname: self.pubsubname,
            source: self.source,
            traceparent: self.traceparent,
            data: f(self.data),
        }
    }
}

impl<P: DeserializeOwned> EventEnvelope<P> {
    /// Decode an envelope from a raw JSON document.
    ///
    /// Publishers that serialize the payload before handing it to the bus
    /// produce `data` as a JSON string; that string is parsed a second time.
    pub fn decode(raw: serde_json::Value) -> Result<Self, EventError> {
        let envelope: EventEnvelope<serde_json::Value> = serde_json::from_value(raw)
            .map_err(|e| EventError::InvalidPayload(format!("envelope: {e}")))?;

        let data = match envelope.data {
            serde_json::Value::String(ref encoded) => serde_json::from_str(encoded)
                .map_err(|e| EventError::InvalidPayload(format!("data: {e}")))?,
            serde_json::Value::Null => {
                return Err(EventError::InvalidPayload("data: missing".to_string()))
            }
            ref value => serde_json::from_value(value.clone())
                .map_err(|e| EventError::InvalidPayload(format!("data: {e}")))?,
        };

        Ok(envelope.map(|_| data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ClusterTarget;

    #[test]
    fn test_decode_object_data() {
        let raw = serde_json::json!({
            "id": "evt-1",
            "topic": "cluster-stop",
            "pubsubname": "messagebus",
            "data": {"host_cluster_id": "host-a", "cluster_name": "alpha"}
        });

        let envelope = EventEnvelope::<ClusterTarget>::decode(raw).unwrap();
        assert_eq!(envelope.id.as_deref(), Some("evt-1"));
        assert_eq!(envelope.topic.as_deref(), Some("cluster-stop"));
        assert_eq!(envelope.data.cluster_name, "alpha");
    }

    #[test]
    fn test_decode_string_encoded_data() {
        let raw = serde_json::json!({
            "data": "{\"host_cluster_id\":\"host-a\",\"cluster_name\":\"beta\"}"
        });

        let envelope = EventEnvelope::<ClusterTarget>::decode(raw).unwrap();
        assert_eq!(envelope.data.host_cluster_id, "host-a");
        assert_eq!(envelope.data.cluster_name, "beta");
    }

    #[test]
    fn test_decode_missing_data_is_invalid() {
        let raw = serde_json::json!({"topic": "cluster-stop"});
        let err = EventEnvelope::<ClusterTarget>::decode(raw).unwrap_err();
        assert!(matches!(err, EventError::InvalidPayload(_)));
    }

    #[test]
    fn test_decode_wrong_shape_is_invalid() {
        let raw = serde_json::json!({"data": {"cluster_name": 7}});
        let err = EventEnvelope::<ClusterTarget>::decode(raw).unwrap_err();
        assert!(matches!(err, EventError::InvalidPayload(_)));
    }

    #[test]
    fn test_envelope_omits_absent_attributes() {
        let envelope = EventEnvelope {
            id: Some("evt-9".to_string()),
            topic: Some("cluster-create".to_string()),
            pubsubname: None,
            source: None,
            traceparent: None,
            data: serde_json::json!({"k": 1}),
        };

        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["topic"], "cluster-create");
        assert_eq!(json["id"], "evt-9");
        assert!(json.get("traceparent").is_none());
    }
}
