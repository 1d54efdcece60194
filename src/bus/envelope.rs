//! Message Envelope
//!
//! Every bus message carries the same envelope: a type tag, millisecond
//! timestamp, originating source id, typed payload, and optional
//! request/response correlation fields. Field names are camelCase on the
//! wire and form part of the contract.

use crate::models::EpochMs;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Stable channel names. These form part of the external contract.
pub mod channels {
    /// External order submissions (manual UI).
    pub const AGGREGATOR_ORDERS: &str = "aggregator:orders";
    /// Directory requests to forward to the Connection Manager.
    pub const AGGREGATOR_REQUESTS: &str = "aggregator:requests";
    /// Republished market ticks for downstream consumers.
    pub const AGGREGATOR_MARKET_DATA: &str = "aggregator:market-data";
    /// Lifecycle events.
    pub const AGGREGATOR_EVENTS: &str = "aggregator:events";
    /// Admin toggles (shadow mode, pause latch).
    pub const AGGREGATOR_ADMIN: &str = "aggregator:admin";
    /// Raw market ticks from the Connection Manager.
    pub const MARKET_DATA: &str = "market:data";
    /// Fill reports.
    pub const ORDER_FILLS: &str = "order:fills";
    /// Status updates (ACK, CANCELLED, FAILED), both directions.
    pub const ORDER_STATUS: &str = "order:status";
    /// Forwarded directory and statistics queries.
    pub const CONNECTION_MANAGER_REQUESTS: &str = "connection-manager:requests";
    /// Paired responses (requestId matches).
    pub const CONNECTION_MANAGER_RESPONSES: &str = "connection-manager:responses";
}

/// Structured record wrapping every payload on the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub timestamp: EpochMs,
    pub source: String,
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_channel: Option<String>,
}

impl Envelope {
    pub fn new(kind: impl Into<String>, source: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            timestamp: Utc::now().timestamp_millis(),
            source: source.into(),
            payload,
            request_id: None,
            response_channel: None,
        }
    }

    pub fn with_correlation(
        mut self,
        request_id: impl Into<String>,
        response_channel: impl Into<String>,
    ) -> Self {
        self.request_id = Some(request_id.into());
        self.response_channel = Some(response_channel.into());
        self
    }

    /// Response envelope: carries the request id back, no reply channel.
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    /// Decode the payload into a typed body.
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

/// One routed message: a channel plus its envelope. The wire unit for
/// every transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusFrame {
    pub channel: String,
    pub envelope: Envelope,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_field_names() {
        let env = Envelope::new("MANUAL_ORDER", "manual-ui", json!({"x": 1}))
            .with_correlation("R1", "priv1");
        let wire = serde_json::to_value(&env).unwrap();
        assert_eq!(wire["type"], "MANUAL_ORDER");
        assert_eq!(wire["requestId"], "R1");
        assert_eq!(wire["responseChannel"], "priv1");
        assert!(wire["timestamp"].as_i64().unwrap() > 0);
    }

    #[test]
    fn test_optional_correlation_omitted() {
        let env = Envelope::new("TICK", "cm", json!({}));
        let wire = serde_json::to_string(&env).unwrap();
        assert!(!wire.contains("requestId"));
        assert!(!wire.contains("responseChannel"));
    }

    #[test]
    fn test_frame_round_trip() {
        let frame = BusFrame {
            channel: channels::ORDER_FILLS.to_string(),
            envelope: Envelope::new("FILL", "connection-manager", json!({"orderId": "A1"})),
        };
        let text = serde_json::to_string(&frame).unwrap();
        let back: BusFrame = serde_json::from_str(&text).unwrap();
        assert_eq!(back.channel, "order:fills");
        assert_eq!(back.envelope.kind, "FILL");
    }
}
