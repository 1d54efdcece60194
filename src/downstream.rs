//! Downstream Adapter
//!
//! Uniform call interface to the Connection Manager, the external process
//! that owns the brokerage session. Every method is a bus request with a
//! method-appropriate timeout (short for place/cancel, longer for
//! statistics) and a small retry budget. Ambiguous responses decode to
//! `DownstreamError::Unknown` rather than being guessed at.

use crate::bus::{channels, BusAdapter, Envelope};
use crate::config::DownstreamConfig;
use crate::error::DownstreamError;
use crate::models::{Order, OrderId};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

/// Acknowledgement for a placed order.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderAck {
    #[serde(default)]
    pub broker_order_id: Option<String>,
}

/// Brokerage account descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountInfo {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub balance: Option<f64>,
    #[serde(default)]
    pub can_trade: Option<bool>,
}

/// Tradeable contract descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractInfo {
    pub symbol: String,
    #[serde(default)]
    pub contract_id: Option<String>,
    #[serde(default)]
    pub tick_size: Option<f64>,
    #[serde(default)]
    pub tick_value: Option<f64>,
}

/// Client for the Connection Manager over the bus.
pub struct ConnectionManagerClient {
    bus: Arc<BusAdapter>,
    config: DownstreamConfig,
}

impl ConnectionManagerClient {
    pub fn new(bus: Arc<BusAdapter>, config: DownstreamConfig) -> Self {
        Self { bus, config }
    }

    /// Submit an order for execution. Short timeout; transient failures
    /// are reported as such so the queue can re-enqueue.
    pub async fn submit_order(&self, order: &Order) -> Result<OrderAck, DownstreamError> {
        let response = self
            .call(
                "PLACE_ORDER",
                json!({
                    "orderId": order.id,
                    "accountId": order.account_id,
                    "instrument": order.instrument,
                    "side": order.side,
                    "kind": order.kind,
                    "quantity": order.quantity,
                    "price": order.price,
                    "stopPrice": order.stop_price,
                    "linkedBracketOf": order.linked_bracket_of,
                }),
                self.order_timeout(),
            )
            .await?;
        Self::decode_ack(&response)?;
        response.decode().map_err(|_| DownstreamError::Unknown)
    }

    /// Best-effort cancel of a dispatched order.
    pub async fn cancel_order(
        &self,
        order_id: &OrderId,
        account_id: &str,
    ) -> Result<(), DownstreamError> {
        let response = self
            .call(
                "CANCEL_ORDER",
                json!({ "orderId": order_id, "accountId": account_id }),
                self.order_timeout(),
            )
            .await?;
        Self::decode_ack(&response)
    }

    pub async fn get_accounts(&self) -> Result<Vec<AccountInfo>, DownstreamError> {
        let response = self
            .call("GET_ACCOUNTS", json!({}), self.query_timeout())
            .await?;
        Self::decode_ack(&response)?;
        serde_json::from_value(response.payload["accounts"].clone())
            .map_err(|_| DownstreamError::Unknown)
    }

    pub async fn get_active_contracts(&self) -> Result<Vec<ContractInfo>, DownstreamError> {
        let response = self
            .call("GET_ACTIVE_CONTRACTS", json!({}), self.query_timeout())
            .await?;
        Self::decode_ack(&response)?;
        serde_json::from_value(response.payload["contracts"].clone())
            .map_err(|_| DownstreamError::Unknown)
    }

    /// Account statistics pass through untyped; consumers pick fields.
    pub async fn get_statistics(&self) -> Result<Value, DownstreamError> {
        let response = self
            .call("GET_STATISTICS", json!({}), self.query_timeout())
            .await?;
        Self::decode_ack(&response)?;
        Ok(response.payload)
    }

    async fn call(
        &self,
        kind: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<Envelope, DownstreamError> {
        self.bus
            .request(
                channels::CONNECTION_MANAGER_REQUESTS,
                kind,
                payload,
                timeout,
                self.config.max_attempts,
            )
            .await
            .map_err(DownstreamError::from)
    }

    /// A well-formed response carries `success`; anything else is UNKNOWN.
    fn decode_ack(response: &Envelope) -> Result<(), DownstreamError> {
        match response.payload.get("success").and_then(Value::as_bool) {
            Some(true) => Ok(()),
            Some(false) => {
                let reason = response
                    .payload
                    .get("reason")
                    .and_then(Value::as_str)
                    .unwrap_or("unspecified")
                    .to_string();
                Err(DownstreamError::Rejected(reason))
            }
            None => Err(DownstreamError::Unknown),
        }
    }

    fn order_timeout(&self) -> Duration {
        Duration::from_millis(self.config.order_timeout_ms)
    }

    fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.config.query_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::transport::InMemoryBus;
    use crate::config::BusConfig;
    use crate::models::{OrderKind, OrderState, Priority, Side};
    use chrono::Utc;

    fn sample_order() -> Order {
        Order {
            id: "O1".into(),
            source: "bot-1".into(),
            account_id: "ACC".into(),
            instrument: "MES".into(),
            side: Side::Buy,
            kind: OrderKind::Market,
            quantity: 1,
            price: None,
            stop_price: None,
            priority: Priority::Normal,
            state: OrderState::Queued,
            filled_quantity: 0,
            average_fill_price: 0.0,
            rejection_reason: None,
            linked_bracket_of: None,
            received_at: Utc::now(),
            validated_at: None,
            dispatched_at: None,
            terminal_at: None,
        }
    }

    /// Wire a fake Connection Manager that answers every request with the
    /// given payload.
    async fn fake_manager(reply: Value) -> ConnectionManagerClient {
        let hub = InMemoryBus::new();
        let aggregator = BusAdapter::new(hub.endpoint(), "aggregator", BusConfig::default());
        let manager = BusAdapter::new(hub.endpoint(), "connection-manager", BusConfig::default());
        aggregator.run();
        manager.run();

        let responder = Arc::clone(&manager);
        manager
            .subscribe(
                channels::CONNECTION_MANAGER_REQUESTS,
                Arc::new(move |env| {
                    let responder = Arc::clone(&responder);
                    let reply = reply.clone();
                    tokio::spawn(async move {
                        let _ = responder
                            .respond(
                                &env.request_id.unwrap(),
                                &env.response_channel.unwrap(),
                                "RESPONSE",
                                reply,
                            )
                            .await;
                    });
                    Ok(())
                }),
            )
            .await
            .unwrap();

        ConnectionManagerClient::new(
            aggregator,
            DownstreamConfig {
                order_timeout_ms: 500,
                query_timeout_ms: 500,
                max_attempts: 1,
            },
        )
    }

    #[tokio::test]
    async fn test_submit_order_success() {
        let client = fake_manager(json!({"success": true, "brokerOrderId": "B9"})).await;
        let ack = client.submit_order(&sample_order()).await.unwrap();
        assert_eq!(ack.broker_order_id.as_deref(), Some("B9"));
    }

    #[tokio::test]
    async fn test_submit_order_rejected() {
        let client = fake_manager(json!({"success": false, "reason": "INVALID_ORDER"})).await;
        let err = client.submit_order(&sample_order()).await.unwrap_err();
        assert!(!err.is_transient());
        match err {
            DownstreamError::Rejected(reason) => assert_eq!(reason, "INVALID_ORDER"),
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_ambiguous_response_is_unknown() {
        let client = fake_manager(json!({"status": "maybe"})).await;
        let err = client.get_accounts().await.unwrap_err();
        assert!(matches!(err, DownstreamError::Unknown));
    }

    #[tokio::test]
    async fn test_get_accounts_decodes() {
        let client = fake_manager(json!({
            "success": true,
            "accounts": [{"id": "ACC1", "balance": 50_000.0}]
        }))
        .await;
        let accounts = client.get_accounts().await.unwrap();
        assert_eq!(accounts.len(), 1);
        assert_eq!(accounts[0].id, "ACC1");
    }

    #[tokio::test]
    async fn test_timeout_maps_to_transient() {
        // No manager wired at all: the request must time out.
        let hub = InMemoryBus::new();
        let aggregator = BusAdapter::new(hub.endpoint(), "aggregator", BusConfig::default());
        aggregator.run();
        let client = ConnectionManagerClient::new(
            aggregator,
            DownstreamConfig {
                order_timeout_ms: 50,
                query_timeout_ms: 50,
                max_attempts: 1,
            },
        );
        let err = client.cancel_order(&"O1".to_string(), "ACC").await.unwrap_err();
        assert!(matches!(err, DownstreamError::Timeout));
        assert!(err.is_transient());
    }
}
