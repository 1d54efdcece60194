//! Monitoring HTTP/WS Surface
//!
//! Thin translator over the metrics hub: REST snapshots, focused slices,
//! the history ring, a counter reset, and a WebSocket that pushes named
//! topics to subscribed clients. Owns no state of its own.

use crate::config::MonitoringConfig;
use crate::metrics::{MetricsHub, MonitorTopic};
use anyhow::{Context, Result};
use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

/// Shared state for every route handler.
#[derive(Clone)]
pub struct ApiState {
    pub metrics: Arc<MetricsHub>,
    pub config: MonitoringConfig,
    /// Queue capacity for the /health fill-ratio check.
    pub queue_capacity: usize,
}

/// Component grade used by /health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthCheck {
    status: HealthStatus,
    detail: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: HealthStatus,
    uptime_secs: i64,
    checks: BTreeMap<&'static str, HealthCheck>,
}

/// Build the monitoring router.
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/metrics", get(metrics_snapshot))
        .route("/api/metrics/history", get(metrics_history))
        .route("/api/metrics/:slice", get(metrics_slice))
        .route("/api/control/reset-metrics", post(reset_metrics))
        .route("/ws", get(websocket_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind and serve until the process exits.
pub async fn serve(state: ApiState) -> Result<()> {
    let addr = format!("{}:{}", state.config.host, state.config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind monitoring listener on {addr}"))?;
    info!("🎯 monitoring surface listening on {}", addr);
    axum::serve(listener, router(state))
        .await
        .context("monitoring server error")?;
    Ok(())
}

async fn health(State(state): State<ApiState>) -> Json<HealthResponse> {
    let snapshot = state.metrics.snapshot();
    let mut checks = BTreeMap::new();

    let fill_ratio = if state.queue_capacity > 0 {
        snapshot.queue.depth as f64 / state.queue_capacity as f64
    } else {
        0.0
    };
    let queue_status = if fill_ratio >= 1.0 {
        HealthStatus::Critical
    } else if fill_ratio >= state.config.queue_warning_ratio {
        HealthStatus::Warning
    } else {
        HealthStatus::Healthy
    };
    checks.insert(
        "queue",
        HealthCheck {
            status: queue_status,
            detail: format!(
                "{}/{} queued ({} in flight)",
                snapshot.queue.depth, state.queue_capacity, snapshot.queue.in_flight
            ),
        },
    );

    let bus_status = if snapshot.bus.connected {
        HealthStatus::Healthy
    } else {
        HealthStatus::Critical
    };
    checks.insert(
        "bus",
        HealthCheck {
            status: bus_status,
            detail: format!(
                "connected={} pending={}",
                snapshot.bus.connected, snapshot.bus.pending_requests
            ),
        },
    );

    let memory_status = if snapshot.system.memory_mb > state.config.memory_warning_mb as f64 {
        HealthStatus::Warning
    } else {
        HealthStatus::Healthy
    };
    checks.insert(
        "memory",
        HealthCheck {
            status: memory_status,
            detail: format!("{:.0} MB resident", snapshot.system.memory_mb),
        },
    );

    let risk_status = if snapshot.risk.paused {
        HealthStatus::Warning
    } else {
        HealthStatus::Healthy
    };
    checks.insert(
        "risk",
        HealthCheck {
            status: risk_status,
            detail: format!(
                "paused={} violations={}",
                snapshot.risk.paused, snapshot.risk.violations_total
            ),
        },
    );

    let overall = checks
        .values()
        .map(|c| c.status)
        .fold(HealthStatus::Healthy, |acc, s| match (acc, s) {
            (HealthStatus::Critical, _) | (_, HealthStatus::Critical) => HealthStatus::Critical,
            (HealthStatus::Warning, _) | (_, HealthStatus::Warning) => HealthStatus::Warning,
            _ => HealthStatus::Healthy,
        });

    Json(HealthResponse {
        status: overall,
        uptime_secs: snapshot.system.uptime_secs,
        checks,
    })
}

async fn metrics_snapshot(State(state): State<ApiState>) -> Response {
    Json(state.metrics.snapshot()).into_response()
}

async fn metrics_history(State(state): State<ApiState>) -> Response {
    Json(state.metrics.history()).into_response()
}

async fn metrics_slice(
    Path(slice): Path<String>,
    State(state): State<ApiState>,
) -> Result<Response, StatusCode> {
    let snapshot = state.metrics.snapshot();
    let body = match slice.as_str() {
        "orders" => serde_json::to_value(&snapshot.orders),
        "risk" => serde_json::to_value(&snapshot.risk),
        "queue" => serde_json::to_value(&snapshot.queue),
        "sltp" => serde_json::to_value(&snapshot.sltp),
        _ => return Err(StatusCode::NOT_FOUND),
    }
    .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(Json(body).into_response())
}

async fn reset_metrics(State(state): State<ApiState>) -> Json<serde_json::Value> {
    state.metrics.reset();
    info!("📊 metrics reset via control endpoint");
    Json(json!({ "success": true }))
}

// ============================================================================
// WebSocket push
// ============================================================================

/// Client frames accepted on the socket.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum WsClientMessage {
    Subscribe { channels: Vec<String> },
    Unsubscribe { channels: Vec<String> },
    Ping,
}

async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<ApiState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: ApiState) {
    let mut events = state.metrics.subscribe();
    let mut subscriptions: HashSet<String> = HashSet::new();

    let welcome = json!({
        "type": "welcome",
        "channels": ["orders", "risk", "sltp", "metrics", "aggregator"],
    });
    if socket.send(Message::Text(welcome.to_string())).await.is_err() {
        return;
    }

    let mut heartbeat =
        tokio::time::interval(Duration::from_secs(state.config.ws_heartbeat_secs.max(1)));
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            // Periodic snapshot for subscribers of the metrics channel.
            _ = heartbeat.tick() => {
                if subscriptions.contains(MonitorTopic::Metrics.as_str()) {
                    let frame = json!({
                        "type": "metrics",
                        "channel": "metrics",
                        "data": state.metrics.snapshot(),
                    });
                    if socket.send(Message::Text(frame.to_string())).await.is_err() {
                        break;
                    }
                }
            }
            // Push events for subscribed topics.
            event = events.recv() => {
                let event = match event {
                    Ok(event) => event,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "ws client lagged; frames dropped");
                        continue;
                    }
                    Err(_) => break,
                };
                if !subscriptions.contains(event.topic.as_str()) {
                    continue;
                }
                let frame = json!({
                    "type": "metrics",
                    "channel": event.topic.as_str(),
                    "data": event.data,
                });
                if socket.send(Message::Text(frame.to_string())).await.is_err() {
                    break;
                }
            }
            // Client control frames.
            msg = socket.recv() => {
                let Some(Ok(msg)) = msg else { break };
                match msg {
                    Message::Text(text) => {
                        match serde_json::from_str::<WsClientMessage>(&text) {
                            Ok(WsClientMessage::Subscribe { channels }) => {
                                let accepted: Vec<String> = channels
                                    .into_iter()
                                    .filter(|c| MonitorTopic::parse(c).is_some())
                                    .collect();
                                for channel in &accepted {
                                    subscriptions.insert(channel.clone());
                                }
                                let ack = json!({
                                    "type": "subscribed",
                                    "channels": accepted,
                                });
                                if socket.send(Message::Text(ack.to_string())).await.is_err() {
                                    break;
                                }
                            }
                            Ok(WsClientMessage::Unsubscribe { channels }) => {
                                for channel in &channels {
                                    subscriptions.remove(channel);
                                }
                                let ack = json!({
                                    "type": "subscribed",
                                    "channels": subscriptions.iter().collect::<Vec<_>>(),
                                });
                                if socket.send(Message::Text(ack.to_string())).await.is_err() {
                                    break;
                                }
                            }
                            Ok(WsClientMessage::Ping) => {
                                let pong = json!({ "type": "pong" });
                                if socket.send(Message::Text(pong.to_string())).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                warn!(error = %e, "unparseable ws control frame");
                            }
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MonitoringConfig;
    use crate::queue::QueueSnapshot;

    fn state_with(depth: usize, capacity: usize, connected: bool) -> ApiState {
        let metrics = Arc::new(MetricsHub::new(10));
        metrics.set_queue(QueueSnapshot {
            depth,
            ..QueueSnapshot::default()
        });
        let mut bus = crate::bus::BusStatsSnapshot::default();
        bus.connected = connected;
        metrics.set_bus(bus);
        ApiState {
            metrics,
            config: MonitoringConfig::default(),
            queue_capacity: capacity,
        }
    }

    #[tokio::test]
    async fn test_health_grades_queue_pressure() {
        let response = health(State(state_with(0, 100, true))).await;
        assert_eq!(response.0.status, HealthStatus::Healthy);

        let response = health(State(state_with(85, 100, true))).await;
        assert_eq!(response.0.status, HealthStatus::Warning);
        assert_eq!(response.0.checks["queue"].status, HealthStatus::Warning);

        let response = health(State(state_with(100, 100, true))).await;
        assert_eq!(response.0.status, HealthStatus::Critical);
    }

    #[tokio::test]
    async fn test_health_critical_when_bus_down() {
        let response = health(State(state_with(0, 100, false))).await;
        assert_eq!(response.0.status, HealthStatus::Critical);
        assert_eq!(response.0.checks["bus"].status, HealthStatus::Critical);
    }

    #[test]
    fn test_ws_client_message_parsing() {
        let subscribe: WsClientMessage =
            serde_json::from_str(r#"{"type":"subscribe","channels":["orders","metrics"]}"#)
                .unwrap();
        assert!(matches!(subscribe, WsClientMessage::Subscribe { channels } if channels.len() == 2));

        let ping: WsClientMessage = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert!(matches!(ping, WsClientMessage::Ping));
    }

    #[test]
    fn test_unknown_slice_is_not_found() {
        // Route-level behavior is covered by the match arm itself.
        let value = MonitorTopic::parse("bogus");
        assert!(value.is_none());
    }
}
