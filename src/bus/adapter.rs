//! Bus Adapter
//!
//! Typed publish / subscribe-with-callback / request-response over the
//! transport. Handler errors are caught and counted; they never reach the
//! transport. Requests are correlated through a bounded pending table with
//! exactly-once completion and deadline-driven eviction.

use crate::bus::envelope::{BusFrame, Envelope};
use crate::bus::transport::BusTransport;
use crate::config::BusConfig;
use crate::error::BusError;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::{interval, timeout, Instant};
use tracing::{debug, warn};

/// Channel callback. Errors are logged and counted, never propagated.
pub type Handler = Arc<dyn Fn(Envelope) -> anyhow::Result<()> + Send + Sync>;

struct PendingRequest {
    tx: oneshot::Sender<Envelope>,
    response_channel: String,
    deadline: Instant,
}

#[derive(Default)]
struct BusStats {
    published: AtomicU64,
    received: AtomicU64,
    handler_errors: AtomicU64,
    requests_sent: AtomicU64,
    request_timeouts: AtomicU64,
    duplicate_responses: AtomicU64,
}

/// Read-only view of adapter counters for the metrics surface.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BusStatsSnapshot {
    pub published: u64,
    pub received: u64,
    pub handler_errors: u64,
    pub requests_sent: u64,
    pub request_timeouts: u64,
    pub duplicate_responses: u64,
    pub connected: bool,
    pub pending_requests: usize,
}

/// Single point of coupling to the message bus.
pub struct BusAdapter {
    transport: Arc<dyn BusTransport>,
    /// Source id stamped into every outbound envelope.
    source: String,
    config: BusConfig,
    handlers: RwLock<HashMap<String, Vec<Handler>>>,
    pending: Mutex<HashMap<String, PendingRequest>>,
    reply_prefix: String,
    /// Well-known channels peers use for correlated responses instead of
    /// the per-request private channel.
    shared_reply_channels: RwLock<HashSet<String>>,
    stats: BusStats,
}

impl BusAdapter {
    pub fn new(transport: Arc<dyn BusTransport>, source: impl Into<String>, config: BusConfig) -> Arc<Self> {
        let source = source.into();
        let reply_prefix = format!("{}:reply:", source);
        Arc::new(Self {
            transport,
            source,
            config,
            handlers: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            reply_prefix,
            shared_reply_channels: RwLock::new(HashSet::new()),
            stats: BusStats::default(),
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// Start the inbound dispatch loop and the pending-table sweeper.
    /// Call once after all construction-time wiring.
    pub fn run(self: &Arc<Self>) {
        let Some(mut incoming) = self.transport.take_incoming() else {
            warn!("bus adapter already running; ignoring second run()");
            return;
        };

        let adapter = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(frame) = incoming.recv().await {
                adapter.dispatch(frame);
            }
            debug!("bus incoming stream ended");
        });

        let sweeper = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = interval(Duration::from_secs(5));
            loop {
                tick.tick().await;
                sweeper.evict_expired();
            }
        });
    }

    /// Fire-and-forget publish of a prepared envelope.
    pub async fn publish(&self, channel: &str, envelope: Envelope) -> Result<(), BusError> {
        self.transport
            .publish(BusFrame {
                channel: channel.to_string(),
                envelope,
            })
            .await?;
        self.stats.published.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Publish a typed payload under this adapter's source id.
    pub async fn publish_json(
        &self,
        channel: &str,
        kind: &str,
        payload: Value,
    ) -> Result<(), BusError> {
        self.publish(channel, Envelope::new(kind, self.source.clone(), payload))
            .await
    }

    /// Register a handler for a channel. Messages arrive in channel order.
    /// Subscribing an already-subscribed channel is idempotent at the
    /// transport; each registered handler sees every message.
    pub async fn subscribe(&self, channel: &str, handler: Handler) -> Result<(), BusError> {
        self.handlers
            .write()
            .entry(channel.to_string())
            .or_default()
            .push(handler);
        self.transport.subscribe(channel).await
    }

    /// Request/response over pub/sub: synthesizes a request id and a
    /// private response channel, publishes, and waits. Retries with
    /// exponential backoff (same request id, so a late first response
    /// still correlates) and fails with a timeout after `max_attempts`.
    pub async fn request(
        &self,
        target_channel: &str,
        kind: &str,
        payload: Value,
        request_timeout: Duration,
        max_attempts: u32,
    ) -> Result<Envelope, BusError> {
        let request_id = uuid::Uuid::new_v4().to_string();
        self.request_with_id(target_channel, kind, payload, request_timeout, max_attempts, request_id)
            .await
    }

    /// Like [`request`](Self::request) but with a caller-pinned request
    /// id, so forwarded requests keep their upstream correlation id.
    pub async fn request_with_id(
        &self,
        target_channel: &str,
        kind: &str,
        payload: Value,
        request_timeout: Duration,
        max_attempts: u32,
        request_id: String,
    ) -> Result<Envelope, BusError> {
        let response_channel = format!("{}{}", self.reply_prefix, request_id);
        let max_attempts = max_attempts.max(1);

        if self.pending.lock().contains_key(&request_id) {
            return Err(BusError::DuplicateRequestId(request_id));
        }

        {
            let pending = self.pending.lock();
            if pending.len() >= self.config.max_pending_requests {
                return Err(BusError::PendingTableFull(pending.len()));
            }
        }

        self.transport.subscribe(&response_channel).await?;

        let (tx, mut rx) = oneshot::channel();
        let total_budget = request_timeout
            .checked_mul(max_attempts)
            .unwrap_or(request_timeout);
        self.pending.lock().insert(
            request_id.clone(),
            PendingRequest {
                tx,
                response_channel: response_channel.clone(),
                deadline: Instant::now() + total_budget + Duration::from_secs(60),
            },
        );
        self.stats.requests_sent.fetch_add(1, Ordering::Relaxed);

        let envelope = Envelope::new(kind, self.source.clone(), payload)
            .with_correlation(request_id.clone(), response_channel.clone());

        for attempt in 0..max_attempts {
            if let Err(e) = self.publish(target_channel, envelope.clone()).await {
                warn!(error = %e, attempt, "request publish failed");
            }

            match timeout(request_timeout, &mut rx).await {
                Ok(Ok(response)) => {
                    let _ = self.transport.unsubscribe(&response_channel).await;
                    return Ok(response);
                }
                Ok(Err(_)) => break, // sender dropped by eviction
                Err(_) => {
                    self.stats.request_timeouts.fetch_add(1, Ordering::Relaxed);
                    if attempt + 1 < max_attempts {
                        let backoff = Duration::from_millis(
                            200u64.saturating_mul(1 << attempt)
                                + rand::thread_rng().gen_range(0..100),
                        );
                        debug!(?backoff, attempt, kind, "request retry");
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
        }

        self.pending.lock().remove(&request_id);
        let _ = self.transport.unsubscribe(&response_channel).await;
        Err(BusError::Timeout {
            attempts: max_attempts,
        })
    }

    /// Accept correlated responses on a well-known shared channel in
    /// addition to per-request private channels. Frames there complete
    /// the matching pending request; unmatched ones are dropped.
    pub async fn add_reply_channel(&self, channel: &str) -> Result<(), BusError> {
        self.shared_reply_channels
            .write()
            .insert(channel.to_string());
        self.transport.subscribe(channel).await
    }

    /// Publish a response for a correlated request on its private channel.
    pub async fn respond(
        &self,
        request_id: &str,
        response_channel: &str,
        kind: &str,
        payload: Value,
    ) -> Result<(), BusError> {
        let envelope =
            Envelope::new(kind, self.source.clone(), payload).with_request_id(request_id);
        self.publish(response_channel, envelope).await
    }

    pub fn stats(&self) -> BusStatsSnapshot {
        BusStatsSnapshot {
            published: self.stats.published.load(Ordering::Relaxed),
            received: self.stats.received.load(Ordering::Relaxed),
            handler_errors: self.stats.handler_errors.load(Ordering::Relaxed),
            requests_sent: self.stats.requests_sent.load(Ordering::Relaxed),
            request_timeouts: self.stats.request_timeouts.load(Ordering::Relaxed),
            duplicate_responses: self.stats.duplicate_responses.load(Ordering::Relaxed),
            connected: self.transport.is_connected(),
            pending_requests: self.pending.lock().len(),
        }
    }

    fn dispatch(&self, frame: BusFrame) {
        self.stats.received.fetch_add(1, Ordering::Relaxed);

        // Correlator traffic completes exactly once; duplicates for an
        // already-completed request are dropped without reaching handlers.
        if let Some(request_id) = frame.envelope.request_id.clone() {
            let is_shared_reply = self.shared_reply_channels.read().contains(&frame.channel);
            let completed = {
                let mut pending = self.pending.lock();
                match pending.get(&request_id) {
                    Some(entry)
                        if entry.response_channel == frame.channel || is_shared_reply =>
                    {
                        pending.remove(&request_id)
                    }
                    _ => None,
                }
            };
            if let Some(entry) = completed {
                let _ = entry.tx.send(frame.envelope);
                return;
            }
            if is_shared_reply || frame.channel.starts_with(&self.reply_prefix) {
                self.stats
                    .duplicate_responses
                    .fetch_add(1, Ordering::Relaxed);
                debug!(request_id, channel = %frame.channel, "duplicate response dropped");
                return;
            }
        }

        let handlers: Vec<Handler> = {
            let map = self.handlers.read();
            map.get(&frame.channel).cloned().unwrap_or_default()
        };
        for handler in handlers {
            if let Err(e) = handler(frame.envelope.clone()) {
                self.stats.handler_errors.fetch_add(1, Ordering::Relaxed);
                warn!(channel = %frame.channel, error = %e, "bus handler failed");
            }
        }
    }

    fn evict_expired(&self) {
        let now = Instant::now();
        let mut pending = self.pending.lock();
        let before = pending.len();
        pending.retain(|_, entry| entry.deadline > now);
        let evicted = before - pending.len();
        if evicted > 0 {
            debug!(evicted, "evicted expired pending requests");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::transport::InMemoryBus;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn adapter_pair() -> (Arc<BusAdapter>, Arc<BusAdapter>) {
        let hub = InMemoryBus::new();
        let a = BusAdapter::new(hub.endpoint(), "aggregator", BusConfig::default());
        let b = BusAdapter::new(hub.endpoint(), "connection-manager", BusConfig::default());
        a.run();
        b.run();
        (a, b)
    }

    #[tokio::test]
    async fn test_publish_subscribe_in_order() {
        let (a, b) = adapter_pair();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        b.subscribe(
            "orders",
            Arc::new(move |env| {
                seen_clone.lock().push(env.kind);
                Ok(())
            }),
        )
        .await
        .unwrap();

        for kind in ["A", "B", "C"] {
            a.publish_json("orders", kind, json!({})).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*seen.lock(), vec!["A", "B", "C"]);
    }

    #[tokio::test]
    async fn test_handler_errors_do_not_propagate() {
        let (a, b) = adapter_pair();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);
        b.subscribe(
            "faulty",
            Arc::new(move |_| {
                calls_clone.fetch_add(1, Ordering::SeqCst);
                anyhow::bail!("boom")
            }),
        )
        .await
        .unwrap();

        a.publish_json("faulty", "X", json!({})).await.unwrap();
        a.publish_json("faulty", "Y", json!({})).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(b.stats().handler_errors, 2);
    }

    #[tokio::test]
    async fn test_request_response_correlation() {
        let (a, b) = adapter_pair();

        // Responder echoes the payload back on the private channel.
        let responder = Arc::clone(&b);
        b.subscribe(
            "connection-manager:requests",
            Arc::new(move |env| {
                let responder = Arc::clone(&responder);
                tokio::spawn(async move {
                    let request_id = env.request_id.clone().unwrap();
                    let response_channel = env.response_channel.clone().unwrap();
                    responder
                        .respond(&request_id, &response_channel, "RESPONSE", env.payload)
                        .await
                        .unwrap();
                    // A second response for the same request must be dropped.
                    responder
                        .respond(&request_id, &response_channel, "RESPONSE", json!({"dup": true}))
                        .await
                        .unwrap();
                });
                Ok(())
            }),
        )
        .await
        .unwrap();

        let response = a
            .request(
                "connection-manager:requests",
                "GET_ACCOUNTS",
                json!({"n": 7}),
                Duration::from_secs(2),
                3,
            )
            .await
            .unwrap();
        assert_eq!(response.payload["n"], 7);

        // The duplicate second response must not disturb anything.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(a.stats().pending_requests, 0);
    }

    #[tokio::test]
    async fn test_response_without_pending_entry_is_dropped() {
        let (a, b) = adapter_pair();

        // A handler on the reply namespace must never see correlator
        // traffic for an already-completed (or never-issued) request.
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);
        a.subscribe(
            "aggregator:reply:deadbeef",
            Arc::new(move |_| {
                calls_clone.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        )
        .await
        .unwrap();

        b.respond("deadbeef", "aggregator:reply:deadbeef", "RESPONSE", json!({}))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(a.stats().duplicate_responses, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_correlation_over_shared_response_channel() {
        let (a, b) = adapter_pair();
        a.add_reply_channel("connection-manager:responses")
            .await
            .unwrap();

        // Responder answers on the shared channel, not the private one.
        let responder = Arc::clone(&b);
        b.subscribe(
            "connection-manager:requests",
            Arc::new(move |env| {
                let responder = Arc::clone(&responder);
                tokio::spawn(async move {
                    responder
                        .respond(
                            &env.request_id.unwrap(),
                            "connection-manager:responses",
                            "RESPONSE",
                            json!({"ok": true}),
                        )
                        .await
                        .unwrap();
                });
                Ok(())
            }),
        )
        .await
        .unwrap();

        let response = a
            .request(
                "connection-manager:requests",
                "GET_STATISTICS",
                json!({}),
                Duration::from_secs(2),
                1,
            )
            .await
            .unwrap();
        assert_eq!(response.payload["ok"], true);
    }

    #[tokio::test]
    async fn test_request_times_out_after_attempts() {
        let (a, _b) = adapter_pair();
        let start = Instant::now();
        let err = a
            .request(
                "nowhere",
                "GET_ACCOUNTS",
                json!({}),
                Duration::from_millis(30),
                2,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::Timeout { attempts: 2 }));
        // Two attempts plus one backoff elapsed.
        assert!(start.elapsed() >= Duration::from_millis(60));
        assert_eq!(a.stats().pending_requests, 0);
    }
}
