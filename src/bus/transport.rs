//! Bus Transports
//!
//! The adapter talks to the broker through [`BusTransport`]. Production
//! uses a single WebSocket connection with reconnect, subscription
//! restore, and bounded offline buffering; tests and in-process wiring use
//! the in-memory hub.

use crate::bus::envelope::{BusFrame, Envelope};
use crate::config::BusConfig;
use crate::error::BusError;
use async_trait::async_trait;
use futures_util::{Sink, SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::sleep;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

/// Point of coupling to the wire. Implementations route every message as
/// a [`BusFrame`]; delivery order per channel follows arrival order.
#[async_trait]
pub trait BusTransport: Send + Sync {
    /// Fire-and-forget publish.
    async fn publish(&self, frame: BusFrame) -> Result<(), BusError>;

    /// Register interest in a channel. Idempotent; restored on reconnect.
    async fn subscribe(&self, channel: &str) -> Result<(), BusError>;

    /// Drop interest in a channel. Used to tear down one-shot reply
    /// channels after correlation completes.
    async fn unsubscribe(&self, channel: &str) -> Result<(), BusError>;

    /// Take the single inbound frame stream. Returns None after the first
    /// call; the adapter owns the receiver.
    fn take_incoming(&self) -> Option<mpsc::UnboundedReceiver<BusFrame>>;

    fn is_connected(&self) -> bool;
}

// ============================================================================
// In-memory hub
// ============================================================================

struct EndpointSlot {
    subscriptions: HashSet<String>,
    tx: mpsc::UnboundedSender<BusFrame>,
}

/// In-process broker: every endpoint sees every frame published on a
/// channel it subscribed to, publisher included, in publish order.
#[derive(Default)]
pub struct InMemoryBus {
    slots: RwLock<Vec<EndpointSlot>>,
}

impl InMemoryBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create a new endpoint attached to this hub.
    pub fn endpoint(self: &Arc<Self>) -> Arc<InMemoryEndpoint> {
        let (tx, rx) = mpsc::unbounded_channel();
        let index = {
            let mut slots = self.slots.write();
            slots.push(EndpointSlot {
                subscriptions: HashSet::new(),
                tx,
            });
            slots.len() - 1
        };
        Arc::new(InMemoryEndpoint {
            hub: Arc::clone(self),
            index,
            incoming: Mutex::new(Some(rx)),
        })
    }

    fn route(&self, frame: &BusFrame) {
        let slots = self.slots.read();
        for slot in slots.iter() {
            if slot.subscriptions.contains(&frame.channel) {
                let _ = slot.tx.send(frame.clone());
            }
        }
    }
}

/// One participant on the in-memory hub.
pub struct InMemoryEndpoint {
    hub: Arc<InMemoryBus>,
    index: usize,
    incoming: Mutex<Option<mpsc::UnboundedReceiver<BusFrame>>>,
}

#[async_trait]
impl BusTransport for InMemoryEndpoint {
    async fn publish(&self, frame: BusFrame) -> Result<(), BusError> {
        self.hub.route(&frame);
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<(), BusError> {
        let mut slots = self.hub.slots.write();
        slots[self.index].subscriptions.insert(channel.to_string());
        Ok(())
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), BusError> {
        let mut slots = self.hub.slots.write();
        slots[self.index].subscriptions.remove(channel);
        Ok(())
    }

    fn take_incoming(&self) -> Option<mpsc::UnboundedReceiver<BusFrame>> {
        self.incoming.lock().take()
    }

    fn is_connected(&self) -> bool {
        true
    }
}

// ============================================================================
// WebSocket transport
// ============================================================================

/// Wire protocol between the aggregator and the bus broker.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum WireMsg {
    Subscribe { channel: String },
    Unsubscribe { channel: String },
    Publish { channel: String, envelope: Envelope },
    Message { channel: String, envelope: Envelope },
}

enum OutboundCmd {
    Publish(BusFrame),
    Subscribe(String),
    Unsubscribe(String),
}

struct WsShared {
    url: String,
    config: BusConfig,
    connected: AtomicBool,
    /// Channels to (re)subscribe at session start.
    subscriptions: Mutex<HashSet<String>>,
    /// Outbound frames held while disconnected, bounded by config.
    buffer: Mutex<VecDeque<BusFrame>>,
    incoming_tx: mpsc::UnboundedSender<BusFrame>,
    fatal_tx: watch::Sender<bool>,
}

/// WebSocket connection to the bus broker. Reconnects with exponential
/// backoff, restores subscriptions, and re-emits buffered publishes. After
/// `max_reconnect_attempts` consecutive failures the fatal signal fires
/// and the transport stays down.
pub struct WsTransport {
    shared: Arc<WsShared>,
    out_tx: mpsc::UnboundedSender<OutboundCmd>,
    incoming_rx: Mutex<Option<mpsc::UnboundedReceiver<BusFrame>>>,
    fatal_rx: watch::Receiver<bool>,
}

impl WsTransport {
    /// Connect to the broker. The first connection attempt is awaited so a
    /// dead broker fails startup; afterwards the worker owns reconnects.
    pub async fn connect(config: BusConfig) -> Result<Arc<Self>, BusError> {
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (fatal_tx, fatal_rx) = watch::channel(false);

        let shared = Arc::new(WsShared {
            url: config.url(),
            config,
            connected: AtomicBool::new(false),
            subscriptions: Mutex::new(HashSet::new()),
            buffer: Mutex::new(VecDeque::new()),
            incoming_tx,
            fatal_tx,
        });

        let (first_tx, first_rx) = oneshot::channel();
        tokio::spawn(Self::run(Arc::clone(&shared), out_rx, first_tx));

        match first_rx.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(error = %e, "bus broker unreachable");
                return Err(BusError::Disconnected);
            }
            Err(_) => return Err(BusError::Closed),
        }

        Ok(Arc::new(Self {
            shared,
            out_tx,
            incoming_rx: Mutex::new(Some(incoming_rx)),
            fatal_rx,
        }))
    }

    /// Watch that flips to true when the reconnect budget is exhausted.
    pub fn fatal_signal(&self) -> watch::Receiver<bool> {
        self.fatal_rx.clone()
    }

    async fn run(
        shared: Arc<WsShared>,
        mut out_rx: mpsc::UnboundedReceiver<OutboundCmd>,
        first_tx: oneshot::Sender<Result<(), String>>,
    ) {
        let mut first = Some(first_tx);
        let base = Duration::from_millis(shared.config.reconnect_backoff_ms.max(1));
        let max_delay = Duration::from_millis(shared.config.reconnect_backoff_max_ms.max(1));
        let mut delay = base;
        let mut consecutive_failures: u32 = 0;

        loop {
            match connect_async(shared.url.as_str()).await {
                Ok((ws, _resp)) => {
                    if let Some(tx) = first.take() {
                        let _ = tx.send(Ok(()));
                    }
                    info!(url = %shared.url, "🔌 bus connected");
                    consecutive_failures = 0;
                    delay = base;
                    shared.connected.store(true, Ordering::SeqCst);

                    let clean_exit = Self::session(&shared, ws, &mut out_rx).await;
                    shared.connected.store(false, Ordering::SeqCst);
                    if clean_exit {
                        return; // transport dropped
                    }
                    warn!("bus disconnected; reconnecting");
                }
                Err(e) => {
                    if let Some(tx) = first.take() {
                        let _ = tx.send(Err(e.to_string()));
                        return;
                    }
                    consecutive_failures += 1;
                    warn!(
                        error = %e,
                        failures = consecutive_failures,
                        "bus reconnect failed"
                    );
                    if consecutive_failures >= shared.config.max_reconnect_attempts {
                        warn!("🛑 bus reconnect budget exhausted");
                        let _ = shared.fatal_tx.send(true);
                        return;
                    }
                }
            }

            sleep(delay).await;
            delay = (delay * 2).min(max_delay);
        }
    }

    /// One connected session. Returns true when the command channel closed
    /// (transport dropped), false on a transport error.
    async fn session(
        shared: &Arc<WsShared>,
        ws: tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
        out_rx: &mut mpsc::UnboundedReceiver<OutboundCmd>,
    ) -> bool {
        let (mut write, mut read) = ws.split();

        // Restore subscriptions before anything else so no frame is missed.
        let subs: Vec<String> = shared.subscriptions.lock().iter().cloned().collect();
        for channel in subs {
            let msg = WireMsg::Subscribe { channel };
            if Self::send_wire(&mut write, &msg).await.is_err() {
                return false;
            }
        }

        // Re-emit frames buffered while disconnected, in original order.
        loop {
            let frame = {
                let mut buffer = shared.buffer.lock();
                buffer.pop_front()
            };
            let Some(frame) = frame else { break };
            let msg = WireMsg::Publish {
                channel: frame.channel,
                envelope: frame.envelope,
            };
            if Self::send_wire(&mut write, &msg).await.is_err() {
                return false;
            }
        }

        loop {
            tokio::select! {
                cmd = out_rx.recv() => {
                    let Some(cmd) = cmd else {
                        let _ = write.send(Message::Close(None)).await;
                        return true;
                    };
                    let msg = match cmd {
                        OutboundCmd::Publish(frame) => WireMsg::Publish {
                            channel: frame.channel,
                            envelope: frame.envelope,
                        },
                        OutboundCmd::Subscribe(channel) => WireMsg::Subscribe { channel },
                        OutboundCmd::Unsubscribe(channel) => WireMsg::Unsubscribe { channel },
                    };
                    if Self::send_wire(&mut write, &msg).await.is_err() {
                        return false;
                    }
                }
                ws_msg = read.next() => {
                    let Some(ws_msg) = ws_msg else {
                        return false;
                    };
                    match ws_msg {
                        Ok(Message::Text(text)) => Self::handle_text(shared, &text),
                        Ok(Message::Ping(payload)) => {
                            let _ = write.send(Message::Pong(payload)).await;
                        }
                        Ok(Message::Close(frame)) => {
                            debug!(?frame, "bus ws close");
                            return false;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            warn!(error = %e, "bus ws error");
                            return false;
                        }
                    }
                }
            }
        }
    }

    async fn send_wire<S>(write: &mut S, msg: &WireMsg) -> Result<(), ()>
    where
        S: Sink<Message> + Unpin,
    {
        let text = match serde_json::to_string(msg) {
            Ok(t) => t,
            Err(e) => {
                warn!(error = %e, "failed to serialize wire message");
                return Ok(()); // do not tear the session down for one bad frame
            }
        };
        write.send(Message::Text(text)).await.map_err(|_| ())
    }

    fn handle_text(shared: &Arc<WsShared>, text: &str) {
        match serde_json::from_str::<WireMsg>(text) {
            Ok(WireMsg::Message { channel, envelope }) => {
                let _ = shared.incoming_tx.send(BusFrame { channel, envelope });
            }
            Ok(_) => {} // broker should not echo our own ops
            Err(e) => debug!(error = %e, "unparseable bus frame dropped"),
        }
    }
}

#[async_trait]
impl BusTransport for WsTransport {
    async fn publish(&self, frame: BusFrame) -> Result<(), BusError> {
        if self.shared.connected.load(Ordering::SeqCst) {
            self.out_tx
                .send(OutboundCmd::Publish(frame))
                .map_err(|_| BusError::Closed)
        } else {
            let mut buffer = self.shared.buffer.lock();
            if buffer.len() >= self.shared.config.publish_buffer_size {
                return Err(BusError::BufferOverflow(buffer.len()));
            }
            buffer.push_back(frame);
            Ok(())
        }
    }

    async fn subscribe(&self, channel: &str) -> Result<(), BusError> {
        let newly_added = self
            .shared
            .subscriptions
            .lock()
            .insert(channel.to_string());
        if newly_added && self.shared.connected.load(Ordering::SeqCst) {
            self.out_tx
                .send(OutboundCmd::Subscribe(channel.to_string()))
                .map_err(|_| BusError::Closed)?;
        }
        Ok(())
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), BusError> {
        let removed = self.shared.subscriptions.lock().remove(channel);
        if removed && self.shared.connected.load(Ordering::SeqCst) {
            self.out_tx
                .send(OutboundCmd::Unsubscribe(channel.to_string()))
                .map_err(|_| BusError::Closed)?;
        }
        Ok(())
    }

    fn take_incoming(&self) -> Option<mpsc::UnboundedReceiver<BusFrame>> {
        self.incoming_rx.lock().take()
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn frame(channel: &str, kind: &str) -> BusFrame {
        BusFrame {
            channel: channel.to_string(),
            envelope: Envelope::new(kind, "test", json!({})),
        }
    }

    #[tokio::test]
    async fn test_in_memory_routing() {
        let hub = InMemoryBus::new();
        let a = hub.endpoint();
        let b = hub.endpoint();

        b.subscribe("orders").await.unwrap();
        let mut b_rx = b.take_incoming().unwrap();

        a.publish(frame("orders", "ONE")).await.unwrap();
        a.publish(frame("other", "TWO")).await.unwrap();
        a.publish(frame("orders", "THREE")).await.unwrap();

        let first = b_rx.recv().await.unwrap();
        let second = b_rx.recv().await.unwrap();
        assert_eq!(first.envelope.kind, "ONE");
        assert_eq!(second.envelope.kind, "THREE");
    }

    #[tokio::test]
    async fn test_in_memory_publisher_receives_own_frames() {
        let hub = InMemoryBus::new();
        let a = hub.endpoint();
        a.subscribe("loop").await.unwrap();
        let mut rx = a.take_incoming().unwrap();
        a.publish(frame("loop", "SELF")).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().envelope.kind, "SELF");
    }

    #[tokio::test]
    async fn test_take_incoming_is_single_use() {
        let hub = InMemoryBus::new();
        let a = hub.endpoint();
        assert!(a.take_incoming().is_some());
        assert!(a.take_incoming().is_none());
    }

    #[test]
    fn test_wire_msg_format() {
        let msg = WireMsg::Publish {
            channel: "order:fills".to_string(),
            envelope: Envelope::new("FILL", "cm", json!({"q": 1})),
        };
        let text = serde_json::to_string(&msg).unwrap();
        assert!(text.contains("\"op\":\"publish\""));
        assert!(text.contains("\"channel\":\"order:fills\""));

        let inbound = r#"{"op":"message","channel":"x","envelope":{"type":"T","timestamp":1,"source":"s","payload":{}}}"#;
        assert!(matches!(
            serde_json::from_str::<WireMsg>(inbound).unwrap(),
            WireMsg::Message { .. }
        ));
    }
}
