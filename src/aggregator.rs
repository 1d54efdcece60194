//! Aggregator Core
//!
//! The orchestrator: a single task that owns `active_orders`, `positions`,
//! the risk engine, the priority queue, and the source registry. Inbound
//! bus callbacks enqueue commands onto its serial stream; outbound
//! dispatches run as parallel tasks that report completions back over an
//! internal channel, so the orchestrator never blocks on I/O.

use crate::bus::{channels, BusAdapter, Envelope};
use crate::config::AppConfig;
use crate::downstream::ConnectionManagerClient;
use crate::error::{DownstreamError, RejectReason};
use crate::metrics::{MetricsHub, MonitorTopic};
use crate::models::{
    AccountId, AggregatorEvent, Fill, MarketTick, Order, OrderId, OrderState, OrderSubmission,
    Priority, SourceKind, Symbol,
};
use crate::queue::{EnqueueOutcome, PriorityQueue, QueueEntry};
use crate::risk::{RiskContext, RiskDecision, RiskEngine, RiskViolation};
use crate::sltp::BracketCalculator;
use crate::sources::SourceRegistry;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Reply to a submission, mirrored onto the bus for correlated requests.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitOutcome {
    pub accepted: bool,
    pub order_id: OrderId,
    pub state: OrderState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<RejectReason>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub violations: Vec<RiskViolation>,
    /// Set when risk deferred: a required datum was momentarily missing
    /// and the producer may simply retry.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub deferred: bool,
}

/// Reply to a cancel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CancelOutcome {
    /// Removed from the queue before dispatch.
    Cancelled,
    /// Cancel forwarded to the broker; confirmation arrives as a status
    /// update.
    CancelRequested,
    NotCancellable,
    NotFound,
}

/// Admin toggles accepted over `aggregator:admin`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "action", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AdminAction {
    SetShadowMode { enabled: bool },
    PauseTrading,
    ResumeTrading,
}

enum Command {
    Submit {
        submission: OrderSubmission,
        respond: Option<oneshot::Sender<SubmitOutcome>>,
    },
    Cancel {
        order_id: OrderId,
        respond: Option<oneshot::Sender<CancelOutcome>>,
    },
    Fill(Fill),
    MarketData(MarketTick),
    BrokerStatus {
        order_id: OrderId,
        status: String,
        reason: Option<String>,
    },
    Admin(AdminAction),
    Shutdown {
        force: bool,
        done: oneshot::Sender<()>,
    },
}

struct DispatchOutcome {
    entry: QueueEntry,
    result: Result<(), DownstreamError>,
    elapsed_ms: f64,
}

/// What a terminal order left behind, for idempotent resubmits and
/// late-fill handling.
struct TerminalRecord {
    state: OrderState,
    reason: Option<RejectReason>,
    account_id: AccountId,
    instrument: Symbol,
}

/// Cloneable handle used by bus callbacks and the monitoring surface.
#[derive(Clone)]
pub struct AggregatorHandle {
    tx: mpsc::UnboundedSender<Command>,
    events_tx: broadcast::Sender<AggregatorEvent>,
}

impl AggregatorHandle {
    pub async fn submit_order(&self, submission: OrderSubmission) -> Option<SubmitOutcome> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(Command::Submit {
                submission,
                respond: Some(tx),
            })
            .ok()?;
        rx.await.ok()
    }

    pub async fn cancel_order(&self, order_id: OrderId) -> Option<CancelOutcome> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(Command::Cancel {
                order_id,
                respond: Some(tx),
            })
            .ok()?;
        rx.await.ok()
    }

    pub fn process_fill(&self, fill: Fill) {
        let _ = self.tx.send(Command::Fill(fill));
    }

    pub fn market_data(&self, tick: MarketTick) {
        let _ = self.tx.send(Command::MarketData(tick));
    }

    pub fn broker_status(&self, order_id: OrderId, status: String, reason: Option<String>) {
        let _ = self.tx.send(Command::BrokerStatus {
            order_id,
            status,
            reason,
        });
    }

    pub fn admin(&self, action: AdminAction) {
        let _ = self.tx.send(Command::Admin(action));
    }

    /// Drain and stop. Resolves when the orchestrator has flushed.
    pub async fn shutdown(&self, force: bool) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(Command::Shutdown { force, done: tx }).is_ok() {
            let _ = rx.await;
        }
    }

    /// Typed internal event stream (metrics, registries, tests).
    pub fn subscribe_events(&self) -> broadcast::Receiver<AggregatorEvent> {
        self.events_tx.subscribe()
    }
}

/// The orchestrator task state.
pub struct Aggregator {
    config: AppConfig,
    bus: Arc<BusAdapter>,
    downstream: Arc<ConnectionManagerClient>,
    metrics: Arc<MetricsHub>,
    risk: RiskEngine,
    queue: PriorityQueue,
    sltp: BracketCalculator,
    sources: SourceRegistry,
    active_orders: HashMap<OrderId, Order>,
    terminal_orders: HashMap<OrderId, TerminalRecord>,
    positions: HashMap<(AccountId, Symbol), crate::models::Position>,
    last_prices: HashMap<Symbol, f64>,
    /// Dispatched entries currently at the broker, by order id.
    in_flight: HashSet<OrderId>,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    dispatch_tx: mpsc::UnboundedSender<DispatchOutcome>,
    dispatch_rx: mpsc::UnboundedReceiver<DispatchOutcome>,
    events_tx: broadcast::Sender<AggregatorEvent>,
    draining: bool,
}

impl Aggregator {
    /// Build the orchestrator and return its task handle. `run()` must be
    /// awaited (normally via `tokio::spawn`) for anything to happen.
    pub fn new(
        config: AppConfig,
        bus: Arc<BusAdapter>,
        downstream: Arc<ConnectionManagerClient>,
        metrics: Arc<MetricsHub>,
    ) -> (Self, AggregatorHandle) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();
        let (events_tx, _) = broadcast::channel(1_024);

        let aggregator = Self {
            risk: RiskEngine::new(config.risk.clone()),
            queue: PriorityQueue::new(config.queue.clone()),
            sltp: BracketCalculator::new(config.sltp.clone(), config.contracts.clone()),
            sources: SourceRegistry::new(),
            active_orders: HashMap::new(),
            terminal_orders: HashMap::new(),
            positions: HashMap::new(),
            last_prices: HashMap::new(),
            in_flight: HashSet::new(),
            cmd_rx,
            dispatch_tx,
            dispatch_rx,
            events_tx: events_tx.clone(),
            draining: false,
            config,
            bus,
            downstream,
            metrics,
        };
        let handle = AggregatorHandle {
            tx: cmd_tx,
            events_tx,
        };
        (aggregator, handle)
    }

    /// Convenience: build and spawn in one step.
    pub fn spawn(
        config: AppConfig,
        bus: Arc<BusAdapter>,
        downstream: Arc<ConnectionManagerClient>,
        metrics: Arc<MetricsHub>,
    ) -> AggregatorHandle {
        let (aggregator, handle) = Self::new(config, bus, downstream, metrics);
        tokio::spawn(aggregator.run());
        handle
    }

    /// The serial orchestrator loop. Exits on shutdown.
    pub async fn run(mut self) {
        let tick_interval = Duration::from_millis(self.config.queue.processing_interval_ms);
        let mut tick = interval(tick_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut last_tick = Instant::now();
        let mut pending_shutdown: Option<(oneshot::Sender<()>, Instant)> = None;

        info!("📦 aggregator core running");
        loop {
            tokio::select! {
                Some(outcome) = self.dispatch_rx.recv() => {
                    self.on_dispatch_complete(outcome).await;
                }
                cmd = self.cmd_rx.recv() => {
                    let Some(cmd) = cmd else { break };
                    match cmd {
                        Command::Shutdown { force, done } => {
                            self.begin_drain().await;
                            let deadline = Instant::now()
                                + Duration::from_secs(self.config.monitoring.drain_deadline_secs);
                            if force || self.in_flight.is_empty() {
                                let _ = done.send(());
                                break;
                            }
                            pending_shutdown = Some((done, deadline));
                        }
                        other => self.handle_command(other).await,
                    }
                }
                _ = tick.tick() => {
                    let lag = last_tick.elapsed().saturating_sub(tick_interval);
                    self.metrics.set_loop_lag(lag.as_secs_f64() * 1_000.0);
                    last_tick = Instant::now();
                    if !self.draining {
                        self.on_tick().await;
                    }
                    self.metrics.set_queue(self.queue.snapshot());
                    self.metrics.set_bus(self.bus.stats());
                    self.metrics
                        .set_risk(self.risk.is_paused(), self.risk.shadow_stats());
                }
            }

            let drain_finished = pending_shutdown
                .as_ref()
                .map(|(_, deadline)| self.in_flight.is_empty() || Instant::now() >= *deadline)
                .unwrap_or(false);
            if drain_finished {
                if let Some((done, _)) = pending_shutdown.take() {
                    let _ = done.send(());
                }
                break;
            }
        }

        // Final flush so the last state is observable.
        self.metrics.set_queue(self.queue.snapshot());
        self.metrics.sample_history();
        info!("📦 aggregator core stopped");
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Submit { submission, respond } => {
                let outcome = self.handle_submission(submission).await;
                if let Some(tx) = respond {
                    let _ = tx.send(outcome);
                }
            }
            Command::Cancel { order_id, respond } => {
                let outcome = self.handle_cancel(order_id).await;
                if let Some(tx) = respond {
                    let _ = tx.send(outcome);
                }
            }
            Command::Fill(fill) => self.handle_fill(fill).await,
            Command::MarketData(tick) => self.handle_market_data(tick).await,
            Command::BrokerStatus {
                order_id,
                status,
                reason,
            } => self.handle_broker_status(order_id, status, reason).await,
            Command::Admin(action) => self.handle_admin(action),
            Command::Shutdown { .. } => debug!("shutdown is handled by the run loop"),
        }
    }

    // ========================================================================
    // Submission
    // ========================================================================

    async fn handle_submission(&mut self, submission: OrderSubmission) -> SubmitOutcome {
        let now = Utc::now();
        let source = submission
            .source
            .clone()
            .unwrap_or_else(|| "unknown".to_string());

        // Idempotence on id: a known non-terminal id returns current state
        // without side effects; a terminal id returns its recorded outcome.
        if let Some(id) = &submission.id {
            if let Some(existing) = self.active_orders.get(id) {
                return SubmitOutcome {
                    accepted: true,
                    order_id: id.clone(),
                    state: existing.state,
                    reason: existing.rejection_reason,
                    violations: vec![],
                    deferred: false,
                };
            }
            if let Some(record) = self.terminal_orders.get(id) {
                return SubmitOutcome {
                    accepted: matches!(record.state, OrderState::Filled),
                    order_id: id.clone(),
                    state: record.state,
                    reason: record.reason,
                    violations: vec![],
                    deferred: false,
                };
            }
        }

        let id = submission
            .id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        // Normalize: fill defaults, resolve the priority from the source
        // kind when the producer did not pin one.
        self.sources.record_order(&source, now);
        let priority = submission.priority.unwrap_or_else(|| {
            match self.sources.kind_of(&source) {
                Some(SourceKind::Manual) => Priority::High,
                _ => Priority::Normal,
            }
        });

        let order = Order {
            id: id.clone(),
            source: source.clone(),
            account_id: submission.account_id.clone(),
            instrument: submission.instrument.clone(),
            side: submission.side,
            kind: submission.kind,
            quantity: submission.quantity,
            price: submission.price,
            stop_price: submission.stop_price,
            priority,
            state: OrderState::Received,
            filled_quantity: 0,
            average_fill_price: 0.0,
            rejection_reason: None,
            linked_bracket_of: None,
            received_at: now,
            validated_at: None,
            dispatched_at: None,
            terminal_at: None,
        };

        self.submit_order(order).await
    }

    /// The shared ingestion path for producer submissions and bracket
    /// children: validation gate, risk gate, queue admission.
    async fn submit_order(&mut self, mut order: Order) -> SubmitOutcome {
        let now = Utc::now();
        self.metrics
            .record_order_received(&order.source, &order.instrument);
        self.emit(AggregatorEvent::OrderSubmitted {
            order_id: order.id.clone(),
            source: order.source.clone(),
            instrument: order.instrument.clone(),
            priority: order.priority,
        })
        .await;

        // Boundary validation.
        if let Some(message) = self.validate(&order) {
            debug!(order_id = %order.id, message, "submission failed validation");
            return self
                .reject_order(order, RejectReason::Validation, vec![])
                .await;
        }
        if self.draining {
            return self
                .reject_order(order, RejectReason::Shutdown, vec![])
                .await;
        }

        // Risk gate.
        let ctx = self.risk_context(&order);
        match self.risk.evaluate(&order, &ctx, now) {
            RiskDecision::Accept => {}
            RiskDecision::Reject { violations } => {
                return self
                    .reject_order(order, RejectReason::RiskViolation, violations)
                    .await;
            }
            RiskDecision::Defer { reason } => {
                debug!(order_id = %order.id, reason, "risk deferred");
                let mut outcome = self
                    .reject_order(order, RejectReason::Deferred, vec![])
                    .await;
                outcome.deferred = true;
                return outcome;
            }
        }
        order.transition(OrderState::Validated, now);

        // Queue admission.
        let entry = QueueEntry {
            order_id: order.id.clone(),
            instrument: order.instrument.clone(),
            priority: order.priority,
            enqueued_at: now,
            attempts: 0,
        };
        match self.queue.enqueue(entry) {
            EnqueueOutcome::Accepted => {}
            EnqueueOutcome::RejectedFull => {
                return self
                    .reject_order(order, RejectReason::QueueFull, vec![])
                    .await;
            }
            EnqueueOutcome::RejectedSymbolLimit => {
                return self
                    .reject_order(order, RejectReason::SymbolLimit, vec![])
                    .await;
            }
        }

        order.transition(OrderState::Queued, now);
        self.risk.record_submitted(&order, now);

        let outcome = SubmitOutcome {
            accepted: true,
            order_id: order.id.clone(),
            state: order.state,
            reason: None,
            violations: vec![],
            deferred: false,
        };
        self.active_orders.insert(order.id.clone(), order);
        outcome
    }

    /// Returns a human-readable problem for malformed input, or None.
    fn validate(&self, order: &Order) -> Option<String> {
        if order.quantity == 0 {
            return Some("quantity must be positive".to_string());
        }
        if order.kind.requires_price() && order.price.is_none() {
            return Some(format!("{:?} order requires a price", order.kind));
        }
        if order.kind.requires_stop_price() && order.stop_price.is_none() {
            return Some(format!("{:?} order requires a stop price", order.kind));
        }
        if order.instrument.is_empty() || order.account_id.is_empty() {
            return Some("instrument and accountId are required".to_string());
        }
        None
    }

    fn risk_context(&self, order: &Order) -> RiskContext {
        let position_size = self
            .positions
            .get(&(order.account_id.clone(), order.instrument.clone()))
            .map(|p| p.size)
            .unwrap_or(0);
        let open_positions = self
            .positions
            .iter()
            .filter(|((account, _), position)| account == &order.account_id && !position.is_flat())
            .count();
        RiskContext {
            position_size,
            open_positions,
            last_price: self.last_prices.get(&order.instrument).copied(),
            dollar_per_point: self.config.contract_for(&order.instrument).dollar_per_point,
        }
    }

    async fn reject_order(
        &mut self,
        mut order: Order,
        reason: RejectReason,
        violations: Vec<RiskViolation>,
    ) -> SubmitOutcome {
        let now = Utc::now();
        order.rejection_reason = Some(reason);
        order.transition(OrderState::Rejected, now);
        self.sources.record_rejection(&order.source, now);

        let rules: Vec<String> = violations
            .iter()
            .map(|v| v.rule.as_str().to_string())
            .collect();
        self.metrics.record_order_rejected(reason, &rules);
        self.emit(AggregatorEvent::OrderRejected {
            order_id: order.id.clone(),
            source: order.source.clone(),
            reason,
            violations: rules,
        })
        .await;

        let outcome = SubmitOutcome {
            accepted: false,
            order_id: order.id.clone(),
            state: OrderState::Rejected,
            reason: Some(reason),
            violations,
            deferred: false,
        };
        self.finalize(order);
        outcome
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    async fn on_tick(&mut self) {
        let now = Utc::now();
        for entry in self.queue.poll_dispatchable(now) {
            let Some(order) = self.active_orders.get(&entry.order_id) else {
                // Cancelled between queue pop bookkeeping and now.
                self.queue.complete_dispatch();
                continue;
            };
            self.in_flight.insert(entry.order_id.clone());

            let order = order.clone();
            let downstream = Arc::clone(&self.downstream);
            let tx = self.dispatch_tx.clone();
            tokio::spawn(async move {
                let started = Instant::now();
                let result = downstream.submit_order(&order).await.map(|_| ());
                let _ = tx.send(DispatchOutcome {
                    entry,
                    result,
                    elapsed_ms: started.elapsed().as_secs_f64() * 1_000.0,
                });
            });
        }
    }

    async fn on_dispatch_complete(&mut self, outcome: DispatchOutcome) {
        let now = Utc::now();
        self.queue.complete_dispatch();
        self.in_flight.remove(&outcome.entry.order_id);

        let Some(order) = self.active_orders.get_mut(&outcome.entry.order_id) else {
            return;
        };

        match outcome.result {
            Ok(()) => {
                order.transition(OrderState::Dispatched, now);
                let order_id = order.id.clone();
                let instrument = order.instrument.clone();
                let source = order.source.clone();
                self.sources.record_processed(&source, now);
                self.metrics.record_order_processed(outcome.elapsed_ms);
                self.publish_status(&order_id, "ACK", None).await;
                self.emit(AggregatorEvent::OrderProcessed {
                    order_id,
                    instrument,
                    dispatch_latency_ms: outcome.elapsed_ms,
                })
                .await;
            }
            Err(err) if err.is_transient() && !self.draining && self.queue.can_retry(&outcome.entry) => {
                let attempts = outcome.entry.attempts + 1;
                warn!(
                    order_id = %outcome.entry.order_id,
                    attempts,
                    error = %err,
                    "transient dispatch failure; retry scheduled"
                );
                // The order goes back to waiting; its state stays QUEUED.
                self.queue.schedule_retry(outcome.entry, now);
            }
            Err(err) => {
                let attempts = outcome.entry.attempts + 1;
                let reason = err.reject_reason();
                warn!(
                    order_id = %outcome.entry.order_id,
                    attempts,
                    error = %err,
                    "dispatch failed"
                );
                self.fail_order(&outcome.entry.order_id, reason, attempts).await;
            }
        }
    }

    async fn fail_order(&mut self, order_id: &OrderId, reason: RejectReason, attempts: u32) {
        let now = Utc::now();
        let Some(mut order) = self.active_orders.remove(order_id) else {
            return;
        };
        order.rejection_reason = Some(reason);
        order.transition(OrderState::Failed, now);
        self.metrics.record_order_failed(reason);
        self.publish_status(order_id, "FAILED", Some(reason.as_str()))
            .await;
        self.emit(AggregatorEvent::OrderFailed {
            order_id: order_id.clone(),
            reason,
            attempts,
        })
        .await;
        self.finalize(order);
    }

    // ========================================================================
    // Fills & positions
    // ========================================================================

    async fn handle_fill(&mut self, fill: Fill) {
        let now = Utc::now();

        if !self.active_orders.contains_key(&fill.order_id) {
            // Cancel races still move positions; anything else is dropped.
            match self.terminal_orders.get(&fill.order_id) {
                Some(record) if record.state == OrderState::Cancelled => {
                    warn!(order_id = %fill.order_id, "late fill after cancel; applying");
                    self.metrics.record_late_fill();
                    let account_id = record.account_id.clone();
                    let instrument = record.instrument.clone();
                    self.apply_position_fill(
                        &account_id,
                        &instrument,
                        fill.side,
                        fill.fill_quantity,
                        fill.fill_price,
                        now,
                    );
                }
                Some(_) => {
                    debug!(order_id = %fill.order_id, "fill for terminal order dropped");
                    self.metrics.record_late_fill();
                }
                None => {
                    warn!(order_id = %fill.order_id, "fill for unknown order dropped");
                    self.metrics.record_unknown_order_fill();
                }
            }
            return;
        }

        // Order accounting under a scoped borrow; cumulative quantity is
        // authoritative for the applied delta.
        let (delta, parent, fully_filled, fill_latency_ms) = {
            let Some(order) = self.active_orders.get_mut(&fill.order_id) else {
                return;
            };

            if !matches!(
                order.state,
                OrderState::Dispatched | OrderState::PartiallyFilled
            ) {
                warn!(order_id = %fill.order_id, state = ?order.state, "fill in unexpected state dropped");
                self.metrics.record_unknown_order_fill();
                return;
            }

            let Some(delta) =
                order.apply_cumulative_fill(fill.cumulative_quantity, fill.fill_price)
            else {
                warn!(
                    order_id = %fill.order_id,
                    cumulative = fill.cumulative_quantity,
                    "non-monotonic cumulative fill dropped"
                );
                self.metrics.record_unknown_order_fill();
                return;
            };
            if delta == 0 {
                return; // duplicate fill report
            }

            let fully_filled = order.is_fully_filled();
            let fill_latency_ms = order
                .dispatched_at
                .map(|at| (now - at).num_milliseconds() as f64)
                .unwrap_or(0.0);
            if fully_filled {
                order.transition(OrderState::Filled, now);
            } else if order.state == OrderState::Dispatched {
                order.transition(OrderState::PartiallyFilled, now);
            }
            (delta, order.clone(), fully_filled, fill_latency_ms)
        };

        let position_size = self.apply_position_fill(
            &parent.account_id,
            &parent.instrument,
            fill.side,
            delta,
            fill.fill_price,
            now,
        );
        self.sources.record_fill(&parent.source, now);
        self.metrics.record_fill(fill_latency_ms);

        // Bracket children for the newly filled quantity. Children of
        // bracket orders are never bracketed again.
        let mut brackets_submitted = false;
        if !parent.is_bracket_child() && self.sltp.enabled() {
            let started = Instant::now();
            let levels = self.sltp.compute(&fill);
            let elapsed_ms = started.elapsed().as_secs_f64() * 1_000.0;
            if levels.calculated {
                self.metrics.record_bracket(true, elapsed_ms);
                self.metrics.push(
                    MonitorTopic::Sltp,
                    json!({
                        "orderId": fill.order_id,
                        "levels": levels,
                    }),
                );
                let children = self.sltp.build_children(&parent, delta, &levels, now);
                for child in children {
                    let outcome = self.submit_order(child).await;
                    if !outcome.accepted {
                        warn!(
                            parent = %fill.order_id,
                            child = %outcome.order_id,
                            reason = ?outcome.reason,
                            "bracket child rejected"
                        );
                    }
                }
                brackets_submitted = true;
            } else {
                self.metrics.record_bracket(false, elapsed_ms);
                if levels.reason.as_deref() == Some("INVALID_GEOMETRY") {
                    warn!(order_id = %fill.order_id, "bracket skipped: INVALID_GEOMETRY");
                }
            }
        }

        self.emit(AggregatorEvent::FillProcessed {
            order_id: fill.order_id.clone(),
            instrument: parent.instrument.clone(),
            fill_quantity: delta,
            cumulative_quantity: fill.cumulative_quantity,
            position_size,
            brackets_submitted,
        })
        .await;

        if fully_filled {
            if let Some(order) = self.active_orders.remove(&fill.order_id) {
                self.finalize(order);
            }
        }
    }

    /// Apply a fill quantity to the (account, instrument) position, feed
    /// realized PnL into risk, and evict flat entries. Returns the new
    /// signed size.
    fn apply_position_fill(
        &mut self,
        account_id: &str,
        instrument: &str,
        side: crate::models::Side,
        quantity: u32,
        price: f64,
        now: chrono::DateTime<Utc>,
    ) -> i64 {
        let spec = self.config.contract_for(instrument);
        let key = (account_id.to_string(), instrument.to_string());
        let position = self.positions.entry(key.clone()).or_insert_with(|| {
            crate::models::Position::new(account_id.to_string(), instrument.to_string(), now)
        });
        let realized = position.apply_fill(side, quantity, price, spec.dollar_per_point, now);
        if let Some(last) = self.last_prices.get(instrument) {
            position.mark(*last, spec.dollar_per_point);
        }
        let size = position.size;
        if position.is_flat() {
            self.positions.remove(&key);
        }
        if realized != 0.0 {
            self.risk.apply_realized_pnl(account_id, realized, now);
        }
        size
    }

    // ========================================================================
    // Market data, cancels, broker status, admin
    // ========================================================================

    async fn handle_market_data(&mut self, tick: MarketTick) {
        self.last_prices.insert(tick.instrument.clone(), tick.last);
        let dollar_per_point = self.config.contract_for(&tick.instrument).dollar_per_point;
        for ((_, instrument), position) in self.positions.iter_mut() {
            if instrument == &tick.instrument {
                position.mark(tick.last, dollar_per_point);
            }
        }
        // Republish for downstream consumers; fire-and-forget.
        if let Err(e) = self
            .bus
            .publish_json(
                channels::AGGREGATOR_MARKET_DATA,
                "MARKET_TICK",
                serde_json::to_value(&tick).unwrap_or_default(),
            )
            .await
        {
            debug!(error = %e, "market data republish failed");
        }
    }

    async fn handle_cancel(&mut self, order_id: OrderId) -> CancelOutcome {
        let now = Utc::now();
        let Some(order) = self.active_orders.get(&order_id) else {
            return CancelOutcome::NotFound;
        };

        match order.state {
            OrderState::Queued => {
                if !self.queue.remove(&order_id) {
                    // Popped for dispatch but not yet confirmed.
                    return CancelOutcome::NotCancellable;
                }
                let Some(mut order) = self.active_orders.remove(&order_id) else {
                    return CancelOutcome::NotFound;
                };
                order.transition(OrderState::Cancelled, now);
                self.metrics.record_order_cancelled();
                self.publish_status(&order_id, "CANCELLED", None).await;
                self.emit(AggregatorEvent::OrderCancelled {
                    order_id: order_id.clone(),
                })
                .await;
                self.finalize(order);
                CancelOutcome::Cancelled
            }
            OrderState::Dispatched | OrderState::PartiallyFilled => {
                // Best-effort: confirmation arrives as a broker status.
                let downstream = Arc::clone(&self.downstream);
                let account_id = order.account_id.clone();
                let id = order_id.clone();
                tokio::spawn(async move {
                    if let Err(e) = downstream.cancel_order(&id, &account_id).await {
                        warn!(order_id = %id, error = %e, "broker cancel failed");
                    }
                });
                CancelOutcome::CancelRequested
            }
            _ => CancelOutcome::NotCancellable,
        }
    }

    async fn handle_broker_status(
        &mut self,
        order_id: OrderId,
        status: String,
        reason: Option<String>,
    ) {
        let now = Utc::now();
        match status.as_str() {
            "CANCELLED" => {
                let Some(mut order) = self.active_orders.remove(&order_id) else {
                    return;
                };
                if !order.transition(OrderState::Cancelled, now) {
                    self.active_orders.insert(order_id, order);
                    return;
                }
                self.metrics.record_order_cancelled();
                self.publish_status(&order_id, "CANCELLED", None).await;
                self.emit(AggregatorEvent::OrderCancelled {
                    order_id: order_id.clone(),
                })
                .await;
                self.finalize(order);
            }
            "FAILED" => {
                if self.active_orders.contains_key(&order_id) {
                    warn!(order_id = %order_id, ?reason, "broker reported order failure");
                    self.fail_order(&order_id, RejectReason::DownstreamRejected, 0)
                        .await;
                }
            }
            other => debug!(order_id = %order_id, status = other, "unhandled broker status"),
        }
    }

    fn handle_admin(&mut self, action: AdminAction) {
        match action {
            AdminAction::SetShadowMode { enabled } => self.risk.set_shadow_mode(enabled),
            AdminAction::PauseTrading => self.risk.set_manual_pause(true),
            AdminAction::ResumeTrading => self.risk.set_manual_pause(false),
        }
        self.metrics
            .set_risk(self.risk.is_paused(), self.risk.shadow_stats());
    }

    // ========================================================================
    // Shutdown & plumbing
    // ========================================================================

    /// Stop admitting, fail everything still waiting with SHUTDOWN, and
    /// leave in-flight dispatches to complete against the deadline.
    async fn begin_drain(&mut self) {
        if self.draining {
            return;
        }
        self.draining = true;
        info!(
            queued = self.queue.len(),
            in_flight = self.in_flight.len(),
            "🔻 draining aggregator"
        );
        self.metrics.push(
            MonitorTopic::Aggregator,
            json!({
                "event": "draining",
                "queued": self.queue.len(),
                "inFlight": self.in_flight.len(),
            }),
        );
        for entry in self.queue.drain_all() {
            self.fail_order(&entry.order_id, RejectReason::Shutdown, entry.attempts)
                .await;
        }
    }

    /// Move a terminal order out of the active map, keeping the record
    /// needed for idempotent resubmits and late fills.
    fn finalize(&mut self, order: Order) {
        self.terminal_orders.insert(
            order.id.clone(),
            TerminalRecord {
                state: order.state,
                reason: order.rejection_reason,
                account_id: order.account_id.clone(),
                instrument: order.instrument.clone(),
            },
        );
    }

    async fn publish_status(&self, order_id: &OrderId, status: &str, reason: Option<&str>) {
        let payload = json!({
            "orderId": order_id,
            "status": status,
            "reason": reason,
        });
        if let Err(e) = self
            .bus
            .publish_json(channels::ORDER_STATUS, status, payload)
            .await
        {
            debug!(error = %e, "status publish failed");
        }
    }

    /// Fan an event out to internal observers, the bus, and the push
    /// surface.
    async fn emit(&self, event: AggregatorEvent) {
        let _ = self.events_tx.send(event.clone());
        let value = serde_json::to_value(&event).unwrap_or_default();
        let kind = value
            .get("type")
            .and_then(|t| t.as_str())
            .unwrap_or("event")
            .to_string();
        if let Err(e) = self
            .bus
            .publish_json(channels::AGGREGATOR_EVENTS, &kind, value.clone())
            .await
        {
            debug!(error = %e, "event publish failed");
        }
        let topic = match &event {
            AggregatorEvent::OrderRejected { violations, .. } if !violations.is_empty() => {
                MonitorTopic::Risk
            }
            _ => MonitorTopic::Orders,
        };
        self.metrics.push(topic, value);
    }
}

/// Subscribe the aggregator to its inbound bus channels. Called once at
/// startup (and by integration tests over the in-memory hub).
pub async fn wire_bus(
    handle: AggregatorHandle,
    bus: Arc<BusAdapter>,
) -> Result<(), crate::error::BusError> {
    // The Connection Manager may answer on its shared response channel
    // instead of the per-request private one; both correlate.
    bus.add_reply_channel(channels::CONNECTION_MANAGER_RESPONSES)
        .await?;

    // External order submissions, with correlated replies.
    {
        let handle = handle.clone();
        let bus_for_reply = Arc::clone(&bus);
        bus.subscribe(
            channels::AGGREGATOR_ORDERS,
            Arc::new(move |envelope: Envelope| {
                let handle = handle.clone();
                let bus = Arc::clone(&bus_for_reply);
                let mut submission: OrderSubmission =
                    serde_json::from_value(envelope.payload["order"].clone())?;
                if submission.source.is_none() {
                    submission.source = envelope.payload["source"]
                        .as_str()
                        .map(str::to_string)
                        .or(Some(envelope.source.clone()));
                }
                tokio::spawn(async move {
                    let outcome = handle.submit_order(submission).await;
                    if let (Some(outcome), Some(request_id), Some(response_channel)) =
                        (outcome, envelope.request_id, envelope.response_channel)
                    {
                        let _ = bus
                            .respond(
                                &request_id,
                                &response_channel,
                                "ORDER_RESULT",
                                serde_json::to_value(&outcome).unwrap_or_default(),
                            )
                            .await;
                    }
                });
                Ok(())
            }),
        )
        .await?;
    }

    // Fill reports.
    {
        let handle = handle.clone();
        bus.subscribe(
            channels::ORDER_FILLS,
            Arc::new(move |envelope: Envelope| {
                let fill: Fill = envelope.decode()?;
                handle.process_fill(fill);
                Ok(())
            }),
        )
        .await?;
    }

    // Raw market ticks.
    {
        let handle = handle.clone();
        bus.subscribe(
            channels::MARKET_DATA,
            Arc::new(move |envelope: Envelope| {
                let tick: MarketTick = envelope.decode()?;
                handle.market_data(tick);
                Ok(())
            }),
        )
        .await?;
    }

    // Broker status updates. The aggregator publishes on this channel
    // too; only foreign envelopes are applied.
    {
        let handle = handle.clone();
        let own_source = bus.source().to_string();
        bus.subscribe(
            channels::ORDER_STATUS,
            Arc::new(move |envelope: Envelope| {
                if envelope.source == own_source {
                    return Ok(());
                }
                let order_id = envelope.payload["orderId"]
                    .as_str()
                    .ok_or_else(|| anyhow::anyhow!("status update missing orderId"))?
                    .to_string();
                let status = envelope.payload["status"]
                    .as_str()
                    .unwrap_or(&envelope.kind)
                    .to_string();
                let reason = envelope.payload["reason"].as_str().map(str::to_string);
                handle.broker_status(order_id, status, reason);
                Ok(())
            }),
        )
        .await?;
    }

    // Directory requests: forwarded to the Connection Manager and the
    // response republished on the producer's private channel. Stateless,
    // so it bypasses the orchestrator.
    {
        let bus_for_forward = Arc::clone(&bus);
        bus.subscribe(
            channels::AGGREGATOR_REQUESTS,
            Arc::new(move |envelope: Envelope| {
                let bus = Arc::clone(&bus_for_forward);
                let Some(request_id) = envelope.request_id.clone() else {
                    anyhow::bail!("directory request missing requestId");
                };
                let Some(response_channel) = envelope.response_channel.clone() else {
                    anyhow::bail!("directory request missing responseChannel");
                };
                tokio::spawn(async move {
                    // Forward under the producer's own request id so the
                    // downstream response carries it back unchanged.
                    let result = bus
                        .request_with_id(
                            channels::CONNECTION_MANAGER_REQUESTS,
                            &envelope.kind,
                            envelope.payload.clone(),
                            Duration::from_secs(15),
                            3,
                            request_id.clone(),
                        )
                        .await;
                    let payload = match result {
                        Ok(response) => response.payload,
                        Err(e) => json!({
                            "success": false,
                            "reason": RejectReason::DownstreamTimeout.as_str(),
                            "detail": e.to_string(),
                        }),
                    };
                    let _ = bus
                        .respond(&request_id, &response_channel, "RESPONSE", payload)
                        .await;
                });
                Ok(())
            }),
        )
        .await?;
    }

    // Admin toggles.
    {
        let handle = handle.clone();
        bus.subscribe(
            channels::AGGREGATOR_ADMIN,
            Arc::new(move |envelope: Envelope| {
                let action: AdminAction = envelope.decode()?;
                handle.admin(action);
                Ok(())
            }),
        )
        .await?;
    }

    Ok(())
}
