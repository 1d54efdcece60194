//! Metrics & Monitoring Surface
//!
//! Rolling counters, time-windowed latency distributions, and a 1 Hz
//! history ring buffer, plus the broadcast channel the monitoring surface
//! translates onto WebSocket clients. Writers are the orchestrator and
//! the sampler task; readers take snapshots under a short lock and never
//! block the orchestrator.

use crate::bus::BusStatsSnapshot;
use crate::error::RejectReason;
use crate::queue::QueueSnapshot;
use crate::risk::ShadowStats;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use tokio::sync::broadcast;

/// Named push topics for the monitoring socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorTopic {
    Orders,
    Risk,
    Sltp,
    Metrics,
    Aggregator,
}

impl MonitorTopic {
    pub fn as_str(&self) -> &'static str {
        match self {
            MonitorTopic::Orders => "orders",
            MonitorTopic::Risk => "risk",
            MonitorTopic::Sltp => "sltp",
            MonitorTopic::Metrics => "metrics",
            MonitorTopic::Aggregator => "aggregator",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "orders" => Some(MonitorTopic::Orders),
            "risk" => Some(MonitorTopic::Risk),
            "sltp" => Some(MonitorTopic::Sltp),
            "metrics" => Some(MonitorTopic::Metrics),
            "aggregator" => Some(MonitorTopic::Aggregator),
            _ => None,
        }
    }
}

/// One pushed monitoring record.
#[derive(Debug, Clone)]
pub struct MonitorEvent {
    pub topic: MonitorTopic,
    pub data: Value,
}

// ============================================================================
// Latency windows
// ============================================================================

/// Keeps the last N samples of a latency series, milliseconds.
#[derive(Debug, Clone)]
pub struct LatencyWindow {
    samples: VecDeque<f64>,
    cap: usize,
}

impl LatencyWindow {
    pub fn new(cap: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(cap),
            cap,
        }
    }

    pub fn record(&mut self, millis: f64) {
        if self.samples.len() >= self.cap {
            self.samples.pop_front();
        }
        self.samples.push_back(millis);
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    pub fn percentiles(&self) -> LatencyPercentiles {
        if self.samples.is_empty() {
            return LatencyPercentiles::default();
        }
        let mut sorted: Vec<f64> = self.samples.iter().copied().collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let n = sorted.len();
        LatencyPercentiles {
            count: n,
            min: sorted[0],
            p50: sorted[n / 2],
            p95: sorted[(n * 95) / 100],
            p99: sorted[(n * 99) / 100],
            max: sorted[n - 1],
            mean: sorted.iter().sum::<f64>() / n as f64,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LatencyPercentiles {
    pub count: usize,
    pub min: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
    pub max: f64,
    pub mean: f64,
}

// ============================================================================
// Counter state
// ============================================================================

#[derive(Debug)]
struct MetricsInner {
    orders_received: u64,
    orders_processed: u64,
    orders_rejected: u64,
    orders_failed: u64,
    orders_cancelled: u64,
    fills_processed: u64,
    late_fills: u64,
    unknown_order_fills: u64,
    brackets_calculated: u64,
    brackets_skipped: u64,
    orders_by_source: HashMap<String, u64>,
    orders_by_instrument: HashMap<String, u64>,
    rejections_by_reason: HashMap<String, u64>,
    violations_by_rule: HashMap<String, u64>,
    fill_latency: LatencyWindow,
    sltp_latency: LatencyWindow,
    dispatch_latency: LatencyWindow,
    queue: QueueSnapshot,
    bus: BusStatsSnapshot,
    shadow: ShadowStats,
    risk_paused: bool,
    loop_lag_ms: f64,
    memory_mb: f64,
}

impl MetricsInner {
    fn new() -> Self {
        Self {
            orders_received: 0,
            orders_processed: 0,
            orders_rejected: 0,
            orders_failed: 0,
            orders_cancelled: 0,
            fills_processed: 0,
            late_fills: 0,
            unknown_order_fills: 0,
            brackets_calculated: 0,
            brackets_skipped: 0,
            orders_by_source: HashMap::new(),
            orders_by_instrument: HashMap::new(),
            rejections_by_reason: HashMap::new(),
            violations_by_rule: HashMap::new(),
            fill_latency: LatencyWindow::new(256),
            sltp_latency: LatencyWindow::new(256),
            dispatch_latency: LatencyWindow::new(256),
            queue: QueueSnapshot::default(),
            bus: BusStatsSnapshot::default(),
            shadow: ShadowStats::default(),
            risk_paused: false,
            loop_lag_ms: 0.0,
            memory_mb: 0.0,
        }
    }
}

// ============================================================================
// Snapshots
// ============================================================================

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrdersSlice {
    pub received: u64,
    pub processed: u64,
    pub rejected: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub by_source: HashMap<String, u64>,
    pub by_instrument: HashMap<String, u64>,
    pub rejections_by_reason: HashMap<String, u64>,
    pub dispatch_latency: LatencyPercentiles,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskSlice {
    pub violations_by_rule: HashMap<String, u64>,
    pub violations_total: u64,
    pub paused: bool,
    pub shadow: ShadowStats,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SltpSlice {
    pub calculated: u64,
    pub skipped: u64,
    pub latency: LatencyPercentiles,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FillsSlice {
    pub processed: u64,
    pub late: u64,
    pub unknown_order: u64,
    pub latency: LatencyPercentiles,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemSlice {
    pub uptime_secs: i64,
    pub memory_mb: f64,
    pub loop_lag_ms: f64,
}

/// Full point-in-time view served by `/api/metrics`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub timestamp: DateTime<Utc>,
    pub orders: OrdersSlice,
    pub fills: FillsSlice,
    pub risk: RiskSlice,
    pub queue: QueueSnapshot,
    pub sltp: SltpSlice,
    pub bus: BusStatsSnapshot,
    pub system: SystemSlice,
}

/// One 1 Hz history row for the ring buffer.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistorySample {
    pub timestamp: DateTime<Utc>,
    pub orders_received: u64,
    pub orders_processed: u64,
    pub orders_rejected: u64,
    pub orders_failed: u64,
    pub fills_processed: u64,
    pub queue_depth: usize,
    pub in_flight: usize,
    pub memory_mb: f64,
    pub loop_lag_ms: f64,
}

// ============================================================================
// Hub
// ============================================================================

/// Shared metrics hub. Cheap to clone via Arc; all mutation goes through
/// short parking_lot critical sections.
pub struct MetricsHub {
    started_at: DateTime<Utc>,
    inner: RwLock<MetricsInner>,
    history: RwLock<VecDeque<HistorySample>>,
    history_cap: usize,
    events_tx: broadcast::Sender<MonitorEvent>,
}

impl MetricsHub {
    pub fn new(history_cap: usize) -> Self {
        let (events_tx, _) = broadcast::channel(1_024);
        Self {
            started_at: Utc::now(),
            inner: RwLock::new(MetricsInner::new()),
            history: RwLock::new(VecDeque::with_capacity(history_cap)),
            history_cap,
            events_tx,
        }
    }

    // -- writers (orchestrator) ---------------------------------------------

    pub fn record_order_received(&self, source: &str, instrument: &str) {
        let mut inner = self.inner.write();
        inner.orders_received += 1;
        *inner.orders_by_source.entry(source.to_string()).or_insert(0) += 1;
        *inner
            .orders_by_instrument
            .entry(instrument.to_string())
            .or_insert(0) += 1;
    }

    pub fn record_order_processed(&self, dispatch_latency_ms: f64) {
        let mut inner = self.inner.write();
        inner.orders_processed += 1;
        inner.dispatch_latency.record(dispatch_latency_ms);
    }

    pub fn record_order_rejected(&self, reason: RejectReason, violation_rules: &[String]) {
        let mut inner = self.inner.write();
        inner.orders_rejected += 1;
        *inner
            .rejections_by_reason
            .entry(reason.as_str().to_string())
            .or_insert(0) += 1;
        for rule in violation_rules {
            *inner.violations_by_rule.entry(rule.clone()).or_insert(0) += 1;
        }
    }

    pub fn record_order_failed(&self, reason: RejectReason) {
        let mut inner = self.inner.write();
        inner.orders_failed += 1;
        *inner
            .rejections_by_reason
            .entry(reason.as_str().to_string())
            .or_insert(0) += 1;
    }

    pub fn record_order_cancelled(&self) {
        self.inner.write().orders_cancelled += 1;
    }

    pub fn record_fill(&self, latency_ms: f64) {
        let mut inner = self.inner.write();
        inner.fills_processed += 1;
        inner.fill_latency.record(latency_ms);
    }

    pub fn record_late_fill(&self) {
        self.inner.write().late_fills += 1;
    }

    pub fn record_unknown_order_fill(&self) {
        self.inner.write().unknown_order_fills += 1;
    }

    pub fn record_bracket(&self, calculated: bool, latency_ms: f64) {
        let mut inner = self.inner.write();
        if calculated {
            inner.brackets_calculated += 1;
            inner.sltp_latency.record(latency_ms);
        } else {
            inner.brackets_skipped += 1;
        }
    }

    pub fn set_queue(&self, snapshot: QueueSnapshot) {
        self.inner.write().queue = snapshot;
    }

    pub fn set_bus(&self, stats: BusStatsSnapshot) {
        self.inner.write().bus = stats;
    }

    pub fn set_risk(&self, paused: bool, shadow: ShadowStats) {
        let mut inner = self.inner.write();
        inner.risk_paused = paused;
        inner.shadow = shadow;
    }

    pub fn set_loop_lag(&self, millis: f64) {
        self.inner.write().loop_lag_ms = millis;
    }

    pub fn set_memory_mb(&self, megabytes: f64) {
        self.inner.write().memory_mb = megabytes;
    }

    /// Append one history row; called by the 1 Hz sampler.
    pub fn sample_history(&self) {
        let sample = {
            let inner = self.inner.read();
            HistorySample {
                timestamp: Utc::now(),
                orders_received: inner.orders_received,
                orders_processed: inner.orders_processed,
                orders_rejected: inner.orders_rejected,
                orders_failed: inner.orders_failed,
                fills_processed: inner.fills_processed,
                queue_depth: inner.queue.depth,
                in_flight: inner.queue.in_flight,
                memory_mb: inner.memory_mb,
                loop_lag_ms: inner.loop_lag_ms,
            }
        };
        let mut history = self.history.write();
        if history.len() >= self.history_cap {
            history.pop_front();
        }
        history.push_back(sample);
    }

    // -- push surface --------------------------------------------------------

    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.events_tx.subscribe()
    }

    pub fn push(&self, topic: MonitorTopic, data: Value) {
        let _ = self.events_tx.send(MonitorEvent { topic, data });
    }

    // -- readers -------------------------------------------------------------

    pub fn snapshot(&self) -> MetricsSnapshot {
        let inner = self.inner.read();
        MetricsSnapshot {
            timestamp: Utc::now(),
            orders: OrdersSlice {
                received: inner.orders_received,
                processed: inner.orders_processed,
                rejected: inner.orders_rejected,
                failed: inner.orders_failed,
                cancelled: inner.orders_cancelled,
                by_source: inner.orders_by_source.clone(),
                by_instrument: inner.orders_by_instrument.clone(),
                rejections_by_reason: inner.rejections_by_reason.clone(),
                dispatch_latency: inner.dispatch_latency.percentiles(),
            },
            fills: FillsSlice {
                processed: inner.fills_processed,
                late: inner.late_fills,
                unknown_order: inner.unknown_order_fills,
                latency: inner.fill_latency.percentiles(),
            },
            risk: RiskSlice {
                violations_total: inner.violations_by_rule.values().sum(),
                violations_by_rule: inner.violations_by_rule.clone(),
                paused: inner.risk_paused,
                shadow: inner.shadow,
            },
            queue: inner.queue.clone(),
            sltp: SltpSlice {
                calculated: inner.brackets_calculated,
                skipped: inner.brackets_skipped,
                latency: inner.sltp_latency.percentiles(),
            },
            bus: inner.bus.clone(),
            system: SystemSlice {
                uptime_secs: (Utc::now() - self.started_at).num_seconds(),
                memory_mb: inner.memory_mb,
                loop_lag_ms: inner.loop_lag_ms,
            },
        }
    }

    pub fn history(&self) -> Vec<HistorySample> {
        self.history.read().iter().cloned().collect()
    }

    /// Zero every counter and window; configuration (caps, channel) stays.
    pub fn reset(&self) {
        *self.inner.write() = MetricsInner::new();
        self.history.write().clear();
    }
}
