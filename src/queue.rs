//! Priority Queue Manager
//!
//! Three FIFO queues keyed by priority with a global capacity, per-symbol
//! sub-limits, a concurrency cap, and a fixed one-second dispatch rate
//! window. Within a priority class order is strictly FIFO; across classes
//! higher priority always wins. Retries are first-class scheduled entries
//! with due times, so every retry is visible to metrics.
//!
//! The queue holds no I/O: the orchestrator polls dispatchable entries on
//! each tick and reports completions back.

use crate::config::QueueConfig;
use crate::models::{OrderId, Priority, Symbol};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;

/// Admission outcome for a new order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Accepted,
    RejectedFull,
    RejectedSymbolLimit,
}

/// An order awaiting dispatch. Exists iff the order is in state QUEUED.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub order_id: OrderId,
    pub instrument: Symbol,
    pub priority: Priority,
    pub enqueued_at: DateTime<Utc>,
    pub attempts: u32,
}

/// A dispatch retry waiting for its due time.
#[derive(Debug, Clone)]
struct RetryEntry {
    entry: QueueEntry,
    due_at: DateTime<Utc>,
}

/// Read-only queue state for the metrics surface.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueSnapshot {
    pub depth: usize,
    pub depth_high: usize,
    pub depth_normal: usize,
    pub depth_low: usize,
    pub depth_max: usize,
    pub in_flight: usize,
    pub retries_pending: usize,
    pub total_enqueued: u64,
    pub total_dispatched: u64,
    pub total_requeued: u64,
}

/// Multi-priority FIFO with backpressure and rate limiting.
pub struct PriorityQueue {
    config: QueueConfig,
    high: VecDeque<QueueEntry>,
    normal: VecDeque<QueueEntry>,
    low: VecDeque<QueueEntry>,
    retries: Vec<RetryEntry>,
    /// Waiting entries per symbol (queues + scheduled retries).
    per_symbol: HashMap<Symbol, usize>,
    in_flight: usize,
    /// Fixed one-second dispatch window.
    second_key: i64,
    dispatched_this_second: u32,
    depth_max: usize,
    total_enqueued: u64,
    total_dispatched: u64,
    total_requeued: u64,
}

impl PriorityQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            high: VecDeque::new(),
            normal: VecDeque::new(),
            low: VecDeque::new(),
            retries: Vec::new(),
            per_symbol: HashMap::new(),
            in_flight: 0,
            second_key: 0,
            dispatched_this_second: 0,
            depth_max: 0,
            total_enqueued: 0,
            total_dispatched: 0,
            total_requeued: 0,
        }
    }

    /// Waiting entries across all classes, scheduled retries included.
    pub fn len(&self) -> usize {
        self.high.len() + self.normal.len() + self.low.len() + self.retries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0 && self.in_flight == 0
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// Admit an order, enforcing global capacity then the symbol limit.
    pub fn enqueue(&mut self, entry: QueueEntry) -> EnqueueOutcome {
        if self.len() >= self.config.max_queue_size {
            return EnqueueOutcome::RejectedFull;
        }
        let symbol_count = self
            .per_symbol
            .get(&entry.instrument)
            .copied()
            .unwrap_or(0);
        if symbol_count >= self.config.max_orders_per_symbol {
            return EnqueueOutcome::RejectedSymbolLimit;
        }

        *self.per_symbol.entry(entry.instrument.clone()).or_insert(0) += 1;
        self.queue_for_mut(entry.priority).push_back(entry);
        self.total_enqueued += 1;
        self.depth_max = self.depth_max.max(self.len());
        EnqueueOutcome::Accepted
    }

    /// Remove a waiting entry (cancel while QUEUED). Entries already
    /// in flight are not touchable here.
    pub fn remove(&mut self, order_id: &OrderId) -> bool {
        for queue in [&mut self.high, &mut self.normal, &mut self.low] {
            if let Some(pos) = queue.iter().position(|e| &e.order_id == order_id) {
                if let Some(entry) = queue.remove(pos) {
                    Self::release_symbol(&mut self.per_symbol, &entry.instrument);
                }
                return true;
            }
        }
        if let Some(pos) = self
            .retries
            .iter()
            .position(|r| &r.entry.order_id == order_id)
        {
            let retry = self.retries.swap_remove(pos);
            Self::release_symbol(&mut self.per_symbol, &retry.entry.instrument);
            return true;
        }
        false
    }

    /// One scheduler tick: promote due retries, then pop dispatchable
    /// heads while the concurrency cap and the per-second rate allow.
    /// Returned entries are accounted as in flight.
    pub fn poll_dispatchable(&mut self, now: DateTime<Utc>) -> Vec<QueueEntry> {
        self.promote_due_retries(now);
        self.roll_second(now);

        let mut out = Vec::new();
        loop {
            if self.in_flight + out.len() >= self.config.max_concurrent_orders {
                break;
            }
            if self.dispatched_this_second >= self.config.max_orders_per_second {
                break;
            }
            let Some(entry) = self.pop_highest() else {
                break;
            };
            Self::release_symbol(&mut self.per_symbol, &entry.instrument);
            self.dispatched_this_second += 1;
            self.total_dispatched += 1;
            out.push(entry);
        }
        self.in_flight += out.len();
        out
    }

    /// Release a concurrency slot after a dispatch finishes (either way).
    pub fn complete_dispatch(&mut self) {
        self.in_flight = self.in_flight.saturating_sub(1);
    }

    /// Schedule a transient-failure retry at the same priority after the
    /// exponential delay for its attempt count.
    pub fn schedule_retry(&mut self, mut entry: QueueEntry, now: DateTime<Utc>) {
        entry.attempts += 1;
        let delay = self.retry_delay(entry.attempts);
        *self.per_symbol.entry(entry.instrument.clone()).or_insert(0) += 1;
        self.total_requeued += 1;
        self.retries.push(RetryEntry {
            entry,
            due_at: now + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero()),
        });
    }

    /// Whether an entry has retry budget left.
    pub fn can_retry(&self, entry: &QueueEntry) -> bool {
        entry.attempts + 1 < self.config.max_dispatch_attempts
    }

    /// Exponential backoff for the Nth attempt (1-based), capped at 30 s.
    pub fn retry_delay(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(16);
        let millis = self
            .config
            .retry_base_delay_ms
            .saturating_mul(1u64 << exponent);
        Duration::from_millis(millis.min(30_000))
    }

    /// Pull every waiting entry out, retries included. Shutdown drain.
    pub fn drain_all(&mut self) -> Vec<QueueEntry> {
        let mut out: Vec<QueueEntry> = Vec::with_capacity(self.len());
        out.extend(self.high.drain(..));
        out.extend(self.normal.drain(..));
        out.extend(self.low.drain(..));
        out.extend(self.retries.drain(..).map(|r| r.entry));
        self.per_symbol.clear();
        out
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            depth: self.len(),
            depth_high: self.high.len(),
            depth_normal: self.normal.len(),
            depth_low: self.low.len(),
            depth_max: self.depth_max,
            in_flight: self.in_flight,
            retries_pending: self.retries.len(),
            total_enqueued: self.total_enqueued,
            total_dispatched: self.total_dispatched,
            total_requeued: self.total_requeued,
        }
    }

    pub fn capacity(&self) -> usize {
        self.config.max_queue_size
    }

    fn queue_for_mut(&mut self, priority: Priority) -> &mut VecDeque<QueueEntry> {
        match priority {
            Priority::High => &mut self.high,
            Priority::Normal => &mut self.normal,
            Priority::Low => &mut self.low,
        }
    }

    fn pop_highest(&mut self) -> Option<QueueEntry> {
        self.high
            .pop_front()
            .or_else(|| self.normal.pop_front())
            .or_else(|| self.low.pop_front())
    }

    fn promote_due_retries(&mut self, now: DateTime<Utc>) {
        if self.retries.is_empty() {
            return;
        }
        let mut remaining = Vec::with_capacity(self.retries.len());
        for retry in self.retries.drain(..) {
            if retry.due_at <= now {
                // Symbol accounting carries over; re-enter the class FIFO.
                match retry.entry.priority {
                    Priority::High => self.high.push_back(retry.entry),
                    Priority::Normal => self.normal.push_back(retry.entry),
                    Priority::Low => self.low.push_back(retry.entry),
                }
            } else {
                remaining.push(retry);
            }
        }
        self.retries = remaining;
    }

    fn roll_second(&mut self, now: DateTime<Utc>) {
        let key = now.timestamp();
        if key != self.second_key {
            self.second_key = key;
            self.dispatched_this_second = 0;
        }
    }

    fn release_symbol(per_symbol: &mut HashMap<Symbol, usize>, symbol: &str) {
        if let Some(count) = per_symbol.get_mut(symbol) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                per_symbol.remove(symbol);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn entry(id: &str, priority: Priority) -> QueueEntry {
        QueueEntry {
            order_id: id.to_string(),
            instrument: "MES".to_string(),
            priority,
            enqueued_at: Utc::now(),
            attempts: 0,
        }
    }

    fn config() -> QueueConfig {
        QueueConfig {
            max_queue_size: 10,
            max_orders_per_symbol: 10,
            processing_interval_ms: 10,
            max_concurrent_orders: 4,
            max_orders_per_second: 100,
            max_dispatch_attempts: 3,
            retry_base_delay_ms: 500,
        }
    }

    fn now_at(second: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 5, 14, 30, second).unwrap()
    }

    #[test]
    fn test_fifo_within_class() {
        let mut queue = PriorityQueue::new(config());
        for id in ["A", "B", "C"] {
            assert_eq!(
                queue.enqueue(entry(id, Priority::Normal)),
                EnqueueOutcome::Accepted
            );
        }
        let popped = queue.poll_dispatchable(now_at(0));
        let ids: Vec<&str> = popped.iter().map(|e| e.order_id.as_str()).collect();
        assert_eq!(ids, vec!["A", "B", "C"]);
    }

    #[test]
    fn test_priority_preemption() {
        let mut config = config();
        config.max_concurrent_orders = 1;
        let mut queue = PriorityQueue::new(config);

        queue.enqueue(entry("N1", Priority::Normal));
        queue.enqueue(entry("L1", Priority::Low));
        queue.enqueue(entry("H1", Priority::High));

        let mut order = Vec::new();
        for _ in 0..3 {
            let popped = queue.poll_dispatchable(now_at(0));
            assert_eq!(popped.len(), 1);
            order.push(popped[0].order_id.clone());
            queue.complete_dispatch();
        }
        assert_eq!(order, vec!["H1", "N1", "L1"]);
    }

    #[test]
    fn test_capacity_backpressure_exact_boundary() {
        let mut config = config();
        config.max_queue_size = 2;
        let mut queue = PriorityQueue::new(config);

        assert_eq!(
            queue.enqueue(entry("A1", Priority::Normal)),
            EnqueueOutcome::Accepted
        );
        assert_eq!(
            queue.enqueue(entry("A2", Priority::Normal)),
            EnqueueOutcome::Accepted
        );
        // Exactly at capacity: the next admit fails.
        assert_eq!(
            queue.enqueue(entry("A3", Priority::Normal)),
            EnqueueOutcome::RejectedFull
        );

        // Freeing one slot permits exactly one new admit.
        assert!(queue.remove(&"A1".to_string()));
        assert_eq!(
            queue.enqueue(entry("A4", Priority::Normal)),
            EnqueueOutcome::Accepted
        );
        assert_eq!(
            queue.enqueue(entry("A5", Priority::Normal)),
            EnqueueOutcome::RejectedFull
        );
    }

    #[test]
    fn test_symbol_limit() {
        let mut config = config();
        config.max_orders_per_symbol = 1;
        let mut queue = PriorityQueue::new(config);

        assert_eq!(
            queue.enqueue(entry("A", Priority::Normal)),
            EnqueueOutcome::Accepted
        );
        assert_eq!(
            queue.enqueue(entry("B", Priority::Normal)),
            EnqueueOutcome::RejectedSymbolLimit
        );

        let mut other = entry("C", Priority::Normal);
        other.instrument = "NQ".to_string();
        assert_eq!(queue.enqueue(other), EnqueueOutcome::Accepted);
    }

    #[test]
    fn test_concurrency_freeze() {
        let mut config = config();
        config.max_concurrent_orders = 0;
        let mut queue = PriorityQueue::new(config);
        queue.enqueue(entry("A", Priority::Normal));
        assert!(queue.poll_dispatchable(now_at(0)).is_empty());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_rate_limit_per_second_window() {
        let mut config = config();
        config.max_orders_per_second = 2;
        config.max_concurrent_orders = 10;
        let mut queue = PriorityQueue::new(config);
        for id in ["A", "B", "C", "D"] {
            queue.enqueue(entry(id, Priority::Normal));
        }

        assert_eq!(queue.poll_dispatchable(now_at(0)).len(), 2);
        // Same second: window exhausted.
        assert!(queue.poll_dispatchable(now_at(0)).is_empty());
        // Next second: window resets.
        assert_eq!(queue.poll_dispatchable(now_at(1)).len(), 2);
    }

    #[test]
    fn test_retry_scheduling_and_promotion() {
        let mut queue = PriorityQueue::new(config());
        queue.enqueue(entry("A", Priority::Normal));
        let popped = queue.poll_dispatchable(now_at(0));
        assert_eq!(popped.len(), 1);
        queue.complete_dispatch();

        let failed = popped.into_iter().next().unwrap();
        assert!(queue.can_retry(&failed));
        queue.schedule_retry(failed, now_at(0));
        assert_eq!(queue.snapshot().retries_pending, 1);

        // Before the due time nothing is dispatchable.
        assert!(queue.poll_dispatchable(now_at(0)).is_empty());

        // After the 500 ms base delay the entry re-enters its class.
        let later = queue.poll_dispatchable(now_at(1));
        assert_eq!(later.len(), 1);
        assert_eq!(later[0].attempts, 1);
    }

    #[test]
    fn test_retry_budget_exhaustion() {
        let queue = PriorityQueue::new(config());
        let mut e = entry("A", Priority::Normal);
        assert!(queue.can_retry(&e)); // attempt 1 -> retry 2 allowed
        e.attempts = 2;
        assert!(!queue.can_retry(&e)); // third attempt was the last
    }

    #[test]
    fn test_retry_delay_is_exponential() {
        let queue = PriorityQueue::new(config());
        assert_eq!(queue.retry_delay(1), Duration::from_millis(500));
        assert_eq!(queue.retry_delay(2), Duration::from_millis(1_000));
        assert_eq!(queue.retry_delay(3), Duration::from_millis(2_000));
        // Capped.
        assert_eq!(queue.retry_delay(12), Duration::from_secs(30));
    }

    #[test]
    fn test_drain_all() {
        let mut queue = PriorityQueue::new(config());
        queue.enqueue(entry("A", Priority::High));
        queue.enqueue(entry("B", Priority::Low));
        let dispatched = queue.poll_dispatchable(now_at(0));
        assert_eq!(dispatched.len(), 2);
        queue.schedule_retry(dispatched.into_iter().next().unwrap(), now_at(0));

        let drained = queue.drain_all();
        assert_eq!(drained.len(), 1);
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn test_depth_max_tracks_high_water() {
        let mut queue = PriorityQueue::new(config());
        for id in ["A", "B", "C"] {
            queue.enqueue(entry(id, Priority::Normal));
        }
        queue.poll_dispatchable(now_at(0));
        assert_eq!(queue.snapshot().depth_max, 3);
    }
}
