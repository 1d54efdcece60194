//! Domain Model
//!
//! Canonical order, fill, and position types shared by every component.
//! Orders are normalized at ingress into a single record with optional
//! fields; unknown fields are rejected at the boundary, not absorbed.

use crate::error::RejectReason;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque order identifier, assigned on ingress when absent.
pub type OrderId = String;

/// Brokerage account identifier.
pub type AccountId = String;

/// Instrument symbol key (e.g. "MES", "NQ").
pub type Symbol = String;

/// Millisecond epoch timestamp used on the wire.
pub type EpochMs = i64;

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    #[inline]
    pub fn opposite(&self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    /// Signed direction: +1 for buys, -1 for sells.
    #[inline]
    pub fn sign(&self) -> i64 {
        match self {
            Side::Buy => 1,
            Side::Sell => -1,
        }
    }
}

/// Order kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderKind {
    Market,
    Limit,
    Stop,
    StopLimit,
}

impl OrderKind {
    /// Whether a limit price is required for this kind.
    pub fn requires_price(&self) -> bool {
        matches!(self, OrderKind::Limit | OrderKind::StopLimit)
    }

    /// Whether a stop trigger price is required for this kind.
    pub fn requires_stop_price(&self) -> bool {
        matches!(self, OrderKind::Stop | OrderKind::StopLimit)
    }
}

/// Priority class. HIGH is reserved for brackets, cancels, and manual
/// traders; starvation of LOW under sustained HIGH load is accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    High,
    Normal,
    Low,
}

/// Order lifecycle states. Transitions are monotonic; terminal states
/// never transition again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderState {
    Received,
    Validated,
    Queued,
    Dispatched,
    PartiallyFilled,
    Filled,
    Rejected,
    Cancelled,
    Failed,
}

impl OrderState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderState::Filled | OrderState::Rejected | OrderState::Cancelled | OrderState::Failed
        )
    }

    /// Legal direct transitions. Everything else is a bug in the caller and
    /// is refused, keeping observed state sequences valid paths.
    pub fn can_transition_to(&self, next: OrderState) -> bool {
        use OrderState::*;
        matches!(
            (self, next),
            (Received, Validated)
                | (Received, Rejected)
                | (Validated, Queued)
                | (Validated, Rejected)
                | (Queued, Dispatched)
                | (Queued, Cancelled)
                | (Queued, Failed)
                | (Dispatched, Filled)
                | (Dispatched, PartiallyFilled)
                | (Dispatched, Cancelled)
                | (Dispatched, Failed)
                | (PartiallyFilled, Filled)
                | (PartiallyFilled, Cancelled)
                | (PartiallyFilled, Failed)
        )
    }
}

/// A trade instruction owned and mutated only by the aggregator core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: OrderId,
    pub source: String,
    pub account_id: AccountId,
    pub instrument: Symbol,
    pub side: Side,
    pub kind: OrderKind,
    pub quantity: u32,
    pub price: Option<f64>,
    pub stop_price: Option<f64>,
    pub priority: Priority,
    pub state: OrderState,
    /// Cumulative filled quantity observed so far.
    pub filled_quantity: u32,
    pub average_fill_price: f64,
    pub rejection_reason: Option<RejectReason>,
    /// Parent order id when this order is an SL/TP bracket child.
    pub linked_bracket_of: Option<OrderId>,
    pub received_at: DateTime<Utc>,
    pub validated_at: Option<DateTime<Utc>>,
    pub dispatched_at: Option<DateTime<Utc>>,
    pub terminal_at: Option<DateTime<Utc>>,
}

impl Order {
    /// Attempt a state transition, stamping lifecycle timestamps. Returns
    /// false (and leaves the order untouched) on an illegal transition.
    pub fn transition(&mut self, next: OrderState, now: DateTime<Utc>) -> bool {
        if !self.state.can_transition_to(next) {
            return false;
        }
        self.state = next;
        match next {
            OrderState::Validated => self.validated_at = Some(now),
            OrderState::Dispatched => self.dispatched_at = Some(now),
            s if s.is_terminal() => self.terminal_at = Some(now),
            _ => {}
        }
        true
    }

    /// Apply a cumulative fill quantity. Returns the newly filled delta, or
    /// None when the cumulative value regresses or exceeds the order
    /// quantity (both are protocol violations from upstream).
    pub fn apply_cumulative_fill(&mut self, cumulative: u32, price: f64) -> Option<u32> {
        if cumulative < self.filled_quantity || cumulative > self.quantity {
            return None;
        }
        let delta = cumulative - self.filled_quantity;
        if delta == 0 {
            return Some(0);
        }
        let old_value = self.average_fill_price * self.filled_quantity as f64;
        self.filled_quantity = cumulative;
        self.average_fill_price = (old_value + price * delta as f64) / cumulative as f64;
        Some(delta)
    }

    pub fn is_fully_filled(&self) -> bool {
        self.filled_quantity >= self.quantity
    }

    pub fn is_bracket_child(&self) -> bool {
        self.linked_bracket_of.is_some()
    }

    /// An order reduces exposure when its direction opposes the current
    /// position for the pair. Used by the open-positions risk exemption.
    pub fn reduces_position(&self, position_size: i64) -> bool {
        position_size != 0 && position_size.signum() != self.side.sign()
    }
}

/// Raw ingress payload for order submission. Unknown fields are rejected
/// at the boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct OrderSubmission {
    #[serde(default)]
    pub id: Option<OrderId>,
    #[serde(default)]
    pub source: Option<String>,
    pub account_id: AccountId,
    pub instrument: Symbol,
    pub side: Side,
    #[serde(default = "default_kind")]
    pub kind: OrderKind,
    pub quantity: u32,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub stop_price: Option<f64>,
    #[serde(default)]
    pub priority: Option<Priority>,
}

fn default_kind() -> OrderKind {
    OrderKind::Market
}

/// Execution report from the broker. `cumulative_quantity` is
/// authoritative and monotonically non-decreasing per order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fill {
    pub order_id: OrderId,
    pub instrument: Symbol,
    pub side: Side,
    pub fill_price: f64,
    pub fill_quantity: u32,
    pub cumulative_quantity: u32,
    pub fill_time: EpochMs,
    #[serde(default)]
    pub source: Option<String>,
}

/// Net exposure per (account, instrument). Evicted when flat.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub account_id: AccountId,
    pub instrument: Symbol,
    /// Signed contracts; sign is direction.
    pub size: i64,
    /// Size-weighted average of opening fills. Undefined (0.0) when flat.
    pub average_price: f64,
    pub realized_pnl: f64,
    pub unrealized_pnl: f64,
    pub opened_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
}

impl Position {
    pub fn new(account_id: AccountId, instrument: Symbol, now: DateTime<Utc>) -> Self {
        Self {
            account_id,
            instrument,
            size: 0,
            average_price: 0.0,
            realized_pnl: 0.0,
            unrealized_pnl: 0.0,
            opened_at: now,
            last_updated_at: now,
        }
    }

    /// Apply a fill delta and return the realized PnL generated by any
    /// closed quantity, in dollars (`dollar_per_point` converts points).
    pub fn apply_fill(
        &mut self,
        side: Side,
        quantity: u32,
        price: f64,
        dollar_per_point: f64,
        now: DateTime<Utc>,
    ) -> f64 {
        let delta = side.sign() * quantity as i64;
        let mut realized = 0.0;

        if self.size == 0 || self.size.signum() == delta.signum() {
            // Opening or extending: size-weighted average entry.
            let old_abs = self.size.unsigned_abs() as f64;
            let add_abs = delta.unsigned_abs() as f64;
            self.average_price =
                (self.average_price * old_abs + price * add_abs) / (old_abs + add_abs);
            if self.size == 0 {
                self.opened_at = now;
            }
            self.size += delta;
        } else {
            // Reducing, possibly flipping through flat.
            let closing = delta.unsigned_abs().min(self.size.unsigned_abs());
            let direction = self.size.signum() as f64;
            realized = (price - self.average_price) * direction * closing as f64 * dollar_per_point;
            self.realized_pnl += realized;
            self.size += delta;
            if self.size == 0 {
                self.average_price = 0.0;
                self.unrealized_pnl = 0.0;
            } else if self.size.signum() == delta.signum() {
                // Flipped: remainder opens a fresh position at the fill price.
                self.average_price = price;
                self.opened_at = now;
            }
        }

        self.last_updated_at = now;
        realized
    }

    /// Refresh unrealized PnL from a last-trade price.
    pub fn mark(&mut self, last_price: f64, dollar_per_point: f64) {
        if self.size == 0 {
            self.unrealized_pnl = 0.0;
            return;
        }
        self.unrealized_pnl =
            (last_price - self.average_price) * self.size as f64 * dollar_per_point;
    }

    pub fn is_flat(&self) -> bool {
        self.size == 0
    }
}

/// Static contract metadata for a symbol, loaded at startup. Field names
/// stay snake_case so the config file reads naturally.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ContractSpec {
    pub tick_size: f64,
    pub tick_value: f64,
    pub dollar_per_point: f64,
}

impl Default for ContractSpec {
    fn default() -> Self {
        Self {
            tick_size: 0.25,
            tick_value: 1.25,
            dollar_per_point: 5.0,
        }
    }
}

/// Producer identity kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SourceKind {
    Bot,
    Manual,
    System,
}

/// Market tick kept for risk marks and republication.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketTick {
    pub instrument: Symbol,
    pub last: f64,
    #[serde(default)]
    pub bid: Option<f64>,
    #[serde(default)]
    pub ask: Option<f64>,
    pub timestamp: EpochMs,
}

/// Lifecycle events emitted by the aggregator core. Observers (metrics,
/// monitoring surface, registry) subscribe by kind; the same records are
/// published on `aggregator:events`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum AggregatorEvent {
    #[serde(rename_all = "camelCase")]
    OrderSubmitted {
        order_id: OrderId,
        source: String,
        instrument: Symbol,
        priority: Priority,
    },
    #[serde(rename_all = "camelCase")]
    OrderProcessed {
        order_id: OrderId,
        instrument: Symbol,
        dispatch_latency_ms: f64,
    },
    #[serde(rename_all = "camelCase")]
    OrderRejected {
        order_id: OrderId,
        source: String,
        reason: RejectReason,
        violations: Vec<String>,
    },
    #[serde(rename_all = "camelCase")]
    OrderFailed {
        order_id: OrderId,
        reason: RejectReason,
        attempts: u32,
    },
    #[serde(rename_all = "camelCase")]
    OrderCancelled { order_id: OrderId },
    #[serde(rename_all = "camelCase")]
    FillProcessed {
        order_id: OrderId,
        instrument: Symbol,
        fill_quantity: u32,
        cumulative_quantity: u32,
        position_size: i64,
        brackets_submitted: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    #[test]
    fn test_state_machine_legal_paths() {
        use OrderState::*;
        assert!(Received.can_transition_to(Validated));
        assert!(Validated.can_transition_to(Queued));
        assert!(Queued.can_transition_to(Dispatched));
        assert!(Dispatched.can_transition_to(PartiallyFilled));
        assert!(PartiallyFilled.can_transition_to(Filled));
        assert!(Queued.can_transition_to(Failed)); // shutdown drain
    }

    #[test]
    fn test_state_machine_illegal_paths() {
        use OrderState::*;
        assert!(!Received.can_transition_to(Dispatched));
        assert!(!Dispatched.can_transition_to(Rejected));
        assert!(!Filled.can_transition_to(Cancelled));
        assert!(!Rejected.can_transition_to(Validated));
        assert!(!Queued.can_transition_to(PartiallyFilled));
    }

    fn sample_order() -> Order {
        Order {
            id: "O1".into(),
            source: "bot-1".into(),
            account_id: "ACC".into(),
            instrument: "MES".into(),
            side: Side::Buy,
            kind: OrderKind::Market,
            quantity: 4,
            price: None,
            stop_price: None,
            priority: Priority::Normal,
            state: OrderState::Dispatched,
            filled_quantity: 0,
            average_fill_price: 0.0,
            rejection_reason: None,
            linked_bracket_of: None,
            received_at: now(),
            validated_at: None,
            dispatched_at: None,
            terminal_at: None,
        }
    }

    #[test]
    fn test_cumulative_fill_semantics() {
        let mut order = sample_order();
        assert_eq!(order.apply_cumulative_fill(2, 4500.0), Some(2));
        assert_eq!(order.filled_quantity, 2);
        // Regression is refused.
        assert_eq!(order.apply_cumulative_fill(1, 4500.0), None);
        // Over-quantity is refused.
        assert_eq!(order.apply_cumulative_fill(5, 4500.0), None);
        // Monotonic progress works and averages by size.
        assert_eq!(order.apply_cumulative_fill(4, 4502.0), Some(2));
        assert!((order.average_fill_price - 4501.0).abs() < 1e-9);
        assert!(order.is_fully_filled());
    }

    #[test]
    fn test_position_open_extend_reduce() {
        let mut pos = Position::new("ACC".into(), "MES".into(), now());
        let r1 = pos.apply_fill(Side::Buy, 2, 4500.0, 5.0, now());
        assert_eq!(r1, 0.0);
        assert_eq!(pos.size, 2);
        assert!((pos.average_price - 4500.0).abs() < 1e-9);

        // Extend at a worse price: weighted average.
        pos.apply_fill(Side::Buy, 2, 4502.0, 5.0, now());
        assert_eq!(pos.size, 4);
        assert!((pos.average_price - 4501.0).abs() < 1e-9);

        // Reduce half at +1 point: realized = 1 * 2 * 5.
        let realized = pos.apply_fill(Side::Sell, 2, 4502.0, 5.0, now());
        assert!((realized - 10.0).abs() < 1e-9);
        assert_eq!(pos.size, 2);

        // Flatten: average price resets.
        pos.apply_fill(Side::Sell, 2, 4501.0, 5.0, now());
        assert!(pos.is_flat());
        assert_eq!(pos.average_price, 0.0);
    }

    #[test]
    fn test_position_flip_through_flat() {
        let mut pos = Position::new("ACC".into(), "MES".into(), now());
        pos.apply_fill(Side::Buy, 2, 4500.0, 5.0, now());
        // Sell 5: closes 2, opens 3 short at the fill price.
        let realized = pos.apply_fill(Side::Sell, 5, 4501.0, 5.0, now());
        assert!((realized - 10.0).abs() < 1e-9);
        assert_eq!(pos.size, -3);
        assert!((pos.average_price - 4501.0).abs() < 1e-9);
    }

    #[test]
    fn test_reduces_position() {
        let order = sample_order(); // BUY
        assert!(order.reduces_position(-3));
        assert!(!order.reduces_position(3));
        assert!(!order.reduces_position(0));
    }

    #[test]
    fn test_submission_rejects_unknown_fields() {
        let raw = r#"{"accountId":"A","instrument":"MES","side":"BUY","quantity":1,"bogus":true}"#;
        assert!(serde_json::from_str::<OrderSubmission>(raw).is_err());
    }
}
