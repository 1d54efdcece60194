//! Risk Engine
//!
//! Pre-trade validation of every candidate order against per-account and
//! fleet-level limits.
//!
//! # Design Principles
//!
//! 1. **Pre-trade, not post-trade**: reject before dispatch, don't unwind
//!    after fills
//! 2. **Deterministic**: same `(order, state)` always produces the same
//!    decision
//! 3. **Complete**: one pass reports every violation found, not just the
//!    first
//! 4. **Shadow mode**: decisions can be computed and logged while always
//!    accepting, for safe rollout

use crate::config::RiskConfig;
use crate::models::{AccountId, Order, Symbol};
use chrono::{DateTime, Datelike, Local, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{info, warn};

/// Named risk rule families. Serialized tags are part of the producer
/// contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ViolationKind {
    Paused,
    OrderSize,
    PositionSize,
    PositionValue,
    OpenPositions,
    DailyLoss,
    DailyProfit,
    AccountDrawdown,
    OrdersPerMinute,
    OrdersPerSymbol,
    TradingHours,
    InstrumentNotAllowed,
}

impl ViolationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ViolationKind::Paused => "PAUSED",
            ViolationKind::OrderSize => "ORDER_SIZE",
            ViolationKind::PositionSize => "POSITION_SIZE",
            ViolationKind::PositionValue => "POSITION_VALUE",
            ViolationKind::OpenPositions => "OPEN_POSITIONS",
            ViolationKind::DailyLoss => "DAILY_LOSS",
            ViolationKind::DailyProfit => "DAILY_PROFIT",
            ViolationKind::AccountDrawdown => "ACCOUNT_DRAWDOWN",
            ViolationKind::OrdersPerMinute => "ORDERS_PER_MINUTE",
            ViolationKind::OrdersPerSymbol => "ORDERS_PER_SYMBOL",
            ViolationKind::TradingHours => "TRADING_HOURS",
            ViolationKind::InstrumentNotAllowed => "INSTRUMENT_NOT_ALLOWED",
        }
    }
}

/// One triggered rule with the observed value and the limit it breached.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskViolation {
    pub rule: ViolationKind,
    pub observed: f64,
    pub limit: f64,
    pub message: String,
}

impl RiskViolation {
    fn new(rule: ViolationKind, observed: f64, limit: f64, message: impl Into<String>) -> Self {
        Self {
            rule,
            observed,
            limit,
            message: message.into(),
        }
    }
}

/// Outcome of a pre-trade evaluation.
#[derive(Debug, Clone)]
pub enum RiskDecision {
    Accept,
    Reject { violations: Vec<RiskViolation> },
    /// A required datum was momentarily unavailable and no other rule
    /// rejected. Rare; callers treat it as a soft failure.
    Defer { reason: String },
}

impl RiskDecision {
    pub fn is_accept(&self) -> bool {
        matches!(self, RiskDecision::Accept)
    }
}

/// What the orchestrator knows about the world at evaluation time.
#[derive(Debug, Clone, Default)]
pub struct RiskContext {
    /// Current signed position for (account, instrument).
    pub position_size: i64,
    /// Open (non-flat) positions for the account.
    pub open_positions: usize,
    /// Last trade price for the instrument, if any has been seen.
    pub last_price: Option<f64>,
    /// Dollars per point for position-value projection.
    pub dollar_per_point: f64,
}

/// Rolling per-account counters. Minute counters reset on the wall-clock
/// minute boundary; daily counters reset at the session boundary.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskState {
    pub daily_pnl: f64,
    pub daily_loss: f64,
    pub daily_profit: f64,
    pub drawdown_from_peak: f64,
    pub orders_in_last_minute: u32,
    pub orders_per_symbol_in_last_minute: HashMap<Symbol, u32>,
    pub paused: bool,
    pub paused_until: Option<DateTime<Utc>>,
    pub session_start_at: DateTime<Utc>,
    #[serde(skip)]
    pnl_peak: f64,
    #[serde(skip)]
    minute_key: i64,
    #[serde(skip)]
    session_key: i64,
}

impl RiskState {
    fn new(now: DateTime<Utc>, session_key: i64) -> Self {
        Self {
            daily_pnl: 0.0,
            daily_loss: 0.0,
            daily_profit: 0.0,
            drawdown_from_peak: 0.0,
            orders_in_last_minute: 0,
            orders_per_symbol_in_last_minute: HashMap::new(),
            paused: false,
            paused_until: None,
            session_start_at: now,
            pnl_peak: 0.0,
            minute_key: now.timestamp() / 60,
            session_key,
        }
    }

    fn roll_minute(&mut self, now: DateTime<Utc>) {
        let key = now.timestamp() / 60;
        if key != self.minute_key {
            self.minute_key = key;
            self.orders_in_last_minute = 0;
            self.orders_per_symbol_in_last_minute.clear();
        }
    }

    fn reset_session(&mut self, now: DateTime<Utc>, session_key: i64) {
        *self = RiskState::new(now, session_key);
    }
}

/// Counters around shadow-mode evaluation, exposed to metrics.
#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShadowStats {
    pub evaluated: u64,
    pub would_reject: u64,
    pub would_defer: u64,
}

/// The pre-trade risk engine. Owned and driven by the orchestrator task;
/// never shared across threads.
pub struct RiskEngine {
    config: RiskConfig,
    accounts: HashMap<AccountId, RiskState>,
    /// Manual fleet-wide pause, set via the admin channel.
    manual_pause: bool,
    shadow: ShadowStats,
    session_reset: NaiveTime,
}

impl RiskEngine {
    pub fn new(config: RiskConfig) -> Self {
        let session_reset = NaiveTime::parse_from_str(&config.session_reset, "%H:%M")
            .unwrap_or_else(|_| NaiveTime::from_hms_opt(0, 0, 0).unwrap());
        Self {
            config,
            accounts: HashMap::new(),
            manual_pause: false,
            shadow: ShadowStats::default(),
            session_reset,
        }
    }

    /// Evaluate an order against every rule in one pass.
    pub fn evaluate(
        &mut self,
        order: &Order,
        ctx: &RiskContext,
        now: DateTime<Utc>,
    ) -> RiskDecision {
        self.roll_windows(&order.account_id, now);

        let manual_pause = self.manual_pause;
        let config = self.config.clone();
        let state = self.account_state_mut(&order.account_id, now).clone();

        let mut violations: Vec<RiskViolation> = Vec::new();
        let mut defer: Option<String> = None;

        // 1. Pause latch (limit breach or manual override).
        let paused = manual_pause
            || (state.paused && state.paused_until.map(|until| now < until).unwrap_or(true));
        if paused {
            violations.push(RiskViolation::new(
                ViolationKind::Paused,
                1.0,
                0.0,
                "trading is paused",
            ));
        }

        // 2. Order size.
        if order.quantity > config.max_order_size {
            violations.push(RiskViolation::new(
                ViolationKind::OrderSize,
                order.quantity as f64,
                config.max_order_size as f64,
                format!(
                    "quantity {} exceeds max order size {}",
                    order.quantity, config.max_order_size
                ),
            ));
        }

        // 3. Projected position size and value.
        let projected = ctx.position_size + order.side.sign() * order.quantity as i64;
        if projected.unsigned_abs() > config.max_position_size as u64 {
            violations.push(RiskViolation::new(
                ViolationKind::PositionSize,
                projected.unsigned_abs() as f64,
                config.max_position_size as f64,
                format!(
                    "projected position {} exceeds max {}",
                    projected, config.max_position_size
                ),
            ));
        }
        match ctx.last_price.or(order.price) {
            Some(price) => {
                let dollar_per_point = if ctx.dollar_per_point > 0.0 {
                    ctx.dollar_per_point
                } else {
                    1.0
                };
                let projected_value = projected.unsigned_abs() as f64 * price * dollar_per_point;
                if projected_value > config.max_position_value {
                    violations.push(RiskViolation::new(
                        ViolationKind::PositionValue,
                        projected_value,
                        config.max_position_value,
                        format!(
                            "projected value {:.2} exceeds max {:.2}",
                            projected_value, config.max_position_value
                        ),
                    ));
                }
            }
            None => {
                defer
                    .get_or_insert_with(|| format!("no reference price for {}", order.instrument));
            }
        }

        // 4. Open positions. Orders that reduce an existing position are
        //    always allowed this check.
        if !order.reduces_position(ctx.position_size) {
            let projected_open = if ctx.position_size == 0 {
                ctx.open_positions + 1
            } else {
                ctx.open_positions
            };
            if projected_open > config.max_open_positions {
                violations.push(RiskViolation::new(
                    ViolationKind::OpenPositions,
                    projected_open as f64,
                    config.max_open_positions as f64,
                    format!(
                        "{} open positions exceeds max {}",
                        projected_open, config.max_open_positions
                    ),
                ));
            }
        }

        // 5. Daily loss / profit, inclusive boundaries.
        if state.daily_loss >= config.max_daily_loss {
            violations.push(RiskViolation::new(
                ViolationKind::DailyLoss,
                state.daily_loss,
                config.max_daily_loss,
                format!(
                    "daily loss {:.2} at or over limit {:.2}",
                    state.daily_loss, config.max_daily_loss
                ),
            ));
        }
        if state.daily_profit >= config.max_daily_profit {
            violations.push(RiskViolation::new(
                ViolationKind::DailyProfit,
                state.daily_profit,
                config.max_daily_profit,
                format!(
                    "daily profit {:.2} at or over limit {:.2}",
                    state.daily_profit, config.max_daily_profit
                ),
            ));
        }

        // 6. Account drawdown from the session PnL peak.
        if state.drawdown_from_peak >= config.max_account_drawdown {
            violations.push(RiskViolation::new(
                ViolationKind::AccountDrawdown,
                state.drawdown_from_peak,
                config.max_account_drawdown,
                format!(
                    "drawdown {:.2} at or over limit {:.2}",
                    state.drawdown_from_peak, config.max_account_drawdown
                ),
            ));
        }

        // 7. Rate limits, fixed minute window. Bracket children are exempt.
        if !order.is_bracket_child() {
            if state.orders_in_last_minute >= config.max_orders_per_minute {
                violations.push(RiskViolation::new(
                    ViolationKind::OrdersPerMinute,
                    state.orders_in_last_minute as f64,
                    config.max_orders_per_minute as f64,
                    format!(
                        "{} orders this minute at limit {}",
                        state.orders_in_last_minute, config.max_orders_per_minute
                    ),
                ));
            }
            let per_symbol = state
                .orders_per_symbol_in_last_minute
                .get(&order.instrument)
                .copied()
                .unwrap_or(0);
            if per_symbol >= config.max_orders_per_symbol {
                violations.push(RiskViolation::new(
                    ViolationKind::OrdersPerSymbol,
                    per_symbol as f64,
                    config.max_orders_per_symbol as f64,
                    format!(
                        "{} orders for {} this minute at limit {}",
                        per_symbol, order.instrument, config.max_orders_per_symbol
                    ),
                ));
            }
        }

        // 8. Trading hours (local time; disabled means 24/7).
        if config.trading_hours.enabled {
            if let Ok((start, end)) = config.trading_hours.parse() {
                let local = now.with_timezone(&Local).time();
                let inside = if start <= end {
                    local >= start && local <= end
                } else {
                    // Overnight window, e.g. 18:00-02:00.
                    local >= start || local <= end
                };
                if !inside {
                    violations.push(RiskViolation::new(
                        ViolationKind::TradingHours,
                        0.0,
                        0.0,
                        format!(
                            "outside trading window {}-{}",
                            config.trading_hours.start, config.trading_hours.end
                        ),
                    ));
                }
            }
        }

        // 9. Instrument whitelist.
        if !config.allowed_instruments.is_empty()
            && !config.allowed_instruments.contains(&order.instrument)
        {
            violations.push(RiskViolation::new(
                ViolationKind::InstrumentNotAllowed,
                0.0,
                0.0,
                format!("{} is not whitelisted", order.instrument),
            ));
        }

        let decision = if !violations.is_empty() {
            RiskDecision::Reject { violations }
        } else if let Some(reason) = defer {
            RiskDecision::Defer { reason }
        } else {
            RiskDecision::Accept
        };

        if config.shadow_mode {
            self.shadow.evaluated += 1;
            match &decision {
                RiskDecision::Reject { violations } => {
                    self.shadow.would_reject += 1;
                    let rules: Vec<&str> = violations.iter().map(|v| v.rule.as_str()).collect();
                    info!(order_id = %order.id, ?rules, "shadow mode: would have rejected");
                }
                RiskDecision::Defer { reason } => {
                    self.shadow.would_defer += 1;
                    info!(order_id = %order.id, reason, "shadow mode: would have deferred");
                }
                RiskDecision::Accept => {}
            }
            return RiskDecision::Accept;
        }

        decision
    }

    /// Count an accepted order toward the rate windows. Bracket children
    /// are exempt from rate limiting and do not consume budget.
    pub fn record_submitted(&mut self, order: &Order, now: DateTime<Utc>) {
        if order.is_bracket_child() {
            return;
        }
        self.roll_windows(&order.account_id, now);
        let instrument = order.instrument.clone();
        let state = self.account_state_mut(&order.account_id, now);
        state.orders_in_last_minute += 1;
        *state
            .orders_per_symbol_in_last_minute
            .entry(instrument)
            .or_insert(0) += 1;
    }

    /// Fold realized PnL into the daily counters; latches the pause flag
    /// on a daily-loss breach when configured.
    pub fn apply_realized_pnl(&mut self, account_id: &str, delta: f64, now: DateTime<Utc>) {
        self.roll_windows(account_id, now);
        let pause_on_daily_loss = self.config.pause_on_daily_loss;
        let max_daily_loss = self.config.max_daily_loss;
        let state = self.account_state_mut(account_id, now);

        state.daily_pnl += delta;
        state.daily_loss = (-state.daily_pnl).max(0.0);
        state.daily_profit = state.daily_pnl.max(0.0);
        if state.daily_pnl > state.pnl_peak {
            state.pnl_peak = state.daily_pnl;
        }
        state.drawdown_from_peak = (state.pnl_peak - state.daily_pnl).max(0.0);

        if pause_on_daily_loss && state.daily_loss >= max_daily_loss && !state.paused {
            state.paused = true;
            state.paused_until = None;
            warn!(
                account_id,
                daily_loss = state.daily_loss,
                "🛑 daily loss limit reached; account paused"
            );
        }
    }

    /// Manual fleet-wide pause/resume (admin channel).
    pub fn set_manual_pause(&mut self, paused: bool) {
        if self.manual_pause != paused {
            warn!(paused, "manual trading pause toggled");
        }
        self.manual_pause = paused;
        if !paused {
            // Resume also clears per-account latches.
            for state in self.accounts.values_mut() {
                state.paused = false;
                state.paused_until = None;
            }
        }
    }

    pub fn set_shadow_mode(&mut self, enabled: bool) {
        if self.config.shadow_mode != enabled {
            warn!(enabled, "shadow mode toggled");
        }
        self.config.shadow_mode = enabled;
    }

    pub fn shadow_mode(&self) -> bool {
        self.config.shadow_mode
    }

    pub fn is_paused(&self) -> bool {
        self.manual_pause || self.accounts.values().any(|s| s.paused)
    }

    pub fn shadow_stats(&self) -> ShadowStats {
        self.shadow
    }

    /// Read-only view for the metrics surface.
    pub fn snapshot(&self) -> HashMap<AccountId, RiskState> {
        self.accounts.clone()
    }

    fn roll_windows(&mut self, account_id: &str, now: DateTime<Utc>) {
        let session_key = self.session_key(now);
        if let Some(state) = self.accounts.get_mut(account_id) {
            if state.session_key != session_key {
                state.reset_session(now, session_key);
            }
            state.roll_minute(now);
        }
    }

    fn account_state_mut(&mut self, account_id: &str, now: DateTime<Utc>) -> &mut RiskState {
        let session_key = self.session_key(now);
        self.accounts
            .entry(account_id.to_string())
            .or_insert_with(|| RiskState::new(now, session_key))
    }

    /// Identifier of the session containing `now`: the ordinal day of the
    /// most recent boundary crossing in local time.
    fn session_key(&self, now: DateTime<Utc>) -> i64 {
        let local = now.with_timezone(&Local);
        let mut key = local.date_naive().num_days_from_ce() as i64;
        if local.time() < self.session_reset {
            key -= 1;
        }
        key
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{OrderKind, OrderState, Priority, Side};
    use chrono::TimeZone;

    fn order(quantity: u32, side: Side) -> Order {
        Order {
            id: "O1".into(),
            source: "bot-1".into(),
            account_id: "ACC".into(),
            instrument: "MES".into(),
            side,
            kind: OrderKind::Market,
            quantity,
            price: Some(4500.0),
            stop_price: None,
            priority: Priority::Normal,
            state: OrderState::Received,
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

    fn ctx() -> RiskContext {
        RiskContext {
            position_size: 0,
            open_positions: 0,
            last_price: Some(4500.0),
            dollar_per_point: 1.0,
        }
    }

    fn engine() -> RiskEngine {
        RiskEngine::new(RiskConfig::default())
    }

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 5, 14, 30, 5).unwrap()
    }

    #[test]
    fn test_accepts_within_limits() {
        let mut engine = engine();
        let decision = engine.evaluate(&order(2, Side::Buy), &ctx(), fixed_now());
        assert!(decision.is_accept());
    }

    #[test]
    fn test_order_size_violation() {
        let mut engine = engine();
        let decision = engine.evaluate(&order(15, Side::Buy), &ctx(), fixed_now());
        match decision {
            RiskDecision::Reject { violations } => {
                assert!(violations.iter().any(|v| v.rule == ViolationKind::OrderSize));
            }
            other => panic!("expected reject, got {other:?}"),
        }
    }

    #[test]
    fn test_all_violations_reported_in_one_pass() {
        let mut config = RiskConfig::default();
        config.max_order_size = 1;
        config.max_position_size = 1;
        config.allowed_instruments = vec!["NQ".into()];
        let mut engine = RiskEngine::new(config);

        let decision = engine.evaluate(&order(5, Side::Buy), &ctx(), fixed_now());
        match decision {
            RiskDecision::Reject { violations } => {
                let rules: Vec<ViolationKind> = violations.iter().map(|v| v.rule).collect();
                assert!(rules.contains(&ViolationKind::OrderSize));
                assert!(rules.contains(&ViolationKind::PositionSize));
                assert!(rules.contains(&ViolationKind::InstrumentNotAllowed));
            }
            other => panic!("expected reject, got {other:?}"),
        }
    }

    #[test]
    fn test_determinism() {
        let mut engine = engine();
        let now = fixed_now();
        let first = format!("{:?}", engine.evaluate(&order(15, Side::Buy), &ctx(), now));
        let second = format!("{:?}", engine.evaluate(&order(15, Side::Buy), &ctx(), now));
        assert_eq!(first, second);
    }

    #[test]
    fn test_reducing_order_skips_open_positions_check() {
        let mut config = RiskConfig::default();
        config.max_open_positions = 1;
        let mut engine = RiskEngine::new(config);

        // Account already at the open-positions cap, long 3 MES.
        let context = RiskContext {
            position_size: 3,
            open_positions: 1,
            last_price: Some(4500.0),
            dollar_per_point: 1.0,
        };

        // A reducing SELL passes.
        assert!(engine
            .evaluate(&order(2, Side::Sell), &context, fixed_now())
            .is_accept());

        // Opening a new pair fails the check.
        let mut opening = order(1, Side::Buy);
        opening.instrument = "NQ".into();
        let fresh_pair = RiskContext {
            position_size: 0,
            open_positions: 1,
            last_price: Some(15_000.0),
            dollar_per_point: 1.0,
        };
        match engine.evaluate(&opening, &fresh_pair, fixed_now()) {
            RiskDecision::Reject { violations } => {
                assert!(violations
                    .iter()
                    .any(|v| v.rule == ViolationKind::OpenPositions));
            }
            other => panic!("expected reject, got {other:?}"),
        }
    }

    #[test]
    fn test_daily_loss_boundary_is_inclusive_and_pauses() {
        let mut engine = engine();
        let now = fixed_now();
        // Lose exactly the limit.
        engine.apply_realized_pnl("ACC", -1_000.0, now);

        let decision = engine.evaluate(&order(1, Side::Buy), &ctx(), now);
        match decision {
            RiskDecision::Reject { violations } => {
                let rules: Vec<ViolationKind> = violations.iter().map(|v| v.rule).collect();
                assert!(rules.contains(&ViolationKind::DailyLoss));
                assert!(rules.contains(&ViolationKind::Paused));
            }
            other => panic!("expected reject, got {other:?}"),
        }
        assert!(engine.is_paused());
    }

    #[test]
    fn test_drawdown_from_peak() {
        let mut engine = engine();
        let now = fixed_now();
        engine.apply_realized_pnl("ACC", 2_500.0, now);
        engine.apply_realized_pnl("ACC", -2_100.0, now);
        // Peak 2500, now 400: drawdown 2100 >= 2000 limit.
        match engine.evaluate(&order(1, Side::Buy), &ctx(), now) {
            RiskDecision::Reject { violations } => {
                assert!(violations
                    .iter()
                    .any(|v| v.rule == ViolationKind::AccountDrawdown));
            }
            other => panic!("expected reject, got {other:?}"),
        }
    }

    #[test]
    fn test_rate_limit_resets_at_minute_boundary() {
        let mut config = RiskConfig::default();
        config.max_orders_per_minute = 2;
        let mut engine = RiskEngine::new(config);

        let t0 = Utc.with_ymd_and_hms(2024, 3, 5, 14, 30, 10).unwrap();
        engine.record_submitted(&order(1, Side::Buy), t0);
        engine.record_submitted(&order(1, Side::Buy), t0);

        // At the cap inside the window.
        match engine.evaluate(&order(1, Side::Buy), &ctx(), t0) {
            RiskDecision::Reject { violations } => {
                assert!(violations
                    .iter()
                    .any(|v| v.rule == ViolationKind::OrdersPerMinute));
            }
            other => panic!("expected reject, got {other:?}"),
        }

        // One tick past the boundary the counter has reset.
        let t1 = Utc.with_ymd_and_hms(2024, 3, 5, 14, 31, 0).unwrap();
        assert!(engine.evaluate(&order(1, Side::Buy), &ctx(), t1).is_accept());
    }

    #[test]
    fn test_bracket_children_exempt_from_rate_limit() {
        let mut config = RiskConfig::default();
        config.max_orders_per_minute = 0;
        let mut engine = RiskEngine::new(config);

        let mut bracket = order(1, Side::Sell);
        bracket.linked_bracket_of = Some("PARENT".into());
        assert!(engine.evaluate(&bracket, &ctx(), fixed_now()).is_accept());

        match engine.evaluate(&order(1, Side::Buy), &ctx(), fixed_now()) {
            RiskDecision::Reject { .. } => {}
            other => panic!("plain order should hit the zero rate limit, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_price_defers() {
        let mut engine = engine();
        let mut o = order(1, Side::Buy);
        o.price = None;
        let context = RiskContext {
            position_size: 0,
            open_positions: 0,
            last_price: None,
            dollar_per_point: 1.0,
        };
        match engine.evaluate(&o, &context, fixed_now()) {
            RiskDecision::Defer { reason } => assert!(reason.contains("MES")),
            other => panic!("expected defer, got {other:?}"),
        }
    }

    #[test]
    fn test_reject_wins_over_defer() {
        let mut engine = engine();
        let mut o = order(50, Side::Buy);
        o.price = None;
        let context = RiskContext {
            position_size: 0,
            open_positions: 0,
            last_price: None,
            dollar_per_point: 1.0,
        };
        assert!(matches!(
            engine.evaluate(&o, &context, fixed_now()),
            RiskDecision::Reject { .. }
        ));
    }

    #[test]
    fn test_shadow_mode_accepts_and_counts() {
        let mut config = RiskConfig::default();
        config.shadow_mode = true;
        let mut engine = RiskEngine::new(config);

        assert!(engine
            .evaluate(&order(50, Side::Buy), &ctx(), fixed_now())
            .is_accept());
        let stats = engine.shadow_stats();
        assert_eq!(stats.evaluated, 1);
        assert_eq!(stats.would_reject, 1);
    }

    #[test]
    fn test_manual_pause_and_resume() {
        let mut engine = engine();
        engine.set_manual_pause(true);
        assert!(matches!(
            engine.evaluate(&order(1, Side::Buy), &ctx(), fixed_now()),
            RiskDecision::Reject { .. }
        ));
        engine.set_manual_pause(false);
        assert!(engine
            .evaluate(&order(1, Side::Buy), &ctx(), fixed_now())
            .is_accept());
    }

    #[test]
    fn test_session_reset_clears_counters_and_pause() {
        let mut engine = engine();
        let day1 = Utc.with_ymd_and_hms(2024, 3, 5, 20, 0, 0).unwrap();
        engine.apply_realized_pnl("ACC", -1_500.0, day1);
        assert!(engine.is_paused());

        // Two days later (safely past any timezone offset) the session has
        // rolled: counters reset, pause cleared.
        let day3 = Utc.with_ymd_and_hms(2024, 3, 7, 20, 0, 0).unwrap();
        assert!(engine
            .evaluate(&order(1, Side::Buy), &ctx(), day3)
            .is_accept());
        assert!(!engine.is_paused());
    }
}
