//! SL/TP Calculator
//!
//! Derives bracket stop-loss and take-profit prices from a fill using
//! contract tick metadata and the configured offsets. Prices snap to the
//! instrument tick *away* from entry, so the worst case is always at
//! least the configured offset. A policy that would invert the bracket
//! geometry yields `calculated: false` with `INVALID_GEOMETRY`.

use crate::config::{BracketMode, SltpConfig};
use crate::models::{ContractSpec, Fill, Order, OrderKind, OrderState, Priority, Side, Symbol};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;

/// Result of a bracket computation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BracketLevels {
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub calculated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl BracketLevels {
    fn skipped(reason: &str) -> Self {
        Self {
            stop_loss: None,
            take_profit: None,
            calculated: false,
            reason: Some(reason.to_string()),
        }
    }
}

/// Computes bracket levels and constructs the child orders.
pub struct BracketCalculator {
    config: SltpConfig,
    contracts: HashMap<Symbol, ContractSpec>,
}

impl BracketCalculator {
    pub fn new(config: SltpConfig, contracts: HashMap<Symbol, ContractSpec>) -> Self {
        Self { config, contracts }
    }

    pub fn enabled(&self) -> bool {
        self.config.calculate_sltp
    }

    /// Effective contract spec for a symbol, tick overrides applied.
    fn contract_for(&self, symbol: &str) -> ContractSpec {
        let mut spec = self.contracts.get(symbol).copied().unwrap_or_default();
        if let Some(tick) = self.config.tick_size_overrides.get(symbol) {
            spec.tick_size = *tick;
        }
        spec
    }

    /// Compute bracket levels for a fill under the configured policy.
    pub fn compute(&self, fill: &Fill) -> BracketLevels {
        if !self.config.calculate_sltp {
            return BracketLevels::skipped("DISABLED");
        }

        let spec = self.contract_for(&fill.instrument);
        let tick = spec.tick_size;
        if tick <= 0.0 {
            return BracketLevels::skipped("INVALID_GEOMETRY");
        }
        let entry = fill.fill_price;

        // Resolve offsets. RISK_REWARD derives one distance from the
        // other; both sides referencing each other is unresolvable.
        let (stop_distance, take_profit_distance) = match (
            self.config.stop_mode,
            self.config.take_profit_mode,
        ) {
            (BracketMode::RiskReward, BracketMode::RiskReward) => {
                return BracketLevels::skipped("INVALID_GEOMETRY");
            }
            (stop_mode, BracketMode::RiskReward) => {
                let stop = self.fixed_distance(stop_mode, entry, true, tick);
                (stop, stop * self.config.risk_reward_ratio)
            }
            (BracketMode::RiskReward, take_mode) => {
                let take = self.fixed_distance(take_mode, entry, false, tick);
                (take / self.config.risk_reward_ratio, take)
            }
            (stop_mode, take_mode) => (
                self.fixed_distance(stop_mode, entry, true, tick),
                self.fixed_distance(take_mode, entry, false, tick),
            ),
        };

        if stop_distance <= 0.0 || take_profit_distance <= 0.0 {
            return BracketLevels::skipped("INVALID_GEOMETRY");
        }

        // Snap away from entry on both legs so the realized offset is
        // never less than configured.
        let (stop_loss, take_profit) = match fill.side {
            Side::Buy => (
                snap_down(entry - stop_distance, tick),
                snap_up(entry + take_profit_distance, tick),
            ),
            Side::Sell => (
                snap_up(entry + stop_distance, tick),
                snap_down(entry - take_profit_distance, tick),
            ),
        };

        // For a BUY fill SL < entry < TP; reversed for SELL.
        let geometry_ok = match fill.side {
            Side::Buy => stop_loss < entry && entry < take_profit,
            Side::Sell => take_profit < entry && entry < stop_loss,
        };
        if !geometry_ok {
            return BracketLevels::skipped("INVALID_GEOMETRY");
        }

        BracketLevels {
            stop_loss: Some(stop_loss),
            take_profit: Some(take_profit),
            calculated: true,
            reason: None,
        }
    }

    fn fixed_distance(&self, mode: BracketMode, entry: f64, is_stop: bool, tick: f64) -> f64 {
        match mode {
            BracketMode::FixedTicks => {
                let ticks = if is_stop {
                    self.config.stop_offset_ticks
                } else {
                    self.config.take_profit_offset_ticks
                };
                ticks as f64 * tick
            }
            BracketMode::Percent => {
                let percent = if is_stop {
                    self.config.stop_offset_percent
                } else {
                    self.config.take_profit_offset_percent
                };
                entry * percent / 100.0
            }
            // Resolved by the caller; unreachable by construction.
            BracketMode::RiskReward => 0.0,
        }
    }

    /// Construct the SL and TP child orders for a filled quantity.
    /// Children inherit account and instrument, take the opposite side,
    /// link to the parent, and ride the HIGH priority class.
    pub fn build_children(
        &self,
        parent: &Order,
        quantity: u32,
        levels: &BracketLevels,
        now: DateTime<Utc>,
    ) -> Vec<Order> {
        let mut children = Vec::with_capacity(2);
        let child = |id: String, kind: OrderKind, price: Option<f64>, stop_price: Option<f64>| {
            Order {
                id,
                source: parent.source.clone(),
                account_id: parent.account_id.clone(),
                instrument: parent.instrument.clone(),
                side: parent.side.opposite(),
                kind,
                quantity,
                price,
                stop_price,
                priority: Priority::High,
                state: OrderState::Received,
                filled_quantity: 0,
                average_fill_price: 0.0,
                rejection_reason: None,
                linked_bracket_of: Some(parent.id.clone()),
                received_at: now,
                validated_at: None,
                dispatched_at: None,
                terminal_at: None,
            }
        };

        if let Some(stop_loss) = levels.stop_loss {
            children.push(child(
                format!("{}:sl:{}", parent.id, uuid::Uuid::new_v4().simple()),
                OrderKind::Stop,
                None,
                Some(stop_loss),
            ));
        }
        if let Some(take_profit) = levels.take_profit {
            children.push(child(
                format!("{}:tp:{}", parent.id, uuid::Uuid::new_v4().simple()),
                OrderKind::Limit,
                Some(take_profit),
                None,
            ));
        }
        children
    }
}

fn snap_down(price: f64, tick: f64) -> f64 {
    ((price / tick) + 1e-9).floor() * tick
}

fn snap_up(price: f64, tick: f64) -> f64 {
    ((price / tick) - 1e-9).ceil() * tick
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fill(side: Side, price: f64) -> Fill {
        Fill {
            order_id: "P1".into(),
            instrument: "MES".into(),
            side,
            fill_price: price,
            fill_quantity: 1,
            cumulative_quantity: 1,
            fill_time: 1_700_000_000_000,
            source: None,
        }
    }

    fn contracts() -> HashMap<Symbol, ContractSpec> {
        let mut map = HashMap::new();
        map.insert(
            "MES".to_string(),
            ContractSpec {
                tick_size: 0.25,
                tick_value: 1.25,
                dollar_per_point: 5.0,
            },
        );
        map
    }

    fn enabled_config() -> SltpConfig {
        SltpConfig {
            calculate_sltp: true,
            stop_offset_ticks: 10,
            take_profit_offset_ticks: 20,
            ..SltpConfig::default()
        }
    }

    #[test]
    fn test_disabled_by_default() {
        let calc = BracketCalculator::new(SltpConfig::default(), contracts());
        let levels = calc.compute(&fill(Side::Buy, 4500.0));
        assert!(!levels.calculated);
        assert_eq!(levels.reason.as_deref(), Some("DISABLED"));
    }

    #[test]
    fn test_fixed_ticks_buy() {
        let calc = BracketCalculator::new(enabled_config(), contracts());
        let levels = calc.compute(&fill(Side::Buy, 4500.0));
        assert!(levels.calculated);
        // 10 ticks of 0.25 below, 20 ticks above.
        assert_eq!(levels.stop_loss, Some(4497.5));
        assert_eq!(levels.take_profit, Some(4505.0));
    }

    #[test]
    fn test_fixed_ticks_sell_mirrors() {
        let calc = BracketCalculator::new(enabled_config(), contracts());
        let levels = calc.compute(&fill(Side::Sell, 4500.0));
        assert_eq!(levels.stop_loss, Some(4502.5));
        assert_eq!(levels.take_profit, Some(4495.0));
    }

    #[test]
    fn test_recompute_is_identical() {
        let calc = BracketCalculator::new(enabled_config(), contracts());
        let first = calc.compute(&fill(Side::Buy, 4500.25));
        let second = calc.compute(&fill(Side::Buy, 4500.25));
        assert_eq!(first.stop_loss, second.stop_loss);
        assert_eq!(first.take_profit, second.take_profit);
    }

    #[test]
    fn test_snap_away_from_entry() {
        let mut config = enabled_config();
        config.stop_mode = BracketMode::Percent;
        config.take_profit_mode = BracketMode::Percent;
        config.stop_offset_percent = 0.01; // 0.45 points at 4500
        config.take_profit_offset_percent = 0.01;
        let calc = BracketCalculator::new(config, contracts());

        let levels = calc.compute(&fill(Side::Buy, 4500.0));
        // Raw SL 4499.55 snaps down to 4499.50, raw TP 4500.45 snaps up to
        // 4500.50: both at least the configured distance from entry.
        assert_eq!(levels.stop_loss, Some(4499.5));
        assert_eq!(levels.take_profit, Some(4500.5));
    }

    #[test]
    fn test_risk_reward_take_profit() {
        let mut config = enabled_config();
        config.take_profit_mode = BracketMode::RiskReward;
        config.risk_reward_ratio = 2.0;
        let calc = BracketCalculator::new(config, contracts());

        let levels = calc.compute(&fill(Side::Buy, 4500.0));
        // Stop 2.5 points below, TP 5.0 points above.
        assert_eq!(levels.stop_loss, Some(4497.5));
        assert_eq!(levels.take_profit, Some(4505.0));
    }

    #[test]
    fn test_zero_offset_is_invalid_geometry() {
        let mut config = enabled_config();
        config.stop_offset_ticks = 0;
        let calc = BracketCalculator::new(config, contracts());
        let levels = calc.compute(&fill(Side::Buy, 4500.0));
        assert!(!levels.calculated);
        assert_eq!(levels.reason.as_deref(), Some("INVALID_GEOMETRY"));
    }

    #[test]
    fn test_double_risk_reward_is_invalid() {
        let mut config = enabled_config();
        config.stop_mode = BracketMode::RiskReward;
        config.take_profit_mode = BracketMode::RiskReward;
        let calc = BracketCalculator::new(config, contracts());
        let levels = calc.compute(&fill(Side::Buy, 4500.0));
        assert!(!levels.calculated);
        assert_eq!(levels.reason.as_deref(), Some("INVALID_GEOMETRY"));
    }

    #[test]
    fn test_tick_override_applies() {
        let mut config = enabled_config();
        config.tick_size_overrides.insert("MES".into(), 0.5);
        let calc = BracketCalculator::new(config, contracts());
        let levels = calc.compute(&fill(Side::Buy, 4500.0));
        // 10 ticks of 0.5 = 5 points.
        assert_eq!(levels.stop_loss, Some(4495.0));
        assert_eq!(levels.take_profit, Some(4510.0));
    }

    #[test]
    fn test_children_construction() {
        let calc = BracketCalculator::new(enabled_config(), contracts());
        let f = fill(Side::Buy, 4500.0);
        let levels = calc.compute(&f);

        let parent = Order {
            id: "P1".into(),
            source: "bot-1".into(),
            account_id: "ACC".into(),
            instrument: "MES".into(),
            side: Side::Buy,
            kind: OrderKind::Market,
            quantity: 1,
            price: None,
            stop_price: None,
            priority: Priority::Normal,
            state: OrderState::Dispatched,
            filled_quantity: 1,
            average_fill_price: 4500.0,
            rejection_reason: None,
            linked_bracket_of: None,
            received_at: Utc::now(),
            validated_at: None,
            dispatched_at: None,
            terminal_at: None,
        };

        let children = calc.build_children(&parent, 1, &levels, Utc::now());
        assert_eq!(children.len(), 2);

        let sl = &children[0];
        assert_eq!(sl.kind, OrderKind::Stop);
        assert_eq!(sl.side, Side::Sell);
        assert_eq!(sl.stop_price, Some(4497.5));
        assert_eq!(sl.priority, Priority::High);
        assert_eq!(sl.linked_bracket_of.as_deref(), Some("P1"));

        let tp = &children[1];
        assert_eq!(tp.kind, OrderKind::Limit);
        assert_eq!(tp.price, Some(4505.0));
        assert_eq!(tp.quantity, 1);
        assert_ne!(sl.id, tp.id);
    }
}
