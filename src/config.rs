//! Configuration
//!
//! Immutable per process: a TOML file selected via `--config`, with env
//! overrides for a narrow set of deployment knobs. A reload means a
//! restart with a drain; only `shadow_mode` and the pause latch are
//! mutable at runtime, via the admin channel.

use crate::models::{ContractSpec, Symbol};
use anyhow::{bail, Context, Result};
use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::path::Path;

/// Top-level application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub risk: RiskConfig,
    pub queue: QueueConfig,
    pub sltp: SltpConfig,
    pub bus: BusConfig,
    pub downstream: DownstreamConfig,
    pub monitoring: MonitoringConfig,
    /// Static contract metadata by symbol.
    pub contracts: HashMap<Symbol, ContractSpec>,
}

/// Pre-trade risk limits, per account unless noted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    pub max_order_size: u32,
    pub max_position_size: u32,
    pub max_position_value: f64,
    pub max_open_positions: usize,
    pub max_daily_loss: f64,
    pub max_daily_profit: f64,
    pub max_account_drawdown: f64,
    pub max_orders_per_minute: u32,
    pub max_orders_per_symbol: u32,
    pub pause_on_daily_loss: bool,
    pub trading_hours: TradingHours,
    /// Optional instrument whitelist; empty means all allowed.
    pub allowed_instruments: Vec<Symbol>,
    /// All decisions become ACCEPT; the would-be decision is logged and
    /// counted. Safe-rollout switch.
    pub shadow_mode: bool,
    /// Session boundary at which daily counters reset, local time.
    pub session_reset: String,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_order_size: 10,
            max_position_size: 20,
            max_position_value: 100_000.0,
            max_open_positions: 5,
            max_daily_loss: 1_000.0,
            max_daily_profit: 3_000.0,
            max_account_drawdown: 2_000.0,
            max_orders_per_minute: 30,
            max_orders_per_symbol: 10,
            pause_on_daily_loss: true,
            trading_hours: TradingHours::default(),
            allowed_instruments: vec![],
            shadow_mode: false,
            session_reset: "00:00".to_string(),
        }
    }
}

/// Trading window in local time. Disabled means 24/7.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TradingHours {
    pub start: String,
    pub end: String,
    pub enabled: bool,
}

impl Default for TradingHours {
    fn default() -> Self {
        Self {
            start: "09:30".to_string(),
            end: "16:00".to_string(),
            enabled: false,
        }
    }
}

impl TradingHours {
    pub fn parse(&self) -> Result<(NaiveTime, NaiveTime)> {
        let start = NaiveTime::parse_from_str(&self.start, "%H:%M")
            .with_context(|| format!("invalid trading_hours.start {:?}", self.start))?;
        let end = NaiveTime::parse_from_str(&self.end, "%H:%M")
            .with_context(|| format!("invalid trading_hours.end {:?}", self.end))?;
        Ok((start, end))
    }
}

/// Priority queue and dispatch scheduler knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Global queued-order capacity across all priority classes.
    pub max_queue_size: usize,
    /// Queued orders allowed per symbol.
    pub max_orders_per_symbol: usize,
    /// Scheduler tick interval.
    pub processing_interval_ms: u64,
    /// Parallel in-flight dispatches.
    pub max_concurrent_orders: usize,
    /// Global dispatch rate, fixed one-second window.
    pub max_orders_per_second: u32,
    /// Dispatch retry ceiling for transient downstream failures.
    pub max_dispatch_attempts: u32,
    /// Base delay for the exponential retry schedule.
    pub retry_base_delay_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 100,
            max_orders_per_symbol: 10,
            processing_interval_ms: 100,
            max_concurrent_orders: 5,
            max_orders_per_second: 10,
            max_dispatch_attempts: 3,
            retry_base_delay_ms: 500,
        }
    }
}

/// Bracket price derivation mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BracketMode {
    FixedTicks,
    Percent,
    RiskReward,
}

/// Stop-loss / take-profit policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SltpConfig {
    /// Master switch; off by default — most producers manage their own
    /// brackets.
    pub calculate_sltp: bool,
    /// Legacy alias for the master switch. Accepted in config files but
    /// must agree with `calculate_sltp`; a mismatch fails validation
    /// instead of silently preferring either key.
    pub place_bracket_orders: Option<bool>,
    pub stop_mode: BracketMode,
    pub take_profit_mode: BracketMode,
    pub stop_offset_ticks: u32,
    pub take_profit_offset_ticks: u32,
    pub stop_offset_percent: f64,
    pub take_profit_offset_percent: f64,
    pub risk_reward_ratio: f64,
    /// Declarative only; trailing execution lives downstream.
    pub enable_trailing_stop: bool,
    /// Per-symbol tick size overrides on top of the contract table.
    pub tick_size_overrides: HashMap<Symbol, f64>,
}

impl Default for SltpConfig {
    fn default() -> Self {
        Self {
            calculate_sltp: false,
            place_bracket_orders: None,
            stop_mode: BracketMode::FixedTicks,
            take_profit_mode: BracketMode::FixedTicks,
            stop_offset_ticks: 10,
            take_profit_offset_ticks: 20,
            stop_offset_percent: 0.25,
            take_profit_offset_percent: 0.5,
            risk_reward_ratio: 2.0,
            enable_trailing_stop: false,
            tick_size_overrides: HashMap::new(),
        }
    }
}

/// Message bus transport settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub host: String,
    pub port: u16,
    /// Outbound messages buffered while disconnected; beyond this cap
    /// publishes fail fast with BUS_BUFFER_OVERFLOW.
    pub publish_buffer_size: usize,
    pub reconnect_backoff_ms: u64,
    pub reconnect_backoff_max_ms: u64,
    /// Consecutive failed reconnects before the process gives up (exit 2).
    pub max_reconnect_attempts: u32,
    /// Default request timeout when a caller does not specify one.
    pub request_timeout_ms: u64,
    pub request_max_attempts: u32,
    /// Outstanding request correlation cap.
    pub max_pending_requests: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 7500,
            publish_buffer_size: 256,
            reconnect_backoff_ms: 500,
            reconnect_backoff_max_ms: 30_000,
            max_reconnect_attempts: 20,
            request_timeout_ms: 5_000,
            request_max_attempts: 3,
            max_pending_requests: 1_024,
        }
    }
}

impl BusConfig {
    pub fn url(&self) -> String {
        format!("ws://{}:{}", self.host, self.port)
    }
}

/// Connection Manager call budgets.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownstreamConfig {
    /// Short budget for place/cancel.
    pub order_timeout_ms: u64,
    /// Longer budget for directory and statistics queries.
    pub query_timeout_ms: u64,
    pub max_attempts: u32,
}

impl Default for DownstreamConfig {
    fn default() -> Self {
        Self {
            order_timeout_ms: 8_000,
            query_timeout_ms: 15_000,
            max_attempts: 3,
        }
    }
}

/// Monitoring HTTP/WS surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub host: String,
    pub port: u16,
    pub ws_heartbeat_secs: u64,
    /// Ring buffer length, sampled at 1 Hz.
    pub history_size: usize,
    /// Queue fill fraction that grades /health as warning.
    pub queue_warning_ratio: f64,
    /// Process RSS above which /health grades memory as warning, MB.
    pub memory_warning_mb: u64,
    /// Shutdown drain deadline.
    pub drain_deadline_secs: u64,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            ws_heartbeat_secs: 10,
            history_size: 300,
            queue_warning_ratio: 0.8,
            memory_warning_mb: 1_024,
            drain_deadline_secs: 10,
        }
    }
}

impl AppConfig {
    /// Load configuration: defaults, then the TOML file if given, then env
    /// overrides for deployment knobs.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        dotenv::dotenv().ok();

        let mut config = match path {
            Some(p) => {
                let raw = std::fs::read_to_string(p)
                    .with_context(|| format!("failed to read config file {}", p.display()))?;
                toml::from_str(&raw)
                    .with_context(|| format!("failed to parse config file {}", p.display()))?
            }
            None => AppConfig::default(),
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(host) = env::var("AGGREGATOR_BUS_HOST") {
            self.bus.host = host;
        }
        if let Some(port) = env::var("AGGREGATOR_BUS_PORT")
            .ok()
            .and_then(|v| v.parse::<u16>().ok())
        {
            self.bus.port = port;
        }
        if let Some(port) = env::var("AGGREGATOR_MONITOR_PORT")
            .ok()
            .and_then(|v| v.parse::<u16>().ok())
        {
            self.monitoring.port = port;
        }
        if let Ok(v) = env::var("AGGREGATOR_SHADOW_MODE") {
            self.risk.shadow_mode = matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON");
        }
    }

    /// Reject configurations that cannot run. Called once at startup; a
    /// failure here is exit code 1.
    pub fn validate(&self) -> Result<()> {
        if self.risk.max_order_size == 0 {
            bail!("risk.max_order_size must be positive");
        }
        if self.queue.max_queue_size == 0 {
            bail!("queue.max_queue_size must be positive");
        }
        if self.queue.processing_interval_ms == 0 {
            bail!("queue.processing_interval_ms must be positive");
        }
        if self.sltp.risk_reward_ratio <= 0.0 {
            bail!("sltp.risk_reward_ratio must be positive");
        }
        if let Some(legacy) = self.sltp.place_bracket_orders {
            if legacy != self.sltp.calculate_sltp {
                bail!(
                    "sltp.place_bracket_orders={} contradicts sltp.calculate_sltp={}; \
                     set both the same or drop the legacy key",
                    legacy,
                    self.sltp.calculate_sltp
                );
            }
        }
        if self.sltp.stop_mode == BracketMode::RiskReward
            && self.sltp.take_profit_mode == BracketMode::RiskReward
        {
            bail!("sltp.stop_mode and sltp.take_profit_mode cannot both be RISK_REWARD");
        }
        self.risk.trading_hours.parse()?;
        NaiveTime::parse_from_str(&self.risk.session_reset, "%H:%M")
            .with_context(|| format!("invalid risk.session_reset {:?}", self.risk.session_reset))?;
        for (symbol, tick) in &self.sltp.tick_size_overrides {
            if *tick <= 0.0 {
                bail!("sltp.tick_size_overrides.{} must be positive", symbol);
            }
        }
        Ok(())
    }

    /// Effective contract spec for a symbol: contract table entry (or the
    /// default), with any SL/TP tick override applied.
    pub fn contract_for(&self, symbol: &str) -> ContractSpec {
        let mut spec = self
            .contracts
            .get(symbol)
            .copied()
            .unwrap_or_default();
        if let Some(tick) = self.sltp.tick_size_overrides.get(symbol) {
            spec.tick_size = *tick;
        }
        spec
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_validate() {
        AppConfig::default().validate().expect("defaults are valid");
    }

    #[test]
    fn test_bracket_flag_mismatch_is_surfaced() {
        let mut config = AppConfig::default();
        config.sltp.calculate_sltp = false;
        config.sltp.place_bracket_orders = Some(true);
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("place_bracket_orders"));
        assert!(err.contains("calculate_sltp"));

        // Agreement is fine.
        config.sltp.calculate_sltp = true;
        config.validate().expect("agreeing flags are valid");
    }

    #[test]
    fn test_double_risk_reward_rejected() {
        let mut config = AppConfig::default();
        config.sltp.stop_mode = BracketMode::RiskReward;
        config.sltp.take_profit_mode = BracketMode::RiskReward;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_round_trip() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[risk]
max_order_size = 7
shadow_mode = true

[queue]
max_queue_size = 42

[bus]
host = "bus.internal"
port = 9100

[contracts.MES]
tick_size = 0.25
tick_value = 1.25
dollar_per_point = 5.0
"#
        )
        .unwrap();

        let config = AppConfig::load(Some(file.path())).expect("load");
        assert_eq!(config.risk.max_order_size, 7);
        assert!(config.risk.shadow_mode);
        assert_eq!(config.queue.max_queue_size, 42);
        assert_eq!(config.bus.url(), "ws://bus.internal:9100");
        // Untouched sections keep defaults.
        assert_eq!(config.downstream.order_timeout_ms, 8_000);
        assert!((config.contract_for("MES").tick_size - 0.25).abs() < 1e-9);
    }

    #[test]
    fn test_tick_override_wins() {
        let mut config = AppConfig::default();
        config
            .contracts
            .insert("MES".into(), ContractSpec::default());
        config.sltp.tick_size_overrides.insert("MES".into(), 0.5);
        assert!((config.contract_for("MES").tick_size - 0.5).abs() < 1e-9);
    }
}
