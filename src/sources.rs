//! Source Registry
//!
//! Identity and bookkeeping for each order producer. Sources register on
//! first contact and live for the process lifetime; unknown sources are
//! auto-registered as SYSTEM so nothing is ever dropped for missing
//! identity.

use crate::models::SourceKind;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;

/// Per-producer metadata and counters.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceInfo {
    pub id: String,
    pub kind: SourceKind,
    pub display_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy_tag: Option<String>,
    pub registered_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub orders_received: u64,
    pub orders_processed: u64,
    pub orders_rejected: u64,
    pub fills_received: u64,
}

/// Registry keyed by source id. Mutated only by the orchestrator.
#[derive(Default)]
pub struct SourceRegistry {
    sources: HashMap<String, SourceInfo>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Explicit registration with identity details.
    pub fn register(
        &mut self,
        id: &str,
        kind: SourceKind,
        display_name: &str,
        strategy_tag: Option<String>,
        now: DateTime<Utc>,
    ) {
        self.sources
            .entry(id.to_string())
            .and_modify(|s| {
                s.kind = kind;
                s.display_name = display_name.to_string();
                s.strategy_tag = strategy_tag.clone();
                s.last_seen_at = now;
            })
            .or_insert_with(|| SourceInfo {
                id: id.to_string(),
                kind,
                display_name: display_name.to_string(),
                strategy_tag,
                registered_at: now,
                last_seen_at: now,
                orders_received: 0,
                orders_processed: 0,
                orders_rejected: 0,
                fills_received: 0,
            });
    }

    pub fn kind_of(&self, id: &str) -> Option<SourceKind> {
        self.sources.get(id).map(|s| s.kind)
    }

    pub fn record_order(&mut self, id: &str, now: DateTime<Utc>) {
        let source = self.ensure(id, now);
        source.orders_received += 1;
        source.last_seen_at = now;
    }

    pub fn record_processed(&mut self, id: &str, now: DateTime<Utc>) {
        let source = self.ensure(id, now);
        source.orders_processed += 1;
        source.last_seen_at = now;
    }

    pub fn record_rejection(&mut self, id: &str, now: DateTime<Utc>) {
        let source = self.ensure(id, now);
        source.orders_rejected += 1;
        source.last_seen_at = now;
    }

    pub fn record_fill(&mut self, id: &str, now: DateTime<Utc>) {
        let source = self.ensure(id, now);
        source.fills_received += 1;
        source.last_seen_at = now;
    }

    pub fn snapshot(&self) -> Vec<SourceInfo> {
        let mut sources: Vec<SourceInfo> = self.sources.values().cloned().collect();
        sources.sort_by(|a, b| a.id.cmp(&b.id));
        sources
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    fn ensure(&mut self, id: &str, now: DateTime<Utc>) -> &mut SourceInfo {
        self.sources
            .entry(id.to_string())
            .or_insert_with(|| SourceInfo {
                id: id.to_string(),
                kind: SourceKind::System,
                display_name: id.to_string(),
                strategy_tag: None,
                registered_at: now,
                last_seen_at: now,
                orders_received: 0,
                orders_processed: 0,
                orders_rejected: 0,
                fills_received: 0,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auto_registration_is_system() {
        let mut registry = SourceRegistry::new();
        registry.record_order("mystery", Utc::now());
        assert_eq!(registry.kind_of("mystery"), Some(SourceKind::System));
        assert_eq!(registry.snapshot()[0].orders_received, 1);
    }

    #[test]
    fn test_counters_accumulate() {
        let mut registry = SourceRegistry::new();
        let now = Utc::now();
        registry.register("bot-1", SourceKind::Bot, "EMA crossover", None, now);
        registry.record_order("bot-1", now);
        registry.record_order("bot-1", now);
        registry.record_processed("bot-1", now);
        registry.record_rejection("bot-1", now);
        registry.record_fill("bot-1", now);

        let info = &registry.snapshot()[0];
        assert_eq!(info.orders_received, 2);
        assert_eq!(info.orders_processed, 1);
        assert_eq!(info.orders_rejected, 1);
        assert_eq!(info.fills_received, 1);
        assert_eq!(info.kind, SourceKind::Bot);
    }

    #[test]
    fn test_re_register_upgrades_identity() {
        let mut registry = SourceRegistry::new();
        let now = Utc::now();
        registry.record_order("trader-7", now);
        assert_eq!(registry.kind_of("trader-7"), Some(SourceKind::System));

        registry.register("trader-7", SourceKind::Manual, "Desk 7", None, now);
        assert_eq!(registry.kind_of("trader-7"), Some(SourceKind::Manual));
        // Counters survive the upgrade.
        assert_eq!(registry.snapshot()[0].orders_received, 1);
        assert_eq!(registry.len(), 1);
    }
}
