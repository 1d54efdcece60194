//! Trading Aggregator Library
//!
//! Exposes the aggregator runtime for the binary and integration tests:
//! bus adapter, downstream client, risk engine, priority queue, SL/TP
//! calculator, source registry, orchestrator core, and the monitoring
//! surface.

pub mod aggregator;
pub mod api;
pub mod bus;
pub mod config;
pub mod downstream;
pub mod error;
pub mod metrics;
pub mod models;
pub mod queue;
pub mod risk;
pub mod sltp;
pub mod sources;

pub use aggregator::{Aggregator, AggregatorHandle, CancelOutcome, SubmitOutcome};
pub use bus::{BusAdapter, InMemoryBus, WsTransport};
pub use config::AppConfig;
pub use downstream::ConnectionManagerClient;
pub use metrics::MetricsHub;
