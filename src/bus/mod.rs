//! Message Bus
//!
//! Single point of coupling to the shared pub/sub transport. Everything
//! else addresses the bus by channel name through [`BusAdapter`].

pub mod adapter;
pub mod envelope;
pub mod transport;

pub use adapter::{BusAdapter, BusStatsSnapshot};
pub use envelope::{channels, BusFrame, Envelope};
pub use transport::{BusTransport, InMemoryBus, WsTransport};
