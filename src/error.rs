//! Error Taxonomy
//!
//! Stable reason codes surfaced to producers and logs. Producer-facing
//! rejections always carry one of these codes; internal errors are retried
//! where possible and promoted to events when recovery fails.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable rejection/failure reason codes. These form part of the wire
/// contract: producers match on the serialized SCREAMING_SNAKE_CASE tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RejectReason {
    /// Malformed order input; reported synchronously at the boundary.
    Validation,
    /// One or more risk rules failed; the violation list rides alongside.
    RiskViolation,
    /// Global queue capacity exhausted.
    QueueFull,
    /// Per-symbol queue limit exhausted.
    SymbolLimit,
    /// Downstream request timed out after all attempts.
    DownstreamTimeout,
    /// Connection Manager rejected the order outright.
    DownstreamRejected,
    /// Connection Manager unreachable.
    DownstreamUnavailable,
    /// Bus transport disconnected.
    BusDisconnected,
    /// Bus publish buffer overflowed while disconnected.
    BusBufferOverflow,
    /// Fill arrived for an order already in a terminal state.
    LateFill,
    /// Fill referenced an order id the aggregator has never seen.
    UnknownOrder,
    /// SL/TP computation would invert the bracket geometry.
    InvalidGeometry,
    /// Order drained during shutdown before dispatch.
    Shutdown,
    /// Cancel requested for an order in a state that cannot be cancelled.
    NotCancellable,
    /// Risk deferred: a required datum was momentarily unavailable. The
    /// producer may retry as-is.
    Deferred,
    /// Ambiguous downstream response that could not be decoded.
    Unknown,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::Validation => "VALIDATION",
            RejectReason::RiskViolation => "RISK_VIOLATION",
            RejectReason::QueueFull => "QUEUE_FULL",
            RejectReason::SymbolLimit => "SYMBOL_LIMIT",
            RejectReason::DownstreamTimeout => "DOWNSTREAM_TIMEOUT",
            RejectReason::DownstreamRejected => "DOWNSTREAM_REJECTED",
            RejectReason::DownstreamUnavailable => "DOWNSTREAM_UNAVAILABLE",
            RejectReason::BusDisconnected => "BUS_DISCONNECTED",
            RejectReason::BusBufferOverflow => "BUS_BUFFER_OVERFLOW",
            RejectReason::LateFill => "LATE_FILL",
            RejectReason::UnknownOrder => "UNKNOWN_ORDER",
            RejectReason::InvalidGeometry => "INVALID_GEOMETRY",
            RejectReason::Shutdown => "SHUTDOWN",
            RejectReason::NotCancellable => "NOT_CANCELLABLE",
            RejectReason::Deferred => "DEFERRED",
            RejectReason::Unknown => "UNKNOWN",
        }
    }
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bus transport and correlation errors.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus transport disconnected")]
    Disconnected,
    #[error("publish buffer overflow ({0} messages buffered)")]
    BufferOverflow(usize),
    #[error("request timed out after {attempts} attempts")]
    Timeout { attempts: u32 },
    #[error("pending request table full ({0} outstanding)")]
    PendingTableFull(usize),
    #[error("request id {0} already outstanding")]
    DuplicateRequestId(String),
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("transport closed")]
    Closed,
}

/// Outcomes of Connection Manager calls, decoded from bus responses.
#[derive(Debug, Error)]
pub enum DownstreamError {
    #[error("downstream request timed out")]
    Timeout,
    #[error("downstream rejected: {0}")]
    Rejected(String),
    #[error("downstream unavailable: {0}")]
    Unavailable(String),
    #[error("ambiguous downstream response")]
    Unknown,
}

impl DownstreamError {
    /// Transient errors are eligible for re-enqueue with backoff; the rest
    /// fail the order immediately.
    pub fn is_transient(&self) -> bool {
        matches!(self, DownstreamError::Timeout | DownstreamError::Unavailable(_))
    }

    pub fn reject_reason(&self) -> RejectReason {
        match self {
            DownstreamError::Timeout => RejectReason::DownstreamTimeout,
            DownstreamError::Rejected(_) => RejectReason::DownstreamRejected,
            DownstreamError::Unavailable(_) => RejectReason::DownstreamUnavailable,
            DownstreamError::Unknown => RejectReason::Unknown,
        }
    }
}

impl From<BusError> for DownstreamError {
    fn from(err: BusError) -> Self {
        match err {
            BusError::Timeout { .. } => DownstreamError::Timeout,
            BusError::Disconnected | BusError::Closed => {
                DownstreamError::Unavailable("bus disconnected".to_string())
            }
            other => DownstreamError::Unavailable(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_codes_are_stable() {
        assert_eq!(
            serde_json::to_string(&RejectReason::QueueFull).unwrap(),
            "\"QUEUE_FULL\""
        );
        assert_eq!(
            serde_json::to_string(&RejectReason::RiskViolation).unwrap(),
            "\"RISK_VIOLATION\""
        );
        assert_eq!(RejectReason::LateFill.as_str(), "LATE_FILL");
    }

    #[test]
    fn test_transient_classification() {
        assert!(DownstreamError::Timeout.is_transient());
        assert!(DownstreamError::Unavailable("down".into()).is_transient());
        assert!(!DownstreamError::Rejected("bad qty".into()).is_transient());
        assert!(!DownstreamError::Unknown.is_transient());
    }
}
