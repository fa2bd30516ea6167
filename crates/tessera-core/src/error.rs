//! Error types for Tessera Core.

use thiserror::Error;

use crate::types::NodeId;

/// Errors raised while parsing or constructing core values.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid id: {0}")]
    InvalidId(String),

    #[error("invalid node id: {0}")]
    InvalidNodeId(String),

    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),

    #[error("timestamp error: {0}")]
    Timestamp(#[from] TimestampError),
}

/// Failures of the hybrid logical clock.
///
/// All of these abort the current send/receive attempt only. The replica keeps
/// its previous clock and stays usable offline.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TimestampError {
    /// The next clock value would run too far ahead of wall-clock time.
    #[error("clock drift: next millis {next} is more than the allowed drift ahead of now {now}")]
    Drift { now: u64, next: u64 },

    /// The logical counter would exceed 65535 within a single millisecond.
    #[error("timestamp counter overflow")]
    CounterOverflow,

    /// A remote timestamp carries our own node id.
    #[error("duplicate node id {node}")]
    DuplicateNode { node: NodeId },

    /// Millis do not fit the 48-bit wire encoding.
    #[error("millis {millis} out of range")]
    TimeOutOfRange { millis: u64 },
}
