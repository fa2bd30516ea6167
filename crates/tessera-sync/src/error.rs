//! Error types for the sync module.

use tessera_core::TimestampError;
use thiserror::Error;

use crate::messages::ErrorCode;

/// A frame that cannot be decoded. The connection carrying it is dropped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolDecodeError {
    #[error("truncated frame: needed {needed} more bytes, {remaining} left")]
    Truncated { needed: usize, remaining: usize },

    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),

    #[error("unknown message type {0}")]
    UnknownMessageType(u8),

    #[error("message type {0} not expected here")]
    UnexpectedMessageType(u8),

    #[error("unknown error code {0}")]
    UnknownErrorCode(u8),

    #[error("unknown value tag {0}")]
    UnknownValueTag(u8),

    #[error("invalid flag byte {0}")]
    InvalidFlag(u8),

    #[error("invalid child mask {0:#04b}")]
    InvalidChildMask(u8),

    #[error("merkle tree deeper than key width")]
    TreeTooDeep,

    #[error("varint overflow")]
    VarintOverflow,

    #[error("{count} messages exceeds the per-frame limit")]
    TooManyMessages { count: u64 },

    #[error("length {len} exceeds the limit")]
    TooLong { len: u64 },

    #[error("invalid id: {0}")]
    InvalidId(String),

    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),

    #[error("invalid utf-8 string")]
    InvalidUtf8,

    #[error("non-zero padding byte")]
    NonZeroPadding,

    #[error("{0} trailing bytes")]
    TrailingBytes(usize),
}

/// Errors that can occur during sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Malformed frame from the peer.
    #[error("decode error: {0}")]
    Decode(#[from] ProtocolDecodeError),

    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(String),

    /// The relay answered with an error frame.
    #[error("relay error: {0:?}")]
    Relay(ErrorCode),

    /// Clock rejected a local or remote timestamp.
    #[error("clock error: {0}")]
    Timestamp(#[from] TimestampError),

    /// Store operation failed.
    #[error("store error: {0}")]
    Store(#[from] tessera_store::StoreError),

    /// Sealing or opening a change failed.
    #[error("keys error: {0}")]
    Keys(#[from] tessera_keys::KeysError),

    /// Timeout waiting for the peer.
    #[error("timeout: {0}")]
    Timeout(String),

    /// A sealed change is larger than a frame may carry.
    #[error("change of {len} bytes exceeds the limit")]
    ChangeTooLarge { len: usize },

    /// A table or column name is longer than peers will decode.
    #[error("name of {len} bytes exceeds the limit")]
    NameTooLong { len: usize },

    /// The peer answered with something other than what was asked for.
    #[error("unexpected message: {0}")]
    UnexpectedMessage(String),

    /// Two rounds in a row ended at the same watermark with nothing learned.
    #[error("no progress at watermark {watermark}")]
    NoProgress { watermark: u64 },

    /// The round limit was reached before the trees agreed.
    #[error("not converged after {0} rounds")]
    TooManyRounds(usize),
}

/// Result type for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;

/// Why the last sync round failed, as published on the session state.
///
/// A plain value so observers can clone and compare it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncStateError {
    /// The relay was unreachable or the connection broke.
    #[error("network error: {0}")]
    Network(String),

    /// The relay rejected the request.
    #[error("relay rejected the request: {0:?}")]
    Server(ErrorCode),

    /// The relay refused to store more data for this owner.
    #[error("storage quota exceeded")]
    PaymentRequired,

    /// The local clock refused a timestamp.
    #[error("clock error: {0}")]
    Clock(TimestampError),

    /// The relay sent something that could not be used.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The local store failed.
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<&SyncError> for SyncStateError {
    fn from(err: &SyncError) -> Self {
        match err {
            SyncError::Relay(ErrorCode::QuotaExceeded) => SyncStateError::PaymentRequired,
            SyncError::Relay(code) => SyncStateError::Server(*code),
            SyncError::Transport(msg) | SyncError::Timeout(msg) => {
                SyncStateError::Network(msg.clone())
            }
            SyncError::Timestamp(e) => SyncStateError::Clock(e.clone()),
            SyncError::Store(e) => SyncStateError::Storage(e.to_string()),
            other => SyncStateError::Protocol(other.to_string()),
        }
    }
}
