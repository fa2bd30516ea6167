//! Error types for the Tessera facade.

use tessera_core::CoreError;
use tessera_keys::KeysError;
use tessera_store::StoreError;
use tessera_sync::SyncError;
use thiserror::Error;

/// Errors that can occur during replica and relay operations.
#[derive(Debug, Error)]
pub enum TesseraError {
    /// Malformed identifier or timestamp.
    #[error("core error: {0}")]
    Core(#[from] CoreError),

    /// Key derivation or sealing failed.
    #[error("keys error: {0}")]
    Keys(#[from] KeysError),

    /// Storage error.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    /// Sync error.
    #[error("sync error: {0}")]
    Sync(#[from] SyncError),

    /// Invalid or unreadable configuration.
    #[error("config error: {0}")]
    Config(String),
}

/// Result type for Tessera operations.
pub type Result<T> = std::result::Result<T, TesseraError>;
