//! Storage errors.

use tessera_core::OwnerId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A tree snapshot could not be encoded or decoded.
    #[error("snapshot serialization failed: {0}")]
    Serialization(String),

    /// The quota policy rejected a batch. Nothing was written.
    #[error("owner {owner} over quota: {required_bytes} bytes required")]
    QuotaExceeded { owner: OwnerId, required_bytes: u64 },

    /// A stored row does not decode (bad id, timestamp or value).
    #[error("corrupt row: {0}")]
    InvalidData(String),

    #[error("schema migration failed: {0}")]
    Migration(String),

    /// The blocking task running a query panicked or was cancelled.
    #[error("storage task failed: {0}")]
    Task(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;
