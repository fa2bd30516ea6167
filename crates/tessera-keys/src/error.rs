//! Error types for the keys module.

use thiserror::Error;

/// Errors that can occur while deriving keys or sealing changes.
#[derive(Debug, Error)]
pub enum KeysError {
    /// Encryption error.
    #[error("encryption error: {0}")]
    EncryptionError(String),

    /// Decryption error (wrong key or tampered ciphertext).
    #[error("decryption error: {0}")]
    DecryptionError(String),

    /// Sealed bytes are too short or otherwise malformed.
    #[error("malformed sealed payload: {0}")]
    Malformed(String),

    /// Secret material could not be parsed.
    #[error("invalid secret: {0}")]
    InvalidSecret(String),
}

/// Result type for key operations.
pub type Result<T> = std::result::Result<T, KeysError>;
