//! Redacted secret values.
//!
//! [`Secret`] implements neither `Display` nor serde, and its `Debug` output
//! is redacted. The only way to read the value is [`Secret::reveal`], which
//! makes every use greppable.

use std::fmt;

use rand::RngCore;

use crate::error::{KeysError, Result};

/// A value that must not end up in logs or on the wire.
pub struct Secret<T>(T);

impl<T> Secret<T> {
    pub fn new(value: T) -> Self {
        Self(value)
    }

    /// Access the wrapped value.
    pub fn reveal(&self) -> &T {
        &self.0
    }
}

impl<T: Clone> Clone for Secret<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T> fmt::Debug for Secret<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret([REDACTED])")
    }
}

/// The 32-byte root secret of an owner. Everything else is derived from it.
pub type OwnerSecret = Secret<[u8; 32]>;

impl Secret<[u8; 32]> {
    /// Generate a fresh random owner secret.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Parse a hex-encoded owner secret (e.g. restored from backup).
    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).map_err(|e| KeysError::InvalidSecret(e.to_string()))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| KeysError::InvalidSecret("expected 32 bytes".into()))?;
        Ok(Self(arr))
    }
}
