//! Strong type definitions for Tessera.
//!
//! All identifiers are newtypes to prevent misuse at compile time.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::CoreError;

/// URL-safe alphabet used by the textual form of [`Id`].
const ID_ALPHABET: &[u8; 64] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-_";

/// A 16-byte identifier rendered as 21 URL-safe characters.
///
/// The text form carries 126 bits (21 × 6), so the two lowest bits of the
/// last byte are always zero. Row ids and owner ids both use this type.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Id(pub [u8; 16]);

impl Id {
    /// Length of the textual form.
    pub const TEXT_LEN: usize = 21;

    /// Generate a random id.
    pub fn random() -> Self {
        let bytes: [u8; 16] = rand::thread_rng().gen();
        Self::from_hash(bytes)
    }

    /// Build an id from arbitrary bytes, clearing the bits the text form cannot carry.
    pub fn from_hash(mut bytes: [u8; 16]) -> Self {
        bytes[15] &= 0b1111_1100;
        Self(bytes)
    }

    /// Create from raw bytes, rejecting bytes the text form cannot represent.
    pub fn from_bytes(bytes: [u8; 16]) -> Result<Self, CoreError> {
        if bytes[15] & 0b11 != 0 {
            return Err(CoreError::InvalidId(
                "low two bits of the last byte must be zero".into(),
            ));
        }
        Ok(Self(bytes))
    }

    /// Get the raw bytes.
    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = u128::from_be_bytes(self.0);
        let mut text = String::with_capacity(Self::TEXT_LEN);
        for i in 0..Self::TEXT_LEN {
            let shift = 122 - 6 * i;
            text.push(ID_ALPHABET[((value >> shift) & 0x3f) as usize] as char);
        }
        f.write_str(&text)
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Id({})", self)
    }
}

impl FromStr for Id {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != Self::TEXT_LEN {
            return Err(CoreError::InvalidId(format!(
                "expected {} characters, got {}",
                Self::TEXT_LEN,
                s.len()
            )));
        }
        let mut value: u128 = 0;
        for c in s.bytes() {
            let index = ID_ALPHABET
                .iter()
                .position(|&a| a == c)
                .ok_or_else(|| CoreError::InvalidId(format!("invalid character {:?}", c as char)))?;
            value = (value << 6) | index as u128;
        }
        Ok(Self((value << 2).to_be_bytes()))
    }
}

/// The tenant identifier: every replica and relay row is scoped by it.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OwnerId(pub Id);

impl OwnerId {
    /// Create from raw bytes.
    pub fn from_bytes(bytes: [u8; 16]) -> Result<Self, CoreError> {
        Id::from_bytes(bytes).map(Self)
    }

    /// Get the raw bytes.
    pub const fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl fmt::Debug for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OwnerId({})", self.0)
    }
}

impl FromStr for OwnerId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(Self)
    }
}

/// An 8-byte replica identifier, rendered as 16 lowercase hex characters.
///
/// Generated randomly per replica; two live replicas must never share one.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub [u8; 8]);

impl NodeId {
    /// Create from raw bytes.
    pub const fn from_bytes(bytes: [u8; 8]) -> Self {
        Self(bytes)
    }

    /// Generate a random node ID.
    pub fn random() -> Self {
        Self(rand::thread_rng().gen())
    }

    /// Get the raw bytes.
    pub const fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }

    /// Convert to hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hex string.
    pub fn from_hex(s: &str) -> Result<Self, CoreError> {
        let bytes = hex::decode(s).map_err(|e| CoreError::InvalidNodeId(e.to_string()))?;
        let arr: [u8; 8] = bytes
            .try_into()
            .map_err(|_| CoreError::InvalidNodeId("expected 8 bytes".into()))?;
        Ok(Self(arr))
    }

    /// The zero node ID (used by watermark timestamps).
    pub const ZERO: Self = Self([0u8; 8]);
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.to_hex())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Per-tenant shared secret authorizing appends at the relay.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WriteKey(pub [u8; 16]);

impl WriteKey {
    /// Create from raw bytes.
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Generate a random write key.
    pub fn random() -> Self {
        Self(rand::thread_rng().gen())
    }

    /// Get the raw bytes.
    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Compare without an early exit, so timing does not reveal the position
    /// of the first differing byte.
    pub fn ct_eq(&self, other: &WriteKey) -> bool {
        self.0
            .iter()
            .zip(other.0.iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

impl fmt::Debug for WriteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("WriteKey(..)")
    }
}
