//! # Tessera Keys
//!
//! Owner secrets, key derivation, and encryption of change payloads.
//!
//! ## Key Model
//!
//! An owner is a single 32-byte [`OwnerSecret`]. Three values are derived
//! from it with blake3 `derive_key`:
//!
//! 1. **Owner id**: routes the replica to its tenant at the relay
//! 2. **Encryption key**: seals every change before it leaves the client
//! 3. **Write key**: authorizes appends at the relay
//!
//! The relay sees only the owner id and the write key, never plaintext.
//!
//! ## Usage
//!
//! ```rust
//! use tessera_keys::{open, seal, Owner, OwnerSecret};
//!
//! let secret = OwnerSecret::generate();
//! let owner = Owner::from_secret(&secret);
//!
//! let sealed = seal(b"change bytes", &owner.encryption_key).unwrap();
//! assert_eq!(open(&sealed, &owner.encryption_key).unwrap(), b"change bytes");
//! ```

pub mod crypto;
pub mod envelope;
pub mod error;
pub mod owner;
pub mod secret;

pub use crypto::EncryptionKey;
pub use envelope::{open, seal, SEAL_OVERHEAD};
pub use error::{KeysError, Result};
pub use owner::Owner;
pub use secret::{OwnerSecret, Secret};
