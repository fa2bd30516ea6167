//! Owner identity and keys derived from the owner secret.
//!
//! The relay only ever learns [`Owner::id`] and [`Owner::write_key`]. The
//! encryption key never leaves the client.

use tessera_core::{Id, OwnerId, WriteKey};

use crate::crypto::EncryptionKey;
use crate::secret::OwnerSecret;

/// blake3 `derive_key` contexts. Changing any of them changes every owner.
mod contexts {
    pub const OWNER_ID: &str = "tessera 2024-06-01 owner id";
    pub const ENCRYPTION_KEY: &str = "tessera 2024-06-01 encryption key";
    pub const WRITE_KEY: &str = "tessera 2024-06-01 write key";
}

/// A tenant as seen by a replica.
#[derive(Debug, Clone)]
pub struct Owner {
    pub id: OwnerId,
    pub encryption_key: EncryptionKey,
    pub write_key: WriteKey,
}

impl Owner {
    /// Deterministically derive all owner values from the secret.
    pub fn from_secret(secret: &OwnerSecret) -> Self {
        let material = secret.reveal();

        let id_bytes = blake3::derive_key(contexts::OWNER_ID, material);
        let mut id = [0u8; 16];
        id.copy_from_slice(&id_bytes[..16]);

        let encryption_key = blake3::derive_key(contexts::ENCRYPTION_KEY, material);

        let write_bytes = blake3::derive_key(contexts::WRITE_KEY, material);
        let mut write_key = [0u8; 16];
        write_key.copy_from_slice(&write_bytes[..16]);

        Self {
            id: OwnerId(Id::from_hash(id)),
            encryption_key: EncryptionKey::from_bytes(encryption_key),
            write_key: WriteKey::from_bytes(write_key),
        }
    }
}
