//! Sealed change payloads.
//!
//! Wire form: `nonce (12 bytes) || ciphertext || tag (16 bytes)`. Every seal
//! draws a fresh random nonce, so sealing the same change twice yields
//! different bytes.

use chacha20poly1305::{aead::Aead, Nonce};
use rand::RngCore;

use crate::crypto::EncryptionKey;
use crate::error::{KeysError, Result};

pub const NONCE_LEN: usize = 12;

/// Poly1305 tag length.
pub const TAG_LEN: usize = 16;

/// Bytes added by sealing.
pub const SEAL_OVERHEAD: usize = NONCE_LEN + TAG_LEN;

/// Seal plaintext into wire bytes.
pub fn seal(plaintext: &[u8], key: &EncryptionKey) -> Result<Vec<u8>> {
    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);

    let ciphertext = key
        .cipher()
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|e| KeysError::EncryptionError(e.to_string()))?;

    let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    sealed.extend_from_slice(&nonce);
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

/// Open wire bytes produced by [`seal`].
pub fn open(sealed: &[u8], key: &EncryptionKey) -> Result<Vec<u8>> {
    if sealed.len() < SEAL_OVERHEAD {
        return Err(KeysError::Malformed(format!(
            "{} bytes is shorter than nonce and tag",
            sealed.len()
        )));
    }
    let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
    key.cipher()
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|e| KeysError::DecryptionError(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_seal_open() {
        let key = EncryptionKey::generate();
        let sealed = seal(b"hello, encrypted world!", &key).unwrap();
        assert_eq!(sealed.len(), 23 + SEAL_OVERHEAD);
        assert_eq!(open(&sealed, &key).unwrap(), b"hello, encrypted world!");
    }

    #[test]
    fn test_wrong_key_fails() {
        let sealed = seal(b"secret", &EncryptionKey::generate()).unwrap();
        assert!(open(&sealed, &EncryptionKey::generate()).is_err());
    }

    #[test]
    fn test_tampered_fails() {
        let key = EncryptionKey::generate();
        let mut sealed = seal(b"secret", &key).unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 1;
        assert!(open(&sealed, &key).is_err());
    }

    #[test]
    fn test_truncated_is_malformed() {
        let key = EncryptionKey::generate();
        assert!(matches!(open(&[0u8; 10], &key), Err(KeysError::Malformed(_))));
    }

    #[test]
    fn test_nonces_differ() {
        let key = EncryptionKey::generate();
        let a = seal(b"same", &key).unwrap();
        let b = seal(b"same", &key).unwrap();
        assert_ne!(a, b);
    }

    proptest! {
        #[test]
        fn prop_any_flipped_byte_rejected(
            payload in prop::collection::vec(any::<u8>(), 0..256),
            index in any::<prop::sample::Index>(),
            bit in 0u8..8,
        ) {
            let key = EncryptionKey::from_bytes([7; 32]);
            let mut sealed = seal(&payload, &key).unwrap();
            let i = index.index(sealed.len());
            sealed[i] ^= 1 << bit;
            prop_assert!(open(&sealed, &key).is_err());
        }
    }
}
