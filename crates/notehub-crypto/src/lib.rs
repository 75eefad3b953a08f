pub mod cache;
pub mod encrypt;
pub mod keys;

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use cache::KeyCache;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("encryption failed")]
    Encrypt,

    /// Tampered ciphertext, or a key derived from a different salt/secret.
    #[error("decryption failed: ciphertext or key mismatch")]
    Decrypt,
}

/// Per-room payload encryption. Keys are derived lazily from the shared
/// secret and the room's stored salt, cached per active room, and evicted
/// after idleness. Eviction is invisible to callers: derivation is
/// deterministic, so a re-derived key decrypts everything the evicted one
/// encrypted.
pub struct EncryptionManager {
    secret: Vec<u8>,
    cache: KeyCache,
}

impl EncryptionManager {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
            cache: KeyCache::new(),
        }
    }

    /// Fetch the room key from the cache, deriving it on first access.
    pub async fn room_key(&self, room_id: Uuid, salt: &[u8]) -> [u8; 32] {
        self.cache
            .get_or_derive(room_id, || keys::derive_room_key(&self.secret, salt, &room_id))
            .await
    }

    /// Encrypt a message payload. Returns (ciphertext, nonce).
    pub async fn encrypt(
        &self,
        room_id: Uuid,
        salt: &[u8],
        plaintext: &[u8],
    ) -> Result<(Vec<u8>, Vec<u8>), CryptoError> {
        let key = self.room_key(room_id, salt).await;
        encrypt::seal(&key, plaintext)
    }

    /// Decrypt a stored message payload.
    pub async fn decrypt(
        &self,
        room_id: Uuid,
        salt: &[u8],
        ciphertext: &[u8],
        nonce: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let key = self.room_key(room_id, salt).await;
        encrypt::open(&key, ciphertext, nonce)
    }

    /// Drop cached keys for rooms idle longer than `max_idle`. Returns the
    /// number of evicted entries.
    pub async fn evict_idle(&self, max_idle: Duration) -> usize {
        self.cache.evict_idle(max_idle).await
    }
}
