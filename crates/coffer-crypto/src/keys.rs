//! Symmetric item/folder keys and symmetric key wrapping

use coffer_core::VaultResult;
use rand::RngCore;
use zeroize::Zeroize;

use crate::chunk::{decrypt_chunk, encrypt_chunk};
use crate::{crypto_err, KEY_SIZE, TOTAL_OVERHEAD};

/// A 256-bit folder, item, or user key. Zeroized on drop.
#[derive(Clone)]
pub struct SymmetricKey {
    bytes: [u8; KEY_SIZE],
}

impl SymmetricKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    /// Build a key from a 32-byte slice.
    pub fn from_slice(slice: &[u8]) -> VaultResult<Self> {
        if slice.len() != KEY_SIZE {
            return Err(crypto_err(format!(
                "key has wrong size: {} bytes (expected {KEY_SIZE})",
                slice.len()
            )));
        }
        let mut bytes = [0u8; KEY_SIZE];
        bytes.copy_from_slice(slice);
        Ok(Self { bytes })
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl Drop for SymmetricKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SymmetricKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Generate a random 256-bit key.
pub fn generate_key() -> SymmetricKey {
    let mut bytes = [0u8; KEY_SIZE];
    rand::thread_rng().fill_bytes(&mut bytes);
    SymmetricKey::from_bytes(bytes)
}

/// Wrap `key` under `wrapping`. Output: `[24-byte nonce][ciphertext + 16-byte tag]`
pub fn wrap_key(wrapping: &SymmetricKey, key: &SymmetricKey) -> VaultResult<Vec<u8>> {
    encrypt_chunk(wrapping, key.as_bytes())
}

/// Unwrap a key produced by [`wrap_key`].
pub fn unwrap_key(wrapping: &SymmetricKey, wrapped: &[u8]) -> VaultResult<SymmetricKey> {
    if wrapped.len() != KEY_SIZE + TOTAL_OVERHEAD {
        return Err(crypto_err(format!(
            "wrapped key has wrong size: {} bytes (expected {})",
            wrapped.len(),
            KEY_SIZE + TOTAL_OVERHEAD
        )));
    }

    let mut plaintext = decrypt_chunk(wrapping, wrapped)
        .map_err(|_| crypto_err("key unwrapping failed: wrong wrapping key or corrupted data"))?;
    let key = SymmetricKey::from_slice(&plaintext);
    plaintext.zeroize();
    key
}
