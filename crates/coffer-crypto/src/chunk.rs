//! Per-chunk XChaCha20-Poly1305 encryption/decryption
//!
//! Encrypted chunk format (binary):
//! ```text
//! [24 bytes: random nonce][N bytes: ciphertext][16 bytes: Poly1305 tag]
//! ```
//!
//! Chunks are sealed independently so any one of them can be fetched by
//! byte range and opened on its own. The same codec seals names, password
//! entries, and the account identity.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use coffer_core::VaultResult;
use rand::RngCore;

use crate::keys::SymmetricKey;
use crate::{crypto_err, NONCE_SIZE, TOTAL_OVERHEAD};

/// Encrypt a single chunk. Returns `[24-byte nonce][ciphertext][16-byte tag]`.
pub fn encrypt_chunk(key: &SymmetricKey, plaintext: &[u8]) -> VaultResult<Vec<u8>> {
    let cipher = XChaCha20Poly1305::new(key.as_bytes().into());

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = XNonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|e| crypto_err(format!("chunk encryption failed: {e}")))?;

    let mut result = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    result.extend_from_slice(&nonce_bytes);
    result.extend_from_slice(&ciphertext);
    Ok(result)
}

/// Decrypt a single chunk produced by [`encrypt_chunk`].
///
/// Fails with `VaultError::Crypto` on a bad tag; callers must abort the
/// whole transfer rather than skip the chunk.
pub fn decrypt_chunk(key: &SymmetricKey, encrypted: &[u8]) -> VaultResult<Vec<u8>> {
    if encrypted.len() < TOTAL_OVERHEAD {
        return Err(crypto_err(format!(
            "encrypted chunk too short: {} bytes (minimum {})",
            encrypted.len(),
            TOTAL_OVERHEAD
        )));
    }

    let (nonce_bytes, ciphertext) = encrypted.split_at(NONCE_SIZE);
    let nonce = XNonce::from_slice(nonce_bytes);
    let cipher = XChaCha20Poly1305::new(key.as_bytes().into());

    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| crypto_err("chunk authentication failed: wrong key or corrupted data"))
}
