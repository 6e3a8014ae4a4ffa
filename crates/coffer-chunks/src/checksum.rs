//! BLAKE3 checksums over ciphertext chunks
//!
//! Checksums are independent of the AEAD tag: they let the object store
//! verify what it received and let finalize check part ordering.

use anyhow::Result;

/// A BLAKE3 hash digest (32 bytes), displayed as 64 hex chars
pub type Hash = blake3::Hash;

pub fn hash_bytes(data: &[u8]) -> Hash {
    blake3::hash(data)
}

/// Format a hash as lowercase hex string (64 chars)
pub fn hash_to_hex(hash: &Hash) -> String {
    hash.to_hex().to_string()
}

/// Parse a 64-char hex string into a Hash
pub fn hash_from_hex(hex: &str) -> Result<Hash> {
    blake3::Hash::from_hex(hex)
        .map_err(|e| anyhow::anyhow!("invalid BLAKE3 hex '{}': {}", hex, e))
}

/// Hex checksum of a ciphertext chunk.
pub fn checksum(data: &[u8]) -> String {
    hash_to_hex(&hash_bytes(data))
}

/// Compare `data` against an expected hex checksum.
pub fn verify_checksum(data: &[u8], expected: &str) -> bool {
    match hash_from_hex(expected) {
        // blake3::Hash equality is constant-time
        Ok(want) => hash_bytes(data) == want,
        Err(_) => false,
    }
}
