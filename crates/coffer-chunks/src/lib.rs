//! coffer-chunks: fixed-size chunk layout and BLAKE3 checksums
//!
//! Files are split into fixed-size plaintext chunks; every chunk (the last
//! one included) carries the same encryption overhead once sealed. Byte
//! ranges for chunk-indexed downloads are computed against the stored
//! ciphertext length.

pub mod checksum;
pub mod layout;

pub use checksum::{checksum, hash_bytes, hash_from_hex, hash_to_hex, verify_checksum, Hash};
pub use layout::{ByteRange, ChunkLayout, DEFAULT_CHUNK_SIZE};
