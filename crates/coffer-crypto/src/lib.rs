//! coffer-crypto: vault encryption primitives
//!
//! Key hierarchy:
//! ```text
//! Password ──Argon2id──▶ User Key
//!   └── Account Keypair (age X25519, identity sealed under the user key)
//!         ├── Root context: wrap with the public key, unwrap with the identity
//!         └── Folder Key (256-bit random, wrapped under its parent's context)
//!               ├── Sub-folder keys (wrapped under this folder key)
//!               └── Item Key (256-bit random, wrapped under the folder key)
//!                     └── Chunk AEAD: XChaCha20-Poly1305 (key=item_key, nonce=random_192bit)
//! ```
//!
//! Sharing wraps an item or folder key under the recipient's public key;
//! payload chunks are never re-encrypted.

pub mod chunk;
pub mod context;
pub mod kdf;
pub mod keypair;
pub mod keys;

pub use chunk::{decrypt_chunk, encrypt_chunk};
pub use context::{derive_context, CryptoContext};
pub use kdf::{derive_user_key, salt_for_identifier, KdfParams};
pub use keypair::{wrap_for_recipient, AccountKeypair};
pub use keys::{generate_key, unwrap_key, wrap_key, SymmetricKey};

/// Size of a symmetric key in bytes (256-bit)
pub const KEY_SIZE: usize = 32;

/// Size of an XChaCha20-Poly1305 nonce (192-bit)
pub const NONCE_SIZE: usize = 24;

/// Size of a Poly1305 authentication tag
pub const TAG_SIZE: usize = 16;

/// Bytes every encrypted chunk carries on top of its plaintext
pub const TOTAL_OVERHEAD: usize = NONCE_SIZE + TAG_SIZE;

pub(crate) fn crypto_err(msg: impl Into<String>) -> coffer_core::VaultError {
    coffer_core::VaultError::Crypto(msg.into())
}
