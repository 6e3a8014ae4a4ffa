//! Account keypairs (age X25519) and asymmetric key wrapping

use std::str::FromStr;

use age::secrecy::ExposeSecret;
use age::x25519::{Identity, Recipient};
use coffer_core::VaultResult;
use zeroize::Zeroize;

use crate::chunk::{decrypt_chunk, encrypt_chunk};
use crate::crypto_err;
use crate::keys::SymmetricKey;

/// One user's asymmetric keypair. The identity never leaves memory in
/// plaintext; at rest it is sealed under the user key.
pub struct AccountKeypair {
    identity: Identity,
    recipient: Recipient,
}

impl AccountKeypair {
    pub fn generate() -> Self {
        let identity = Identity::generate();
        let recipient = identity.to_public();
        Self {
            identity,
            recipient,
        }
    }

    /// The `age1...` public key string stored on the account.
    pub fn public_key(&self) -> String {
        self.recipient.to_string()
    }

    /// Seal the identity under `user_key` for storage.
    pub fn protect(&self, user_key: &SymmetricKey) -> VaultResult<Vec<u8>> {
        let secret = self.identity.to_string();
        encrypt_chunk(user_key, secret.expose_secret().as_bytes())
    }

    /// Recover a keypair sealed by [`AccountKeypair::protect`].
    pub fn unprotect(user_key: &SymmetricKey, protected: &[u8]) -> VaultResult<Self> {
        let mut plaintext = decrypt_chunk(user_key, protected)
            .map_err(|_| crypto_err("unable to decrypt private key: wrong password"))?;

        let parsed = std::str::from_utf8(&plaintext)
            .map_err(|_| crypto_err("private key is not valid UTF-8"))
            .and_then(|s| {
                Identity::from_str(s).map_err(|e| crypto_err(format!("invalid private key: {e}")))
            });
        plaintext.zeroize();

        let identity = parsed?;
        let recipient = identity.to_public();
        Ok(Self {
            identity,
            recipient,
        })
    }

    /// Encrypt arbitrary bytes to this account's public key.
    pub fn encrypt(&self, plaintext: &[u8]) -> VaultResult<Vec<u8>> {
        age::encrypt(&self.recipient, plaintext)
            .map_err(|e| crypto_err(format!("asymmetric encryption failed: {e}")))
    }

    /// Decrypt bytes encrypted to this account's public key.
    pub fn decrypt(&self, ciphertext: &[u8]) -> VaultResult<Vec<u8>> {
        age::decrypt(&self.identity, ciphertext)
            .map_err(|e| crypto_err(format!("asymmetric decryption failed: {e}")))
    }

    /// Unwrap a symmetric key wrapped to this account's public key.
    pub fn unwrap_key(&self, wrapped: &[u8]) -> VaultResult<SymmetricKey> {
        let mut plaintext = self.decrypt(wrapped)?;
        let key = SymmetricKey::from_slice(&plaintext);
        plaintext.zeroize();
        key
    }
}

impl std::fmt::Debug for AccountKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountKeypair")
            .field("public_key", &self.public_key())
            .field("identity", &"[REDACTED]")
            .finish()
    }
}

fn parse_recipient(public_key: &str) -> VaultResult<Recipient> {
    Recipient::from_str(public_key.trim())
        .map_err(|e| crypto_err(format!("invalid public key '{public_key}': {e}")))
}

/// Wrap `key` for the holder of `public_key` (an `age1...` string).
pub fn wrap_for_recipient(public_key: &str, key: &SymmetricKey) -> VaultResult<Vec<u8>> {
    let recipient = parse_recipient(public_key)?;
    age::encrypt(&recipient, key.as_bytes())
        .map_err(|e| crypto_err(format!("key wrapping for recipient failed: {e}")))
}
