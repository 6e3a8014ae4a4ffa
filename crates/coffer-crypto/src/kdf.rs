//! Key derivation: Argon2id (identifier, password) → user key

use argon2::{Algorithm, Argon2, Params, Version};
use coffer_core::VaultResult;
use secrecy::{ExposeSecret, SecretString};

use crate::keys::SymmetricKey;
use crate::{crypto_err, KEY_SIZE};

/// Argon2id parameters for KDF
#[derive(Debug, Clone)]
pub struct KdfParams {
    /// Memory cost in KiB (default: 65536 = 64 MiB)
    pub mem_cost_kib: u32,
    /// Time cost / iterations (default: 3)
    pub time_cost: u32,
    /// Parallelism (default: 4)
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            mem_cost_kib: 65536,
            time_cost: 3,
            parallelism: 4,
        }
    }
}

impl From<&coffer_core::config::VaultConfig> for KdfParams {
    fn from(cfg: &coffer_core::config::VaultConfig) -> Self {
        Self {
            mem_cost_kib: cfg.argon2_mem_cost_kib,
            time_cost: cfg.argon2_time_cost,
            parallelism: cfg.argon2_parallelism,
        }
    }
}

/// Salt derived from the account identifier, so the user key can be
/// re-derived from credentials alone.
pub fn salt_for_identifier(identifier: &str) -> [u8; 16] {
    let digest = blake3::hash(identifier.trim().to_lowercase().as_bytes());
    let mut salt = [0u8; 16];
    salt.copy_from_slice(&digest.as_bytes()[..16]);
    salt
}

/// Derive the 256-bit user key that seals an account's private key.
pub fn derive_user_key(
    identifier: &str,
    password: &SecretString,
    params: &KdfParams,
) -> VaultResult<SymmetricKey> {
    let argon2_params = Params::new(
        params.mem_cost_kib,
        params.time_cost,
        params.parallelism,
        Some(KEY_SIZE),
    )
    .map_err(|e| crypto_err(format!("invalid Argon2id params: {e}")))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon2_params);

    let salt = salt_for_identifier(identifier);
    let mut key = [0u8; KEY_SIZE];
    argon2
        .hash_password_into(password.expose_secret().as_bytes(), &salt, &mut key)
        .map_err(|e| crypto_err(format!("Argon2id KDF failed: {e}")))?;

    Ok(SymmetricKey::from_bytes(key))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast() -> KdfParams {
        KdfParams {
            mem_cost_kib: 1024,
            time_cost: 1,
            parallelism: 1,
        }
    }

    #[test]
    fn test_kdf_deterministic() {
        let pw = SecretString::from("correct horse");
        let k1 = derive_user_key("alice@example.com", &pw, &fast()).unwrap();
        let k2 = derive_user_key("alice@example.com", &pw, &fast()).unwrap();
        assert_eq!(k1.as_bytes(), k2.as_bytes(), "KDF must be deterministic");
    }

    #[test]
    fn test_kdf_identifier_normalized() {
        let pw = SecretString::from("pw");
        let k1 = derive_user_key("Alice@Example.com ", &pw, &fast()).unwrap();
        let k2 = derive_user_key("alice@example.com", &pw, &fast()).unwrap();
        assert_eq!(k1.as_bytes(), k2.as_bytes());
    }

    #[test]
    fn test_kdf_different_passwords() {
        let k1 = derive_user_key("a", &SecretString::from("one"), &fast()).unwrap();
        let k2 = derive_user_key("a", &SecretString::from("two"), &fast()).unwrap();
        assert_ne!(k1.as_bytes(), k2.as_bytes());
    }

    #[test]
    fn test_kdf_different_identifiers() {
        let pw = SecretString::from("same");
        let k1 = derive_user_key("a", &pw, &fast()).unwrap();
        let k2 = derive_user_key("b", &pw, &fast()).unwrap();
        assert_ne!(
            k1.as_bytes(),
            k2.as_bytes(),
            "different salts must produce different keys"
        );
    }
}
