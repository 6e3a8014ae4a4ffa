//! Folder crypto contexts and key-sequence resolution
//!
//! A key sequence lists wrapped keys from the top of a user's tree down to
//! a target folder. Entry 0 is wrapped to the account public key; entry
//! `i > 0` is wrapped under the key recovered from entry `i - 1`. An empty
//! sequence means the account root, whose context is the keypair itself.

use std::sync::Arc;

use coffer_core::{VaultError, VaultResult};
use tracing::debug;

use crate::chunk::{decrypt_chunk, encrypt_chunk};
use crate::keypair::AccountKeypair;
use crate::keys::{unwrap_key, wrap_key, SymmetricKey};

/// Working encryption context for one folder.
#[derive(Clone, Debug)]
pub enum CryptoContext {
    /// Root folder: wrap to the public key, unwrap with the identity
    Account(Arc<AccountKeypair>),
    /// Any other folder: its recovered symmetric key
    Folder(SymmetricKey),
}

impl CryptoContext {
    /// Wrap a child key (sub-folder or item) under this context.
    pub fn wrap_key(&self, key: &SymmetricKey) -> VaultResult<Vec<u8>> {
        match self {
            CryptoContext::Account(kp) => kp.encrypt(key.as_bytes()),
            CryptoContext::Folder(parent) => wrap_key(parent, key),
        }
    }

    /// Unwrap a child key wrapped under this context.
    pub fn unwrap_key(&self, wrapped: &[u8]) -> VaultResult<SymmetricKey> {
        match self {
            CryptoContext::Account(kp) => kp.unwrap_key(wrapped),
            CryptoContext::Folder(parent) => unwrap_key(parent, wrapped),
        }
    }

    /// Encrypt data directly under this context.
    pub fn encrypt(&self, plaintext: &[u8]) -> VaultResult<Vec<u8>> {
        match self {
            CryptoContext::Account(kp) => kp.encrypt(plaintext),
            CryptoContext::Folder(key) => encrypt_chunk(key, plaintext),
        }
    }

    pub fn decrypt(&self, ciphertext: &[u8]) -> VaultResult<Vec<u8>> {
        match self {
            CryptoContext::Account(kp) => kp.decrypt(ciphertext),
            CryptoContext::Folder(key) => decrypt_chunk(key, ciphertext),
        }
    }

    /// The folder key, if this is not the root context.
    pub fn folder_key(&self) -> Option<&SymmetricKey> {
        match self {
            CryptoContext::Account(_) => None,
            CryptoContext::Folder(key) => Some(key),
        }
    }

    pub fn is_root(&self) -> bool {
        matches!(self, CryptoContext::Account(_))
    }
}

/// Walk `key_sequence` from the account keypair down to the target folder.
///
/// Any unwrap failure is reported as `VaultError::Crypto` naming the depth
/// it happened at; it is never folded into a not-found error.
pub fn derive_context(
    keypair: &Arc<AccountKeypair>,
    key_sequence: &[Vec<u8>],
) -> VaultResult<CryptoContext> {
    let Some((first, rest)) = key_sequence.split_first() else {
        return Ok(CryptoContext::Account(Arc::clone(keypair)));
    };

    let mut key = keypair.unwrap_key(first).map_err(|e| {
        VaultError::Crypto(format!("key sequence broken at depth 0: {e}"))
    })?;

    for (depth, wrapped) in rest.iter().enumerate() {
        key = unwrap_key(&key, wrapped).map_err(|e| {
            VaultError::Crypto(format!("key sequence broken at depth {}: {e}", depth + 1))
        })?;
    }

    debug!(depth = key_sequence.len(), "derived folder context");
    Ok(CryptoContext::Folder(key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::generate_key;
    use crate::keypair::wrap_for_recipient;

    /// Build a chain root -> f1 -> f2 -> ... and return (keys, sequence).
    fn chain(kp: &AccountKeypair, depth: usize) -> (Vec<SymmetricKey>, Vec<Vec<u8>>) {
        let mut keys = Vec::new();
        let mut seq = Vec::new();
        for i in 0..depth {
            let key = generate_key();
            let wrapped = if i == 0 {
                wrap_for_recipient(&kp.public_key(), &key).unwrap()
            } else {
                wrap_key(&keys[i - 1], &key).unwrap()
            };
            keys.push(key);
            seq.push(wrapped);
        }
        (keys, seq)
    }

    #[test]
    fn test_empty_sequence_is_account_context() {
        let kp = Arc::new(AccountKeypair::generate());
        let ctx = derive_context(&kp, &[]).unwrap();
        assert!(ctx.is_root());

        let sealed = ctx.encrypt(b"root data").unwrap();
        assert_eq!(ctx.decrypt(&sealed).unwrap(), b"root data");
    }

    #[test]
    fn test_nested_chain_yields_leaf_key() {
        let kp = Arc::new(AccountKeypair::generate());
        let (keys, seq) = chain(&kp, 4);

        let ctx = derive_context(&kp, &seq).unwrap();
        assert_eq!(ctx.folder_key().unwrap().as_bytes(), keys[3].as_bytes());

        // Deterministic across calls
        let again = derive_context(&kp, &seq).unwrap();
        assert_eq!(
            ctx.folder_key().unwrap().as_bytes(),
            again.folder_key().unwrap().as_bytes()
        );
    }

    #[test]
    fn test_wrong_account_is_crypto_error() {
        let owner = AccountKeypair::generate();
        let other = Arc::new(AccountKeypair::generate());
        let (_, seq) = chain(&owner, 2);

        let err = derive_context(&other, &seq).unwrap_err();
        assert!(matches!(err, VaultError::Crypto(ref m) if m.contains("depth 0")));
    }

    #[test]
    fn test_corrupted_link_reports_depth() {
        let kp = Arc::new(AccountKeypair::generate());
        let (_, mut seq) = chain(&kp, 3);
        seq[2][30] ^= 0xFF;

        let err = derive_context(&kp, &seq).unwrap_err();
        assert!(matches!(err, VaultError::Crypto(ref m) if m.contains("depth 2")));
    }

    #[test]
    fn test_context_wraps_children() {
        let kp = Arc::new(AccountKeypair::generate());
        let (_, seq) = chain(&kp, 1);
        let ctx = derive_context(&kp, &seq).unwrap();

        let child = generate_key();
        let wrapped = ctx.wrap_key(&child).unwrap();
        assert_eq!(ctx.unwrap_key(&wrapped).unwrap().as_bytes(), child.as_bytes());
    }
}
