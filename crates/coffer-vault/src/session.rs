//! Client-side session: the unlocked keypair plus derived folder contexts.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use coffer_core::types::{VaultFolder, VaultItem};
use coffer_core::{VaultError, VaultResult};
use coffer_crypto::{decrypt_chunk, derive_context, AccountKeypair, CryptoContext, SymmetricKey};
use secrecy::SecretString;
use tracing::{debug, warn};

use crate::account::normalize_identifier;
use crate::ownership::{key_sequence, resolve_folder_ref};
use crate::vault::Vault;

/// Derived folder contexts keyed by canonical folder id.
#[derive(Debug, Default)]
pub struct ContextCache {
    entries: RwLock<HashMap<String, CryptoContext>>,
}

impl ContextCache {
    pub fn get(&self, folder_id: &str) -> Option<CryptoContext> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(folder_id)
            .cloned()
    }

    pub fn insert(&self, folder_id: &str, context: CryptoContext) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(folder_id.to_string(), context);
    }

    pub fn invalidate(&self, folder_id: &str) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(folder_id);
    }

    pub fn clear(&self) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug)]
pub struct VaultSession {
    user_id: String,
    keypair: Arc<AccountKeypair>,
    contexts: ContextCache,
}

impl VaultSession {
    pub fn new(user_id: impl Into<String>, keypair: AccountKeypair) -> Self {
        Self {
            user_id: user_id.into(),
            keypair: Arc::new(keypair),
            contexts: ContextCache::default(),
        }
    }

    /// Unlock an account, asking `prompt` for a password up to the
    /// configured number of attempts.
    ///
    /// `prompt` receives the 1-based attempt number and may return None to
    /// give up early. Only wrong-password failures are retried.
    pub fn unlock<F>(vault: &Vault, identifier: &str, mut prompt: F) -> VaultResult<Self>
    where
        F: FnMut(u32) -> Option<SecretString>,
    {
        let attempts = vault.options().max_unlock_attempts.max(1);
        let mut failures = Vec::new();

        for attempt in 1..=attempts {
            let Some(password) = prompt(attempt) else {
                break;
            };
            match vault.unlock_account(identifier, &password) {
                Ok(keypair) => return Ok(Self::new(normalize_identifier(identifier), keypair)),
                Err(VaultError::Crypto(msg)) => {
                    warn!(attempt, attempts, "unlock attempt failed");
                    failures.push(format!("attempt {attempt}: {msg}"));
                }
                Err(e) => return Err(e),
            }
        }

        if failures.is_empty() {
            return Err(VaultError::Crypto("unlock cancelled".into()));
        }
        Err(VaultError::Crypto(format!(
            "unable to unlock account: {}",
            failures.join("; ")
        )))
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn keypair(&self) -> &Arc<AccountKeypair> {
        &self.keypair
    }

    pub fn contexts(&self) -> &ContextCache {
        &self.contexts
    }

    /// The context that wraps keys of `folder_id`'s children, derived from
    /// the folder's key sequence on first use.
    pub fn folder_context(&self, vault: &Vault, folder_id: &str) -> VaultResult<CryptoContext> {
        let ref_id = resolve_folder_ref(vault.store(), folder_id)?;
        if let Some(ctx) = self.contexts.get(&ref_id) {
            return Ok(ctx);
        }

        let sequence = key_sequence(vault.store(), &ref_id, &self.user_id)?;
        let ctx = derive_context(&self.keypair, &sequence)?;
        debug!(folder_id = %ref_id, depth = sequence.len(), "cached folder context");
        self.contexts.insert(&ref_id, ctx.clone());
        Ok(ctx)
    }

    /// Recover an item's symmetric key through its folder's context.
    pub fn item_key(&self, vault: &Vault, item: &VaultItem) -> VaultResult<SymmetricKey> {
        self.folder_context(vault, &item.folder_id)?
            .unwrap_key(&item.protected_key)
    }

    pub fn item_name(&self, vault: &Vault, item: &VaultItem) -> VaultResult<String> {
        let key = self.item_key(vault, item)?;
        utf8(decrypt_chunk(&key, &item.name)?)
    }

    /// Folder names are sealed under the folder's own key.
    pub fn folder_name(&self, vault: &Vault, folder: &VaultFolder) -> VaultResult<String> {
        if folder.is_root() {
            return Ok(String::new());
        }
        let ctx = self.folder_context(vault, &folder.id)?;
        let key = ctx
            .folder_key()
            .ok_or_else(|| VaultError::Invalid(format!("folder {} has no key", folder.id)))?;
        utf8(decrypt_chunk(key, &folder.name)?)
    }
}

fn utf8(bytes: Vec<u8>) -> VaultResult<String> {
    String::from_utf8(bytes).map_err(|_| VaultError::Crypto("name is not valid UTF-8".into()))
}
