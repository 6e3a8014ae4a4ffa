//! Account creation and unlock.
//!
//! An account id is its normalized identifier, and its root folder shares
//! that id. The private key is stored sealed under the Argon2id user key.

use coffer_core::types::{Account, VaultFolder};
use coffer_core::{VaultError, VaultResult};
use coffer_crypto::{derive_user_key, generate_key, wrap_for_recipient, AccountKeypair};
use secrecy::SecretString;
use tracing::info;

use crate::vault::Vault;

/// Canonical form of an account identifier.
pub fn normalize_identifier(identifier: &str) -> String {
    identifier.trim().to_lowercase()
}

impl Vault {
    /// Create an account with a fresh keypair and an empty root folder.
    pub fn create_account(
        &self,
        identifier: &str,
        password: &SecretString,
    ) -> VaultResult<(Account, AccountKeypair)> {
        let id = normalize_identifier(identifier);
        if id.is_empty() {
            return Err(VaultError::Invalid("account identifier is empty".into()));
        }

        let user_key = derive_user_key(&id, password, &self.options.kdf)?;
        let keypair = AccountKeypair::generate();
        let account = Account {
            id: id.clone(),
            public_key: keypair.public_key(),
            protected_private_key: keypair.protect(&user_key)?,
            storage_used: 0,
            storage_limit: self.options.default_storage_limit,
            send_used: 0,
            send_limit: self.options.default_send_limit,
        };

        let root = VaultFolder {
            id: id.clone(),
            ref_id: id.clone(),
            parent_id: None,
            owner_id: id.clone(),
            name: Vec::new(),
            protected_key: wrap_for_recipient(&account.public_key, &generate_key())?,
            modified: coffer_core::unix_now(),
            can_modify: true,
            shared_by: None,
            shared_with: 0,
        };

        self.store.insert_account(account.clone())?;
        self.store.insert_folder(root)?;
        info!(account = %id, "account created");
        Ok((account, keypair))
    }

    /// Recover an account's keypair. A wrong password is a `Crypto` error.
    pub fn unlock_account(
        &self,
        identifier: &str,
        password: &SecretString,
    ) -> VaultResult<AccountKeypair> {
        let id = normalize_identifier(identifier);
        let account = self.store.get_account(&id)?;
        let user_key = derive_user_key(&id, password, &self.options.kdf)?;
        AccountKeypair::unprotect(&user_key, &account.protected_private_key)
    }

    pub fn account(&self, user_id: &str) -> VaultResult<Account> {
        self.store.get_account(user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vault::testing::vault;

    #[test]
    fn test_create_and_unlock() {
        let v = vault();
        let pw = SecretString::from("hunter2");
        let (account, keypair) = v.create_account("  Alice@Example.com ", &pw).unwrap();
        assert_eq!(account.id, "alice@example.com");

        let unlocked = v.unlock_account("alice@example.com", &pw).unwrap();
        assert_eq!(unlocked.public_key(), keypair.public_key());

        let root = v.store().get_folder("alice@example.com").unwrap();
        assert!(root.is_root());
    }

    #[test]
    fn test_wrong_password_is_crypto_error() {
        let v = vault();
        v.create_account("bob", &SecretString::from("right")).unwrap();
        let err = v.unlock_account("bob", &SecretString::from("wrong")).unwrap_err();
        assert!(matches!(err, VaultError::Crypto(_)));
    }

    #[test]
    fn test_unknown_account_is_not_found() {
        let v = vault();
        let err = v.unlock_account("nobody", &SecretString::from("x")).unwrap_err();
        assert!(matches!(err, VaultError::NotFound(_)));
    }

    #[test]
    fn test_duplicate_and_empty_identifiers() {
        let v = vault();
        let pw = SecretString::from("pw");
        v.create_account("carol", &pw).unwrap();
        assert!(v.create_account("CAROL", &pw).is_err());
        assert!(matches!(
            v.create_account("   ", &pw),
            Err(VaultError::Invalid(_))
        ));
    }
}
