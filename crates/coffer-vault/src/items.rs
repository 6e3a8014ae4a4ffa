//! Item lookup, rename, delete, and password entries.
//!
//! A password entry is an item with no payload: its secret is sealed under
//! the item key and stored inline.

use coffer_core::types::VaultItem;
use coffer_core::{VaultError, VaultResult};
use coffer_crypto::{decrypt_chunk, encrypt_chunk, generate_key};
use tracing::info;
use uuid::Uuid;

use crate::ownership::check_folder_ownership;
use crate::session::VaultSession;
use crate::vault::Vault;

impl Vault {
    /// Fetch an item the user can see.
    pub fn get_item(&self, user_id: &str, item_id: &str) -> VaultResult<VaultItem> {
        self.item_access(user_id, item_id).map(|(item, _)| item)
    }

    pub fn add_password(
        &self,
        session: &VaultSession,
        folder_id: &str,
        name: &str,
        secret: &[u8],
    ) -> VaultResult<VaultItem> {
        if name.trim().is_empty() {
            return Err(VaultError::Invalid("entry name is empty".into()));
        }
        let folder = check_folder_ownership(self.store(), folder_id, session.user_id())?;
        if !folder.can_modify {
            return Err(VaultError::ReadOnly);
        }

        let ctx = session.folder_context(self, &folder.ref_id)?;
        let key = generate_key();
        let id = Uuid::new_v4().to_string();
        let item = VaultItem {
            id: id.clone(),
            ref_id: id,
            folder_id: folder.ref_id,
            owner_id: folder.canonical_owner,
            name: encrypt_chunk(&key, name.as_bytes())?,
            protected_key: ctx.wrap_key(&key)?,
            size: 0,
            chunks: 0,
            object_id: None,
            stored_length: 0,
            modified: coffer_core::unix_now(),
            can_modify: true,
            shared_by: None,
            shared_with: 0,
            password_data: Some(encrypt_chunk(&key, secret)?),
        };

        self.store.insert_item(item.clone())?;
        info!(item_id = %item.id, "password entry added");
        Ok(item)
    }

    pub fn read_password(&self, session: &VaultSession, item_id: &str) -> VaultResult<Vec<u8>> {
        let (item, _) = self.item_access(session.user_id(), item_id)?;
        let sealed = item
            .password_data
            .as_deref()
            .ok_or_else(|| VaultError::Invalid(format!("item {item_id} is not a password entry")))?;
        let key = session.item_key(self, &item)?;
        decrypt_chunk(&key, sealed)
    }

    /// Rename an item. Every row sharing the payload sees the new name.
    pub fn rename_item(&self, session: &VaultSession, item_id: &str, name: &str) -> VaultResult<()> {
        if name.trim().is_empty() {
            return Err(VaultError::Invalid("item name is empty".into()));
        }
        let (item, can_modify) = self.item_access(session.user_id(), item_id)?;
        if !can_modify {
            return Err(VaultError::ReadOnly);
        }
        let key = session.item_key(self, &item)?;
        self.store
            .rename_item(&item.ref_id, encrypt_chunk(&key, name.as_bytes())?)
    }

    /// Delete an item. A shadow only loses the caller's copy; the canonical
    /// item takes its payload and every share with it. Deleting a missing
    /// item succeeds.
    pub async fn delete_item(&self, user_id: &str, item_id: &str) -> VaultResult<()> {
        let Some(item) = self.store.get_item(item_id) else {
            return Ok(());
        };
        if item.owner_id == user_id && !item.is_owner() {
            self.store.delete_item_row(&item.id)?;
            info!(item_id = %item.id, user = user_id, "shared item removed");
            return Ok(());
        }

        let can_modify = item.owner_id == user_id
            || check_folder_ownership(self.store(), &item.folder_id, user_id)?.can_modify;
        if !can_modify {
            return Err(VaultError::ReadOnly);
        }
        self.purge_item(&item).await
    }
}
