//! Folder create, list, rename, and recursive delete.

use std::collections::HashSet;

use coffer_core::types::{FolderOwnership, VaultFolder, VaultItem};
use coffer_core::{VaultError, VaultResult};
use coffer_crypto::{encrypt_chunk, generate_key, CryptoContext};
use tracing::info;
use uuid::Uuid;

use crate::ownership::{check_folder_ownership, key_sequence};
use crate::session::VaultSession;
use crate::vault::Vault;

/// One folder's contents as seen by one user.
#[derive(Debug, Clone)]
pub struct FolderListing {
    pub folder: FolderOwnership,
    /// Wrapped keys from the user's root down to this folder
    pub key_sequence: Vec<Vec<u8>>,
    pub folders: Vec<VaultFolder>,
    pub items: Vec<VaultItem>,
}

impl Vault {
    pub fn create_folder(
        &self,
        session: &VaultSession,
        parent_id: &str,
        name: &str,
    ) -> VaultResult<VaultFolder> {
        if name.trim().is_empty() {
            return Err(VaultError::Invalid("folder name is empty".into()));
        }
        let parent = check_folder_ownership(self.store(), parent_id, session.user_id())?;
        if !parent.can_modify {
            return Err(VaultError::ReadOnly);
        }

        let parent_ctx = session.folder_context(self, &parent.ref_id)?;
        let key = generate_key();
        let id = Uuid::new_v4().to_string();
        let folder = VaultFolder {
            id: id.clone(),
            ref_id: id,
            parent_id: Some(parent.ref_id),
            owner_id: parent.canonical_owner,
            name: encrypt_chunk(&key, name.as_bytes())?,
            protected_key: parent_ctx.wrap_key(&key)?,
            modified: coffer_core::unix_now(),
            can_modify: true,
            shared_by: None,
            shared_with: 0,
        };

        self.store.insert_folder(folder.clone())?;
        session
            .contexts()
            .insert(&folder.id, CryptoContext::Folder(key));
        info!(folder_id = %folder.id, user = session.user_id(), "folder created");
        Ok(folder)
    }

    pub fn list_folder(&self, user_id: &str, folder_id: &str) -> VaultResult<FolderListing> {
        let folder = check_folder_ownership(self.store(), folder_id, user_id)?;
        let key_sequence = key_sequence(self.store(), &folder.ref_id, user_id)?;
        let folders = self.store.subfolders(&folder.ref_id);
        let items = self.store.items_in_folder(&folder.ref_id);
        Ok(FolderListing {
            folder,
            key_sequence,
            folders,
            items,
        })
    }

    pub fn rename_folder(
        &self,
        session: &VaultSession,
        folder_id: &str,
        name: &str,
    ) -> VaultResult<()> {
        if name.trim().is_empty() {
            return Err(VaultError::Invalid("folder name is empty".into()));
        }
        let folder = check_folder_ownership(self.store(), folder_id, session.user_id())?;
        if !folder.can_modify {
            return Err(VaultError::ReadOnly);
        }

        let ctx = session.folder_context(self, &folder.ref_id)?;
        let key = ctx
            .folder_key()
            .ok_or_else(|| VaultError::Invalid("the root folder cannot be renamed".into()))?;
        self.store
            .rename_folder(&folder.ref_id, encrypt_chunk(key, name.as_bytes())?)
    }

    /// Delete a folder and everything beneath it. Deleting a shadow only
    /// removes the caller's copy. Returns the number of folders removed;
    /// a missing folder is already deleted.
    pub async fn delete_folder(&self, user_id: &str, folder_id: &str) -> VaultResult<usize> {
        let Some(row) = self.store.get_folder(folder_id) else {
            return Ok(0);
        };
        if row.is_root() {
            return Err(VaultError::Permission("the root folder cannot be deleted".into()));
        }
        if row.owner_id == user_id && !row.is_owner() {
            self.store.delete_folder_row(&row.id)?;
            info!(folder_id = %row.id, user = user_id, "shared folder removed");
            return Ok(1);
        }

        let folder = check_folder_ownership(self.store(), &row.ref_id, user_id)?;
        if !folder.can_modify {
            return Err(VaultError::ReadOnly);
        }

        // Parents before children
        let mut order = Vec::new();
        let mut seen = HashSet::new();
        let mut stack = vec![folder.ref_id];
        while let Some(id) = stack.pop() {
            if !seen.insert(id.clone()) {
                continue;
            }
            stack.extend(
                self.store
                    .subfolders(&id)
                    .into_iter()
                    .filter(|f| f.is_owner())
                    .map(|f| f.id),
            );
            order.push(id);
        }

        for id in &order {
            for item in self.store.items_in_folder(id) {
                if item.is_owner() {
                    self.purge_item(&item).await?;
                }
            }
        }
        for id in order.iter().rev() {
            self.store.delete_folder(id)?;
        }

        info!(folder_id, folders = order.len(), user = user_id, "folder deleted");
        Ok(order.len())
    }
}
