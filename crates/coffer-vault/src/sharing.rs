//! Sharing: re-wrap an item or folder key to a recipient and give them a
//! shadow row that points at the canonical one.
//!
//! Only the direct owner of a canonical row may share it. The shadow lands
//! in the recipient's root and never copies payload bytes.

use coffer_core::types::{Shadow, ShareInfo, SharingEntry, VaultFolder, VaultItem};
use coffer_core::{VaultError, VaultResult};
use coffer_crypto::wrap_for_recipient;
use tracing::info;
use uuid::Uuid;

use crate::account::normalize_identifier;
use crate::ownership::check_folder_ownership;
use crate::session::VaultSession;
use crate::vault::Vault;

impl Vault {
    pub fn share_item(
        &self,
        session: &VaultSession,
        item_id: &str,
        recipient: &str,
        can_modify: bool,
    ) -> VaultResult<ShareInfo> {
        let owner_id = session.user_id();
        let recipient_id = self.check_recipient(owner_id, recipient)?;

        let item = self
            .store
            .get_item(item_id)
            .ok_or_else(|| VaultError::not_found(format!("item {item_id}")))?;
        if item.owner_id != owner_id || !item.is_owner() {
            return Err(VaultError::Permission(
                "only the owner of an item can share it".into(),
            ));
        }
        if !check_folder_ownership(self.store(), &item.folder_id, owner_id)?.is_owner {
            return Err(VaultError::Permission(
                "items inside a shared folder cannot be re-shared".into(),
            ));
        }
        if self
            .store
            .is_shared_with_recipient(owner_id, &item.id, &recipient_id)
        {
            return Err(VaultError::AlreadyShared);
        }

        let account = self.store.get_account(&recipient_id)?;
        let key = session.item_key(self, &item)?;
        let shadow = VaultItem {
            id: Uuid::new_v4().to_string(),
            ref_id: item.id.clone(),
            folder_id: recipient_id.clone(),
            owner_id: recipient_id.clone(),
            protected_key: wrap_for_recipient(&account.public_key, &key)?,
            modified: coffer_core::unix_now(),
            can_modify,
            shared_by: Some(owner_id.to_string()),
            shared_with: 0,
            ..item
        };

        let entry = SharingEntry {
            id: Uuid::new_v4().to_string(),
            owner_id: owner_id.to_string(),
            item_id: shadow.ref_id.clone(),
            recipient_id,
            shadow_id: shadow.id.clone(),
            is_folder: false,
            can_modify,
        };
        self.store
            .add_sharing_entry(entry.clone(), Shadow::Item(shadow))?;

        info!(share_id = %entry.id, item_id, recipient = %entry.recipient_id, can_modify, "item shared");
        Ok(ShareInfo::from(&entry))
    }

    pub fn share_folder(
        &self,
        session: &VaultSession,
        folder_id: &str,
        recipient: &str,
        can_modify: bool,
    ) -> VaultResult<ShareInfo> {
        let owner_id = session.user_id();
        let recipient_id = self.check_recipient(owner_id, recipient)?;

        let folder = self
            .store
            .get_folder(folder_id)
            .ok_or_else(|| VaultError::not_found(format!("folder {folder_id}")))?;
        if folder.is_root() {
            return Err(VaultError::Permission("the root folder cannot be shared".into()));
        }
        if folder.owner_id != owner_id || !folder.is_owner() {
            return Err(VaultError::Permission(
                "only the owner of a folder can share it".into(),
            ));
        }
        if !check_folder_ownership(self.store(), &folder.id, owner_id)?.is_owner {
            return Err(VaultError::Permission(
                "folders inside a shared folder cannot be re-shared".into(),
            ));
        }
        if self
            .store
            .is_shared_with_recipient(owner_id, &folder.id, &recipient_id)
        {
            return Err(VaultError::AlreadyShared);
        }

        let account = self.store.get_account(&recipient_id)?;
        let ctx = session.folder_context(self, &folder.id)?;
        let key = ctx
            .folder_key()
            .ok_or_else(|| VaultError::Invalid(format!("folder {folder_id} has no key")))?;
        let shadow = VaultFolder {
            id: Uuid::new_v4().to_string(),
            ref_id: folder.id.clone(),
            parent_id: Some(recipient_id.clone()),
            owner_id: recipient_id.clone(),
            protected_key: wrap_for_recipient(&account.public_key, key)?,
            modified: coffer_core::unix_now(),
            can_modify,
            shared_by: Some(owner_id.to_string()),
            shared_with: 0,
            ..folder
        };

        let entry = SharingEntry {
            id: Uuid::new_v4().to_string(),
            owner_id: owner_id.to_string(),
            item_id: shadow.ref_id.clone(),
            recipient_id,
            shadow_id: shadow.id.clone(),
            is_folder: true,
            can_modify,
        };
        self.store
            .add_sharing_entry(entry.clone(), Shadow::Folder(shadow))?;

        info!(share_id = %entry.id, folder_id, recipient = %entry.recipient_id, can_modify, "folder shared");
        Ok(ShareInfo::from(&entry))
    }

    /// Current recipients of something `owner_id` has shared.
    pub fn share_info(&self, owner_id: &str, item_id: &str) -> Vec<ShareInfo> {
        self.store.get_share_info(owner_id, item_id)
    }

    /// Change a recipient's write permission. The wrapped key is untouched.
    pub fn edit_share(
        &self,
        owner_id: &str,
        share_id: &str,
        can_modify: bool,
    ) -> VaultResult<ShareInfo> {
        let entry = self
            .store
            .update_share_permission(owner_id, share_id, can_modify)?;
        info!(share_id, can_modify, "share permission changed");
        Ok(ShareInfo::from(&entry))
    }

    /// Revoke a share, removing the recipient's shadow with it.
    pub fn remove_share(&self, owner_id: &str, share_id: &str) -> VaultResult<()> {
        let entry = self.store.remove_sharing_entry(owner_id, share_id)?;
        info!(share_id, recipient = %entry.recipient_id, "share removed");
        Ok(())
    }

    fn check_recipient(&self, owner_id: &str, recipient: &str) -> VaultResult<String> {
        let recipient_id = normalize_identifier(recipient);
        if recipient_id == owner_id {
            return Err(VaultError::Permission("cannot share with yourself".into()));
        }
        Ok(recipient_id)
    }
}
