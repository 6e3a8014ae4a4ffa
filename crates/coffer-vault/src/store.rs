//! Metadata store: accounts, folders, items, shares, upload sessions, and
//! ephemeral-transfer rows.
//!
//! `VaultStore` is the persistence seam. `JsonStore` keeps every table in
//! memory behind one lock, so each trait call is a single transaction
//! (share insert/edit/remove touch two tables atomically). When opened with
//! a path it is flushed atomically via temp+rename, and on drop.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use coffer_core::types::{
    Account, DownloadProgress, FileExpiry, FileMetadata, Shadow, ShareInfo, SharingEntry,
    UploadSession, VaultFolder, VaultItem,
};
use coffer_core::{VaultError, VaultResult};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Result of appending a chunk checksum to an upload session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChecksumAppend {
    /// Newly recorded; the session's full checksum list so far
    Appended(Vec<String>),
    /// Chunk was already recorded with the same checksum
    Duplicate(Vec<String>),
}

impl ChecksumAppend {
    pub fn checksums(&self) -> &[String] {
        match self {
            ChecksumAppend::Appended(c) | ChecksumAppend::Duplicate(c) => c,
        }
    }
}

pub trait VaultStore: Send + Sync {
    // ── accounts ─────────────────────────────────────────────────────────
    fn insert_account(&self, account: Account) -> VaultResult<()>;
    fn get_account(&self, id: &str) -> VaultResult<Account>;
    /// Add `delta` bytes to an account's meter. Growth past the limit fails
    /// with `Capacity` and changes nothing. Returns the new usage.
    fn adjust_storage(&self, user_id: &str, delta: i64) -> VaultResult<u64>;
    /// Same as `adjust_storage`, for the ephemeral send meter.
    fn adjust_send(&self, user_id: &str, delta: i64) -> VaultResult<u64>;

    // ── folders ──────────────────────────────────────────────────────────
    fn insert_folder(&self, folder: VaultFolder) -> VaultResult<()>;
    fn get_folder(&self, id: &str) -> Option<VaultFolder>;
    /// Canonical row plus every shadow of it.
    fn folders_by_ref(&self, ref_id: &str) -> Vec<VaultFolder>;
    fn subfolders(&self, parent_id: &str) -> Vec<VaultFolder>;
    fn rename_folder(&self, ref_id: &str, name: Vec<u8>) -> VaultResult<()>;
    /// Remove a folder's canonical row, its shadows, and its sharing entries.
    fn delete_folder(&self, ref_id: &str) -> VaultResult<bool>;
    /// Remove one folder row (a shadow) and the sharing entry that made it.
    fn delete_folder_row(&self, id: &str) -> VaultResult<bool>;

    // ── items ────────────────────────────────────────────────────────────
    fn insert_item(&self, item: VaultItem) -> VaultResult<()>;
    fn get_item(&self, id: &str) -> Option<VaultItem>;
    fn items_by_ref(&self, ref_id: &str) -> Vec<VaultItem>;
    fn items_in_folder(&self, folder_id: &str) -> Vec<VaultItem>;
    fn rename_item(&self, ref_id: &str, name: Vec<u8>) -> VaultResult<()>;
    /// Remove an item's canonical row, shadows, sharing entries, and upload
    /// session. Returns the canonical row if there was one.
    fn delete_item(&self, ref_id: &str) -> VaultResult<Option<VaultItem>>;
    /// Remove one item row (a shadow) and the sharing entry that made it.
    fn delete_item_row(&self, id: &str) -> VaultResult<bool>;

    // ── sharing ──────────────────────────────────────────────────────────
    /// Insert a sharing entry and its shadow row together. Fails with
    /// `AlreadyShared` if the (owner, item, recipient) triple exists.
    fn add_sharing_entry(&self, entry: SharingEntry, shadow: Shadow) -> VaultResult<()>;
    fn is_shared_with_recipient(&self, owner_id: &str, item_id: &str, recipient_id: &str) -> bool;
    fn get_share_info(&self, owner_id: &str, item_id: &str) -> Vec<ShareInfo>;
    /// Remove a sharing entry and its shadow row together.
    fn remove_sharing_entry(&self, owner_id: &str, share_id: &str) -> VaultResult<SharingEntry>;
    /// Rewrite `can_modify` on a sharing entry and its shadow row together.
    fn update_share_permission(
        &self,
        owner_id: &str,
        share_id: &str,
        can_modify: bool,
    ) -> VaultResult<SharingEntry>;

    // ── payload metadata ─────────────────────────────────────────────────
    /// Record a finalized payload on every vault row and/or ephemeral
    /// metadata row for `id`.
    fn update_object_metadata(&self, id: &str, object_id: &str, length: u64) -> VaultResult<()>;

    // ── upload sessions ──────────────────────────────────────────────────
    fn create_upload_session(&self, session: UploadSession) -> VaultResult<()>;
    fn update_upload_values(&self, item_id: &str, url: &str, token: &str) -> VaultResult<()>;
    fn get_upload_values(&self, item_id: &str) -> Option<UploadSession>;
    /// Append the checksum for 1-based `chunk`, which must be the next one.
    fn append_checksum(&self, item_id: &str, chunk: u32, checksum: &str)
        -> VaultResult<ChecksumAppend>;
    fn delete_upload_session(&self, item_id: &str) -> VaultResult<bool>;

    // ── ephemeral transfers ──────────────────────────────────────────────
    fn insert_metadata(&self, meta: FileMetadata) -> VaultResult<()>;
    fn retrieve_metadata(&self, id: &str) -> Option<FileMetadata>;
    fn delete_metadata(&self, id: &str) -> VaultResult<bool>;
    fn set_expiry(&self, id: &str, expiry: FileExpiry) -> VaultResult<()>;
    fn get_expiry(&self, id: &str) -> Option<FileExpiry>;
    /// Decrement and return the remaining download count.
    fn decrement_downloads(&self, id: &str) -> VaultResult<u32>;
    fn delete_expiry(&self, id: &str) -> VaultResult<bool>;
    /// Ids whose expiry has passed or whose downloads are exhausted.
    fn expired_transfers(&self, now: u64) -> Vec<String>;

    // ── download progress ────────────────────────────────────────────────
    fn insert_download(&self, progress: DownloadProgress) -> VaultResult<()>;
    fn get_download(&self, id: &str) -> Option<DownloadProgress>;
    fn update_download(&self, id: &str, chunk: u32, now: u64) -> VaultResult<()>;
    fn delete_download(&self, id: &str) -> VaultResult<bool>;
    /// Drop progress rows for a transfer (all of them).
    fn delete_downloads_for(&self, file_id: &str) -> VaultResult<usize>;
    /// Drop progress rows not updated since `before`.
    fn delete_stale_downloads(&self, before: u64) -> VaultResult<usize>;

    /// Persist pending changes, if the backend is durable.
    fn flush(&self) -> Result<()>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct Tables {
    accounts: HashMap<String, Account>,
    folders: HashMap<String, VaultFolder>,
    items: HashMap<String, VaultItem>,
    shares: HashMap<String, SharingEntry>,
    uploads: HashMap<String, UploadSession>,
    metadata: HashMap<String, FileMetadata>,
    expiry: HashMap<String, FileExpiry>,
    downloads: HashMap<String, DownloadProgress>,
}

impl Tables {
    fn share_count(&self, item_id: &str) -> usize {
        self.shares.values().filter(|s| s.item_id == item_id).count()
    }

    fn remove_shares_for(&mut self, item_id: &str) {
        self.shares.retain(|_, s| s.item_id != item_id);
    }
}

struct Inner {
    tables: Tables,
    dirty: bool,
}

/// In-memory tables, optionally persisted to a JSON file.
pub struct JsonStore {
    path: Option<PathBuf>,
    inner: Mutex<Inner>,
}

impl JsonStore {
    /// Volatile store, for tests and the memory backend.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            inner: Mutex::new(Inner {
                tables: Tables::default(),
                dirty: false,
            }),
        }
    }

    /// Load or create a store at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let tables = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("reading vault store: {}", path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("parsing vault store: {}", path.display()))?
        } else {
            Tables::default()
        };

        Ok(Self {
            path: Some(path.to_path_buf()),
            inner: Mutex::new(Inner {
                tables,
                dirty: false,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` against the tables and mark the store dirty.
    fn write<T>(&self, f: impl FnOnce(&mut Tables) -> VaultResult<T>) -> VaultResult<T> {
        let mut inner = self.lock();
        let out = f(&mut inner.tables)?;
        inner.dirty = true;
        Ok(out)
    }

    fn read<T>(&self, f: impl FnOnce(&Tables) -> T) -> T {
        f(&self.lock().tables)
    }
}

impl Drop for JsonStore {
    fn drop(&mut self) {
        if let Err(e) = VaultStore::flush(self) {
            warn!("failed to flush vault store on drop: {e}");
        }
    }
}

impl VaultStore for JsonStore {
    fn insert_account(&self, account: Account) -> VaultResult<()> {
        self.write(|t| {
            if t.accounts.contains_key(&account.id) {
                return Err(VaultError::Invalid(format!(
                    "account {} already exists",
                    account.id
                )));
            }
            t.accounts.insert(account.id.clone(), account);
            Ok(())
        })
    }

    fn get_account(&self, id: &str) -> VaultResult<Account> {
        self.read(|t| t.accounts.get(id).cloned())
            .ok_or_else(|| VaultError::not_found(format!("account {id}")))
    }

    fn adjust_storage(&self, user_id: &str, delta: i64) -> VaultResult<u64> {
        self.write(|t| {
            let acct = t
                .accounts
                .get_mut(user_id)
                .ok_or_else(|| VaultError::not_found(format!("account {user_id}")))?;
            if delta > 0 {
                let needed = delta as u64;
                let available = acct.storage_available();
                if needed > available {
                    return Err(VaultError::Capacity { needed, available });
                }
                acct.storage_used += needed;
            } else {
                acct.storage_used = acct.storage_used.saturating_sub(delta.unsigned_abs());
            }
            Ok(acct.storage_used)
        })
    }

    fn adjust_send(&self, user_id: &str, delta: i64) -> VaultResult<u64> {
        self.write(|t| {
            let acct = t
                .accounts
                .get_mut(user_id)
                .ok_or_else(|| VaultError::not_found(format!("account {user_id}")))?;
            if delta > 0 {
                let needed = delta as u64;
                let available = acct.send_available();
                if needed > available {
                    return Err(VaultError::Capacity { needed, available });
                }
                acct.send_used += needed;
            } else {
                acct.send_used = acct.send_used.saturating_sub(delta.unsigned_abs());
            }
            Ok(acct.send_used)
        })
    }

    fn insert_folder(&self, folder: VaultFolder) -> VaultResult<()> {
        self.write(|t| {
            if t.folders.contains_key(&folder.id) {
                return Err(VaultError::Invalid(format!("folder {} already exists", folder.id)));
            }
            t.folders.insert(folder.id.clone(), folder);
            Ok(())
        })
    }

    fn get_folder(&self, id: &str) -> Option<VaultFolder> {
        self.read(|t| t.folders.get(id).cloned())
    }

    fn folders_by_ref(&self, ref_id: &str) -> Vec<VaultFolder> {
        self.read(|t| {
            t.folders
                .values()
                .filter(|f| f.ref_id == ref_id)
                .cloned()
                .collect()
        })
    }

    fn subfolders(&self, parent_id: &str) -> Vec<VaultFolder> {
        self.read(|t| {
            let mut out: Vec<VaultFolder> = t
                .folders
                .values()
                .filter(|f| f.parent_id.as_deref() == Some(parent_id))
                .cloned()
                .map(|mut f| {
                    f.shared_with = t.share_count(&f.ref_id);
                    f
                })
                .collect();
            out.sort_by(|a, b| a.modified.cmp(&b.modified).then(a.id.cmp(&b.id)));
            out
        })
    }

    fn rename_folder(&self, ref_id: &str, name: Vec<u8>) -> VaultResult<()> {
        self.write(|t| {
            let now = coffer_core::unix_now();
            let mut found = false;
            for f in t.folders.values_mut().filter(|f| f.ref_id == ref_id) {
                f.name = name.clone();
                f.modified = now;
                found = true;
            }
            if !found {
                return Err(VaultError::not_found(format!("folder {ref_id}")));
            }
            Ok(())
        })
    }

    fn delete_folder(&self, ref_id: &str) -> VaultResult<bool> {
        self.write(|t| {
            let before = t.folders.len();
            t.folders.retain(|_, f| f.ref_id != ref_id);
            t.remove_shares_for(ref_id);
            Ok(t.folders.len() != before)
        })
    }

    fn delete_folder_row(&self, id: &str) -> VaultResult<bool> {
        self.write(|t| {
            let removed = t.folders.remove(id).is_some();
            t.shares.retain(|_, s| !(s.is_folder && s.shadow_id == id));
            Ok(removed)
        })
    }

    fn insert_item(&self, item: VaultItem) -> VaultResult<()> {
        self.write(|t| {
            if t.items.contains_key(&item.id) {
                return Err(VaultError::Invalid(format!("item {} already exists", item.id)));
            }
            t.items.insert(item.id.clone(), item);
            Ok(())
        })
    }

    fn get_item(&self, id: &str) -> Option<VaultItem> {
        self.read(|t| t.items.get(id).cloned())
    }

    fn items_by_ref(&self, ref_id: &str) -> Vec<VaultItem> {
        self.read(|t| {
            t.items
                .values()
                .filter(|i| i.ref_id == ref_id)
                .cloned()
                .collect()
        })
    }

    fn items_in_folder(&self, folder_id: &str) -> Vec<VaultItem> {
        self.read(|t| {
            let mut out: Vec<VaultItem> = t
                .items
                .values()
                .filter(|i| i.folder_id == folder_id)
                .cloned()
                .map(|mut i| {
                    i.shared_with = t.share_count(&i.ref_id);
                    i
                })
                .collect();
            out.sort_by(|a, b| a.modified.cmp(&b.modified).then(a.id.cmp(&b.id)));
            out
        })
    }

    fn rename_item(&self, ref_id: &str, name: Vec<u8>) -> VaultResult<()> {
        self.write(|t| {
            let now = coffer_core::unix_now();
            let mut found = false;
            for i in t.items.values_mut().filter(|i| i.ref_id == ref_id) {
                i.name = name.clone();
                i.modified = now;
                found = true;
            }
            if !found {
                return Err(VaultError::not_found(format!("item {ref_id}")));
            }
            Ok(())
        })
    }

    fn delete_item(&self, ref_id: &str) -> VaultResult<Option<VaultItem>> {
        self.write(|t| {
            let canonical = t.items.get(ref_id).filter(|i| i.is_owner()).cloned();
            t.items.retain(|_, i| i.ref_id != ref_id);
            t.remove_shares_for(ref_id);
            t.uploads.remove(ref_id);
            Ok(canonical)
        })
    }

    fn delete_item_row(&self, id: &str) -> VaultResult<bool> {
        self.write(|t| {
            let removed = t.items.remove(id).is_some();
            t.shares.retain(|_, s| !(!s.is_folder && s.shadow_id == id));
            Ok(removed)
        })
    }

    fn add_sharing_entry(&self, entry: SharingEntry, shadow: Shadow) -> VaultResult<()> {
        self.write(|t| {
            let exists = t.shares.values().any(|s| {
                s.owner_id == entry.owner_id
                    && s.item_id == entry.item_id
                    && s.recipient_id == entry.recipient_id
            });
            if exists {
                return Err(VaultError::AlreadyShared);
            }

            match shadow {
                Shadow::Item(item) => {
                    if entry.is_folder || item.id != entry.shadow_id {
                        return Err(VaultError::Invalid("shadow does not match share".into()));
                    }
                    t.items.insert(item.id.clone(), item);
                }
                Shadow::Folder(folder) => {
                    if !entry.is_folder || folder.id != entry.shadow_id {
                        return Err(VaultError::Invalid("shadow does not match share".into()));
                    }
                    t.folders.insert(folder.id.clone(), folder);
                }
            }
            debug!(share_id = %entry.id, item_id = %entry.item_id, "sharing entry added");
            t.shares.insert(entry.id.clone(), entry);
            Ok(())
        })
    }

    fn is_shared_with_recipient(&self, owner_id: &str, item_id: &str, recipient_id: &str) -> bool {
        self.read(|t| {
            t.shares.values().any(|s| {
                s.owner_id == owner_id && s.item_id == item_id && s.recipient_id == recipient_id
            })
        })
    }

    fn get_share_info(&self, owner_id: &str, item_id: &str) -> Vec<ShareInfo> {
        self.read(|t| {
            let mut out: Vec<ShareInfo> = t
                .shares
                .values()
                .filter(|s| s.owner_id == owner_id && s.item_id == item_id)
                .map(ShareInfo::from)
                .collect();
            out.sort_by(|a, b| a.recipient_id.cmp(&b.recipient_id));
            out
        })
    }

    fn remove_sharing_entry(&self, owner_id: &str, share_id: &str) -> VaultResult<SharingEntry> {
        self.write(|t| {
            match t.shares.get(share_id) {
                Some(s) if s.owner_id == owner_id => {}
                _ => return Err(VaultError::not_found(format!("share {share_id}"))),
            }
            let entry = t
                .shares
                .remove(share_id)
                .ok_or_else(|| VaultError::not_found(format!("share {share_id}")))?;
            if entry.is_folder {
                t.folders.remove(&entry.shadow_id);
            } else {
                t.items.remove(&entry.shadow_id);
            }
            Ok(entry)
        })
    }

    fn update_share_permission(
        &self,
        owner_id: &str,
        share_id: &str,
        can_modify: bool,
    ) -> VaultResult<SharingEntry> {
        self.write(|t| {
            let entry = match t.shares.get_mut(share_id) {
                Some(s) if s.owner_id == owner_id => s,
                _ => return Err(VaultError::not_found(format!("share {share_id}"))),
            };
            entry.can_modify = can_modify;
            let entry = entry.clone();

            if entry.is_folder {
                if let Some(f) = t.folders.get_mut(&entry.shadow_id) {
                    f.can_modify = can_modify;
                }
            } else if let Some(i) = t.items.get_mut(&entry.shadow_id) {
                i.can_modify = can_modify;
            }
            Ok(entry)
        })
    }

    fn update_object_metadata(&self, id: &str, object_id: &str, length: u64) -> VaultResult<()> {
        self.write(|t| {
            let mut found = false;
            for i in t.items.values_mut().filter(|i| i.ref_id == id) {
                i.object_id = Some(object_id.to_string());
                i.stored_length = length;
                found = true;
            }
            if let Some(m) = t.metadata.get_mut(id) {
                m.object_id = Some(object_id.to_string());
                m.length = length;
                found = true;
            }
            if !found {
                return Err(VaultError::not_found(format!("metadata for {id}")));
            }
            Ok(())
        })
    }

    fn create_upload_session(&self, session: UploadSession) -> VaultResult<()> {
        self.write(|t| {
            t.uploads.insert(session.item_id.clone(), session);
            Ok(())
        })
    }

    fn update_upload_values(&self, item_id: &str, url: &str, token: &str) -> VaultResult<()> {
        self.write(|t| {
            let session = t
                .uploads
                .get_mut(item_id)
                .ok_or_else(|| VaultError::not_found(format!("upload session {item_id}")))?;
            session.upload_url = url.to_string();
            session.token = token.to_string();
            Ok(())
        })
    }

    fn get_upload_values(&self, item_id: &str) -> Option<UploadSession> {
        self.read(|t| t.uploads.get(item_id).cloned())
    }

    fn append_checksum(
        &self,
        item_id: &str,
        chunk: u32,
        checksum: &str,
    ) -> VaultResult<ChecksumAppend> {
        self.write(|t| {
            let session = t
                .uploads
                .get_mut(item_id)
                .ok_or_else(|| VaultError::not_found(format!("upload session {item_id}")))?;
            let completed = session.completed_chunks();

            if chunk >= 1 && chunk <= completed {
                if session.checksums[chunk as usize - 1] == checksum {
                    return Ok(ChecksumAppend::Duplicate(session.checksums.clone()));
                }
                return Err(VaultError::transfer(
                    chunk,
                    "chunk already recorded with a different checksum",
                ));
            }
            if chunk != completed + 1 {
                return Err(VaultError::transfer(
                    chunk,
                    format!("out of order: expected chunk {}", completed + 1),
                ));
            }
            session.checksums.push(checksum.to_string());
            Ok(ChecksumAppend::Appended(session.checksums.clone()))
        })
    }

    fn delete_upload_session(&self, item_id: &str) -> VaultResult<bool> {
        self.write(|t| Ok(t.uploads.remove(item_id).is_some()))
    }

    fn insert_metadata(&self, meta: FileMetadata) -> VaultResult<()> {
        self.write(|t| {
            t.metadata.insert(meta.id.clone(), meta);
            Ok(())
        })
    }

    fn retrieve_metadata(&self, id: &str) -> Option<FileMetadata> {
        self.read(|t| t.metadata.get(id).cloned())
    }

    fn delete_metadata(&self, id: &str) -> VaultResult<bool> {
        self.write(|t| Ok(t.metadata.remove(id).is_some()))
    }

    fn set_expiry(&self, id: &str, expiry: FileExpiry) -> VaultResult<()> {
        self.write(|t| {
            t.expiry.insert(id.to_string(), expiry);
            Ok(())
        })
    }

    fn get_expiry(&self, id: &str) -> Option<FileExpiry> {
        self.read(|t| t.expiry.get(id).copied())
    }

    fn decrement_downloads(&self, id: &str) -> VaultResult<u32> {
        self.write(|t| {
            let expiry = t
                .expiry
                .get_mut(id)
                .ok_or_else(|| VaultError::not_found(format!("expiry for {id}")))?;
            expiry.downloads_remaining = expiry.downloads_remaining.saturating_sub(1);
            Ok(expiry.downloads_remaining)
        })
    }

    fn delete_expiry(&self, id: &str) -> VaultResult<bool> {
        self.write(|t| Ok(t.expiry.remove(id).is_some()))
    }

    fn expired_transfers(&self, now: u64) -> Vec<String> {
        self.read(|t| {
            let mut ids: Vec<String> = t
                .expiry
                .iter()
                .filter(|(_, e)| e.is_expired(now))
                .map(|(id, _)| id.clone())
                .collect();
            ids.sort();
            ids
        })
    }

    fn insert_download(&self, progress: DownloadProgress) -> VaultResult<()> {
        self.write(|t| {
            t.downloads.insert(progress.id.clone(), progress);
            Ok(())
        })
    }

    fn get_download(&self, id: &str) -> Option<DownloadProgress> {
        self.read(|t| t.downloads.get(id).cloned())
    }

    fn update_download(&self, id: &str, chunk: u32, now: u64) -> VaultResult<()> {
        self.write(|t| {
            let d = t
                .downloads
                .get_mut(id)
                .ok_or_else(|| VaultError::not_found(format!("download {id}")))?;
            d.chunk = chunk;
            d.updated = now;
            Ok(())
        })
    }

    fn delete_download(&self, id: &str) -> VaultResult<bool> {
        self.write(|t| Ok(t.downloads.remove(id).is_some()))
    }

    fn delete_downloads_for(&self, file_id: &str) -> VaultResult<usize> {
        self.write(|t| {
            let before = t.downloads.len();
            t.downloads.retain(|_, d| d.file_id != file_id);
            Ok(before - t.downloads.len())
        })
    }

    fn delete_stale_downloads(&self, before: u64) -> VaultResult<usize> {
        self.write(|t| {
            let count = t.downloads.len();
            t.downloads.retain(|_, d| d.updated >= before);
            Ok(count - t.downloads.len())
        })
    }

    fn flush(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let json = {
            let mut inner = self.lock();
            if !inner.dirty {
                return Ok(());
            }
            let json =
                serde_json::to_string_pretty(&inner.tables).context("serializing vault store")?;
            inner.dirty = false;
            json
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating store dir: {}", parent.display()))?;
        }

        // Atomic write: write to temp file, then rename
        let tmp_path = path.with_extension("tmp");
        let written = std::fs::write(&tmp_path, &json)
            .with_context(|| format!("writing vault store temp: {}", tmp_path.display()))
            .and_then(|_| {
                std::fs::rename(&tmp_path, path)
                    .with_context(|| format!("renaming vault store: {}", path.display()))
            });
        if written.is_err() {
            self.lock().dirty = true;
        }
        written
    }
}
