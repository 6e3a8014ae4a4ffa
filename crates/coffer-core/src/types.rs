use serde::{Deserialize, Serialize};

/// A user account. The private half of the keypair is only ever stored
/// encrypted under the password-derived user key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    /// age X25519 recipient string (`age1...`)
    pub public_key: String,
    /// Serialized identity, encrypted with the chunk codec under the user key
    #[serde(with = "crate::b64")]
    pub protected_private_key: Vec<u8>,
    /// Plaintext bytes charged to this account
    pub storage_used: u64,
    /// `None` means unmetered
    pub storage_limit: Option<u64>,
    /// Plaintext bytes sent as ephemeral transfers
    #[serde(default)]
    pub send_used: u64,
    #[serde(default)]
    pub send_limit: Option<u64>,
}

impl Account {
    pub fn storage_available(&self) -> u64 {
        match self.storage_limit {
            Some(limit) => limit.saturating_sub(self.storage_used),
            None => u64::MAX,
        }
    }

    pub fn send_available(&self) -> u64 {
        match self.send_limit {
            Some(limit) => limit.saturating_sub(self.send_used),
            None => u64::MAX,
        }
    }
}

/// A folder row. Shadow rows (shares) carry the recipient as `owner_id`
/// and point at the canonical folder through `ref_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultFolder {
    pub id: String,
    pub ref_id: String,
    /// `None` only for an account's root folder
    pub parent_id: Option<String>,
    pub owner_id: String,
    #[serde(with = "crate::b64")]
    pub name: Vec<u8>,
    /// Folder key wrapped under the parent context (or a public key for
    /// roots and shadows)
    #[serde(with = "crate::b64")]
    pub protected_key: Vec<u8>,
    pub modified: u64,
    pub can_modify: bool,
    #[serde(default)]
    pub shared_by: Option<String>,
    /// Filled in on listing; not persisted meaningfully
    #[serde(default)]
    pub shared_with: usize,
}

impl VaultFolder {
    pub fn is_owner(&self) -> bool {
        self.id == self.ref_id
    }

    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }
}

/// A file or password entry row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultItem {
    pub id: String,
    /// Equals `id` for owned items, the owner's item id for shadows
    pub ref_id: String,
    pub folder_id: String,
    pub owner_id: String,
    #[serde(with = "crate::b64")]
    pub name: Vec<u8>,
    #[serde(with = "crate::b64")]
    pub protected_key: Vec<u8>,
    /// Declared plaintext size in bytes
    pub size: u64,
    /// Total chunk count; zero for password entries
    pub chunks: u32,
    /// Set once the object store has finalized the payload
    #[serde(default)]
    pub object_id: Option<String>,
    /// Stored ciphertext length, known after finalize
    #[serde(default)]
    pub stored_length: u64,
    pub modified: u64,
    pub can_modify: bool,
    #[serde(default)]
    pub shared_by: Option<String>,
    #[serde(default)]
    pub shared_with: usize,
    #[serde(default, with = "crate::b64::option")]
    pub password_data: Option<Vec<u8>>,
}

impl VaultItem {
    pub fn is_owner(&self) -> bool {
        self.id == self.ref_id
    }

    pub fn is_password(&self) -> bool {
        self.password_data.is_some()
    }

    pub fn is_complete(&self) -> bool {
        self.object_id.is_some()
    }
}

/// One share of an item or folder with one recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharingEntry {
    pub id: String,
    pub owner_id: String,
    /// Canonical (owner's) item or folder id
    pub item_id: String,
    pub recipient_id: String,
    /// Id of the recipient's shadow row
    pub shadow_id: String,
    pub is_folder: bool,
    pub can_modify: bool,
}

/// What callers see about a share.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareInfo {
    pub id: String,
    pub recipient_id: String,
    pub can_modify: bool,
}

impl From<&SharingEntry> for ShareInfo {
    fn from(e: &SharingEntry) -> Self {
        ShareInfo {
            id: e.id.clone(),
            recipient_id: e.recipient_id.clone(),
            can_modify: e.can_modify,
        }
    }
}

/// Recipient-side row created by a share.
#[derive(Debug, Clone)]
pub enum Shadow {
    Item(VaultItem),
    Folder(VaultFolder),
}

/// Object-store upload session for one item or ephemeral transfer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UploadSession {
    pub item_id: String,
    pub name: String,
    pub upload_url: String,
    pub token: String,
    /// Large-file id for multi-part sessions
    #[serde(default)]
    pub upload_id: Option<String>,
    /// Ciphertext checksums in chunk order, append-only
    #[serde(default)]
    pub checksums: Vec<String>,
}

impl UploadSession {
    pub fn completed_chunks(&self) -> u32 {
        self.checksums.len() as u32
    }
}

/// Metadata for an ephemeral (non-vault) transfer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileMetadata {
    pub id: String,
    #[serde(with = "crate::b64")]
    pub name: Vec<u8>,
    pub chunks: u32,
    /// Plaintext size in bytes
    #[serde(default)]
    pub size: u64,
    /// Account charged for the transfer
    #[serde(default)]
    pub sender_id: Option<String>,
    #[serde(default)]
    pub object_id: Option<String>,
    #[serde(default)]
    pub length: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileExpiry {
    pub downloads_remaining: u32,
    /// Unix seconds
    pub expires_at: u64,
}

impl FileExpiry {
    pub fn is_expired(&self, now: u64) -> bool {
        self.expires_at <= now || self.downloads_remaining == 0
    }
}

/// Per-download chunk progress for ephemeral transfers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadProgress {
    pub id: String,
    pub file_id: String,
    pub chunk: u32,
    pub updated: u64,
}

/// Ownership and permission of a user over a folder, resolved by walking
/// the folder tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderOwnership {
    /// Row the user holds (own folder or shadow)
    pub id: String,
    pub ref_id: String,
    /// Owner of the canonical folder at the top of the walk
    pub canonical_owner: String,
    pub is_owner: bool,
    pub can_modify: bool,
}
