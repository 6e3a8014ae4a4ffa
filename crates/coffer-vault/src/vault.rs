//! The vault engine handle shared by every operation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use coffer_chunks::ChunkLayout;
use coffer_core::config::CofferConfig;
use coffer_core::types::VaultItem;
use coffer_core::{VaultError, VaultResult};
use coffer_crypto::{KdfParams, TOTAL_OVERHEAD};
use coffer_storage::{ChunkCache, ObjectStore};
use tracing::{info, warn};

use crate::ownership::check_folder_ownership;
use crate::store::VaultStore;

#[derive(Debug, Clone)]
pub struct VaultOptions {
    /// Plaintext bytes per chunk
    pub chunk_size: u64,
    pub kdf: KdfParams,
    /// Storage limit given to new accounts (None = unlimited)
    pub default_storage_limit: Option<u64>,
    /// Ephemeral send allowance given to new accounts (None = unlimited)
    pub default_send_limit: Option<u64>,
    pub max_unlock_attempts: u32,
}

impl Default for VaultOptions {
    fn default() -> Self {
        Self {
            chunk_size: coffer_chunks::DEFAULT_CHUNK_SIZE,
            kdf: KdfParams::default(),
            default_storage_limit: None,
            default_send_limit: None,
            max_unlock_attempts: 3,
        }
    }
}

impl VaultOptions {
    pub fn from_config(config: &CofferConfig) -> Self {
        Self {
            chunk_size: config.transfer.chunk_size,
            kdf: KdfParams::from(&config.vault),
            default_storage_limit: config.vault.default_storage_limit,
            default_send_limit: config.vault.default_send_limit,
            max_unlock_attempts: config.vault.max_unlock_attempts,
        }
    }
}

pub struct Vault {
    pub(crate) store: Arc<dyn VaultStore>,
    pub(crate) objects: Arc<dyn ObjectStore>,
    pub(crate) cache: Option<Arc<ChunkCache>>,
    pub(crate) layout: ChunkLayout,
    pub(crate) options: VaultOptions,
    /// Serializes chunk uploads per item or transfer id
    upload_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Vault {
    pub fn new(
        store: Arc<dyn VaultStore>,
        objects: Arc<dyn ObjectStore>,
        options: VaultOptions,
    ) -> VaultResult<Self> {
        let layout = ChunkLayout::new(options.chunk_size, TOTAL_OVERHEAD as u64)
            .map_err(|e| VaultError::Config(e.to_string()))?;
        Ok(Self {
            store,
            objects,
            cache: None,
            layout,
            options,
            upload_locks: Mutex::new(HashMap::new()),
        })
    }

    /// Serve repeat downloads from a local ciphertext cache.
    pub fn with_cache(mut self, cache: Arc<ChunkCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn store(&self) -> &dyn VaultStore {
        self.store.as_ref()
    }

    pub fn layout(&self) -> ChunkLayout {
        self.layout
    }

    pub fn options(&self) -> &VaultOptions {
        &self.options
    }

    /// Look up an item and whether `user_id` may modify it.
    ///
    /// The user's own rows (owned items and their shadows) carry their own
    /// permission; anything else is reachable only through a folder.
    pub(crate) fn item_access(&self, user_id: &str, item_id: &str) -> VaultResult<(VaultItem, bool)> {
        let item = self
            .store
            .get_item(item_id)
            .ok_or_else(|| VaultError::not_found(format!("item {item_id}")))?;
        if item.owner_id == user_id {
            let can_modify = item.can_modify;
            return Ok((item, can_modify));
        }
        let ownership = check_folder_ownership(self.store(), &item.folder_id, user_id)?;
        Ok((item, ownership.can_modify))
    }

    pub(crate) fn upload_lock(&self, id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .upload_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(id.to_string()).or_default())
    }

    pub(crate) fn release_upload_lock(&self, id: &str) {
        self.upload_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
    }

    pub(crate) async fn drop_cached(&self, id: &str) {
        if let Some(cache) = &self.cache {
            if let Err(e) = cache.remove(id).await {
                warn!(id, "failed to drop cache entry: {e:#}");
            }
        }
    }

    /// Delete a canonical item everywhere: payload, session, rows, shares,
    /// meter, and cache. The payload goes first so a storage failure leaves
    /// the item intact and the delete can be retried.
    pub(crate) async fn purge_item(&self, item: &VaultItem) -> VaultResult<()> {
        let session = self.store.get_upload_values(&item.id);

        if let Some(object_id) = &item.object_id {
            self.objects.delete_file(object_id).await.map_err(|e| {
                VaultError::Storage(format!("deleting payload of item {}: {e:#}", item.id))
            })?;
        } else if let Some(session) = &session {
            self.release_session(&item.id, session).await;
        }

        self.store.delete_item(&item.id)?;
        self.store
            .adjust_storage(&item.owner_id, -(item.size as i64))?;
        self.release_upload_lock(&item.id);
        self.drop_cached(&item.id).await;

        info!(item_id = %item.id, size = item.size, "item deleted");
        Ok(())
    }
}
