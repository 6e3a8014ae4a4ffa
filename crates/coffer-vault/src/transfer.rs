//! Chunked transfers between clients and the object store.
//!
//! Server side: `init_upload` reserves storage and opens an upload session,
//! `upload_chunk` verifies and forwards one sealed chunk, `download_chunk`
//! serves one sealed chunk by byte range. Client side: `upload_file`,
//! `resume_upload`, and `download_file` drive those per chunk, sealing and
//! opening with the item key.
//!
//! Checksums are append-only and a chunk is recorded only after the store
//! accepted it, so an aborted upload resumes after its last recorded chunk.

use coffer_chunks::checksum;
use coffer_core::types::{UploadSession, VaultItem};
use coffer_core::{VaultError, VaultResult};
use coffer_crypto::{decrypt_chunk, encrypt_chunk, generate_key, SymmetricKey};
use coffer_storage::{StoredObject, UploadTarget};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::ownership::check_folder_ownership;
use crate::session::VaultSession;
use crate::vault::Vault;

/// Progress callback: (chunks completed, total chunks).
pub type ProgressFn = Box<dyn Fn(u64, u64) + Send + Sync>;

/// A client's request to start a vault upload. Name and key arrive sealed.
#[derive(Debug, Clone)]
pub struct NewUpload {
    pub folder_id: String,
    pub name: Vec<u8>,
    pub protected_key: Vec<u8>,
    /// Plaintext size in bytes
    pub size: u64,
    pub chunks: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOutcome {
    Pending { completed: u32, total: u32 },
    Complete(StoredObject),
}

/// One sealed chunk as served to a client.
#[derive(Debug, Clone)]
pub struct ChunkData {
    pub data: Vec<u8>,
    /// This chunk ends at the last stored byte
    pub eof: bool,
}

/// Attach a chunk index to failures that came from I/O.
fn at_chunk(chunk: u32, err: VaultError) -> VaultError {
    match err {
        VaultError::Storage(_) | VaultError::Io(_) | VaultError::Other(_) => {
            VaultError::transfer(chunk, err)
        }
        other => other,
    }
}

fn storage_err(context: &str, err: anyhow::Error) -> VaultError {
    VaultError::Storage(format!("{context}: {err:#}"))
}

impl Vault {
    /// Start a vault upload into `folder_id`, charging the folder owner.
    pub async fn init_upload(&self, user_id: &str, upload: NewUpload) -> VaultResult<VaultItem> {
        if upload.name.is_empty() || upload.protected_key.is_empty() {
            return Err(VaultError::Invalid("upload needs a name and a key".into()));
        }
        if upload.size == 0 {
            return Err(VaultError::Invalid("empty uploads are not supported".into()));
        }
        let expected = self
            .layout
            .chunk_count(upload.size)
            .map_err(|e| VaultError::Invalid(format!("{e:#}")))?;
        if upload.chunks != expected {
            return Err(VaultError::Invalid(format!(
                "{} bytes take {expected} chunks, not {}",
                upload.size, upload.chunks
            )));
        }

        let folder = check_folder_ownership(self.store(), &upload.folder_id, user_id)?;
        if !folder.can_modify {
            return Err(VaultError::ReadOnly);
        }
        self.store
            .adjust_storage(&folder.canonical_owner, upload.size as i64)?;

        let id = Uuid::new_v4().to_string();
        let item = VaultItem {
            id: id.clone(),
            ref_id: id,
            folder_id: folder.ref_id,
            owner_id: folder.canonical_owner,
            name: upload.name,
            protected_key: upload.protected_key,
            size: upload.size,
            chunks: upload.chunks,
            object_id: None,
            stored_length: 0,
            modified: coffer_core::unix_now(),
            can_modify: true,
            shared_by: None,
            shared_with: 0,
            password_data: None,
        };

        let opened = match self.store.insert_item(item.clone()) {
            Ok(()) => self.open_session(&item.id, item.chunks).await,
            Err(e) => Err(e),
        };
        if let Err(e) = opened {
            warn!(item_id = %item.id, "upload init failed, rolling back: {e}");
            if let Err(undo) = self.store.delete_item(&item.id) {
                warn!(item_id = %item.id, "rollback could not remove item: {undo}");
            }
            if let Err(undo) = self
                .store
                .adjust_storage(&item.owner_id, -(item.size as i64))
            {
                warn!(item_id = %item.id, owner = %item.owner_id, "rollback could not release storage: {undo}");
            }
            return Err(e);
        }

        info!(item_id = %item.id, size = item.size, chunks = item.chunks, "upload initialized");
        Ok(item)
    }

    /// Open an object-store session: single-shot for one chunk, a large
    /// file otherwise. Part targets are requested per chunk, so a large
    /// file starts without one.
    pub(crate) async fn open_session(&self, id: &str, chunks: u32) -> VaultResult<()> {
        let (target, upload_id) = if chunks == 1 {
            let target = self
                .objects
                .get_upload_url()
                .await
                .map_err(|e| storage_err("requesting upload url", e))?;
            (target, None)
        } else {
            let file_id = self
                .objects
                .start_large_file(id)
                .await
                .map_err(|e| storage_err("starting large file", e))?;
            let target = UploadTarget {
                url: String::new(),
                token: String::new(),
            };
            (target, Some(file_id))
        };

        self.store.create_upload_session(UploadSession {
            item_id: id.to_string(),
            name: id.to_string(),
            upload_url: target.url,
            token: target.token,
            upload_id,
            checksums: Vec::new(),
        })
    }

    /// Accept sealed chunk `chunk` (1-based) of a vault item.
    pub async fn upload_chunk(
        &self,
        user_id: &str,
        item_id: &str,
        chunk: u32,
        data: Vec<u8>,
    ) -> VaultResult<ChunkOutcome> {
        let (item, can_modify) = self.item_access(user_id, item_id)?;
        if !can_modify {
            return Err(VaultError::ReadOnly);
        }
        if item.is_complete() {
            return Err(VaultError::Invalid(format!("item {item_id} is already uploaded")));
        }
        self.put_chunk(&item.ref_id, item.size, item.chunks, chunk, data)
            .await
    }

    /// Finalize an upload whose chunks are all recorded. Needed only when
    /// a previous finalize failed after the last chunk went through.
    pub async fn complete_upload(&self, user_id: &str, item_id: &str) -> VaultResult<VaultItem> {
        let (item, can_modify) = self.item_access(user_id, item_id)?;
        if item.is_complete() {
            return Ok(item);
        }
        if !can_modify {
            return Err(VaultError::ReadOnly);
        }

        let lock = self.upload_lock(&item.ref_id);
        let _guard = lock.lock().await;
        let session = self
            .store
            .get_upload_values(&item.ref_id)
            .ok_or_else(|| VaultError::not_found(format!("upload session {}", item.ref_id)))?;
        let completed = session.completed_chunks();
        if completed != item.chunks {
            return Err(VaultError::transfer(
                completed + 1,
                format!("upload incomplete: {completed} of {} chunks", item.chunks),
            ));
        }
        self.finish(&item.ref_id, &session, item.chunks).await?;
        self.item_access(user_id, item_id).map(|(item, _)| item)
    }

    /// Shared by vault items and ephemeral transfers: verify ordering and
    /// size, forward to the object store, record the checksum, and finalize
    /// once every chunk is in. `size` is the plaintext size of the whole
    /// payload; every chunk must seal exactly its share of it.
    pub(crate) async fn put_chunk(
        &self,
        id: &str,
        size: u64,
        total: u32,
        chunk: u32,
        data: Vec<u8>,
    ) -> VaultResult<ChunkOutcome> {
        if chunk == 0 || chunk > total {
            return Err(VaultError::transfer(
                chunk,
                format!("chunk index out of range 1..={total}"),
            ));
        }
        let expected = self
            .layout
            .sealed_len(chunk, size)
            .map_err(|e| VaultError::transfer(chunk, e))?;
        let len = data.len() as u64;
        if len != expected {
            return Err(VaultError::transfer(
                chunk,
                format!("sealed chunk is {len} bytes, expected {expected}"),
            ));
        }

        let lock = self.upload_lock(id);
        let _guard = lock.lock().await;

        let session = self
            .store
            .get_upload_values(id)
            .ok_or_else(|| VaultError::not_found(format!("upload session {id}")))?;
        let completed = session.completed_chunks();
        let sum = checksum(&data);

        // Re-sent chunk: accept if identical, finalize if it was the last
        if chunk <= completed {
            if session.checksums[chunk as usize - 1] != sum {
                return Err(VaultError::transfer(
                    chunk,
                    "chunk already uploaded with different content",
                ));
            }
            if completed == total {
                let stored = self.finish(id, &session, total).await?;
                return Ok(ChunkOutcome::Complete(stored));
            }
            return Ok(ChunkOutcome::Pending { completed, total });
        }
        if chunk != completed + 1 {
            return Err(VaultError::transfer(
                chunk,
                format!("out of order: expected chunk {}", completed + 1),
            ));
        }

        match session.upload_id.as_deref() {
            None => {
                let target = UploadTarget {
                    url: session.upload_url.clone(),
                    token: session.token.clone(),
                };
                let stored = match self.objects.upload_file(&target, id, &sum, data).await {
                    Ok(stored) => stored,
                    Err(e) => {
                        self.refresh_target(id).await;
                        return Err(VaultError::transfer(chunk, format!("{e:#}")));
                    }
                };
                self.store.append_checksum(id, chunk, &sum)?;
                self.record_payload(id, &stored)?;
                Ok(ChunkOutcome::Complete(stored))
            }
            Some(file_id) => {
                let target = self
                    .objects
                    .get_upload_part_url(file_id)
                    .await
                    .map_err(|e| VaultError::transfer(chunk, format!("{e:#}")))?;
                self.store
                    .update_upload_values(id, &target.url, &target.token)?;
                self.objects
                    .upload_file_part(&target, file_id, chunk, &sum, data)
                    .await
                    .map_err(|e| VaultError::transfer(chunk, format!("{e:#}")))?;

                let recorded = self.store.append_checksum(id, chunk, &sum)?;
                let completed = recorded.checksums().len() as u32;
                debug!(id, chunk, total, "chunk stored");
                if completed < total {
                    return Ok(ChunkOutcome::Pending { completed, total });
                }

                let session = UploadSession {
                    checksums: recorded.checksums().to_vec(),
                    ..session
                };
                let stored = self.finish(id, &session, total).await?;
                Ok(ChunkOutcome::Complete(stored))
            }
        }
    }

    /// Stitch a completed large file and record it.
    async fn finish(&self, id: &str, session: &UploadSession, total: u32) -> VaultResult<StoredObject> {
        let file_id = session.upload_id.as_deref().ok_or_else(|| {
            VaultError::transfer(total, "single-shot upload has no pending finalize")
        })?;
        let stored = self
            .objects
            .finish_large_file(file_id, &session.checksums)
            .await
            .map_err(|e| VaultError::transfer(total, format!("finalize failed: {e:#}")))?;
        self.record_payload(id, &stored)?;
        Ok(stored)
    }

    fn record_payload(&self, id: &str, stored: &StoredObject) -> VaultResult<()> {
        self.store
            .update_object_metadata(id, &stored.object_id, stored.length)?;
        self.store.delete_upload_session(id)?;
        self.release_upload_lock(id);
        info!(id, object_id = %stored.object_id, length = stored.length, "upload finalized");
        Ok(())
    }

    /// Single-shot tokens are spent on use; issue a fresh one so the
    /// chunk can be retried.
    async fn refresh_target(&self, id: &str) {
        match self.objects.get_upload_url().await {
            Ok(target) => {
                if let Err(e) = self
                    .store
                    .update_upload_values(id, &target.url, &target.token)
                {
                    warn!(id, "failed to store fresh upload url: {e}");
                }
            }
            Err(e) => warn!(id, "failed to refresh upload url: {e:#}"),
        }
    }

    /// Give back what an unfinished upload holds in the object store: its
    /// staged parts, or its unused single-shot token.
    pub(crate) async fn release_session(&self, id: &str, session: &UploadSession) {
        match session.upload_id.as_deref() {
            Some(file_id) => {
                if let Err(e) = self.objects.cancel_large_file(file_id).await {
                    warn!(id, file_id, "failed to cancel large file: {e:#}");
                }
            }
            None if !session.token.is_empty() => {
                if let Err(e) = self.objects.revoke_upload_url(&session.token).await {
                    warn!(id, "failed to revoke upload url: {e:#}");
                }
            }
            None => {}
        }
    }

    /// Serve sealed chunk `chunk` of a completed vault item.
    pub async fn download_chunk(
        &self,
        user_id: &str,
        item_id: &str,
        chunk: u32,
    ) -> VaultResult<ChunkData> {
        let (item, _) = self.item_access(user_id, item_id)?;
        let object_id = item
            .object_id
            .as_deref()
            .ok_or_else(|| VaultError::not_found(format!("payload of item {item_id}")))?;
        self.fetch_chunk(&item.ref_id, object_id, item.stored_length, chunk)
            .await
    }

    /// Ranged read through the local cache, filling it as chunks pass.
    pub(crate) async fn fetch_chunk(
        &self,
        cache_key: &str,
        object_id: &str,
        length: u64,
        chunk: u32,
    ) -> VaultResult<ChunkData> {
        let range = self
            .layout
            .byte_range(chunk, length)
            .map_err(|e| VaultError::transfer(chunk, e))?;

        if let Some(cache) = &self.cache {
            if cache.has_file(cache_key, length).await {
                match cache.read(cache_key, range.start, range.end).await {
                    Ok(data) => {
                        debug!(cache_key, chunk, "chunk served from cache");
                        return Ok(ChunkData {
                            data,
                            eof: range.eof,
                        });
                    }
                    Err(e) => warn!(cache_key, chunk, "cache read failed: {e:#}"),
                }
            }
        }

        let data = self
            .objects
            .partial_download(object_id, range.start, range.end)
            .await
            .map_err(|e| VaultError::transfer(chunk, format!("{e:#}")))?;
        if data.len() as u64 != range.size() {
            return Err(VaultError::transfer(
                chunk,
                format!("short read: {} of {} bytes", data.len(), range.size()),
            ));
        }

        if let Some(cache) = &self.cache {
            if chunk == 1 {
                if let Err(e) = cache.prep(cache_key, length).await {
                    debug!(cache_key, "not caching: {e:#}");
                }
            }
            if let Err(e) = cache.write(cache_key, range.start, &data).await {
                warn!(cache_key, chunk, "cache write failed: {e:#}");
            }
        }

        Ok(ChunkData {
            data,
            eof: range.eof,
        })
    }

    /// Abandon an unfinished upload and release its reservation.
    pub async fn abort_upload(&self, user_id: &str, item_id: &str) -> VaultResult<()> {
        if self.store.get_item(item_id).is_none() {
            return Ok(());
        }
        let (item, can_modify) = self.item_access(user_id, item_id)?;
        if !can_modify {
            return Err(VaultError::ReadOnly);
        }
        if item.is_complete() {
            return Err(VaultError::Invalid(format!(
                "item {item_id} is already uploaded; delete it instead"
            )));
        }

        let canonical = self.store.get_item(&item.ref_id).unwrap_or(item);
        let lock = self.upload_lock(&canonical.id);
        let _guard = lock.lock().await;
        self.purge_item(&canonical).await?;
        info!(item_id = %canonical.id, "upload aborted");
        Ok(())
    }

    // ── client side ──────────────────────────────────────────────────────

    /// Seal and upload `data` as a new item named `name` in `folder_id`.
    pub async fn upload_file(
        &self,
        session: &VaultSession,
        folder_id: &str,
        name: &str,
        data: &[u8],
        progress: Option<&ProgressFn>,
    ) -> VaultResult<VaultItem> {
        let ctx = session.folder_context(self, folder_id)?;
        let key = generate_key();
        let size = data.len() as u64;
        let upload = NewUpload {
            folder_id: folder_id.to_string(),
            name: encrypt_chunk(&key, name.as_bytes())?,
            protected_key: ctx.wrap_key(&key)?,
            size,
            chunks: self
                .layout
                .chunk_count(size)
                .map_err(|e| VaultError::Invalid(format!("{e:#}")))?,
        };

        let item = self.init_upload(session.user_id(), upload).await?;
        self.send_chunks(session.user_id(), &item, &key, data, 0, progress)
            .await
    }

    /// Continue an interrupted upload of `data` after its last recorded
    /// chunk. Skipped chunks still report progress.
    pub async fn resume_upload(
        &self,
        session: &VaultSession,
        item_id: &str,
        data: &[u8],
        progress: Option<&ProgressFn>,
    ) -> VaultResult<VaultItem> {
        let (item, _) = self.item_access(session.user_id(), item_id)?;
        if item.is_complete() {
            return Ok(item);
        }
        if data.len() as u64 != item.size {
            return Err(VaultError::Invalid(format!(
                "resume data is {} bytes, item is {}",
                data.len(),
                item.size
            )));
        }

        let completed = self
            .store
            .get_upload_values(&item.ref_id)
            .ok_or_else(|| VaultError::not_found(format!("upload session {}", item.ref_id)))?
            .completed_chunks();
        info!(item_id, completed, total = item.chunks, "resuming upload");

        let key = session.item_key(self, &item)?;
        let item = self
            .send_chunks(session.user_id(), &item, &key, data, completed, progress)
            .await?;
        if item.is_complete() {
            return Ok(item);
        }
        self.complete_upload(session.user_id(), &item.id).await
    }

    async fn send_chunks(
        &self,
        user_id: &str,
        item: &VaultItem,
        key: &SymmetricKey,
        data: &[u8],
        skip: u32,
        progress: Option<&ProgressFn>,
    ) -> VaultResult<VaultItem> {
        let total = item.chunks;
        for chunk in 1..=total {
            if chunk > skip {
                let (start, end) = self
                    .layout
                    .plaintext_range(chunk, item.size)
                    .map_err(|e| VaultError::transfer(chunk, e))?;
                let sealed = encrypt_chunk(key, &data[start as usize..end as usize])?;
                self.upload_chunk(user_id, &item.id, chunk, sealed)
                    .await
                    .map_err(|e| at_chunk(chunk, e))?;
            }
            if let Some(report) = progress {
                report(chunk as u64, total as u64);
            }
        }

        self.item_access(user_id, &item.id).map(|(item, _)| item)
    }

    /// Download and open every chunk of an item.
    ///
    /// A chunk that fails authentication aborts the whole download.
    pub async fn download_file(
        &self,
        session: &VaultSession,
        item_id: &str,
        progress: Option<&ProgressFn>,
    ) -> VaultResult<Vec<u8>> {
        let (item, _) = self.item_access(session.user_id(), item_id)?;
        if !item.is_complete() {
            return Err(VaultError::not_found(format!("payload of item {item_id}")));
        }
        let key = session.item_key(self, &item)?;

        let mut out = Vec::new();
        for chunk in 1..=item.chunks {
            let sealed = self
                .download_chunk(session.user_id(), item_id, chunk)
                .await
                .map_err(|e| at_chunk(chunk, e))?;
            let plain = decrypt_chunk(&key, &sealed.data)
                .map_err(|e| VaultError::Crypto(format!("chunk {chunk}: {e}")))?;
            out.extend_from_slice(&plain);

            if let Some(report) = progress {
                report(chunk as u64, item.chunks as u64);
            }
            if sealed.eof && chunk != item.chunks {
                return Err(VaultError::transfer(chunk, "payload ended early"));
            }
        }

        if out.len() as u64 != item.size {
            return Err(VaultError::transfer(
                item.chunks,
                format!("payload is {} bytes, expected {}", out.len(), item.size),
            ));
        }
        Ok(out)
    }
}
