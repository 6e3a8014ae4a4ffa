//! Ephemeral transfers: anonymous uploads with an expiry and a download
//! budget, outside any vault tree.
//!
//! A download is a session that must read chunks in order. Reaching the
//! last chunk spends one download; spending the last one deletes the
//! transfer on the spot.

use std::time::Duration;

use coffer_core::types::{DownloadProgress, FileExpiry, FileMetadata};
use coffer_core::{VaultError, VaultResult};
use tracing::{info, warn};
use uuid::Uuid;

use crate::transfer::{ChunkData, ChunkOutcome};
use crate::vault::Vault;

/// Largest plaintext accepted by a text send.
pub const MAX_TEXT_SEND_LEN: u64 = 2000;

/// A sender's request to start an ephemeral transfer. The name arrives
/// sealed; the key never reaches the server.
#[derive(Debug, Clone)]
pub struct NewSend {
    pub name: Vec<u8>,
    /// Plaintext size in bytes
    pub size: u64,
    pub chunks: u32,
    pub downloads: u32,
    pub expires_in: Duration,
}

/// A short message sent in one request. `text` is already sealed with
/// the chunk codec.
#[derive(Debug, Clone)]
pub struct NewTextSend {
    pub name: Vec<u8>,
    pub text: Vec<u8>,
    pub downloads: u32,
    pub expires_in: Duration,
}

impl Vault {
    /// Start an ephemeral transfer, charging its plaintext size to the
    /// sender's send meter.
    pub async fn init_send(&self, sender_id: &str, send: NewSend) -> VaultResult<String> {
        if send.name.is_empty() {
            return Err(VaultError::Invalid("transfer needs a name".into()));
        }
        if send.downloads == 0 {
            return Err(VaultError::Invalid("transfer must allow at least one download".into()));
        }
        let expected = self
            .layout
            .chunk_count(send.size)
            .map_err(|e| VaultError::Invalid(format!("{e:#}")))?;
        if send.size == 0 || send.chunks != expected {
            return Err(VaultError::Invalid(format!(
                "{} bytes cannot be sent as {} chunks",
                send.size, send.chunks
            )));
        }

        self.store.adjust_send(sender_id, send.size as i64)?;

        let id = Uuid::new_v4().to_string();
        let opened = self
            .store
            .insert_metadata(FileMetadata {
                id: id.clone(),
                name: send.name,
                chunks: send.chunks,
                size: send.size,
                sender_id: Some(sender_id.to_string()),
                object_id: None,
                length: 0,
            })
            .and_then(|()| {
                self.store.set_expiry(
                    &id,
                    FileExpiry {
                        downloads_remaining: send.downloads,
                        expires_at: coffer_core::unix_now()
                            .saturating_add(send.expires_in.as_secs()),
                    },
                )
            });
        let opened = match opened {
            Ok(()) => self.open_session(&id, send.chunks).await,
            Err(e) => Err(e),
        };

        if let Err(e) = opened {
            warn!(transfer_id = %id, "send init failed, rolling back: {e}");
            if let Err(undo) = self.store.delete_metadata(&id) {
                warn!(transfer_id = %id, "rollback could not remove metadata: {undo}");
            }
            if let Err(undo) = self.store.delete_expiry(&id) {
                warn!(transfer_id = %id, "rollback could not remove expiry: {undo}");
            }
            if let Err(undo) = self.store.adjust_send(sender_id, -(send.size as i64)) {
                warn!(transfer_id = %id, sender = sender_id, "rollback could not refund send meter: {undo}");
            }
            return Err(e);
        }

        info!(transfer_id = %id, sender = sender_id, chunks = send.chunks, downloads = send.downloads, "transfer initialized");
        Ok(id)
    }

    /// Create and upload a text transfer in one step. The result is
    /// downloadable as soon as this returns.
    pub async fn send_text(&self, sender_id: &str, send: NewTextSend) -> VaultResult<String> {
        let sealed = send.text.len() as u64;
        if sealed <= self.layout.overhead {
            return Err(VaultError::Invalid("text transfer is empty".into()));
        }
        let size = sealed - self.layout.overhead;
        if size > MAX_TEXT_SEND_LEN {
            return Err(VaultError::Invalid(format!(
                "text is {size} bytes, at most {MAX_TEXT_SEND_LEN} allowed"
            )));
        }
        if size > self.layout.chunk_size {
            return Err(VaultError::Invalid(format!(
                "text of {size} bytes does not fit one {}-byte chunk",
                self.layout.chunk_size
            )));
        }

        let id = self
            .init_send(
                sender_id,
                NewSend {
                    name: send.name,
                    size,
                    chunks: 1,
                    downloads: send.downloads,
                    expires_in: send.expires_in,
                },
            )
            .await?;
        if let Err(e) = self.upload_send_chunk(&id, 1, send.text).await {
            warn!(transfer_id = %id, "text upload failed, removing transfer: {e}");
            if let Err(undo) = self.delete_transfer(&id).await {
                warn!(transfer_id = %id, "could not remove failed text transfer: {undo}");
            }
            return Err(e);
        }
        Ok(id)
    }

    pub async fn upload_send_chunk(
        &self,
        id: &str,
        chunk: u32,
        data: Vec<u8>,
    ) -> VaultResult<ChunkOutcome> {
        let meta = self.live_metadata(id)?;
        if meta.object_id.is_some() {
            return Err(VaultError::Invalid(format!("transfer {id} is already uploaded")));
        }
        self.put_chunk(id, meta.size, meta.chunks, chunk, data).await
    }

    /// Start a download session for a complete, unexpired transfer.
    pub fn begin_send_download(&self, id: &str) -> VaultResult<String> {
        let meta = self.live_metadata(id)?;
        if meta.object_id.is_none() {
            return Err(VaultError::not_found(format!("payload of transfer {id}")));
        }

        let download_id = Uuid::new_v4().to_string();
        self.store.insert_download(DownloadProgress {
            id: download_id.clone(),
            file_id: id.to_string(),
            chunk: 0,
            updated: coffer_core::unix_now(),
        })?;
        Ok(download_id)
    }

    /// Serve the next chunk of a download session. Re-reading the current
    /// chunk is allowed; skipping ahead is not.
    pub async fn download_send_chunk(
        &self,
        download_id: &str,
        chunk: u32,
    ) -> VaultResult<ChunkData> {
        let progress = self
            .store
            .get_download(download_id)
            .ok_or_else(|| VaultError::not_found(format!("download {download_id}")))?;
        if chunk != progress.chunk + 1 && chunk != progress.chunk {
            return Err(VaultError::transfer(
                chunk,
                format!("out of order: expected chunk {}", progress.chunk + 1),
            ));
        }

        let id = progress.file_id;
        let meta = self.live_metadata(&id)?;
        let object_id = meta
            .object_id
            .as_deref()
            .ok_or_else(|| VaultError::not_found(format!("payload of transfer {id}")))?;

        let data = self.fetch_chunk(&id, object_id, meta.length, chunk).await?;
        if !data.eof {
            self.store
                .update_download(download_id, chunk, coffer_core::unix_now())?;
            return Ok(data);
        }

        self.store.delete_download(download_id)?;
        let remaining = self.store.decrement_downloads(&id)?;
        info!(transfer_id = %id, remaining, "transfer downloaded");
        if remaining == 0 {
            if let Err(e) = self.delete_transfer(&id).await {
                warn!(transfer_id = %id, "delete after last download failed, reaper will retry: {e}");
            }
        }
        Ok(data)
    }

    /// Remove a transfer's payload and rows. The payload goes first; if the
    /// store refuses, the rows stay so a later sweep can retry. A transfer
    /// that never finished uploading is refunded to its sender. Returns
    /// false when there was nothing to remove.
    pub async fn delete_transfer(&self, id: &str) -> VaultResult<bool> {
        let meta = self.store.retrieve_metadata(id);
        let session = self.store.get_upload_values(id);

        if let Some(object_id) = meta.as_ref().and_then(|m| m.object_id.as_deref()) {
            self.objects.delete_file(object_id).await.map_err(|e| {
                VaultError::Storage(format!("deleting payload of transfer {id}: {e:#}"))
            })?;
        } else {
            if let Some(session) = &session {
                self.release_session(id, session).await;
            }
            if let Some(FileMetadata {
                sender_id: Some(sender),
                size,
                ..
            }) = &meta
            {
                if let Err(e) = self.store.adjust_send(sender, -(*size as i64)) {
                    warn!(transfer_id = id, sender = %sender, "could not refund send meter: {e}");
                }
            }
        }

        let had_expiry = self.store.delete_expiry(id)?;
        self.store.delete_upload_session(id)?;
        self.store.delete_downloads_for(id)?;
        let had_meta = self.store.delete_metadata(id)?;
        self.release_upload_lock(id);
        self.drop_cached(id).await;

        Ok(had_meta || had_expiry)
    }

    /// Metadata for a transfer that has neither expired nor run out of
    /// downloads. Spent transfers read as missing.
    fn live_metadata(&self, id: &str) -> VaultResult<FileMetadata> {
        let expiry = self
            .store
            .get_expiry(id)
            .ok_or_else(|| VaultError::not_found(format!("transfer {id}")))?;
        if expiry.is_expired(coffer_core::unix_now()) {
            return Err(VaultError::not_found(format!("transfer {id}")));
        }
        self.store
            .retrieve_metadata(id)
            .ok_or_else(|| VaultError::not_found(format!("transfer {id}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vault::testing::{fast_options, signup, vault, vault_with, CHUNK};
    use crate::vault::VaultOptions;
    use coffer_crypto::{decrypt_chunk, encrypt_chunk, generate_key};

    fn new_send(size: u64, chunks: u32) -> NewSend {
        NewSend {
            name: vec![1],
            size,
            chunks,
            downloads: 1,
            expires_in: Duration::from_secs(60),
        }
    }

    #[tokio::test]
    async fn test_send_roundtrip_and_budget() {
        let v = vault();
        signup(&v, "alice");
        let key = generate_key();
        let data: Vec<u8> = (0..CHUNK + 10).map(|i| i as u8).collect();

        let id = v
            .init_send(
                "alice",
                NewSend {
                    name: encrypt_chunk(&key, b"photo.jpg").unwrap(),
                    size: data.len() as u64,
                    chunks: 2,
                    downloads: 1,
                    expires_in: Duration::from_secs(3600),
                },
            )
            .await
            .unwrap();

        let first = encrypt_chunk(&key, &data[..CHUNK as usize]).unwrap();
        let second = encrypt_chunk(&key, &data[CHUNK as usize..]).unwrap();
        v.upload_send_chunk(&id, 1, first).await.unwrap();
        assert!(matches!(
            v.upload_send_chunk(&id, 2, second).await.unwrap(),
            ChunkOutcome::Complete(_)
        ));

        let dl = v.begin_send_download(&id).unwrap();
        assert!(v.download_send_chunk(&dl, 2).await.is_err(), "no skipping ahead");
        let c1 = v.download_send_chunk(&dl, 1).await.unwrap();
        assert!(!c1.eof);
        let c2 = v.download_send_chunk(&dl, 2).await.unwrap();
        assert!(c2.eof);

        let mut plain = decrypt_chunk(&key, &c1.data).unwrap();
        plain.extend(decrypt_chunk(&key, &c2.data).unwrap());
        assert_eq!(plain, data);

        // Budget spent: everything is gone, the sent bytes stay charged
        assert!(v.store().retrieve_metadata(&id).is_none());
        assert!(v.store().get_expiry(&id).is_none());
        assert!(matches!(
            v.begin_send_download(&id),
            Err(VaultError::NotFound(_))
        ));
        assert_eq!(v.account("alice").unwrap().send_used, CHUNK + 10);
    }

    #[tokio::test]
    async fn test_incomplete_send_is_not_downloadable() {
        let v = vault();
        signup(&v, "alice");
        let id = v
            .init_send(
                "alice",
                NewSend {
                    downloads: 2,
                    ..new_send(3, 1)
                },
            )
            .await
            .unwrap();
        assert_eq!(v.account("alice").unwrap().send_used, 3);
        assert!(matches!(
            v.begin_send_download(&id),
            Err(VaultError::NotFound(_))
        ));
        assert!(v.delete_transfer(&id).await.unwrap());
        assert!(!v.delete_transfer(&id).await.unwrap());
        assert_eq!(v.account("alice").unwrap().send_used, 0);
    }

    #[tokio::test]
    async fn test_send_validation() {
        let v = vault();
        signup(&v, "alice");
        let bad = NewSend {
            downloads: 0,
            ..new_send(10, 1)
        };
        assert!(matches!(
            v.init_send("alice", bad).await,
            Err(VaultError::Invalid(_))
        ));
        assert!(matches!(
            v.init_send("alice", new_send(10, 2)).await,
            Err(VaultError::Invalid(_))
        ));

        // A size needing more chunks than an index can hold must not wrap
        let huge = (u32::MAX as u64 + 1) * CHUNK + 1;
        assert!(matches!(
            v.init_send("alice", new_send(huge, 2)).await,
            Err(VaultError::Invalid(_))
        ));
        assert!(matches!(
            v.init_send("nobody", new_send(10, 1)).await,
            Err(VaultError::NotFound(_))
        ));
        assert_eq!(v.account("alice").unwrap().send_used, 0);
    }

    #[tokio::test]
    async fn test_sealed_chunk_must_match_its_share() {
        let v = vault();
        signup(&v, "alice");
        let key = generate_key();
        let id = v.init_send("alice", new_send(CHUNK + 10, 2)).await.unwrap();

        let short = encrypt_chunk(&key, &[7u8; 5]).unwrap();
        let err = v.upload_send_chunk(&id, 1, short.clone()).await.unwrap_err();
        assert_eq!(err.failed_chunk(), Some(1));

        let full = encrypt_chunk(&key, &[7u8; CHUNK as usize]).unwrap();
        v.upload_send_chunk(&id, 1, full).await.unwrap();

        let err = v.upload_send_chunk(&id, 2, short).await.unwrap_err();
        assert_eq!(err.failed_chunk(), Some(2));
        assert!(v.begin_send_download(&id).is_err());

        let tail = encrypt_chunk(&key, &[7u8; 10]).unwrap();
        let done = v.upload_send_chunk(&id, 2, tail).await.unwrap();
        let ChunkOutcome::Complete(stored) = done else {
            panic!("expected completion, got {done:?}");
        };
        assert_eq!(stored.length, CHUNK + 10 + 2 * v.layout().overhead);
    }

    #[tokio::test]
    async fn test_send_meter_limits_sender() {
        let v = vault_with(VaultOptions {
            default_send_limit: Some(CHUNK * 2),
            ..fast_options()
        });
        signup(&v, "alice");

        let first = v.init_send("alice", new_send(CHUNK * 2, 2)).await.unwrap();
        let err = v.init_send("alice", new_send(1, 1)).await.unwrap_err();
        assert!(matches!(err, VaultError::Capacity { needed: 1, available: 0 }));

        // Abandoned before upload finished: the allowance comes back
        v.delete_transfer(&first).await.unwrap();
        v.init_send("alice", new_send(1, 1)).await.unwrap();
        assert_eq!(v.account("alice").unwrap().send_used, 1);
    }

    #[tokio::test]
    async fn test_text_send_is_ready_immediately() {
        let v = vault();
        signup(&v, "alice");
        let key = generate_key();

        let id = v
            .send_text(
                "alice",
                NewTextSend {
                    name: encrypt_chunk(&key, b"note").unwrap(),
                    text: encrypt_chunk(&key, b"meet at noon").unwrap(),
                    downloads: 1,
                    expires_in: Duration::from_secs(600),
                },
            )
            .await
            .unwrap();
        assert_eq!(v.store().retrieve_metadata(&id).unwrap().chunks, 1);

        let dl = v.begin_send_download(&id).unwrap();
        let chunk = v.download_send_chunk(&dl, 1).await.unwrap();
        assert!(chunk.eof);
        assert_eq!(decrypt_chunk(&key, &chunk.data).unwrap(), b"meet at noon");
        assert!(v.store().retrieve_metadata(&id).is_none());
        assert_eq!(v.account("alice").unwrap().send_used, 12);
    }

    #[tokio::test]
    async fn test_text_send_length_limits() {
        let v = vault_with(VaultOptions {
            chunk_size: 4096,
            ..fast_options()
        });
        signup(&v, "alice");
        let key = generate_key();
        let text = |len: usize| NewTextSend {
            name: vec![1],
            text: encrypt_chunk(&key, &vec![b'a'; len]).unwrap(),
            downloads: 1,
            expires_in: Duration::from_secs(60),
        };

        v.send_text("alice", text(MAX_TEXT_SEND_LEN as usize))
            .await
            .unwrap();
        assert!(matches!(
            v.send_text("alice", text(MAX_TEXT_SEND_LEN as usize + 1)).await,
            Err(VaultError::Invalid(_))
        ));
        assert!(matches!(
            v.send_text(
                "alice",
                NewTextSend {
                    text: vec![0; v.layout().overhead as usize],
                    ..text(1)
                }
            )
            .await,
            Err(VaultError::Invalid(_))
        ));

        // Smaller chunks than the text limit: one chunk still has to hold it
        let small = vault();
        signup(&small, "bob");
        assert!(matches!(
            small.send_text("bob", text(CHUNK as usize + 1)).await,
            Err(VaultError::Invalid(_))
        ));
    }

    #[tokio::test]
    async fn test_far_expiry_saturates() {
        let v = vault();
        signup(&v, "alice");
        let id = v
            .init_send(
                "alice",
                NewSend {
                    expires_in: Duration::MAX,
                    ..new_send(3, 1)
                },
            )
            .await
            .unwrap();
        let expiry = v.store().get_expiry(&id).unwrap();
        assert_eq!(expiry.expires_at, u64::MAX);
        assert!(!expiry.is_expired(coffer_core::unix_now()));
    }
}
