//! Object-store sessions: single-shot uploads, multi-part "large files",
//! ranged downloads, and deletes.
//!
//! `OpendalObjectStore` emulates a vendor large-file API on top of any
//! OpenDAL backend. Parts are staged under `{prefix}parts/{file_id}/` next
//! to an `info` marker, so an open session outlives the process that
//! started it. Finish streams the parts into `{prefix}objects/{file_id}`,
//! re-verifying each part's checksum in order.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, PoisonError};

use anyhow::{Context, Result};
use async_trait::async_trait;
use opendal::{ErrorKind, Operator};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Where and with what credential the next upload may be sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadTarget {
    pub url: String,
    pub token: String,
}

/// A finalized payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub object_id: String,
    pub length: u64,
}

#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Upload target for a single-shot upload.
    async fn get_upload_url(&self) -> Result<UploadTarget>;

    /// Single-shot upload of a whole (one-chunk) payload.
    async fn upload_file(
        &self,
        target: &UploadTarget,
        name: &str,
        checksum: &str,
        data: Vec<u8>,
    ) -> Result<StoredObject>;

    /// Withdraw an issued, unused upload token. Returns false if it was
    /// already spent or never issued.
    async fn revoke_upload_url(&self, token: &str) -> Result<bool>;

    /// Open a multi-part session, returning its file id.
    async fn start_large_file(&self, name: &str) -> Result<String>;

    /// Fresh upload target for the next part of `file_id`.
    async fn get_upload_part_url(&self, file_id: &str) -> Result<UploadTarget>;

    /// Upload 1-based `part` of `file_id`.
    async fn upload_file_part(
        &self,
        target: &UploadTarget,
        file_id: &str,
        part: u32,
        checksum: &str,
        data: Vec<u8>,
    ) -> Result<()>;

    /// Close a multi-part session. `checksums` must list every part in order.
    async fn finish_large_file(&self, file_id: &str, checksums: &[String]) -> Result<StoredObject>;

    /// Discard an unfinished multi-part session. Returns false if unknown.
    async fn cancel_large_file(&self, file_id: &str) -> Result<bool>;

    /// Inclusive byte range `[start, end]` of a stored object.
    async fn partial_download(&self, object_id: &str, start: u64, end: u64) -> Result<Vec<u8>>;

    /// Delete a stored object. Deleting a missing object succeeds.
    async fn delete_file(&self, object_id: &str) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum TargetScope {
    Bucket,
    Part(String),
}

pub struct OpendalObjectStore {
    op: Operator,
    prefix: String,
    /// Issued, not yet used upload tokens
    targets: Mutex<HashMap<String, TargetScope>>,
}

impl OpendalObjectStore {
    /// `prefix` is prepended to every key (e.g. "vault/"); may be empty.
    pub fn new(op: Operator, prefix: &str) -> Self {
        let prefix = match prefix.trim_matches('/') {
            "" => String::new(),
            p => format!("{p}/"),
        };
        Self {
            op,
            prefix,
            targets: Mutex::new(HashMap::new()),
        }
    }

    pub fn operator(&self) -> &Operator {
        &self.op
    }

    /// Upload tokens issued and neither spent nor revoked.
    pub fn pending_targets(&self) -> usize {
        self.targets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn object_path(&self, object_id: &str) -> String {
        format!("{}objects/{object_id}", self.prefix)
    }

    fn staging_dir(&self, file_id: &str) -> String {
        format!("{}parts/{file_id}/", self.prefix)
    }

    fn marker_path(&self, file_id: &str) -> String {
        format!("{}info", self.staging_dir(file_id))
    }

    fn part_path(&self, file_id: &str, part: u32) -> String {
        format!("{}{part:08}", self.staging_dir(file_id))
    }

    fn issue_target(&self, scope: TargetScope) -> UploadTarget {
        let token = Uuid::new_v4().to_string();
        let url = match &scope {
            TargetScope::Bucket => format!("{}upload/{token}", self.prefix),
            TargetScope::Part(file_id) => format!("{}upload/{file_id}/{token}", self.prefix),
        };
        self.targets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(token.clone(), scope);
        UploadTarget { url, token }
    }

    /// Consume a token, checking it was issued for `scope`.
    fn redeem_target(&self, target: &UploadTarget, scope: &TargetScope) -> Result<()> {
        let mut targets = self.targets.lock().unwrap_or_else(PoisonError::into_inner);
        match targets.get(&target.token) {
            Some(issued) if issued == scope => {
                targets.remove(&target.token);
                Ok(())
            }
            Some(_) => anyhow::bail!("upload token was issued for a different destination"),
            None => anyhow::bail!("unknown or already used upload token"),
        }
    }

    /// Drop every unused part token of a closed large file.
    fn revoke_part_targets(&self, file_id: &str) -> usize {
        let mut targets = self.targets.lock().unwrap_or_else(PoisonError::into_inner);
        let before = targets.len();
        targets.retain(|_, scope| !matches!(scope, TargetScope::Part(id) if id == file_id));
        before - targets.len()
    }

    async fn is_open(&self, file_id: &str) -> Result<bool> {
        let marker = self.marker_path(file_id);
        self.op
            .exists(&marker)
            .await
            .with_context(|| format!("checking large file marker: {marker}"))
    }

    async fn ensure_open(&self, file_id: &str) -> Result<()> {
        if !self.is_open(file_id).await? {
            anyhow::bail!("no open large file with id {file_id}");
        }
        Ok(())
    }

    /// Part numbers currently staged for `file_id`.
    async fn staged_parts(&self, file_id: &str) -> Result<BTreeSet<u32>> {
        let dir = self.staging_dir(file_id);
        let entries = match self.op.list(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e).with_context(|| format!("listing staged parts: {dir}")),
        };
        Ok(entries
            .iter()
            .filter_map(|entry| entry.name().trim_end_matches('/').parse::<u32>().ok())
            .collect())
    }

    async fn remove_staging(&self, file_id: &str, parts: &BTreeSet<u32>) -> Result<()> {
        for part in parts {
            let path = self.part_path(file_id, *part);
            self.op
                .delete(&path)
                .await
                .with_context(|| format!("removing staged part: {path}"))?;
        }
        let marker = self.marker_path(file_id);
        self.op
            .delete(&marker)
            .await
            .with_context(|| format!("removing large file marker: {marker}"))
    }
}

fn verify(data: &[u8], checksum: &str, what: &str) -> Result<()> {
    if !coffer_chunks::verify_checksum(data, checksum) {
        anyhow::bail!(
            "checksum mismatch for {what}: expected {checksum}, got {}",
            coffer_chunks::checksum(data)
        );
    }
    Ok(())
}

#[async_trait]
impl ObjectStore for OpendalObjectStore {
    async fn get_upload_url(&self) -> Result<UploadTarget> {
        Ok(self.issue_target(TargetScope::Bucket))
    }

    async fn upload_file(
        &self,
        target: &UploadTarget,
        name: &str,
        checksum: &str,
        data: Vec<u8>,
    ) -> Result<StoredObject> {
        self.redeem_target(target, &TargetScope::Bucket)?;
        verify(&data, checksum, name)?;

        let object_id = Uuid::new_v4().to_string();
        let length = data.len() as u64;
        let path = self.object_path(&object_id);
        self.op
            .write(&path, data)
            .await
            .with_context(|| format!("uploading object: {path}"))?;

        info!(object_id = %object_id, name, length, "uploaded single-shot object");
        Ok(StoredObject { object_id, length })
    }

    async fn revoke_upload_url(&self, token: &str) -> Result<bool> {
        Ok(self
            .targets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(token)
            .is_some())
    }

    async fn start_large_file(&self, name: &str) -> Result<String> {
        let file_id = Uuid::new_v4().to_string();
        let marker = self.marker_path(&file_id);
        self.op
            .write(&marker, name.as_bytes().to_vec())
            .await
            .with_context(|| format!("writing large file marker: {marker}"))?;
        debug!(file_id = %file_id, name, "started large file");
        Ok(file_id)
    }

    async fn get_upload_part_url(&self, file_id: &str) -> Result<UploadTarget> {
        self.ensure_open(file_id).await?;
        Ok(self.issue_target(TargetScope::Part(file_id.to_string())))
    }

    async fn upload_file_part(
        &self,
        target: &UploadTarget,
        file_id: &str,
        part: u32,
        checksum: &str,
        data: Vec<u8>,
    ) -> Result<()> {
        self.redeem_target(target, &TargetScope::Part(file_id.to_string()))?;
        if part == 0 {
            anyhow::bail!("part numbers start at 1");
        }
        verify(&data, checksum, &format!("{file_id} part {part}"))?;
        self.ensure_open(file_id).await?;

        let length = data.len() as u64;
        let path = self.part_path(file_id, part);
        self.op
            .write(&path, data)
            .await
            .with_context(|| format!("uploading part: {path}"))?;
        debug!(file_id, part, length, "uploaded part");
        Ok(())
    }

    async fn finish_large_file(&self, file_id: &str, checksums: &[String]) -> Result<StoredObject> {
        self.ensure_open(file_id).await?;
        let parts = self.staged_parts(file_id).await?;
        if checksums.len() != parts.len() {
            anyhow::bail!(
                "finish rejected: {} checksums supplied for {} uploaded parts",
                checksums.len(),
                parts.len()
            );
        }
        if let Some(missing) = (1..=checksums.len() as u32).find(|p| !parts.contains(p)) {
            anyhow::bail!("finish rejected: part {missing} was never uploaded");
        }

        let object_path = self.object_path(file_id);
        let mut writer = self
            .op
            .writer(&object_path)
            .await
            .with_context(|| format!("opening finished object: {object_path}"))?;
        let mut length = 0u64;
        for (i, want) in checksums.iter().enumerate() {
            let part = i as u32 + 1;
            let path = self.part_path(file_id, part);
            let appended = async {
                let data = self
                    .op
                    .read(&path)
                    .await
                    .with_context(|| format!("reading part: {path}"))?
                    .to_vec();
                verify(&data, want, &format!("{file_id} part {part}"))
                    .context("finish rejected")?;
                let len = data.len() as u64;
                writer
                    .write(data)
                    .await
                    .with_context(|| format!("writing finished object: {object_path}"))?;
                anyhow::Ok(len)
            }
            .await;
            match appended {
                Ok(len) => length += len,
                Err(e) => {
                    if let Err(abort) = writer.abort().await {
                        warn!(path = %object_path, "failed to abort partial object: {abort}");
                    }
                    return Err(e);
                }
            }
        }
        writer
            .close()
            .await
            .with_context(|| format!("closing finished object: {object_path}"))?;

        if let Err(e) = self.remove_staging(file_id, &parts).await {
            warn!(file_id, "failed to remove staged parts: {e:#}");
        }
        self.revoke_part_targets(file_id);

        info!(object_id = %file_id, parts = checksums.len(), length, "finished large file");
        Ok(StoredObject {
            object_id: file_id.to_string(),
            length,
        })
    }

    async fn cancel_large_file(&self, file_id: &str) -> Result<bool> {
        let revoked = self.revoke_part_targets(file_id);
        if !self.is_open(file_id).await? {
            return Ok(false);
        }
        let parts = self.staged_parts(file_id).await?;
        self.remove_staging(file_id, &parts).await?;
        info!(file_id, parts = parts.len(), revoked, "cancelled large file");
        Ok(true)
    }

    async fn partial_download(&self, object_id: &str, start: u64, end: u64) -> Result<Vec<u8>> {
        if end < start {
            anyhow::bail!("invalid range {start}..={end}");
        }
        let path = self.object_path(object_id);
        let buf = self
            .op
            .read_with(&path)
            .range(start..end + 1)
            .await
            .with_context(|| format!("reading {path} bytes {start}..={end}"))?;
        Ok(buf.to_vec())
    }

    async fn delete_file(&self, object_id: &str) -> Result<()> {
        let path = self.object_path(object_id);
        self.op
            .delete(&path)
            .await
            .with_context(|| format!("deleting object: {path}"))
    }
}
