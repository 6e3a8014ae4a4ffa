//! Local chunk cache for downloaded ciphertext.
//!
//! Entries are keyed by item id and sized to the item's stored length. An
//! entry is filled sequentially as chunks are fetched (write-through) and
//! only counts as a hit once it holds the full length. Entries still being
//! filled are never evicted; otherwise the oldest go first.
//!
//! Cache layout: `{cache_dir}/{id[0..2]}/{id}` (two-level sharding).

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::debug;

pub struct ChunkCache {
    dir: PathBuf,
    max_bytes: u64,
    max_file_bytes: u64,
    /// item id -> expected length, for entries still being filled
    filling: Mutex<HashMap<String, u64>>,
}

impl ChunkCache {
    /// Create a cache at `dir` holding at most `max_bytes`, with no single
    /// entry larger than `max_file_bytes`.
    pub fn new(dir: PathBuf, max_bytes: u64, max_file_bytes: u64) -> Self {
        ChunkCache {
            dir,
            max_bytes,
            max_file_bytes: max_file_bytes.min(max_bytes),
            filling: Mutex::new(HashMap::new()),
        }
    }

    fn path_for(&self, item_id: &str) -> PathBuf {
        let prefix = if item_id.len() >= 2 && item_id.is_char_boundary(2) {
            &item_id[..2]
        } else {
            "xx"
        };
        self.dir.join(prefix).join(item_id)
    }

    fn is_filling(&self, item_id: &str) -> bool {
        self.filling
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(item_id)
    }

    /// True if a complete entry of exactly `length` bytes is cached.
    pub async fn has_file(&self, item_id: &str, length: u64) -> bool {
        if self.is_filling(item_id) {
            return false;
        }
        match fs::metadata(self.path_for(item_id)).await {
            Ok(meta) => meta.is_file() && meta.len() == length,
            Err(_) => false,
        }
    }

    /// Reserve space for an entry of `length` bytes and start filling it.
    ///
    /// Returns false (and caches nothing) if the entry can never fit.
    pub async fn prep(&self, item_id: &str, length: u64) -> Result<bool> {
        if length == 0 || length > self.max_file_bytes {
            return Ok(false);
        }

        self.evict_for(length).await?;

        let path = self.path_for(item_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating cache dir: {}", parent.display()))?;
        }
        fs::File::create(&path)
            .await
            .with_context(|| format!("creating cache entry: {}", path.display()))?;

        self.filling
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(item_id.to_string(), length);
        debug!(item_id, length, "cache entry prepared");
        Ok(true)
    }

    /// Append `data`, which must start at byte `offset` of the entry.
    ///
    /// Writes for entries that were never prepared are ignored. A write that
    /// is out of sequence or overruns the expected length drops the entry.
    pub async fn write(&self, item_id: &str, offset: u64, data: &[u8]) -> Result<()> {
        let expected = {
            let filling = self.filling.lock().unwrap_or_else(PoisonError::into_inner);
            match filling.get(item_id) {
                Some(len) => *len,
                None => return Ok(()),
            }
        };

        let path = self.path_for(item_id);
        let current = fs::metadata(&path).await.map(|m| m.len()).unwrap_or(u64::MAX);
        let end = offset + data.len() as u64;
        if current != offset || end > expected {
            debug!(item_id, offset, current, "out-of-sequence cache write, dropping entry");
            return self.remove(item_id).await;
        }

        let mut file = fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("opening cache entry: {}", path.display()))?;
        file.write_all(data)
            .await
            .with_context(|| format!("writing cache entry: {}", path.display()))?;
        file.flush().await?;

        if end == expected {
            self.filling
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(item_id);
            debug!(item_id, length = expected, "cache entry complete");
        }
        Ok(())
    }

    /// Read the inclusive byte range `[start, end]` of a cached entry.
    pub async fn read(&self, item_id: &str, start: u64, end: u64) -> Result<Vec<u8>> {
        if end < start {
            anyhow::bail!("invalid range {start}..={end}");
        }
        let path = self.path_for(item_id);
        let mut file = fs::File::open(&path)
            .await
            .with_context(|| format!("opening cache entry: {}", path.display()))?;
        file.seek(SeekFrom::Start(start)).await?;

        let mut buf = vec![0u8; (end - start + 1) as usize];
        file.read_exact(&mut buf)
            .await
            .with_context(|| format!("reading cache entry: {}", path.display()))?;
        Ok(buf)
    }

    /// Drop an entry. Removing a missing entry succeeds.
    pub async fn remove(&self, item_id: &str) -> Result<()> {
        self.filling
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(item_id);

        let path = self.path_for(item_id);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("removing cache entry: {}", path.display())),
        }
    }

    /// Evict the oldest complete entries until `incoming` more bytes fit.
    async fn evict_for(&self, incoming: u64) -> Result<()> {
        let mut entries: Vec<(String, PathBuf, u64, std::time::SystemTime)> = Vec::new();
        let mut total: u64 = 0;

        let mut top = match fs::read_dir(&self.dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e).context("listing cache dir"),
        };
        while let Some(shard) = top.next_entry().await? {
            if !shard.file_type().await?.is_dir() {
                continue;
            }
            let mut inner = fs::read_dir(shard.path()).await?;
            while let Some(entry) = inner.next_entry().await? {
                let meta = entry.metadata().await?;
                if !meta.is_file() {
                    continue;
                }
                let mtime = meta.modified().unwrap_or(std::time::UNIX_EPOCH);
                let name = entry.file_name().to_string_lossy().into_owned();
                // Reserved space for in-progress entries counts in full
                let size = self
                    .filling
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .get(&name)
                    .copied()
                    .unwrap_or(meta.len());
                total += size;
                entries.push((name, entry.path(), size, mtime));
            }
        }

        if total + incoming <= self.max_bytes {
            return Ok(());
        }

        entries.sort_by_key(|(_, _, _, mtime)| *mtime);
        for (name, path, size, _) in entries {
            if total + incoming <= self.max_bytes {
                break;
            }
            if self.is_filling(&name) {
                continue;
            }
            let _ = fs::remove_file(&path).await;
            total = total.saturating_sub(size);
            debug!(item_id = %name, size, "evicted cache entry");
        }

        if total + incoming > self.max_bytes {
            anyhow::bail!("cache full: {total} bytes held by in-progress entries");
        }
        Ok(())
    }
}
