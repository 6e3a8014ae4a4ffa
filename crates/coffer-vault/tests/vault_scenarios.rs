//! End-to-end vault scenarios over an in-memory OpenDAL backend.
//!
//! Each test builds a vault from public pieces only (JsonStore, an
//! OpendalObjectStore on the memory service) and drives it the way a
//! client and the daemon would.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use coffer_core::VaultError;
use coffer_crypto::{encrypt_chunk, generate_key, KdfParams};
use coffer_storage::{
    memory_operator, ChunkCache, ObjectStore, OpendalObjectStore, StoredObject, UploadTarget,
};
use coffer_vault::{
    ChunkOutcome, ExpiryReaper, JsonStore, NewSend, NewUpload, Vault, VaultOptions, VaultSession,
    VaultStore,
};
use opendal::Operator;
use secrecy::SecretString;

const CHUNK: u64 = 64;

fn options() -> VaultOptions {
    VaultOptions {
        chunk_size: CHUNK,
        kdf: KdfParams {
            mem_cost_kib: 64,
            time_cost: 1,
            parallelism: 1,
        },
        default_storage_limit: None,
        default_send_limit: None,
        max_unlock_attempts: 3,
    }
}

fn vault_on(op: Operator) -> Vault {
    let objects = OpendalObjectStore::new(op, "vault/");
    Vault::new(Arc::new(JsonStore::in_memory()), Arc::new(objects), options())
        .expect("build vault")
}

fn signup(vault: &Vault, name: &str) -> VaultSession {
    let password = SecretString::from(format!("{name}-password"));
    let (account, keypair) = vault
        .create_account(name, &password)
        .expect("create account");
    VaultSession::new(account.id, keypair)
}

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 256) as u8).collect()
}

#[tokio::test]
async fn test_shared_folder_tree_is_readable_by_recipient() {
    let vault = vault_on(memory_operator().expect("memory operator"));
    let alice = signup(&vault, "alice");
    let bob = signup(&vault, "bob");

    let f1 = vault.create_folder(&alice, "alice", "projects").unwrap();
    let f2 = vault.create_folder(&alice, &f1.id, "2026").unwrap();
    let data = payload(3 * CHUNK as usize - 5);
    let item = vault
        .upload_file(&alice, &f2.id, "report.pdf", &data, None)
        .await
        .expect("upload into nested folder");
    assert_eq!(item.chunks, 3);

    vault.share_folder(&alice, &f1.id, "bob", false).unwrap();

    // Bob reaches F2 through the shadow of F1 in his root
    let listing = vault.list_folder("bob", &f2.id).expect("bob lists f2");
    assert!(!listing.folder.is_owner);
    assert!(!listing.folder.can_modify);
    assert_eq!(listing.key_sequence.len(), 2);
    assert_eq!(bob.folder_name(&vault, &f2).unwrap(), "2026");

    let seen = listing
        .items
        .iter()
        .find(|i| i.id == item.id)
        .expect("item visible to bob");
    assert_eq!(bob.item_name(&vault, seen).unwrap(), "report.pdf");
    let fetched = vault.download_file(&bob, &item.id, None).await.unwrap();
    assert_eq!(fetched, data);

    assert!(matches!(
        vault
            .upload_file(&bob, &f2.id, "mine.txt", b"nope", None)
            .await,
        Err(VaultError::ReadOnly)
    ));
}

#[tokio::test]
async fn test_shared_item_lifecycle() {
    let op = memory_operator().expect("memory operator");
    let vault = vault_on(op.clone());
    let alice = signup(&vault, "alice");
    let bob = signup(&vault, "bob");

    let data = payload(2 * CHUNK as usize + 1);
    let item = vault
        .upload_file(&alice, "alice", "notes.txt", &data, None)
        .await
        .unwrap();
    let path = format!("vault/objects/{}", item.object_id.clone().expect("complete item"));
    let before = op.read(&path).await.expect("read object").to_vec();

    let share = vault.share_item(&alice, &item.id, "bob", false).unwrap();

    // Sharing rewraps the key only; the stored ciphertext is untouched
    let after = op.read(&path).await.expect("read object after share").to_vec();
    assert_eq!(after, before);

    let root = vault.list_folder("bob", "bob").unwrap();
    let shadow = root
        .items
        .iter()
        .find(|i| i.ref_id == item.id)
        .expect("shadow in bob's root")
        .clone();
    assert!(!shadow.can_modify);
    assert_ne!(shadow.id, item.id);
    assert_ne!(shadow.protected_key, item.protected_key);
    assert_eq!(shadow.object_id, item.object_id);

    let fetched = vault.download_file(&bob, &shadow.id, None).await.unwrap();
    assert_eq!(fetched, data);
    assert!(matches!(
        vault.rename_item(&bob, &shadow.id, "renamed"),
        Err(VaultError::ReadOnly)
    ));

    vault.delete_item("alice", &item.id).await.expect("delete");
    assert!(vault.list_folder("bob", "bob").unwrap().items.is_empty());
    assert!(vault.share_info("alice", &item.id).is_empty());
    assert!(vault.remove_share("alice", &share.id).is_err());
    assert_eq!(vault.account("alice").unwrap().storage_used, 0);

    // Deleting again is a no-op
    vault.delete_item("alice", &item.id).await.expect("second delete");
}

#[tokio::test]
async fn test_tampered_chunk_fails_authentication() {
    let op = memory_operator().expect("memory operator");
    let vault = vault_on(op.clone());
    let alice = signup(&vault, "alice");

    let data = payload(3 * CHUNK as usize - 5);
    let item = vault
        .upload_file(&alice, "alice", "ledger.csv", &data, None)
        .await
        .unwrap();
    let object_id = item.object_id.clone().expect("complete item");

    let path = format!("vault/objects/{object_id}");
    let mut stored = op.read(&path).await.expect("read object").to_vec();
    let sealed_chunk = (CHUNK + coffer_crypto::TOTAL_OVERHEAD as u64) as usize;
    stored[sealed_chunk + 30] ^= 0x01;
    op.write(&path, stored).await.expect("write tampered object");

    match vault.download_file(&alice, &item.id, None).await {
        Err(VaultError::Crypto(msg)) => assert!(msg.contains("chunk 2"), "got: {msg}"),
        other => panic!("expected crypto error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_repeat_download_is_served_from_cache() {
    let op = memory_operator().expect("memory operator");
    let dir = tempfile::tempdir().expect("tempdir");
    let cache = Arc::new(ChunkCache::new(dir.path().to_path_buf(), 1 << 20, 1 << 20));
    let vault = vault_on(op.clone()).with_cache(cache);
    let alice = signup(&vault, "alice");

    let data = payload(2 * CHUNK as usize + 9);
    let item = vault
        .upload_file(&alice, "alice", "photo.jpg", &data, None)
        .await
        .unwrap();
    assert_eq!(vault.download_file(&alice, &item.id, None).await.unwrap(), data);

    // Once cached, the object store is no longer consulted
    let object_id = item.object_id.clone().unwrap();
    op.delete(&format!("vault/objects/{object_id}"))
        .await
        .expect("delete backing object");
    assert_eq!(vault.download_file(&alice, &item.id, None).await.unwrap(), data);
}

#[tokio::test]
async fn test_state_survives_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");
    let state = dir.path().join("state.json");
    let op = memory_operator().expect("memory operator");

    let item_id = {
        let store = Arc::new(JsonStore::open(&state).expect("open state"));
        let objects = Arc::new(OpendalObjectStore::new(op.clone(), "vault/"));
        let vault = Vault::new(store.clone(), objects, options()).unwrap();
        let alice = signup(&vault, "alice");
        let entry = vault
            .add_password(&alice, "alice", "router", b"hunter2")
            .unwrap();
        store.flush().expect("flush");
        entry.id
    };

    let store = Arc::new(JsonStore::open(&state).expect("reopen state"));
    let objects = Arc::new(OpendalObjectStore::new(op, "vault/"));
    let vault = Vault::new(store, objects, options()).unwrap();
    let alice = VaultSession::unlock(&vault, "Alice", |_| {
        Some(SecretString::from("alice-password"))
    })
    .expect("unlock after reopen");
    assert_eq!(vault.read_password(&alice, &item_id).unwrap(), b"hunter2");
}

/// Object store whose deletes or new sessions can be switched off.
struct FlakyStore {
    inner: OpendalObjectStore,
    fail_deletes: AtomicBool,
    fail_sessions: AtomicBool,
}

impl FlakyStore {
    fn new() -> Self {
        Self {
            inner: OpendalObjectStore::new(memory_operator().expect("memory operator"), "vault/"),
            fail_deletes: AtomicBool::new(false),
            fail_sessions: AtomicBool::new(false),
        }
    }

    fn check_sessions(&self) -> Result<()> {
        if self.fail_sessions.load(Ordering::SeqCst) {
            anyhow::bail!("backend refused new session");
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for FlakyStore {
    async fn get_upload_url(&self) -> Result<UploadTarget> {
        self.check_sessions()?;
        self.inner.get_upload_url().await
    }

    async fn upload_file(
        &self,
        target: &UploadTarget,
        name: &str,
        checksum: &str,
        data: Vec<u8>,
    ) -> Result<StoredObject> {
        self.inner.upload_file(target, name, checksum, data).await
    }

    async fn revoke_upload_url(&self, token: &str) -> Result<bool> {
        self.inner.revoke_upload_url(token).await
    }

    async fn start_large_file(&self, name: &str) -> Result<String> {
        self.check_sessions()?;
        self.inner.start_large_file(name).await
    }

    async fn get_upload_part_url(&self, file_id: &str) -> Result<UploadTarget> {
        self.inner.get_upload_part_url(file_id).await
    }

    async fn upload_file_part(
        &self,
        target: &UploadTarget,
        file_id: &str,
        part: u32,
        checksum: &str,
        data: Vec<u8>,
    ) -> Result<()> {
        self.inner
            .upload_file_part(target, file_id, part, checksum, data)
            .await
    }

    async fn finish_large_file(&self, file_id: &str, checksums: &[String]) -> Result<StoredObject> {
        self.inner.finish_large_file(file_id, checksums).await
    }

    async fn cancel_large_file(&self, file_id: &str) -> Result<bool> {
        self.inner.cancel_large_file(file_id).await
    }

    async fn partial_download(&self, object_id: &str, start: u64, end: u64) -> Result<Vec<u8>> {
        self.inner.partial_download(object_id, start, end).await
    }

    async fn delete_file(&self, object_id: &str) -> Result<()> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            anyhow::bail!("backend unavailable");
        }
        self.inner.delete_file(object_id).await
    }
}

#[tokio::test]
async fn test_reaper_retries_failed_deletes() {
    let flaky = Arc::new(FlakyStore::new());
    let vault = Arc::new(
        Vault::new(Arc::new(JsonStore::in_memory()), flaky.clone(), options()).unwrap(),
    );

    signup(&vault, "carol");
    let key = generate_key();
    let id = vault
        .init_send(
            "carol",
            NewSend {
                name: encrypt_chunk(&key, b"slides.key").unwrap(),
                size: 12,
                chunks: 1,
                downloads: 3,
                expires_in: Duration::from_secs(60),
            },
        )
        .await
        .unwrap();
    let sealed = encrypt_chunk(&key, b"twelve bytes").unwrap();
    assert!(matches!(
        vault.upload_send_chunk(&id, 1, sealed).await.unwrap(),
        ChunkOutcome::Complete(_)
    ));

    let reaper = ExpiryReaper::new(Arc::clone(&vault), Duration::from_secs(1));
    let later = coffer_core::unix_now() + 120;

    flaky.fail_deletes.store(true, Ordering::SeqCst);
    let stats = reaper.sweep_once(later).await;
    assert_eq!((stats.deleted, stats.failed), (0, 1));
    assert!(vault.store().retrieve_metadata(&id).is_some(), "rows kept for retry");

    flaky.fail_deletes.store(false, Ordering::SeqCst);
    let stats = reaper.sweep_once(later).await;
    assert_eq!((stats.deleted, stats.failed), (1, 0));
    assert!(vault.store().retrieve_metadata(&id).is_none());
    assert!(vault.store().get_expiry(&id).is_none());
}

#[tokio::test]
async fn test_interrupted_upload_resumes_after_restart() {
    let dir = tempfile::tempdir().expect("tempdir");
    let state = dir.path().join("state.json");
    let op = memory_operator().expect("memory operator");
    let key = generate_key();
    let data = payload(3 * CHUNK as usize);
    let sealed: Vec<Vec<u8>> = data
        .chunks(CHUNK as usize)
        .map(|c| encrypt_chunk(&key, c).unwrap())
        .collect();

    let item_id = {
        let store = Arc::new(JsonStore::open(&state).expect("open state"));
        let objects = Arc::new(OpendalObjectStore::new(op.clone(), "vault/"));
        let vault = Vault::new(store.clone(), objects, options()).unwrap();
        let alice = signup(&vault, "alice");
        let ctx = alice.folder_context(&vault, "alice").unwrap();
        let item = vault
            .init_upload(
                "alice",
                NewUpload {
                    folder_id: "alice".into(),
                    name: encrypt_chunk(&key, b"archive.tar").unwrap(),
                    protected_key: ctx.wrap_key(&key).unwrap(),
                    size: data.len() as u64,
                    chunks: 3,
                },
            )
            .await
            .unwrap();
        vault
            .upload_chunk("alice", &item.id, 1, sealed[0].clone())
            .await
            .unwrap();
        store.flush().expect("flush");
        item.id
    };

    // Fresh process: new metadata store handle and new object store
    let store = Arc::new(JsonStore::open(&state).expect("reopen state"));
    let objects = Arc::new(OpendalObjectStore::new(op, "vault/"));
    let vault = Vault::new(store, objects.clone(), options()).unwrap();
    vault
        .upload_chunk("alice", &item_id, 2, sealed[1].clone())
        .await
        .expect("second chunk after restart");
    let done = vault
        .upload_chunk("alice", &item_id, 3, sealed[2].clone())
        .await
        .expect("last chunk after restart");
    assert!(matches!(done, ChunkOutcome::Complete(_)));
    assert_eq!(objects.pending_targets(), 0);

    let alice = VaultSession::unlock(&vault, "alice", |_| {
        Some(SecretString::from("alice-password".to_string()))
    })
    .expect("unlock after restart");
    assert_eq!(vault.download_file(&alice, &item_id, None).await.unwrap(), data);
}

#[tokio::test]
async fn test_upload_tokens_do_not_outlive_their_upload() {
    let objects = Arc::new(OpendalObjectStore::new(
        memory_operator().expect("memory operator"),
        "vault/",
    ));
    let vault = Vault::new(Arc::new(JsonStore::in_memory()), objects.clone(), options()).unwrap();
    let alice = signup(&vault, "alice");

    vault
        .upload_file(&alice, "alice", "big.bin", &payload(3 * CHUNK as usize), None)
        .await
        .unwrap();
    vault
        .upload_file(&alice, "alice", "small.txt", &payload(10), None)
        .await
        .unwrap();
    assert_eq!(objects.pending_targets(), 0);

    // Abandoned uploads give their tokens back, single-shot or multi-part
    let ctx = alice.folder_context(&vault, "alice").unwrap();
    let key = generate_key();
    for (size, chunks) in [(10, 1), (2 * CHUNK, 2)] {
        let item = vault
            .init_upload(
                "alice",
                NewUpload {
                    folder_id: "alice".into(),
                    name: encrypt_chunk(&key, b"partial").unwrap(),
                    protected_key: ctx.wrap_key(&key).unwrap(),
                    size,
                    chunks,
                },
            )
            .await
            .unwrap();
        if chunks > 1 {
            vault
                .upload_chunk(
                    "alice",
                    &item.id,
                    1,
                    encrypt_chunk(&key, &payload(CHUNK as usize)).unwrap(),
                )
                .await
                .unwrap();
        }
        vault.abort_upload("alice", &item.id).await.unwrap();
        assert_eq!(objects.pending_targets(), 0, "{chunks}-chunk upload");
    }

    let sent = vault
        .init_send(
            "alice",
            NewSend {
                name: vec![1],
                size: 3,
                chunks: 1,
                downloads: 1,
                expires_in: Duration::from_secs(60),
            },
        )
        .await
        .unwrap();
    assert_eq!(objects.pending_targets(), 1);
    vault.delete_transfer(&sent).await.unwrap();
    assert_eq!(objects.pending_targets(), 0);
}

#[tokio::test]
async fn test_failed_session_open_rolls_back() {
    let flaky = Arc::new(FlakyStore::new());
    let vault = Vault::new(Arc::new(JsonStore::in_memory()), flaky.clone(), options()).unwrap();
    let alice = signup(&vault, "alice");
    flaky.fail_sessions.store(true, Ordering::SeqCst);

    for len in [10, 2 * CHUNK as usize] {
        let err = vault
            .upload_file(&alice, "alice", "doomed.bin", &payload(len), None)
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::Storage(_)), "got {err:?}");
    }
    assert!(vault.list_folder("alice", "alice").unwrap().items.is_empty());
    assert_eq!(vault.account("alice").unwrap().storage_used, 0);

    let err = vault
        .init_send(
            "alice",
            NewSend {
                name: vec![1],
                size: 3,
                chunks: 1,
                downloads: 1,
                expires_in: Duration::from_secs(60),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, VaultError::Storage(_)), "got {err:?}");
    assert_eq!(vault.account("alice").unwrap().send_used, 0);
    assert!(vault.store().expired_transfers(u64::MAX).is_empty());

    flaky.fail_sessions.store(false, Ordering::SeqCst);
    vault
        .upload_file(&alice, "alice", "fine.bin", &payload(10), None)
        .await
        .expect("upload once the backend recovers");
}
