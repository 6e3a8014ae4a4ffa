//! Object-store sessions against the local filesystem backend.
//!
//! Exercises the same flows the vault engine drives, but through real files
//! in a temp directory so on-disk layout and part cleanup are observable.

use coffer_chunks::checksum;
use coffer_storage::{check_health, ObjectStore, OpendalObjectStore};
use coffer_storage::operator::fs_operator;

fn store(dir: &tempfile::TempDir) -> OpendalObjectStore {
    let op = fs_operator(dir.path().to_str().expect("utf-8 temp path")).expect("fs operator");
    OpendalObjectStore::new(op, "vault")
}

#[tokio::test]
async fn test_large_file_lands_on_disk_and_parts_are_cleaned() {
    let dir = tempfile::tempdir().expect("tempdir");
    let objects = store(&dir);
    check_health(objects.operator()).await.expect("fs backend healthy");

    let parts: Vec<Vec<u8>> = vec![vec![1u8; 100], vec![2u8; 100], vec![3u8; 17]];
    let file_id = objects.start_large_file("backup.tar").await.unwrap();
    let mut sums = Vec::new();
    for (i, data) in parts.iter().enumerate() {
        let target = objects.get_upload_part_url(&file_id).await.unwrap();
        let sum = checksum(data);
        objects
            .upload_file_part(&target, &file_id, i as u32 + 1, &sum, data.clone())
            .await
            .expect("upload part");
        sums.push(sum);
    }

    let stored = objects.finish_large_file(&file_id, &sums).await.unwrap();
    assert_eq!(stored.object_id, file_id);
    assert_eq!(stored.length, 217);

    let on_disk = dir.path().join("vault/objects").join(&file_id);
    assert_eq!(std::fs::metadata(&on_disk).expect("object file").len(), 217);
    let staged = dir.path().join("vault/parts").join(&file_id);
    let leftover = std::fs::read_dir(&staged)
        .map(|entries| entries.count())
        .unwrap_or(0);
    assert_eq!(leftover, 0, "staged parts removed after finish");

    // Middle of part 2 through the first byte of part 3
    let range = objects.partial_download(&file_id, 150, 200).await.unwrap();
    assert_eq!(range.len(), 51);
    assert!(range[..50].iter().all(|b| *b == 2));
    assert_eq!(range[50], 3);

    objects.delete_file(&file_id).await.unwrap();
    assert!(!on_disk.exists());
}

#[tokio::test]
async fn test_failed_part_can_be_retried_with_fresh_target() {
    let dir = tempfile::tempdir().expect("tempdir");
    let objects = store(&dir);
    let file_id = objects.start_large_file("video.mp4").await.unwrap();
    let data = vec![9u8; 64];
    let sum = checksum(&data);

    let target = objects.get_upload_part_url(&file_id).await.unwrap();
    let err = objects
        .upload_file_part(&target, &file_id, 1, &checksum(b"other"), data.clone())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("checksum mismatch"));

    // The rejected attempt consumed its token
    assert!(objects
        .upload_file_part(&target, &file_id, 1, &sum, data.clone())
        .await
        .is_err());

    let retry = objects.get_upload_part_url(&file_id).await.unwrap();
    objects
        .upload_file_part(&retry, &file_id, 1, &sum, data)
        .await
        .expect("retry with fresh target");
    let stored = objects.finish_large_file(&file_id, &[sum]).await.unwrap();
    assert_eq!(stored.length, 64);
}

#[tokio::test]
async fn test_open_large_file_survives_restart() {
    let dir = tempfile::tempdir().expect("tempdir");
    let file_id = {
        let objects = store(&dir);
        let file_id = objects.start_large_file("resume.bin").await.unwrap();
        let data = vec![4u8; 32];
        let target = objects.get_upload_part_url(&file_id).await.unwrap();
        objects
            .upload_file_part(&target, &file_id, 1, &checksum(&data), data)
            .await
            .expect("first part");
        file_id
    };

    let objects = store(&dir);
    let data = vec![5u8; 8];
    let target = objects
        .get_upload_part_url(&file_id)
        .await
        .expect("session still open after restart");
    objects
        .upload_file_part(&target, &file_id, 2, &checksum(&data), data)
        .await
        .expect("second part");

    let sums = [checksum(&[4u8; 32]), checksum(&[5u8; 8])];
    let stored = objects.finish_large_file(&file_id, &sums).await.unwrap();
    assert_eq!(stored.length, 40);
    assert_eq!(objects.pending_targets(), 0);
    assert!(!dir.path().join("vault/parts").join(&file_id).join("info").exists());
}
