//! Folder ownership and key-sequence resolution
//!
//! Both walks climb parent links iteratively. At each level the user's own
//! row (their folder or their shadow of a shared one) wins over the
//! canonical row; climbing past another user's root means no access.

use coffer_core::types::{FolderOwnership, VaultFolder};
use coffer_core::{VaultError, VaultResult};

use crate::store::VaultStore;

/// Deepest folder nesting either walk will follow.
pub const MAX_FOLDER_DEPTH: usize = 64;

/// Map a folder id (canonical or shadow) to the canonical id.
pub fn resolve_folder_ref(store: &dyn VaultStore, folder_id: &str) -> VaultResult<String> {
    store
        .get_folder(folder_id)
        .map(|f| f.ref_id)
        .ok_or_else(|| VaultError::not_found(format!("folder {folder_id}")))
}

fn rows_for(store: &dyn VaultStore, ref_id: &str) -> VaultResult<Vec<VaultFolder>> {
    let rows = store.folders_by_ref(ref_id);
    if rows.is_empty() {
        return Err(VaultError::not_found(format!("folder {ref_id}")));
    }
    Ok(rows)
}

fn canonical(rows: &[VaultFolder], ref_id: &str) -> VaultResult<VaultFolder> {
    rows.iter()
        .find(|f| f.is_owner())
        .cloned()
        .ok_or_else(|| VaultError::not_found(format!("folder {ref_id}")))
}

/// Resolve what `user_id` may do in `folder_id`.
///
/// Access comes from the nearest ancestor (or the folder itself) that the
/// user holds a row for. The canonical owner is the one whose storage pays
/// for uploads into the folder.
pub fn check_folder_ownership(
    store: &dyn VaultStore,
    folder_id: &str,
    user_id: &str,
) -> VaultResult<FolderOwnership> {
    let target = resolve_folder_ref(store, folder_id)?;
    let target_rows = rows_for(store, &target)?;
    let canonical_owner = canonical(&target_rows, &target)?.owner_id;

    let mut rows = target_rows;
    let mut current = target.clone();
    for _ in 0..MAX_FOLDER_DEPTH {
        if let Some(own) = rows.iter().find(|f| f.owner_id == user_id) {
            return Ok(FolderOwnership {
                id: own.id.clone(),
                ref_id: target,
                is_owner: canonical_owner == user_id,
                canonical_owner,
                can_modify: own.can_modify,
            });
        }

        let row = canonical(&rows, &current)?;
        current = row
            .parent_id
            .ok_or_else(|| VaultError::Permission(format!("no access to folder {target}")))?;
        rows = rows_for(store, &current)?;
    }

    Err(VaultError::Invalid(format!(
        "folder {target} is nested deeper than {MAX_FOLDER_DEPTH}"
    )))
}

/// Wrapped keys from the top of `user_id`'s view down to `folder_id`.
///
/// Empty for the user's root. The first entry is wrapped to the user's
/// public key: either a top-level folder of their own, or their shadow of a
/// shared folder.
pub fn key_sequence(
    store: &dyn VaultStore,
    folder_id: &str,
    user_id: &str,
) -> VaultResult<Vec<Vec<u8>>> {
    let mut current = resolve_folder_ref(store, folder_id)?;
    let mut sequence = Vec::new();

    for _ in 0..MAX_FOLDER_DEPTH {
        let rows = rows_for(store, &current)?;
        if rows.iter().any(|f| f.owner_id == user_id && f.is_root()) {
            sequence.reverse();
            return Ok(sequence);
        }

        let row = match rows.iter().find(|f| f.owner_id == user_id) {
            Some(own) => own.clone(),
            None => canonical(&rows, &current)?,
        };
        sequence.push(row.protected_key);
        current = row
            .parent_id
            .ok_or_else(|| VaultError::Permission(format!("no access to folder {folder_id}")))?;
    }

    Err(VaultError::Invalid(format!(
        "folder {folder_id} is nested deeper than {MAX_FOLDER_DEPTH}"
    )))
}
