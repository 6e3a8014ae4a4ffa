//! coffer-vault: the vault engine
//!
//! Folders and items form per-user trees whose keys chain from the account
//! keypair. Shares add recipient-side shadow rows carrying re-wrapped keys.
//! Payloads move as independently encrypted chunks through an object store,
//! and ephemeral transfers are reaped once expired or fully downloaded.

pub mod account;
pub mod folders;
pub mod items;
pub mod limiter;
pub mod ownership;
pub mod reaper;
pub mod send;
pub mod session;
pub mod sharing;
pub mod store;
pub mod transfer;
pub mod vault;

pub use account::normalize_identifier;
pub use folders::FolderListing;
pub use limiter::{client_key, RateLimiter};
pub use ownership::{check_folder_ownership, key_sequence, MAX_FOLDER_DEPTH};
pub use reaper::{ExpiryReaper, ReapStats};
pub use send::{NewSend, NewTextSend, MAX_TEXT_SEND_LEN};
pub use session::{ContextCache, VaultSession};
pub use store::{ChecksumAppend, JsonStore, VaultStore};
pub use transfer::{ChunkData, ChunkOutcome, NewUpload, ProgressFn};
pub use vault::{Vault, VaultOptions};
