pub mod b64;
pub mod config;
pub mod error;
pub mod types;

pub use error::{VaultError, VaultResult};

/// Current Unix time in seconds.
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
