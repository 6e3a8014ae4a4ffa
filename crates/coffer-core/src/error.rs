use thiserror::Error;

pub type VaultResult<T> = Result<T, VaultError>;

#[derive(Debug, Error)]
pub enum VaultError {
    /// Key unwrap or AEAD authentication failure. Never downgraded to NotFound.
    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("permission denied: {0}")]
    Permission(String),

    #[error("item is already shared with this recipient")]
    AlreadyShared,

    #[error("folder is read-only for this user")]
    ReadOnly,

    /// Object-store I/O or checksum failure on a specific 1-based chunk.
    #[error("transfer failed at chunk {chunk}: {reason}")]
    Transfer { chunk: u32, reason: String },

    #[error("insufficient storage: {needed} bytes requested, {available} available")]
    Capacity { needed: u64, available: u64 },

    #[error("invalid request: {0}")]
    Invalid(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl VaultError {
    pub fn not_found(what: impl Into<String>) -> Self {
        VaultError::NotFound(what.into())
    }

    pub fn transfer(chunk: u32, reason: impl std::fmt::Display) -> Self {
        VaultError::Transfer {
            chunk,
            reason: reason.to_string(),
        }
    }

    /// The chunk a transfer aborted on, so a resume can skip the ones before it.
    pub fn failed_chunk(&self) -> Option<u32> {
        match self {
            VaultError::Transfer { chunk, .. } => Some(*chunk),
            _ => None,
        }
    }

    /// Whether a caller-side retry could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            VaultError::Transfer { .. } | VaultError::Storage(_) | VaultError::Io(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transfer_error_names_chunk() {
        let err = VaultError::transfer(3, "checksum mismatch");
        assert_eq!(err.failed_chunk(), Some(3));
        assert!(err.to_string().contains("chunk 3"));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_crypto_is_not_retryable() {
        let err = VaultError::Crypto("bad tag".into());
        assert!(!err.is_retryable());
        assert_eq!(err.failed_chunk(), None);
    }
}
