use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration (loaded from coffer.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CofferConfig {
    pub daemon: DaemonConfig,
    pub storage: StorageConfig,
    pub vault: VaultConfig,
    pub transfer: TransferConfig,
    pub reaper: ReaperConfig,
    pub limiter: LimiterConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Prometheus metrics + health endpoint (default: 127.0.0.1:9100)
    pub metrics_addr: Option<String>,
    /// Log level (default: info)
    pub log_level: String,
    /// Log format: "json" or "text"
    pub log_format: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Backend: "s3", "fs", or "memory"
    pub backend: String,
    /// S3-compatible endpoint
    pub endpoint: String,
    /// S3 region (default: us-east-1)
    pub region: String,
    pub bucket: String,
    /// Root directory for the "fs" backend, key prefix for "s3"
    pub root: String,
    /// Refuse plaintext HTTP endpoints
    pub enforce_tls: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    /// JSON metadata store
    pub state_file: PathBuf,
    /// Storage limit for new accounts in bytes (None = unmetered)
    pub default_storage_limit: Option<u64>,
    /// Ephemeral send allowance for new accounts in bytes (None = unmetered)
    pub default_send_limit: Option<u64>,
    /// Argon2id memory cost in KiB (default: 65536 = 64 MiB)
    pub argon2_mem_cost_kib: u32,
    /// Argon2id time cost (iterations, default: 3)
    pub argon2_time_cost: u32,
    /// Argon2id parallelism (default: 4)
    pub argon2_parallelism: u32,
    /// Password prompts before unlock gives up
    pub max_unlock_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Plaintext chunk size in bytes. Fixed for the lifetime of stored data.
    pub chunk_size: u64,
    /// Local chunk cache directory (None disables the cache)
    pub cache_dir: Option<PathBuf>,
    /// Total cache budget in MB
    pub cache_max_mb: u64,
    /// Largest single file the cache will hold, in MB
    pub cache_max_file_mb: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaperConfig {
    pub enabled: bool,
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimiterConfig {
    /// Bucket capacity (burst)
    pub capacity: u32,
    /// Seconds per refilled token
    pub refill_secs: u64,
    /// Visitors idle longer than this are purged
    pub idle_timeout_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            metrics_addr: Some("127.0.0.1:9100".into()),
            log_level: "info".into(),
            log_format: "json".into(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: "s3".into(),
            endpoint: "http://localhost:9000".into(),
            region: "us-east-1".into(),
            bucket: "coffer".into(),
            root: "/".into(),
            enforce_tls: false,
        }
    }
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            state_file: PathBuf::from("/var/lib/coffer/vault.json"),
            default_storage_limit: None,
            default_send_limit: None,
            argon2_mem_cost_kib: 65536,
            argon2_time_cost: 3,
            argon2_parallelism: 4,
            max_unlock_attempts: 3,
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: 10_000_000,
            cache_dir: None,
            cache_max_mb: 25_000,
            cache_max_file_mb: 5_000,
        }
    }
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_ms: 1000,
        }
    }
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            capacity: 3,
            refill_secs: 30,
            idle_timeout_secs: 60,
            sweep_interval_secs: 30,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let toml_str = r#"
[daemon]
metrics_addr = "0.0.0.0:9200"
log_level = "debug"
log_format = "text"

[storage]
backend = "s3"
endpoint = "https://s3.example.com"
region = "eu-central-1"
bucket = "vault-data"
enforce_tls = true

[vault]
state_file = "/tmp/vault.json"
default_storage_limit = 1073741824
default_send_limit = 104857600
argon2_mem_cost_kib = 131072
max_unlock_attempts = 5

[transfer]
chunk_size = 1048576
cache_dir = "/var/cache/coffer"
cache_max_mb = 512

[reaper]
poll_interval_ms = 250

[limiter]
capacity = 5
refill_secs = 10
"#;
        let config: CofferConfig = toml::from_str(toml_str).unwrap();

        assert_eq!(config.daemon.metrics_addr.as_deref(), Some("0.0.0.0:9200"));
        assert_eq!(config.daemon.log_format, "text");
        assert_eq!(config.storage.region, "eu-central-1");
        assert!(config.storage.enforce_tls);
        assert_eq!(config.vault.state_file, PathBuf::from("/tmp/vault.json"));
        assert_eq!(config.vault.default_storage_limit, Some(1 << 30));
        assert_eq!(config.vault.default_send_limit, Some(100 << 20));
        assert_eq!(config.vault.argon2_mem_cost_kib, 131072);
        assert_eq!(config.vault.max_unlock_attempts, 5);
        assert_eq!(config.transfer.chunk_size, 1 << 20);
        assert_eq!(
            config.transfer.cache_dir,
            Some(PathBuf::from("/var/cache/coffer"))
        );
        assert_eq!(config.reaper.poll_interval_ms, 250);
        assert!(config.reaper.enabled);
        assert_eq!(config.limiter.capacity, 5);
        assert_eq!(config.limiter.idle_timeout_secs, 60);
    }

    #[test]
    fn test_parse_defaults() {
        let config: CofferConfig = toml::from_str("").unwrap();

        assert_eq!(config.daemon.log_level, "info");
        assert_eq!(config.storage.backend, "s3");
        assert_eq!(config.storage.bucket, "coffer");
        assert!(config.vault.default_storage_limit.is_none());
        assert!(config.vault.default_send_limit.is_none());
        assert_eq!(config.vault.argon2_time_cost, 3);
        assert_eq!(config.transfer.chunk_size, 10_000_000);
        assert!(config.transfer.cache_dir.is_none());
        assert_eq!(config.reaper.poll_interval_ms, 1000);
        assert_eq!(config.limiter.capacity, 3);
        assert_eq!(config.limiter.refill_secs, 30);
    }

    #[test]
    fn test_parse_partial_config() {
        let toml_str = r#"
[storage]
backend = "fs"
root = "/srv/coffer"
"#;
        let config: CofferConfig = toml::from_str(toml_str).unwrap();

        assert_eq!(config.storage.backend, "fs");
        assert_eq!(config.storage.root, "/srv/coffer");
        assert_eq!(config.storage.region, "us-east-1");
        assert_eq!(config.limiter.capacity, 3);
    }

    #[test]
    fn test_serialize_roundtrip() {
        let config = CofferConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: CofferConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(config.storage.endpoint, parsed.storage.endpoint);
        assert_eq!(config.vault.state_file, parsed.vault.state_file);
        assert_eq!(config.transfer.chunk_size, parsed.transfer.chunk_size);
    }
}
