//! OpenDAL Operator factory for coffer storage backends

use anyhow::{Context, Result};
use opendal::Operator;

/// Minimal config needed to build an S3 operator
/// (full config lives in coffer-core's StorageConfig)
#[derive(Debug, Clone)]
pub struct S3Config {
    pub endpoint: String,
    pub region: String,
    pub bucket: String,
    pub root: String,
    pub access_key_id: String,
    pub secret_access_key: String,
}

/// Build an OpenDAL Operator for any S3-compatible endpoint (path-style).
pub fn build_operator(cfg: &S3Config) -> Result<Operator> {
    // opendal 0.55: S3 builder uses consuming pattern (methods take `self`, return `Self`)
    let builder = opendal::services::S3::default()
        .endpoint(&cfg.endpoint)
        .region(&cfg.region)
        .bucket(&cfg.bucket)
        .root(&cfg.root)
        .access_key_id(&cfg.access_key_id)
        .secret_access_key(&cfg.secret_access_key);

    let op = Operator::new(builder)
        .context("creating OpenDAL S3 operator")?
        .layer(opendal::layers::LoggingLayer::default())
        .layer(
            opendal::layers::RetryLayer::new()
                .with_max_times(5)
                .with_jitter(),
        )
        .finish();

    Ok(op)
}

/// Local filesystem backend rooted at `root`.
pub fn fs_operator(root: &str) -> Result<Operator> {
    let builder = opendal::services::Fs::default().root(root);
    Ok(Operator::new(builder)
        .with_context(|| format!("creating OpenDAL fs operator at {root}"))?
        .layer(opendal::layers::LoggingLayer::default())
        .finish())
}

/// In-process backend; contents vanish with the operator.
pub fn memory_operator() -> Result<Operator> {
    Ok(Operator::new(opendal::services::Memory::default())
        .context("creating OpenDAL memory operator")?
        .finish())
}

/// Build an operator from coffer-core config + loaded credentials.
///
/// If `enforce_tls` is true and an S3 endpoint uses HTTP, this returns an
/// error. Otherwise, a warning is logged for non-HTTPS endpoints.
pub fn build_from_core_config(
    storage: &coffer_core::config::StorageConfig,
    access_key_id: &str,
    secret_access_key: &str,
) -> Result<Operator> {
    match storage.backend.as_str() {
        "memory" => {
            tracing::warn!("using in-memory object storage; payloads are not persisted");
            memory_operator()
        }
        "fs" => fs_operator(&storage.root),
        "s3" => {
            if storage.endpoint.starts_with("http://") {
                if storage.enforce_tls {
                    anyhow::bail!(
                        "S3 endpoint uses plaintext HTTP ({}), but enforce_tls is enabled. \
                         Use an HTTPS endpoint or set storage.enforce_tls = false for local development.",
                        storage.endpoint
                    );
                }
                tracing::warn!(
                    endpoint = %storage.endpoint,
                    "S3 endpoint uses plaintext HTTP; set storage.enforce_tls = true and use HTTPS in production"
                );
            }

            build_operator(&S3Config {
                endpoint: storage.endpoint.clone(),
                region: storage.region.clone(),
                bucket: storage.bucket.clone(),
                root: storage.root.clone(),
                access_key_id: access_key_id.to_string(),
                secret_access_key: secret_access_key.to_string(),
            })
        }
        other => anyhow::bail!("unknown storage backend '{other}' (expected s3, fs, or memory)"),
    }
}
