//! Daemon lifecycle: open stores, start background loops, serve metrics,
//! shut down cleanly on Ctrl-C.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use coffer_core::config::{CofferConfig, StorageConfig};
use coffer_storage::{ChunkCache, OpendalObjectStore};
use coffer_vault::{ExpiryReaper, JsonStore, RateLimiter, Vault, VaultOptions, VaultStore};
use prometheus_client::registry::Registry;
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::metrics::{DaemonMetrics, HealthState};

/// Key prefix for everything the vault writes to the object store
const OBJECT_PREFIX: &str = "vault/";
const FLUSH_INTERVAL: Duration = Duration::from_secs(5);

pub async fn run(config: CofferConfig) -> Result<()> {
    info!("daemon starting");

    // Metadata store
    let store = Arc::new(
        JsonStore::open(&config.vault.state_file)
            .with_context(|| format!("opening state file: {}", config.vault.state_file.display()))?,
    );

    // Object store, verified but kept even when unreachable so /readyz can recover
    let (access_key, secret_key) = storage_credentials(&config.storage)?;
    let op = coffer_storage::build_from_core_config(
        &config.storage,
        &access_key,
        secret_key.expose_secret(),
    )
    .context("building storage operator")?;
    match coffer_storage::check_health(&op).await {
        Ok(()) => info!(backend = %config.storage.backend, "storage: connected"),
        Err(e) => warn!(backend = %config.storage.backend, "storage: {e}"),
    }

    let objects = Arc::new(OpendalObjectStore::new(op.clone(), OBJECT_PREFIX));
    let mut vault = Vault::new(store.clone(), objects, VaultOptions::from_config(&config))?;
    if let Some(dir) = &config.transfer.cache_dir {
        let mb = 1024 * 1024;
        let cache = ChunkCache::new(
            dir.clone(),
            config.transfer.cache_max_mb * mb,
            config.transfer.cache_max_file_mb * mb,
        );
        info!(dir = %dir.display(), max_mb = config.transfer.cache_max_mb, "chunk cache enabled");
        vault = vault.with_cache(Arc::new(cache));
    }
    let vault = Arc::new(vault);

    let mut registry = Registry::default();
    let metrics = DaemonMetrics::register(&mut registry);
    let limiter = Arc::new(RateLimiter::from_config(&config.limiter));

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    if config.reaper.enabled {
        let reaper = ExpiryReaper::new(
            Arc::clone(&vault),
            Duration::from_millis(config.reaper.poll_interval_ms.max(1)),
        );
        let observer = metrics.clone();
        tasks.push(tokio::spawn(reaper.run(shutdown_tx.subscribe(), move |stats| {
            observer.observe_sweep(stats)
        })));
    } else {
        warn!("expiry reaper disabled; expired transfers will not be removed");
    }

    tasks.push(tokio::spawn(sweep_limiter(
        Arc::clone(&limiter),
        Duration::from_secs(config.limiter.sweep_interval_secs.max(1)),
        shutdown_tx.subscribe(),
    )));
    tasks.push(tokio::spawn(flush_store(
        store.clone(),
        FLUSH_INTERVAL,
        shutdown_tx.subscribe(),
    )));

    if let Some(addr) = config.daemon.metrics_addr.clone() {
        let state = HealthState {
            registry: Arc::new(registry),
            operator: op,
            limiter,
            metrics,
        };
        tokio::spawn(async move {
            if let Err(e) = crate::metrics::serve(addr, state).await {
                error!("metrics server failed: {e}");
            }
        });
    }

    notify_ready();
    info!("daemon ready");

    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;
    info!("shutdown requested");

    let _ = shutdown_tx.send(());
    for task in tasks {
        if let Err(e) = task.await {
            warn!("background task ended abnormally: {e}");
        }
    }
    store.flush().context("final state flush")?;
    info!("daemon stopped");
    Ok(())
}

/// S3 credentials from the environment. Other backends need none.
fn storage_credentials(storage: &StorageConfig) -> Result<(String, SecretString)> {
    if storage.backend != "s3" {
        return Ok((String::new(), SecretString::from(String::new())));
    }
    let access_key = std::env::var("COFFER_ACCESS_KEY_ID")
        .or_else(|_| std::env::var("AWS_ACCESS_KEY_ID"))
        .context("S3 credentials not set: export COFFER_ACCESS_KEY_ID")?;
    let secret_key = std::env::var("COFFER_SECRET_ACCESS_KEY")
        .or_else(|_| std::env::var("AWS_SECRET_ACCESS_KEY"))
        .context("COFFER_SECRET_ACCESS_KEY not set")?;
    Ok((access_key, SecretString::from(secret_key)))
}

async fn sweep_limiter(
    limiter: Arc<RateLimiter>,
    every: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(every);
    loop {
        tokio::select! {
            biased;
            _ = shutdown.recv() => break,
            _ = ticker.tick() => {
                let dropped = limiter.sweep();
                if dropped > 0 {
                    tracing::debug!(dropped, tracked = limiter.len(), "limiter sweep");
                }
            }
        }
    }
}

async fn flush_store(
    store: Arc<JsonStore>,
    every: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(every);
    loop {
        tokio::select! {
            biased;
            _ = shutdown.recv() => break,
            _ = ticker.tick() => {
                if let Err(e) = store.flush() {
                    warn!("state flush failed: {e:#}");
                }
            }
        }
    }
}

fn notify_ready() {
    // sd_notify(READY=1) when running under systemd; no-op otherwise
    if let Ok(socket) = std::env::var("NOTIFY_SOCKET") {
        use std::os::unix::net::UnixDatagram;
        if let Ok(sock) = UnixDatagram::unbound() {
            let _ = sock.send_to(b"READY=1\n", &socket);
            tracing::debug!(notify_socket = %socket, "sent systemd READY=1");
        }
    }
}
