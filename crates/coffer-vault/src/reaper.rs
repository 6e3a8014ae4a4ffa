//! Background sweep of expired ephemeral transfers.
//!
//! Each tick deletes every transfer past its expiry or out of downloads,
//! then drops download sessions nobody has touched for a while. A failed
//! delete keeps the transfer's rows so the next tick retries it.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::vault::Vault;

/// Download sessions idle this long are dropped.
pub const STALE_DOWNLOAD_SECS: u64 = 3600;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReapStats {
    pub deleted: usize,
    pub failed: usize,
    pub stale_downloads: usize,
}

pub struct ExpiryReaper {
    vault: Arc<Vault>,
    interval: Duration,
}

impl ExpiryReaper {
    pub fn new(vault: Arc<Vault>, interval: Duration) -> Self {
        Self { vault, interval }
    }

    /// One pass over everything expired as of `now` (Unix seconds).
    pub async fn sweep_once(&self, now: u64) -> ReapStats {
        let mut stats = ReapStats::default();

        for id in self.vault.store().expired_transfers(now) {
            match self.vault.delete_transfer(&id).await {
                Ok(_) => {
                    debug!(transfer_id = %id, "reaped expired transfer");
                    stats.deleted += 1;
                }
                Err(e) => {
                    warn!(transfer_id = %id, "failed to reap transfer: {e}");
                    stats.failed += 1;
                }
            }
        }

        match self
            .vault
            .store()
            .delete_stale_downloads(now.saturating_sub(STALE_DOWNLOAD_SECS))
        {
            Ok(n) => stats.stale_downloads = n,
            Err(e) => warn!("failed to clean stale downloads: {e}"),
        }

        if stats != ReapStats::default() {
            info!(
                deleted = stats.deleted,
                failed = stats.failed,
                stale_downloads = stats.stale_downloads,
                "reaper sweep"
            );
        }
        stats
    }

    /// Sweep every interval until `shutdown` fires, reporting each pass to
    /// `observe`.
    pub async fn run<F>(self, mut shutdown: broadcast::Receiver<()>, observe: F)
    where
        F: Fn(&ReapStats) + Send,
    {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(interval_ms = self.interval.as_millis() as u64, "expiry reaper started");

        loop {
            tokio::select! {
                biased;
                _ = shutdown.recv() => {
                    info!("expiry reaper: shutdown signal received");
                    break;
                }
                _ = ticker.tick() => {
                    let stats = self.sweep_once(coffer_core::unix_now()).await;
                    observe(&stats);
                }
            }
        }
    }
}
