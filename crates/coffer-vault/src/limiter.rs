//! Per-client token bucket.
//!
//! Each client key holds up to `capacity` tokens and earns one back every
//! `refill`. Clients idle longer than `idle_timeout` are forgotten by
//! `sweep`, so the map stays bounded by recent traffic.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use coffer_core::config::LimiterConfig;

#[derive(Debug, Clone, Copy)]
struct Bucket {
    tokens: u32,
    last_refill: Instant,
    last_seen: Instant,
}

pub struct RateLimiter {
    buckets: Mutex<HashMap<String, Bucket>>,
    capacity: u32,
    refill: Duration,
    idle_timeout: Duration,
}

impl RateLimiter {
    pub fn new(capacity: u32, refill: Duration, idle_timeout: Duration) -> Self {
        RateLimiter {
            buckets: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
            refill: refill.max(Duration::from_millis(1)),
            idle_timeout,
        }
    }

    pub fn from_config(cfg: &LimiterConfig) -> Self {
        Self::new(
            cfg.capacity,
            Duration::from_secs(cfg.refill_secs),
            Duration::from_secs(cfg.idle_timeout_secs),
        )
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Bucket>> {
        self.buckets.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take a token for `key`. False means the client is over its rate.
    pub fn allow(&self, key: &str) -> bool {
        self.allow_at(key, Instant::now())
    }

    pub fn allow_at(&self, key: &str, now: Instant) -> bool {
        let mut buckets = self.lock();
        let bucket = buckets.entry(key.to_string()).or_insert(Bucket {
            tokens: self.capacity,
            last_refill: now,
            last_seen: now,
        });
        bucket.last_seen = now;

        let elapsed = now.saturating_duration_since(bucket.last_refill);
        let earned = elapsed.as_nanos() / self.refill.as_nanos();
        if earned > 0 {
            let tokens = (bucket.tokens as u128 + earned).min(self.capacity as u128) as u32;
            bucket.tokens = tokens;
            // A full bucket earns nothing while it sits full
            bucket.last_refill = if tokens == self.capacity {
                now
            } else {
                bucket.last_refill + self.refill * earned as u32
            };
        }

        if bucket.tokens == 0 {
            return false;
        }
        bucket.tokens -= 1;
        true
    }

    /// Forget clients idle past the timeout. Returns how many were dropped.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    pub fn sweep_at(&self, now: Instant) -> usize {
        let mut buckets = self.lock();
        let before = buckets.len();
        buckets.retain(|_, b| now.saturating_duration_since(b.last_seen) < self.idle_timeout);
        before - buckets.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Identify a client: the first `X-Forwarded-For` entry when present,
/// otherwise the peer address.
pub fn client_key(forwarded_for: Option<&str>, peer: IpAddr) -> String {
    forwarded_for
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(String::from)
        .unwrap_or_else(|| peer.to_string())
}
