//! Shared TTL cache for manifests and auth tokens
//!
//! A concurrent map of fingerprint keys to cached payloads. A `get` that
//! finds an expired entry deletes it in place; a background sweeper removes
//! whatever expired without being read.

use bytes::Bytes;
use dashmap::DashMap;
use md5::{Digest, Md5};
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Sweep interval for the background cleaner
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(20 * 60);

/// Tags whose content is expected to move over time
const FLOATING_TAGS: [&str; 5] = ["latest", "main", "master", "dev", "develop"];

/// One cached payload with its response metadata
#[derive(Debug, Clone)]
pub struct CachedItem {
    pub data: Bytes,
    pub content_type: String,
    pub headers: Vec<(String, String)>,
    pub expires_at: Instant,
}

/// Concurrent TTL cache shared by the registry engine and the auth shim
#[derive(Default)]
pub struct UniversalCache {
    items: DashMap<String, CachedItem>,
}

impl UniversalCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch a live entry. Expired entries are deleted on the spot.
    pub fn get(&self, key: &str) -> Option<CachedItem> {
        // The shard guard must be released before the remove below.
        match self.items.get(key) {
            Some(item) if Instant::now() < item.expires_at => return Some(item.clone()),
            Some(_) => {}
            None => return None,
        }
        self.items.remove(key);
        None
    }

    pub fn set(
        &self,
        key: impl Into<String>,
        data: Bytes,
        content_type: impl Into<String>,
        headers: Vec<(String, String)>,
        ttl: Duration,
    ) {
        self.items.insert(
            key.into(),
            CachedItem {
                data,
                content_type: content_type.into(),
                headers,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    /// Remove expired entries; returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.items.len();
        self.items.retain(|_, item| now < item.expires_at);
        before - self.items.len()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Spawn the periodic sweeper. The task runs for the process lifetime.
    pub fn spawn_sweeper(self: &Arc<Self>, period: Duration) -> tokio::task::JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let dropped = cache.purge_expired();
                if dropped > 0 {
                    tracing::debug!(dropped, remaining = cache.len(), "cache sweep");
                }
            }
        })
    }
}

fn fingerprint(prefix: &str, input: &str) -> String {
    format!("{}:{}", prefix, hex::encode(Md5::digest(input.as_bytes())))
}

/// Cache key for a token exchange, derived from the raw query string
pub fn token_key(raw_query: &str) -> String {
    fingerprint("token", raw_query)
}

/// Cache key for a manifest, derived from the full image ref and selector
pub fn manifest_key(image_ref: &str, reference: &str) -> String {
    fingerprint("manifest", &format!("{}:{}", image_ref, reference))
}

/// TTL policy for cached manifests.
///
/// Digests are immutable and keep for a day. Floating tags move quickly.
/// Everything else gets the configured default.
pub fn manifest_ttl(reference: &str, default_ttl: Duration) -> Duration {
    if reference.starts_with("sha256:") {
        return Duration::from_secs(24 * 3600);
    }
    if FLOATING_TAGS.contains(&reference) {
        return Duration::from_secs(10 * 60);
    }
    default_ttl
}

#[derive(Deserialize)]
struct TokenExpiry {
    #[serde(default)]
    expires_in: u64,
}

/// TTL for a cached token response.
///
/// When the upstream announces `expires_in`, cache for five minutes less
/// than that (floored at five minutes); otherwise thirty minutes.
pub fn token_ttl(body: &[u8]) -> Duration {
    const DEFAULT: Duration = Duration::from_secs(30 * 60);
    const MARGIN: u64 = 300;
    const FLOOR: Duration = Duration::from_secs(5 * 60);

    match serde_json::from_slice::<TokenExpiry>(body) {
        Ok(resp) if resp.expires_in > 0 => {
            let safe = Duration::from_secs(resp.expires_in.saturating_sub(MARGIN));
            safe.max(FLOOR)
        }
        _ => DEFAULT,
    }
}
