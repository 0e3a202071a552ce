//! Request debouncing for image downloads
//!
//! Suppresses identical download requests from the same user inside a short
//! window, keyed by user identity plus a content fingerprint.

use md5::{Digest, Md5};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Window for single-image downloads
pub const SINGLE_WINDOW: Duration = Duration::from_secs(5);

/// Window for batch downloads
pub const BATCH_WINDOW: Duration = Duration::from_secs(60);

const CLEANUP_EVERY: Duration = Duration::from_secs(5 * 60);

struct DebounceState {
    entries: HashMap<String, Instant>,
    last_cleanup: Instant,
}

/// Per-user, per-content request suppression
pub struct Debouncer {
    state: Mutex<DebounceState>,
    window: Duration,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            state: Mutex::new(DebounceState {
                entries: HashMap::new(),
                last_cleanup: Instant::now(),
            }),
            window,
        }
    }

    /// The window length in whole seconds, for `retry_after` hints
    pub fn window_secs(&self) -> u64 {
        self.window.as_secs()
    }

    /// True when the request may proceed; refreshes the entry either way
    /// only on success.
    pub fn should_allow(&self, user_id: &str, content_key: &str) -> bool {
        let key = format!("{}:{}", user_id, content_key);
        let now = Instant::now();
        let mut state = self.state.lock().expect("debounce lock poisoned");

        if let Some(last) = state.entries.get(&key) {
            if now.duration_since(*last) < self.window {
                return false;
            }
        }
        state.entries.insert(key, now);

        // Piggybacked cleanup keeps the map from growing unbounded.
        if now.duration_since(state.last_cleanup) > CLEANUP_EVERY {
            let window = self.window;
            state
                .entries
                .retain(|_, last| now.duration_since(*last) <= window * 2);
            state.last_cleanup = now;
        }

        true
    }

    pub fn len(&self) -> usize {
        self.state.lock().expect("debounce lock poisoned").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Order-independent fingerprint of a download request
pub fn content_fingerprint(images: &[String], platform: &str) -> String {
    let mut sorted: Vec<&str> = images.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    let content = format!("{}:{}", sorted.join("|"), platform);
    hex::encode(Md5::digest(content.as_bytes()))
}

/// Best-effort user identity: the session cookie when present, otherwise a
/// short hash of address plus user agent. Not a security boundary.
pub fn user_fingerprint(session: Option<&str>, ip: &str, user_agent: &str) -> String {
    if let Some(session) = session.filter(|s| !s.is_empty()) {
        return format!("session:{}", session);
    }
    let ua = if user_agent.is_empty() {
        "unknown"
    } else {
        user_agent
    };
    let digest = Md5::digest(format!("{}:{}", ip, ua).as_bytes());
    format!("ip:{}", hex::encode(&digest[..8]))
}
