//! Pull-aware rate-limit exemption
//!
//! A `docker pull` is one manifest fetch followed by a burst of blob
//! fetches. The manifest consumes quota and arms a short window; blob
//! fetches inside that window ride free, up to a bound.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How long blob fetches stay exempt after a manifest fetch
const ACTIVE_WINDOW: Duration = Duration::from_secs(3 * 60);

/// Maximum exempt blob fetches per window
const MAX_FREE_BLOBS: u32 = 100;

/// Sessions idle longer than this are swept
const SESSION_EXPIRY: Duration = Duration::from_secs(30 * 60);

/// Hard cap on tracked sessions; the map is wiped beyond this
const MAX_SESSIONS: usize = 10_000;

/// How often the session sweeper runs
pub const SESSION_SWEEP_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Registry API verb extracted from a `/v2/` path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullVerb {
    Manifests,
    Blobs,
    Tags,
}

/// Parse the API verb out of a `/v2/…` path
pub fn parse_pull_verb(path: &str) -> Option<PullVerb> {
    let path = path.strip_prefix("/v2/").unwrap_or(path);
    if path.contains("/manifests/") {
        Some(PullVerb::Manifests)
    } else if path.contains("/blobs/") {
        Some(PullVerb::Blobs)
    } else if path.contains("/tags/") {
        Some(PullVerb::Tags)
    } else {
        None
    }
}

#[derive(Default)]
struct PullSession {
    last_manifest: Option<Instant>,
    consumed_in_window: u32,
}

/// Per-source pull sessions keyed by normalized address
#[derive(Default)]
pub struct PullSessions {
    sessions: DashMap<String, PullSession>,
}

impl PullSessions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether this request should skip bucket consumption.
    ///
    /// A manifest fetch never skips, but arms the window and resets the
    /// counter — even when the previous window is still open. A blob fetch
    /// inside the window skips until the free budget runs out.
    pub fn should_exempt(&self, key: &str, path: &str) -> bool {
        let verb = match parse_pull_verb(path) {
            Some(v @ (PullVerb::Manifests | PullVerb::Blobs)) => v,
            _ => return false,
        };

        let mut session = self.sessions.entry(key.to_string()).or_default();
        let now = Instant::now();

        match verb {
            PullVerb::Manifests => {
                session.last_manifest = Some(now);
                session.consumed_in_window = 0;
                false
            }
            PullVerb::Blobs => match session.last_manifest {
                Some(at) if now.duration_since(at) <= ACTIVE_WINDOW => {
                    session.consumed_in_window += 1;
                    session.consumed_in_window <= MAX_FREE_BLOBS
                }
                _ => false,
            },
            PullVerb::Tags => false,
        }
    }

    /// Drop stale sessions; wipe the whole map past the size cap.
    pub fn cleanup(&self) {
        let now = Instant::now();
        self.sessions.retain(|_, session| {
            session
                .last_manifest
                .is_some_and(|at| now.duration_since(at) <= SESSION_EXPIRY)
        });
        if self.sessions.len() > MAX_SESSIONS {
            tracing::warn!(tracked = self.sessions.len(), "pull-session map over cap, wiping");
            self.sessions.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Spawn the periodic session sweeper
    pub fn spawn_sweeper(self: &Arc<Self>, period: Duration) -> tokio::task::JoinHandle<()> {
        let sessions = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                sessions.cleanup();
            }
        })
    }
}
