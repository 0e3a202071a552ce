//! Process-wide application state

use crate::clients::HttpClients;
use hubgate_cache::UniversalCache;
use hubgate_config::{AppConfig, ConfigStore};
use hubgate_export::{Debouncer, ImageStreamer, UpstreamSettings, BATCH_WINDOW, SINGLE_WINDOW};
use hubgate_limiter::{IpRateLimiter, PullSessions, RateSettings};
use hubgate_registry::{TokenShim, UpstreamClient};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

pub type SharedState = Arc<AppState>;

/// Singletons initialized once at startup and read by every request task
pub struct AppState {
    pub config: Arc<ConfigStore>,
    pub cache: Arc<UniversalCache>,
    pub limiter: Arc<IpRateLimiter>,
    pub sessions: Arc<PullSessions>,
    pub clients: HttpClients,
    pub upstream: Arc<UpstreamClient>,
    pub shim: Arc<TokenShim>,
    pub streamer: Arc<ImageStreamer>,
    pub single_debounce: Arc<Debouncer>,
    pub batch_debounce: Arc<Debouncer>,
    pub started_wall: SystemTime,
    pub started: Instant,
}

impl AppState {
    pub fn new(config: AppConfig) -> anyhow::Result<SharedState> {
        let clients = HttpClients::build(&config)?;

        let limiter = Arc::new(IpRateLimiter::new(
            RateSettings {
                request_limit: config.rate_limit.request_limit,
                period_hours: config.rate_limit.period_hours,
            },
            &config.security.white_list,
            &config.security.black_list,
        ));

        let streamer = Arc::new(ImageStreamer::new(&UpstreamSettings {
            proxy: config.access.proxy.clone(),
        }));

        let store = Arc::new(ConfigStore::new(config));
        let cache = Arc::new(UniversalCache::new());

        let upstream = Arc::new(UpstreamClient::new(
            clients.streaming.clone(),
            Arc::clone(&cache),
            Arc::clone(&store),
        ));
        let shim = Arc::new(TokenShim::new(
            clients.streaming.clone(),
            Arc::clone(&cache),
            Arc::clone(&store),
        ));

        Ok(Arc::new(Self {
            config: store,
            cache,
            limiter,
            sessions: Arc::new(PullSessions::new()),
            clients,
            upstream,
            shim,
            streamer,
            single_debounce: Arc::new(Debouncer::new(SINGLE_WINDOW)),
            batch_debounce: Arc::new(Debouncer::new(BATCH_WINDOW)),
            started_wall: SystemTime::now(),
            started: Instant::now(),
        }))
    }

    /// Start the background sweepers. Call once after construction.
    pub fn spawn_sweepers(self: &SharedState) {
        let _ = self.cache.spawn_sweeper(hubgate_cache::SWEEP_INTERVAL);
        let _ = self
            .limiter
            .spawn_sweeper(hubgate_limiter::CLEANUP_INTERVAL);
        let _ = self
            .sessions
            .spawn_sweeper(hubgate_limiter::SESSION_SWEEP_INTERVAL);
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }
}
