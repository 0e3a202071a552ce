//! Outbound HTTP client factory
//!
//! Two pre-built clients sharing pool and proxy settings: a streaming
//! client with no overall deadline for manifest/blob/file transfers, and a
//! short-deadline client for interactive lookups. Redirects are disabled on
//! the streaming client; the planes that need them follow hops manually.

use hubgate_config::AppConfig;
use std::time::Duration;

#[derive(Clone)]
pub struct HttpClients {
    /// Long-lived transfer client: no overall deadline, 300 s read
    /// timeout, deep idle pool, manual redirects
    pub streaming: reqwest::Client,
    /// Short-deadline client for small interactive calls
    pub search: reqwest::Client,
}

impl HttpClients {
    pub fn build(config: &AppConfig) -> reqwest::Result<Self> {
        let mut streaming = reqwest::Client::builder()
            .pool_max_idle_per_host(1000)
            .pool_idle_timeout(Duration::from_secs(90))
            .connect_timeout(Duration::from_secs(30))
            .read_timeout(Duration::from_secs(300))
            .tcp_keepalive(Duration::from_secs(30))
            .redirect(reqwest::redirect::Policy::none());

        // An explicit proxy URL wins; otherwise reqwest picks up the
        // process environment (HTTP_PROXY / HTTPS_PROXY / ALL_PROXY).
        if !config.access.proxy.is_empty() {
            streaming = streaming.proxy(reqwest::Proxy::all(&config.access.proxy)?);
        }

        let mut search = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .connect_timeout(Duration::from_secs(5))
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(30));

        if !config.access.proxy.is_empty() {
            search = search.proxy(reqwest::Proxy::all(&config.access.proxy)?);
        }

        Ok(Self {
            streaming: streaming.build()?,
            search: search.build()?,
        })
    }
}
