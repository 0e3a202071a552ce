//! HubGate configuration
//!
//! Loads `config.toml`, applies environment overrides, and hands out
//! immutable snapshots to request handlers.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Upstream registry mapping, keyed by the domain clients put in front of
/// the image name (e.g. `ghcr.io/owner/image`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryMapping {
    /// Upstream registry host
    pub upstream: String,

    /// Token endpoint host (may include a path, e.g. `ghcr.io/token`)
    #[serde(rename = "authHost")]
    pub auth_host: String,

    /// Authentication family of the upstream
    #[serde(rename = "authType", default)]
    pub auth_type: AuthType,

    /// Whether requests may be routed to this registry
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Authentication family for an upstream registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthType {
    #[default]
    Docker,
    Github,
    Google,
    Quay,
    Anonymous,
}

/// Listener settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Per-response size cap for the GitHub proxy, in bytes
    #[serde(rename = "fileSize", default = "default_file_size")]
    pub file_size: u64,

    /// Serve clear-text HTTP/2 alongside HTTP/1.1
    #[serde(rename = "enableH2C", default)]
    pub enable_h2c: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            file_size: default_file_size(),
            enable_h2c: false,
        }
    }
}

/// Per-source rate limit settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Requests allowed per period (also the bucket burst)
    #[serde(rename = "requestLimit", default = "default_request_limit")]
    pub request_limit: u32,

    /// Period length in hours; fractional values are allowed
    #[serde(rename = "periodHours", default = "default_period_hours")]
    pub period_hours: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            request_limit: default_request_limit(),
            period_hours: default_period_hours(),
        }
    }
}

/// Source-address allow/deny lists (CIDR notation; bare addresses accepted)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecurityConfig {
    #[serde(rename = "whiteList", default)]
    pub white_list: Vec<String>,

    #[serde(rename = "blackList", default)]
    pub black_list: Vec<String>,
}

/// Content access lists and the outbound proxy URL
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccessConfig {
    #[serde(rename = "whiteList", default)]
    pub white_list: Vec<String>,

    #[serde(rename = "blackList", default)]
    pub black_list: Vec<String>,

    /// Outbound proxy URL (http, https or socks5); empty disables
    #[serde(default)]
    pub proxy: String,
}

/// Image exporter limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
    #[serde(rename = "maxImages", default = "default_max_images")]
    pub max_images: usize,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            max_images: default_max_images(),
        }
    }
}

/// Manifest/token cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenCacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// TTL for manifests cached under a non-floating tag
    #[serde(
        rename = "defaultTTL",
        with = "humantime_serde",
        default = "default_cache_ttl"
    )]
    pub default_ttl: Duration,
}

impl Default for TokenCacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_ttl: default_cache_ttl(),
        }
    }
}

/// Full application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(rename = "rateLimit", default)]
    pub rate_limit: RateLimitConfig,

    #[serde(default)]
    pub security: SecurityConfig,

    #[serde(default)]
    pub access: AccessConfig,

    #[serde(default)]
    pub download: DownloadConfig,

    /// Alternate registries, keyed by domain. `docker.io` is implicit and
    /// never appears here.
    #[serde(default = "default_registries")]
    pub registries: HashMap<String, RegistryMapping>,

    #[serde(rename = "tokenCache", default)]
    pub token_cache: TokenCacheConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            rate_limit: RateLimitConfig::default(),
            security: SecurityConfig::default(),
            access: AccessConfig::default(),
            download: DownloadConfig::default(),
            registries: default_registries(),
            token_cache: TokenCacheConfig::default(),
        }
    }
}

impl AppConfig {
    /// Listener bind authority, `host:port`
    pub fn bind_authority(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// Authority clients can reach us at when no Host header is available
    pub fn advertised_authority(&self) -> String {
        if self.server.host == "0.0.0.0" {
            format!("localhost:{}", self.server.port)
        } else {
            self.bind_authority()
        }
    }

    /// Look up an enabled registry mapping by domain
    pub fn enabled_registry(&self, domain: &str) -> Option<&RegistryMapping> {
        self.registries.get(domain).filter(|m| m.enabled)
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    5000
}

fn default_file_size() -> u64 {
    2 * 1024 * 1024 * 1024
}

fn default_request_limit() -> u32 {
    200
}

fn default_period_hours() -> f64 {
    1.0
}

fn default_max_images() -> usize {
    10
}

fn default_cache_ttl() -> Duration {
    Duration::from_secs(20 * 60)
}

fn default_true() -> bool {
    true
}

fn default_registries() -> HashMap<String, RegistryMapping> {
    let mut map = HashMap::new();
    map.insert(
        "ghcr.io".to_string(),
        RegistryMapping {
            upstream: "ghcr.io".to_string(),
            auth_host: "ghcr.io/token".to_string(),
            auth_type: AuthType::Github,
            enabled: true,
        },
    );
    map.insert(
        "gcr.io".to_string(),
        RegistryMapping {
            upstream: "gcr.io".to_string(),
            auth_host: "gcr.io/v2/token".to_string(),
            auth_type: AuthType::Google,
            enabled: true,
        },
    );
    map.insert(
        "quay.io".to_string(),
        RegistryMapping {
            upstream: "quay.io".to_string(),
            auth_host: "quay.io/v2/auth".to_string(),
            auth_type: AuthType::Quay,
            enabled: true,
        },
    );
    map.insert(
        "registry.k8s.io".to_string(),
        RegistryMapping {
            upstream: "registry.k8s.io".to_string(),
            auth_host: "registry.k8s.io".to_string(),
            auth_type: AuthType::Anonymous,
            enabled: true,
        },
    );
    map
}

/// Load configuration: defaults, then the TOML file if present, then
/// environment overrides. Invalid environment values are ignored.
pub fn load(path: impl AsRef<Path>) -> Result<AppConfig, ConfigError> {
    let path = path.as_ref();

    let mut cfg = match std::fs::read_to_string(path) {
        Ok(text) => toml::from_str(&text)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!(path = %path.display(), "config file not found, using defaults");
            AppConfig::default()
        }
        Err(e) => return Err(e.into()),
    };

    apply_env_overrides(&mut cfg);
    Ok(cfg)
}

fn apply_env_overrides(cfg: &mut AppConfig) {
    if let Ok(val) = std::env::var("SERVER_HOST") {
        if !val.is_empty() {
            cfg.server.host = val;
        }
    }
    if let Ok(val) = std::env::var("SERVER_PORT") {
        if let Ok(port) = val.parse::<u16>() {
            if port > 0 {
                cfg.server.port = port;
            }
        }
    }
    if let Ok(val) = std::env::var("ENABLE_H2C") {
        if let Ok(enable) = val.parse::<bool>() {
            cfg.server.enable_h2c = enable;
        }
    }
    if let Ok(val) = std::env::var("MAX_FILE_SIZE") {
        if let Ok(size) = val.parse::<u64>() {
            if size > 0 {
                cfg.server.file_size = size;
            }
        }
    }
    if let Ok(val) = std::env::var("RATE_LIMIT") {
        if let Ok(limit) = val.parse::<u32>() {
            if limit > 0 {
                cfg.rate_limit.request_limit = limit;
            }
        }
    }
    if let Ok(val) = std::env::var("RATE_PERIOD_HOURS") {
        if let Ok(period) = val.parse::<f64>() {
            if period > 0.0 {
                cfg.rate_limit.period_hours = period;
            }
        }
    }
    if let Ok(val) = std::env::var("IP_WHITELIST") {
        cfg.security
            .white_list
            .extend(val.split(',').map(|s| s.trim().to_string()));
    }
    if let Ok(val) = std::env::var("IP_BLACKLIST") {
        cfg.security
            .black_list
            .extend(val.split(',').map(|s| s.trim().to_string()));
    }
    if let Ok(val) = std::env::var("MAX_IMAGES") {
        if let Ok(max) = val.parse::<usize>() {
            if max > 0 {
                cfg.download.max_images = max;
            }
        }
    }
}

/// Read-mostly configuration view.
///
/// Readers get a shared immutable snapshot; a reload swaps the pointer
/// atomically. Snapshots taken before a reload stay valid.
pub struct ConfigStore {
    current: RwLock<Arc<AppConfig>>,
}

impl ConfigStore {
    pub fn new(cfg: AppConfig) -> Self {
        Self {
            current: RwLock::new(Arc::new(cfg)),
        }
    }

    /// Current immutable snapshot
    pub fn snapshot(&self) -> Arc<AppConfig> {
        self.current.read().expect("config lock poisoned").clone()
    }

    /// Replace the configuration; in-flight readers keep their snapshot
    pub fn replace(&self, cfg: AppConfig) {
        *self.current.write().expect("config lock poisoned") = Arc::new(cfg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.server.host, "0.0.0.0");
        assert_eq!(cfg.server.port, 5000);
        assert_eq!(cfg.server.file_size, 2 * 1024 * 1024 * 1024);
        assert!(!cfg.server.enable_h2c);
        assert_eq!(cfg.rate_limit.request_limit, 200);
        assert_eq!(cfg.download.max_images, 10);
        assert!(cfg.token_cache.enabled);
        assert_eq!(cfg.token_cache.default_ttl, Duration::from_secs(1200));
        assert!(cfg.registries.contains_key("ghcr.io"));
        assert!(cfg.registries.contains_key("registry.k8s.io"));
        assert!(!cfg.registries.contains_key("docker.io"));
    }

    #[test]
    fn parse_toml_sections() {
        let text = r#"
            [server]
            host = "127.0.0.1"
            port = 8080
            enableH2C = true

            [rateLimit]
            requestLimit = 50
            periodHours = 0.5

            [security]
            whiteList = ["10.0.0.0/8"]

            [access]
            blackList = ["badactor/*"]
            proxy = "socks5://127.0.0.1:1080"

            [tokenCache]
            enabled = true
            defaultTTL = "30m"

            [registries."ghcr.io"]
            upstream = "ghcr.io"
            authHost = "ghcr.io/token"
            authType = "github"
            enabled = false
        "#;

        let cfg: AppConfig = toml::from_str(text).unwrap();
        assert_eq!(cfg.server.host, "127.0.0.1");
        assert_eq!(cfg.server.port, 8080);
        assert!(cfg.server.enable_h2c);
        assert_eq!(cfg.rate_limit.request_limit, 50);
        assert_eq!(cfg.rate_limit.period_hours, 0.5);
        assert_eq!(cfg.security.white_list, vec!["10.0.0.0/8"]);
        assert_eq!(cfg.access.black_list, vec!["badactor/*"]);
        assert_eq!(cfg.access.proxy, "socks5://127.0.0.1:1080");
        assert_eq!(cfg.token_cache.default_ttl, Duration::from_secs(1800));

        let ghcr = cfg.registries.get("ghcr.io").unwrap();
        assert_eq!(ghcr.auth_type, AuthType::Github);
        assert!(!ghcr.enabled);
        assert!(cfg.enabled_registry("ghcr.io").is_none());
    }

    #[test]
    fn enabled_registry_lookup() {
        let cfg = AppConfig::default();
        assert!(cfg.enabled_registry("ghcr.io").is_some());
        assert!(cfg.enabled_registry("example.com").is_none());
    }

    #[test]
    fn advertised_authority_falls_back_to_localhost() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.advertised_authority(), "localhost:5000");

        let mut cfg = AppConfig::default();
        cfg.server.host = "192.168.1.5".to_string();
        assert_eq!(cfg.advertised_authority(), "192.168.1.5:5000");
    }

    #[test]
    fn snapshot_survives_replace() {
        let store = ConfigStore::new(AppConfig::default());
        let before = store.snapshot();

        let mut updated = AppConfig::default();
        updated.server.port = 6000;
        store.replace(updated);

        assert_eq!(before.server.port, 5000);
        assert_eq!(store.snapshot().server.port, 6000);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = load(dir.path().join("nope.toml")).unwrap();
        assert_eq!(cfg.server.port, 5000);
    }
}
