//! Token-auth shim
//!
//! Proxies `/token…` exchanges to the upstream auth host, caches GET
//! responses, and rewrites `WWW-Authenticate` realms so Docker clients
//! come back through this proxy for token acquisition.

use crate::upstream::RegistryError;
use bytes::Bytes;
use hubgate_cache::{token_key, token_ttl, UniversalCache};
use hubgate_config::{ConfigStore, RegistryMapping};
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE, HOST};
use reqwest::{Method, StatusCode};
use std::sync::Arc;

/// Where token requests go when no registry was latched for the request
pub const DEFAULT_AUTH_HOST: &str = "auth.docker.io";

/// Upstream auth origins whose realms are rewritten to point at us
const REWRITTEN_ORIGINS: [&str; 4] = [
    "https://auth.docker.io",
    "https://ghcr.io",
    "https://gcr.io",
    "https://quay.io",
];

/// Request-scoped registry selection, threaded via request extensions
#[derive(Debug, Clone)]
pub struct ActiveRegistry(pub RegistryMapping);

/// A fully-buffered shim response ready to relay
#[derive(Debug)]
pub struct ShimResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ShimResponse {
    fn cached(body: Bytes) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Self {
            status: StatusCode::OK,
            headers,
            body,
        }
    }
}

/// Auth host for a token exchange: the latched registry's, if the engine
/// threaded one through, else Docker Hub's. `registry.k8s.io` latches an
/// `anonymous` mapping whose auth host is itself; proxying there is a
/// harmless no-op round trip and is kept as-is.
pub fn resolve_auth_host(latched: Option<&RegistryMapping>) -> &str {
    latched
        .map(|m| m.auth_host.as_str())
        .unwrap_or(DEFAULT_AUTH_HOST)
}

/// Rewrite upstream auth origins in a `WWW-Authenticate` value to the
/// proxy's own clear-text origin.
pub fn rewrite_auth_header(value: &str, proxy_host: &str) -> String {
    let replacement = format!("http://{}", proxy_host);
    let mut value = value.to_string();
    for origin in REWRITTEN_ORIGINS {
        value = value.replace(origin, &replacement);
    }
    value
}

/// `/token` proxy with response capture and caching
pub struct TokenShim {
    http: reqwest::Client,
    cache: Arc<UniversalCache>,
    config: Arc<ConfigStore>,
}

impl TokenShim {
    pub fn new(
        http: reqwest::Client,
        cache: Arc<UniversalCache>,
        config: Arc<ConfigStore>,
    ) -> Self {
        Self {
            http,
            cache,
            config,
        }
    }

    /// Proxy one token exchange.
    ///
    /// `path` is the inbound request path (`/token` or `/token/…`); the
    /// upstream URL is the auth host with that path appended, preserving
    /// whatever path the mapping's auth host already carries.
    pub async fn proxy(
        &self,
        method: Method,
        latched: Option<&RegistryMapping>,
        path: &str,
        raw_query: &str,
        mut headers: HeaderMap,
        body: Bytes,
        proxy_host: &str,
    ) -> Result<ShimResponse, RegistryError> {
        let cfg = self.config.snapshot();
        let cacheable = method == Method::GET && cfg.token_cache.enabled;
        let key = token_key(raw_query);

        if cacheable {
            if let Some(item) = self.cache.get(&key) {
                tracing::debug!("token shim cache hit");
                return Ok(ShimResponse::cached(item.data));
            }
        }

        let auth_host = resolve_auth_host(latched);

        let mut url = format!("https://{}{}", auth_host, path);
        if !raw_query.is_empty() {
            url.push('?');
            url.push_str(raw_query);
        }

        headers.remove(HOST);

        let resp = self
            .http
            .request(method, &url)
            .headers(headers)
            .body(body)
            .send()
            .await?;

        let status = resp.status();
        let mut out_headers = HeaderMap::new();
        for (name, value) in resp.headers() {
            if name == reqwest::header::WWW_AUTHENTICATE {
                let rewritten = value
                    .to_str()
                    .map(|v| rewrite_auth_header(v, proxy_host))
                    .unwrap_or_default();
                if let Ok(value) = HeaderValue::from_str(&rewritten) {
                    out_headers.append(name, value);
                }
            } else {
                out_headers.append(name, value.clone());
            }
        }

        let body = resp.bytes().await?;

        if cacheable && status == StatusCode::OK && !body.is_empty() {
            let ttl = token_ttl(&body);
            self.cache
                .set(key, body.clone(), "application/json", Vec::new(), ttl);
        }

        Ok(ShimResponse {
            status,
            headers: out_headers,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrites_known_auth_origins() {
        let header = r#"Bearer realm="https://auth.docker.io/token",service="registry.docker.io""#;
        assert_eq!(
            rewrite_auth_header(header, "proxy.example.com:5000"),
            r#"Bearer realm="http://proxy.example.com:5000/token",service="registry.docker.io""#
        );

        for origin in ["https://ghcr.io", "https://gcr.io", "https://quay.io"] {
            let header = format!(r#"Bearer realm="{}/token""#, origin);
            let rewritten = rewrite_auth_header(&header, "p.example");
            assert_eq!(rewritten, r#"Bearer realm="http://p.example/token""#);
        }
    }

    #[test]
    fn unknown_origins_pass_through() {
        let header = r#"Bearer realm="https://registry.k8s.io/token""#;
        assert_eq!(rewrite_auth_header(header, "p.example"), header);
    }

    #[test]
    fn auth_host_defaults_to_docker() {
        assert_eq!(resolve_auth_host(None), DEFAULT_AUTH_HOST);

        let mapping = RegistryMapping {
            upstream: "ghcr.io".to_string(),
            auth_host: "ghcr.io/token".to_string(),
            auth_type: hubgate_config::AuthType::Github,
            enabled: true,
        };
        assert_eq!(resolve_auth_host(Some(&mapping)), "ghcr.io/token");
    }

    #[test]
    fn cached_response_shape() {
        let resp = ShimResponse::cached(Bytes::from_static(b"{\"token\":\"t\"}"));
        assert_eq!(resp.status, StatusCode::OK);
        assert_eq!(
            resp.headers.get(CONTENT_TYPE).unwrap(),
            "application/json"
        );
    }
}
