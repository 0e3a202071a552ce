//! Upstream distribution client
//!
//! Speaks raw registry HTTP through the shared streaming client so that
//! media types, digests and content lengths pass through byte-exact. Auth
//! is the standard anonymous Bearer dance: a 401 challenge names a realm,
//! the realm hands out a short-lived token, the request is retried once.
//! Tokens land in the shared TTL cache under `token:` keys.

use bytes::Bytes;
use hubgate_cache::{token_key, token_ttl, UniversalCache};
use hubgate_config::ConfigStore;
use reqwest::header::{ACCEPT, LOCATION, WWW_AUTHENTICATE};
use reqwest::{Method, StatusCode};
use std::sync::Arc;
use thiserror::Error;

/// Docker Hub's distribution endpoint
pub const DOCKER_HUB_HOST: &str = "registry-1.docker.io";

/// Manifest media types we accept from upstreams, newest first
pub const MANIFEST_ACCEPT: &str = "application/vnd.oci.image.index.v1+json, \
     application/vnd.oci.image.manifest.v1+json, \
     application/vnd.docker.distribution.manifest.list.v2+json, \
     application/vnd.docker.distribution.manifest.v2+json";

/// Registries redirect blob fetches to CDNs; bound the chain
const MAX_UPSTREAM_REDIRECTS: usize = 10;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("upstream request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("upstream returned {0}")]
    UpstreamStatus(StatusCode),

    #[error("redirect chain from upstream did not terminate")]
    RedirectLoop,

    #[error("upstream sent an unusable redirect location")]
    BadRedirect,

    #[error("token endpoint returned no usable token")]
    NoToken,
}

/// A parsed `WWW-Authenticate: Bearer` challenge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BearerChallenge {
    pub realm: String,
    pub service: Option<String>,
    pub scope: Option<String>,
}

/// Parse `Bearer realm="…",service="…",scope="…"`. Parameter order is not
/// significant; unquoted values are tolerated.
pub fn parse_bearer_challenge(header: &str) -> Option<BearerChallenge> {
    let rest = header.trim().strip_prefix("Bearer ")?;

    let mut realm = None;
    let mut service = None;
    let mut scope = None;

    for part in rest.split(',') {
        let (key, value) = part.split_once('=')?;
        let value = value.trim().trim_matches('"').to_string();
        match key.trim() {
            "realm" => realm = Some(value),
            "service" => service = Some(value),
            "scope" => scope = Some(value),
            _ => {}
        }
    }

    Some(BearerChallenge {
        realm: realm?,
        service,
        scope,
    })
}

#[derive(serde::Deserialize)]
struct TokenBody {
    #[serde(default)]
    token: String,
    #[serde(default)]
    access_token: String,
}

/// URL builders for the distribution API
pub fn manifest_url(host: &str, image: &str, reference: &str) -> String {
    format!("https://{}/v2/{}/manifests/{}", host, image, reference)
}

pub fn blob_url(host: &str, image: &str, digest: &str) -> String {
    format!("https://{}/v2/{}/blobs/{}", host, image, digest)
}

pub fn tags_url(host: &str, image: &str) -> String {
    format!("https://{}/v2/{}/tags/list", host, image)
}

/// Shared upstream client for the registry plane
pub struct UpstreamClient {
    http: reqwest::Client,
    cache: Arc<UniversalCache>,
    config: Arc<ConfigStore>,
}

impl UpstreamClient {
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

    /// Perform one request against an upstream registry, handling the
    /// Bearer dance and CDN redirects. Non-2xx statuses are returned to
    /// the caller for mapping, not treated as transport errors.
    pub async fn request(
        &self,
        method: Method,
        url: &str,
        accept: Option<&str>,
    ) -> Result<reqwest::Response, RegistryError> {
        let resp = self.send(&method, url, accept, None).await?;
        if resp.status() != StatusCode::UNAUTHORIZED {
            return Ok(resp);
        }

        let challenge = resp
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_bearer_challenge);

        match challenge {
            Some(challenge) => {
                let token = self.fetch_token(&challenge).await?;
                self.send(&method, url, accept, Some(&token)).await
            }
            None => Ok(resp),
        }
    }

    async fn send(
        &self,
        method: &Method,
        url: &str,
        accept: Option<&str>,
        bearer: Option<&str>,
    ) -> Result<reqwest::Response, RegistryError> {
        let origin_host = host_of(url).to_string();
        let mut url = url.to_string();

        for _ in 0..=MAX_UPSTREAM_REDIRECTS {
            let mut req = self.http.request(method.clone(), &url);
            if let Some(accept) = accept {
                req = req.header(ACCEPT, accept);
            }
            // Credentials stay home when a CDN redirect changes hosts.
            if let Some(token) = bearer {
                if host_of(&url) == origin_host {
                    req = req.bearer_auth(token);
                }
            }

            let resp = req.send().await?;
            if !resp.status().is_redirection() {
                return Ok(resp);
            }

            let location = resp
                .headers()
                .get(LOCATION)
                .and_then(|v| v.to_str().ok())
                .ok_or(RegistryError::BadRedirect)?;
            url = absolutize(&url, location).ok_or(RegistryError::BadRedirect)?;
        }

        Err(RegistryError::RedirectLoop)
    }

    /// Fetch (or recall) an anonymous token for a challenge
    async fn fetch_token(&self, challenge: &BearerChallenge) -> Result<String, RegistryError> {
        let mut query = String::new();
        if let Some(service) = &challenge.service {
            query.push_str(&format!("service={}", service));
        }
        if let Some(scope) = &challenge.scope {
            if !query.is_empty() {
                query.push('&');
            }
            query.push_str(&format!("scope={}", scope));
        }

        let cache_enabled = self.config.snapshot().token_cache.enabled;
        let key = token_key(&query);

        if cache_enabled {
            if let Some(item) = self.cache.get(&key) {
                if let Some(token) = extract_token(&item.data) {
                    tracing::debug!(realm = %challenge.realm, "token cache hit");
                    return Ok(token);
                }
            }
        }

        let url = if query.is_empty() {
            challenge.realm.clone()
        } else {
            format!("{}?{}", challenge.realm, query)
        };

        let resp = self.http.get(&url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(RegistryError::UpstreamStatus(status));
        }
        let body = resp.bytes().await?;

        let token = extract_token(&body).ok_or(RegistryError::NoToken)?;
        if cache_enabled {
            let ttl = token_ttl(&body);
            self.cache
                .set(key, body, "application/json", Vec::new(), ttl);
        }
        Ok(token)
    }
}

fn extract_token(body: &Bytes) -> Option<String> {
    let parsed: TokenBody = serde_json::from_slice(body).ok()?;
    if !parsed.token.is_empty() {
        Some(parsed.token)
    } else if !parsed.access_token.is_empty() {
        Some(parsed.access_token)
    } else {
        None
    }
}

fn host_of(url: &str) -> &str {
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .unwrap_or(url);
    rest.split('/').next().unwrap_or(rest)
}

fn absolutize(base: &str, location: &str) -> Option<String> {
    if location.starts_with("http://") || location.starts_with("https://") {
        return Some(location.to_string());
    }
    if location.starts_with('/') {
        let scheme_end = base.find("://")? + 3;
        let host_end = base[scheme_end..]
            .find('/')
            .map(|i| scheme_end + i)
            .unwrap_or(base.len());
        return Some(format!("{}{}", &base[..host_end], location));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_challenge() {
        let challenge = parse_bearer_challenge(
            r#"Bearer realm="https://auth.docker.io/token",service="registry.docker.io",scope="repository:library/nginx:pull""#,
        )
        .unwrap();
        assert_eq!(challenge.realm, "https://auth.docker.io/token");
        assert_eq!(challenge.service.as_deref(), Some("registry.docker.io"));
        assert_eq!(
            challenge.scope.as_deref(),
            Some("repository:library/nginx:pull")
        );
    }

    #[test]
    fn parses_minimal_challenge() {
        let challenge = parse_bearer_challenge(r#"Bearer realm="https://ghcr.io/token""#).unwrap();
        assert_eq!(challenge.realm, "https://ghcr.io/token");
        assert_eq!(challenge.service, None);
        assert_eq!(challenge.scope, None);
    }

    #[test]
    fn rejects_non_bearer() {
        assert!(parse_bearer_challenge(r#"Basic realm="x""#).is_none());
        assert!(parse_bearer_challenge("garbage").is_none());
    }

    #[test]
    fn token_extraction_prefers_token_field() {
        assert_eq!(
            extract_token(&Bytes::from_static(br#"{"token":"a","access_token":"b"}"#)).unwrap(),
            "a"
        );
        assert_eq!(
            extract_token(&Bytes::from_static(br#"{"access_token":"b"}"#)).unwrap(),
            "b"
        );
        assert!(extract_token(&Bytes::from_static(b"{}")).is_none());
        assert!(extract_token(&Bytes::from_static(b"nope")).is_none());
    }

    #[test]
    fn url_builders() {
        assert_eq!(
            manifest_url(DOCKER_HUB_HOST, "library/nginx", "latest"),
            "https://registry-1.docker.io/v2/library/nginx/manifests/latest"
        );
        assert_eq!(
            blob_url("ghcr.io", "owner/tool", "sha256:abc"),
            "https://ghcr.io/v2/owner/tool/blobs/sha256:abc"
        );
        assert_eq!(
            tags_url("quay.io", "org/app"),
            "https://quay.io/v2/org/app/tags/list"
        );
    }

    #[test]
    fn absolutize_handles_relative_and_absolute() {
        assert_eq!(
            absolutize("https://a.example/v2/x", "https://cdn.example/blob").unwrap(),
            "https://cdn.example/blob"
        );
        assert_eq!(
            absolutize("https://a.example/v2/x", "/other/path").unwrap(),
            "https://a.example/other/path"
        );
        assert!(absolutize("https://a.example/v2/x", "relative").is_none());
    }

    #[test]
    fn host_extraction() {
        assert_eq!(host_of("https://a.example/v2/x"), "a.example");
        assert_eq!(host_of("http://b.example"), "b.example");
    }
}
