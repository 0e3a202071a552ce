//! Request handlers

pub mod github;
pub mod health;
pub mod image;
pub mod registry;
pub mod token;

use axum::http::header::{HeaderMap, HOST};

/// Externally visible authority of this service, for URL rewriting.
///
/// `X-Forwarded-Host` wins (the edge proxy knows best), then the request's
/// own `Host`, then the configured listener authority.
pub fn proxy_host(headers: &HeaderMap, fallback: &str) -> String {
    headers
        .get("x-forwarded-host")
        .or_else(|| headers.get(HOST))
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(|v| v.to_string())
        .unwrap_or_else(|| fallback.to_string())
}
