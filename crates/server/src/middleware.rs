//! Rate-limit middleware and client-address extraction

use crate::error::GatewayError;
use crate::state::SharedState;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header::HeaderMap, Extensions};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use hubgate_limiter::{extract_ip, normalize_for_limit, Acquire};
use std::net::SocketAddr;

/// Paths belonging to the static UI, exempt from rate limiting
const STATIC_PATHS: [&str; 4] = ["/", "/favicon.ico", "/images.html", "/search.html"];

fn is_static_path(path: &str) -> bool {
    STATIC_PATHS.contains(&path) || path.starts_with("/public/")
}

/// Client address, taking proxy headers over the socket peer.
///
/// Priority: `X-Forwarded-For` first hop, `X-Real-IP`,
/// `X-Original-Forwarded-For` first hop, then the connection's peer.
pub fn client_address(headers: &HeaderMap, extensions: &Extensions) -> String {
    for (name, first_only) in [
        ("x-forwarded-for", true),
        ("x-real-ip", false),
        ("x-original-forwarded-for", true),
    ] {
        if let Some(value) = headers.get(name).and_then(|v| v.to_str().ok()) {
            let candidate = if first_only {
                value.split(',').next().unwrap_or(value)
            } else {
                value
            };
            let candidate = candidate.trim();
            if !candidate.is_empty() {
                return candidate.to_string();
            }
        }
    }

    extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.to_string())
        .unwrap_or_else(|| "127.0.0.1".to_string())
}

/// Session key shared by the rate limiter and pull-window maps
pub fn session_key(address: &str) -> String {
    let (ip, clean) = extract_ip(address);
    ip.map(normalize_for_limit).unwrap_or(clean)
}

/// Outer rate-limit middleware covering every non-static route.
///
/// Deny CIDRs answer 403 before any handler runs. Registry manifest/blob
/// requests consult the pull window before the bucket so that one
/// `docker pull` costs one token rather than dozens.
pub async fn rate_limit(
    State(state): State<SharedState>,
    request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();
    if is_static_path(&path) {
        return next.run(request).await;
    }

    let address = client_address(request.headers(), request.extensions());

    match state.limiter.acquire(&address).await {
        Acquire::Denied => {
            tracing::warn!(client = %address, path = %path, "blocked source address");
            GatewayError::SourceBlocked.into_response()
        }
        Acquire::Unlimited => next.run(request).await,
        Acquire::Limited(entry) => {
            if path.starts_with("/v2/")
                && state.sessions.should_exempt(&session_key(&address), &path)
            {
                return next.run(request).await;
            }
            if entry.try_consume() {
                next.run(request).await
            } else {
                tracing::warn!(client = %address, path = %path, "rate limit exceeded");
                GatewayError::RateLimited.into_response()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(
                axum::http::header::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    #[test]
    fn forwarded_for_takes_first_hop() {
        let headers = headers(&[("x-forwarded-for", "203.0.113.4, 10.0.0.1")]);
        assert_eq!(
            client_address(&headers, &Extensions::new()),
            "203.0.113.4"
        );
    }

    #[test]
    fn header_priority_order() {
        let both = headers(&[
            ("x-real-ip", "192.0.2.8"),
            ("x-forwarded-for", "203.0.113.4"),
        ]);
        assert_eq!(client_address(&both, &Extensions::new()), "203.0.113.4");

        let real_only = headers(&[("x-real-ip", "192.0.2.8")]);
        assert_eq!(client_address(&real_only, &Extensions::new()), "192.0.2.8");

        let original = headers(&[("x-original-forwarded-for", "198.51.100.2, 10.0.0.1")]);
        assert_eq!(
            client_address(&original, &Extensions::new()),
            "198.51.100.2"
        );
    }

    #[test]
    fn falls_back_to_peer_address() {
        let mut extensions = Extensions::new();
        extensions.insert(ConnectInfo("198.51.100.7:4444".parse::<SocketAddr>().unwrap()));
        assert_eq!(
            client_address(&HeaderMap::new(), &extensions),
            "198.51.100.7:4444"
        );
    }

    #[test]
    fn static_paths_are_recognized() {
        assert!(is_static_path("/"));
        assert!(is_static_path("/favicon.ico"));
        assert!(is_static_path("/public/css/app.css"));
        assert!(!is_static_path("/v2/"));
        assert!(!is_static_path("/ready"));
    }

    #[test]
    fn session_keys_normalize() {
        assert_eq!(session_key("203.0.113.4:999"), "203.0.113.4");
        assert_eq!(session_key("2001:db8:0:1::9"), "2001:db8:0:1::/64");
        assert_eq!(session_key("weird"), "weird");
    }
}
