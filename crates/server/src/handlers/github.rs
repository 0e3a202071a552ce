//! GitHub-family URL proxy
//!
//! Fallback handler for any path that is not a registry, token, or API
//! route: the path itself is the target URL.

use crate::error::GatewayError;
use crate::state::SharedState;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures_util::StreamExt;
use hubgate_access::AccessPolicy;
use hubgate_github::{
    check_github_url, is_blob_url, normalize_target, process_script, MAX_REDIRECTS,
    MAX_SCRIPT_SIZE,
};

/// Media types this service refuses to proxy on GET
const BLOCKED_CONTENT_TYPES: [&str; 4] = [
    "text/html",
    "application/xhtml+xml",
    "text/xml",
    "application/xml",
];

pub async fn proxy(State(state): State<SharedState>, request: Request) -> Response {
    let cfg = state.config.snapshot();

    let raw = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_else(|| request.uri().path());
    let target = normalize_target(raw);

    let groups = match check_github_url(&target) {
        Some(groups) => groups,
        None => return GatewayError::InvalidInput.into_response(),
    };

    if groups.len() >= 2 {
        let policy = AccessPolicy::new(&cfg.access.white_list, &cfg.access.black_list);
        if let Err(reason) = policy.check_github(&groups[0], &groups[1]) {
            tracing::warn!(
                owner = %groups[0],
                repo = %groups[1],
                reason = %reason,
                "repository access denied"
            );
            return GatewayError::AccessDenied(reason.to_string()).into_response();
        }
    }

    // Blob pages are served through the raw endpoint.
    let target = if is_blob_url(&target) {
        target.replacen("/blob/", "/raw/", 1)
    } else {
        target
    };

    let method = request.method().clone();
    let mut headers = request.headers().clone();
    headers.remove(header::HOST);
    let real_host = visible_host(request.headers());

    // The inbound body is only available once; redirect retries go out
    // empty, which is all a redirected GET needs anyway.
    let mut body = Some(reqwest::Body::wrap_stream(
        request.into_body().into_data_stream(),
    ));

    let mut url = target;
    let mut hops = 0usize;

    loop {
        let mut builder = state
            .clients
            .streaming
            .request(method.clone(), &url)
            .headers(headers.clone());
        if let Some(body) = body.take() {
            builder = builder.body(body);
        }

        let resp = match builder.send().await {
            Ok(resp) => resp,
            Err(e) => {
                tracing::warn!(url = %url, error = %e, "upstream fetch failed");
                return GatewayError::GithubUpstream(e.to_string()).into_response();
            }
        };

        // Redirects are resolved before any content checks; the checks
        // below belong to the final response only.
        if let Some(location) = resp
            .headers()
            .get(header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string())
        {
            if check_github_url(&location).is_some() {
                // The client can follow this one back through us.
                return relay(resp, Some(format!("/{}", location)), &url, &real_host).await;
            }

            hops += 1;
            if hops > MAX_REDIRECTS {
                return GatewayError::RedirectLoop.into_response();
            }
            url = match absolutize(&url, &location) {
                Some(next) => next,
                None => return GatewayError::GithubUpstream("bad redirect".into()).into_response(),
            };
            continue;
        }

        // This service accelerates files, not web pages.
        if method == Method::GET {
            if let Some(content_type) = resp
                .headers()
                .get(header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
            {
                let token = content_type
                    .split(';')
                    .next()
                    .unwrap_or("")
                    .trim()
                    .to_ascii_lowercase();
                if BLOCKED_CONTENT_TYPES.contains(&token.as_str()) {
                    return GatewayError::HtmlBlocked.into_response();
                }
            }
        }

        if let Some(length) = resp
            .headers()
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
        {
            if length > cfg.server.file_size {
                return GatewayError::TooLarge {
                    limit_mb: cfg.server.file_size / (1024 * 1024),
                }
                .into_response();
            }
        }

        return relay(resp, None, &url, &real_host).await;
    }
}

/// Build the client-facing response from the final upstream response.
async fn relay(
    resp: reqwest::Response,
    location_override: Option<String>,
    final_url: &str,
    real_host: &str,
) -> Response {
    let status = resp.status();
    let mut headers = resp.headers().clone();

    headers.remove(header::CONTENT_SECURITY_POLICY);
    headers.remove(header::REFERRER_POLICY);
    headers.remove(header::STRICT_TRANSPORT_SECURITY);

    if let Some(location) = location_override {
        if let Ok(value) = header::HeaderValue::from_str(&location) {
            headers.insert(header::LOCATION, value);
        }
    }

    if is_script_url(final_url) {
        let compressed = headers
            .get(header::CONTENT_ENCODING)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.eq_ignore_ascii_case("gzip"));

        let body = match collect_capped(resp, MAX_SCRIPT_SIZE + 1).await {
            Ok(body) => body,
            Err(e) => return GatewayError::ScriptRewrite(e).into_response(),
        };

        let rewritten = match process_script(body, compressed, real_host) {
            Ok(rewritten) => rewritten,
            Err(e) => return GatewayError::ScriptRewrite(e.to_string()).into_response(),
        };

        if rewritten.changed {
            // Length and encoding describe bytes we no longer send; the
            // body goes out chunked instead.
            headers.remove(header::CONTENT_LENGTH);
            headers.remove(header::CONTENT_ENCODING);
        }

        return build_response(status, headers, Body::from(rewritten.data));
    }

    build_response(
        status,
        headers,
        Body::from_stream(resp.bytes_stream()),
    )
}

fn build_response(status: StatusCode, headers: HeaderMap, body: Body) -> Response {
    let mut builder = Response::builder().status(status);
    if let Some(target) = builder.headers_mut() {
        *target = headers;
    }
    builder
        .body(body)
        .unwrap_or_else(|_| GatewayError::Internal("response build failed".into()).into_response())
}

/// Read at most `cap` bytes of the body; more means it is not a script.
async fn collect_capped(resp: reqwest::Response, cap: usize) -> Result<Bytes, String> {
    let mut stream = resp.bytes_stream();
    let mut buf = Vec::new();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| e.to_string())?;
        if buf.len() + chunk.len() > cap {
            return Err(format!(
                "script exceeds {} MB limit",
                MAX_SCRIPT_SIZE / 1024 / 1024
            ));
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(Bytes::from(buf))
}

/// Final path component ends in `.sh` or `.ps1`, case-insensitive
fn is_script_url(url: &str) -> bool {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let last = path.rsplit('/').next().unwrap_or(path).to_ascii_lowercase();
    last.ends_with(".sh") || last.ends_with(".ps1")
}

fn visible_host(headers: &HeaderMap) -> String {
    let host = headers
        .get("x-forwarded-host")
        .or_else(|| headers.get(header::HOST))
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if host.starts_with("http://") || host.starts_with("https://") {
        host.to_string()
    } else if host.is_empty() {
        String::new()
    } else {
        format!("https://{}", host)
    }
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
    fn script_detection_uses_final_component() {
        assert!(is_script_url("https://raw.githubusercontent.com/u/r/main/install.sh"));
        assert!(is_script_url("https://github.com/u/r/raw/main/Setup.PS1"));
        assert!(is_script_url("https://host/x/a.sh?token=abc"));
        assert!(!is_script_url("https://host/x/a.sh.txt"));
        assert!(!is_script_url("https://host/script.sh/readme"));
        assert!(!is_script_url("https://host/x/archive.tar.gz"));
    }

    #[test]
    fn visible_host_prefixes_scheme() {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, "proxy.example".parse().unwrap());
        assert_eq!(visible_host(&headers), "https://proxy.example");

        headers.insert("x-forwarded-host", "edge.example".parse().unwrap());
        assert_eq!(visible_host(&headers), "https://edge.example");
    }

    #[test]
    fn absolutize_redirects() {
        assert_eq!(
            absolutize("https://github.com/u/r/releases/a", "https://objects.example/x").unwrap(),
            "https://objects.example/x"
        );
        assert_eq!(
            absolutize("https://github.com/u/r", "/login").unwrap(),
            "https://github.com/login"
        );
        assert!(absolutize("https://github.com/u/r", "relative/path").is_none());
    }
}
