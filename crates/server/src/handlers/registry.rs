//! Registry engine handlers for `/v2/…`

use crate::error::GatewayError;
use crate::state::SharedState;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use hubgate_access::AccessPolicy;
use hubgate_cache::{manifest_key, manifest_ttl, CachedItem, UniversalCache};
use hubgate_config::AppConfig;
use hubgate_registry::{
    blob_url, manifest_url, parse_registry_path, split_registry_domain, tags_url, ApiKind,
    DOCKER_HUB_HOST, MANIFEST_ACCEPT,
};
use serde_json::json;
use std::sync::Arc;

/// `GET /v2/` — version probe, always `200 {}`
pub async fn check() -> impl IntoResponse {
    Json(json!({}))
}

/// Everything else under `/v2/`
pub async fn proxy(State(state): State<SharedState>, request: Request) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let cfg = state.config.snapshot();

    let rest = match path.strip_prefix("/v2/") {
        Some(rest) => rest,
        None => return GatewayError::NotFound("Docker Registry API v2 only").into_response(),
    };

    // Alternate registry selection by leading domain, Docker Hub otherwise.
    let (upstream_host, domain, remaining) = match split_registry_domain(rest, &cfg) {
        Some((domain, remaining)) => {
            let mapping = match cfg.enabled_registry(domain) {
                Some(m) => m,
                None => return GatewayError::BadRequest("registry not configured".into()).into_response(),
            };
            (mapping.upstream.clone(), Some(domain.to_string()), remaining.to_string())
        }
        None => (DOCKER_HUB_HOST.to_string(), None, rest.to_string()),
    };

    let parsed = match parse_registry_path(&remaining) {
        Some(parsed) => parsed,
        None => return GatewayError::BadRequest("invalid path format".into()).into_response(),
    };

    let mut image = parsed.image;
    if domain.is_none() && !image.contains('/') {
        image = format!("library/{}", image);
    }

    // Access control runs on the domain-qualified name for alternates.
    let check_name = match &domain {
        Some(domain) => format!("{}/{}", domain, image),
        None => image.clone(),
    };
    let policy = AccessPolicy::new(&cfg.access.white_list, &cfg.access.black_list);
    if let Err(reason) = policy.check_image(&check_name) {
        tracing::warn!(image = %check_name, reason = %reason, "image access denied");
        return GatewayError::AccessDenied(reason.to_string()).into_response();
    }

    match parsed.kind {
        ApiKind::Manifests => {
            manifest(&state, &cfg, method, &upstream_host, &image, &parsed.reference).await
        }
        ApiKind::Blobs => blob(&state, &upstream_host, &image, &parsed.reference).await,
        ApiKind::Tags => tags(&state, &upstream_host, &image).await,
    }
}

async fn manifest(
    state: &SharedState,
    cfg: &AppConfig,
    method: Method,
    upstream_host: &str,
    image: &str,
    reference: &str,
) -> Response {
    if !valid_reference(reference) {
        return GatewayError::BadRequest("invalid reference".into()).into_response();
    }

    let image_ref = format!("{}/{}", upstream_host, image);
    let key = manifest_key(&image_ref, reference);
    let cache_enabled = cfg.token_cache.enabled;

    if cache_enabled && method == Method::GET {
        if let Some(item) = state.cache.get(&key) {
            tracing::debug!(image = %image_ref, reference, "manifest cache hit");
            return cached_response(item);
        }
    }

    let url = manifest_url(upstream_host, image, reference);

    if method == Method::HEAD {
        let resp = match state.upstream.request(Method::HEAD, &url, Some(MANIFEST_ACCEPT)).await {
            Ok(resp) if resp.status().is_success() => resp,
            Ok(resp) => {
                tracing::warn!(image = %image_ref, status = %resp.status(), "manifest HEAD failed");
                return GatewayError::NotFound("manifest not found").into_response();
            }
            Err(e) => {
                tracing::warn!(image = %image_ref, error = %e, "manifest HEAD failed");
                return GatewayError::NotFound("manifest not found").into_response();
            }
        };

        let mut builder = Response::builder().status(StatusCode::OK);
        for name in [
            header::CONTENT_TYPE,
            header::CONTENT_LENGTH,
            header::HeaderName::from_static("docker-content-digest"),
        ] {
            if let Some(value) = resp.headers().get(&name) {
                builder = builder.header(name, value);
            }
        }
        return builder.body(Body::empty()).unwrap_or_else(|_| {
            GatewayError::Internal("response build failed".into()).into_response()
        });
    }

    // Anything that is not a HEAD fetches the manifest body.
    let resp = match state.upstream.request(Method::GET, &url, Some(MANIFEST_ACCEPT)).await {
        Ok(resp) if resp.status().is_success() => resp,
        Ok(resp) => {
            tracing::warn!(image = %image_ref, status = %resp.status(), "manifest fetch failed");
            return GatewayError::NotFound("manifest not found").into_response();
        }
        Err(e) => {
            tracing::warn!(image = %image_ref, error = %e, "manifest fetch failed");
            return GatewayError::NotFound("manifest not found").into_response();
        }
    };

    let media_type = resp
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/vnd.docker.distribution.manifest.v2+json")
        .to_string();
    let digest = resp
        .headers()
        .get("docker-content-digest")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string());

    let body = match resp.bytes().await {
        Ok(body) => body,
        Err(e) => {
            tracing::warn!(image = %image_ref, error = %e, "manifest body read failed");
            return GatewayError::NotFound("manifest not found").into_response();
        }
    };

    let mut extra_headers = vec![(
        "Content-Length".to_string(),
        body.len().to_string(),
    )];
    if let Some(digest) = &digest {
        extra_headers.push(("Docker-Content-Digest".to_string(), digest.clone()));
    }

    if cache_enabled {
        let ttl = manifest_ttl(reference, cfg.token_cache.default_ttl);
        state
            .cache
            .set(key, body.clone(), media_type.clone(), extra_headers.clone(), ttl);
    }

    manifest_response(&media_type, &extra_headers, body)
}

async fn blob(state: &SharedState, upstream_host: &str, image: &str, digest: &str) -> Response {
    if !digest.starts_with("sha256:") || !valid_digest(digest) {
        return GatewayError::BadRequest("invalid digest reference".into()).into_response();
    }

    let url = blob_url(upstream_host, image, digest);
    let resp = match state.upstream.request(Method::GET, &url, None).await {
        Ok(resp) if resp.status().is_success() => resp,
        Ok(resp)
            if resp.status() == StatusCode::NOT_FOUND
                || resp.status() == StatusCode::UNAUTHORIZED =>
        {
            tracing::warn!(image, digest, status = %resp.status(), "layer not found upstream");
            return GatewayError::NotFound("layer not found").into_response();
        }
        Ok(resp) => {
            tracing::warn!(image, digest, status = %resp.status(), "layer fetch failed");
            return GatewayError::UpstreamFailure("failed to get layer content".into())
                .into_response();
        }
        Err(e) => {
            tracing::warn!(image, digest, error = %e, "layer fetch failed");
            return GatewayError::NotFound("layer not found").into_response();
        }
    };

    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header("Docker-Content-Digest", digest);
    if let Some(length) = resp.headers().get(header::CONTENT_LENGTH) {
        builder = builder.header(header::CONTENT_LENGTH, length);
    }

    // Layer bytes flow straight through; nothing is buffered or cached.
    builder
        .body(Body::from_stream(resp.bytes_stream()))
        .unwrap_or_else(|_| GatewayError::Internal("response build failed".into()).into_response())
}

async fn tags(state: &SharedState, upstream_host: &str, image: &str) -> Response {
    let url = tags_url(upstream_host, image);
    let resp = match state.upstream.request(Method::GET, &url, None).await {
        Ok(resp) if resp.status().is_success() => resp,
        Ok(resp) => {
            tracing::warn!(image, status = %resp.status(), "tags fetch failed");
            return GatewayError::NotFound("tags not found").into_response();
        }
        Err(e) => {
            tracing::warn!(image, error = %e, "tags fetch failed");
            return GatewayError::NotFound("tags not found").into_response();
        }
    };

    #[derive(serde::Deserialize)]
    struct TagList {
        #[serde(default)]
        tags: Vec<String>,
    }

    let body = match resp.bytes().await {
        Ok(body) => body,
        Err(e) => {
            tracing::warn!(image, error = %e, "tags body read failed");
            return GatewayError::NotFound("tags not found").into_response();
        }
    };
    let parsed: TagList = match serde_json::from_slice(&body) {
        Ok(parsed) => parsed,
        Err(_) => return GatewayError::NotFound("tags not found").into_response(),
    };

    Json(json!({ "name": image, "tags": parsed.tags })).into_response()
}

fn cached_response(item: CachedItem) -> Response {
    let mut builder = Response::builder().status(StatusCode::OK);
    if !item.content_type.is_empty() {
        builder = builder.header(header::CONTENT_TYPE, item.content_type.as_str());
    }
    for (name, value) in &item.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    builder
        .body(Body::from(item.data))
        .unwrap_or_else(|_| GatewayError::Internal("response build failed".into()).into_response())
}

fn manifest_response(media_type: &str, headers: &[(String, String)], body: Bytes) -> Response {
    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, media_type);
    for (name, value) in headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    builder
        .body(Body::from(body))
        .unwrap_or_else(|_| GatewayError::Internal("response build failed".into()).into_response())
}

/// A reference is a digest or a well-formed tag
fn valid_reference(reference: &str) -> bool {
    if reference.starts_with("sha256:") {
        return valid_digest(reference);
    }
    !reference.is_empty()
        && reference.len() <= 128
        && reference
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
}

fn valid_digest(digest: &str) -> bool {
    match digest.strip_prefix("sha256:") {
        Some(hex) => hex.len() == 64 && hex.chars().all(|c| c.is_ascii_hexdigit()),
        None => false,
    }
}

/// Warm a cache entry directly; used by tests to model upstream state.
#[doc(hidden)]
pub fn seed_manifest_cache(
    cache: &Arc<UniversalCache>,
    image_ref: &str,
    reference: &str,
    body: Bytes,
    media_type: &str,
    digest: &str,
    ttl: std::time::Duration,
) {
    let headers = vec![
        ("Content-Length".to_string(), body.len().to_string()),
        ("Docker-Content-Digest".to_string(), digest.to_string()),
    ];
    cache.set(
        manifest_key(image_ref, reference),
        body,
        media_type,
        headers,
        ttl,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_validation() {
        assert!(valid_reference("latest"));
        assert!(valid_reference("1.25.3-alpine"));
        assert!(valid_reference("v1_2"));
        assert!(!valid_reference(""));
        assert!(!valid_reference("bad tag"));
        assert!(!valid_reference(&"x".repeat(200)));

        let digest = format!("sha256:{}", "a".repeat(64));
        assert!(valid_reference(&digest));
        assert!(!valid_reference("sha256:short"));
        assert!(!valid_reference(&format!("sha256:{}", "g".repeat(64))));
    }
}
