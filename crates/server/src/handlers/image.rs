//! Image exporter endpoints under `/api/image/…`

use crate::error::GatewayError;
use crate::middleware::client_address;
use crate::state::SharedState;
use axum::body::Body;
use axum::extract::{Path, Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use hubgate_export::{content_fingerprint, gzip_relay, user_fingerprint, StreamOptions};
use serde::Deserialize;
use serde_json::json;
use tokio_util::io::ReaderStream;

const PIPE_BUFFER: usize = 64 * 1024;
const MAX_BATCH_BODY: usize = 64 * 1024;

#[derive(Debug, Default, Deserialize)]
struct DownloadQuery {
    #[serde(default)]
    tag: String,
    #[serde(default)]
    platform: String,
    #[serde(default)]
    compressed: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BatchRequest {
    images: Vec<String>,
    #[serde(default)]
    platform: String,
    #[serde(rename = "useCompressedLayers")]
    use_compressed_layers: Option<bool>,
}

/// `GET /api/image/download/{image}` — one image as a docker-archive tar
pub async fn download(
    State(state): State<SharedState>,
    Path(image): Path<String>,
    request: Request,
) -> Response {
    let query: DownloadQuery = parse_query(request.uri());

    let mut image_ref = image.replace('_', "/");
    if !image_ref.contains(':') && !image_ref.contains('@') {
        let tag = if query.tag.is_empty() { "latest" } else { &query.tag };
        image_ref = format!("{}:{}", image_ref, tag);
    }

    if hubgate_export::parse_reference(&image_ref).is_err() {
        return GatewayError::BadRequest(format!("invalid image reference: {}", image_ref))
            .into_response();
    }

    let user = request_user(&request);
    let fingerprint = content_fingerprint(std::slice::from_ref(&image_ref), &query.platform);
    if !state.single_debounce.should_allow(&user, &fingerprint) {
        return GatewayError::Debounced {
            retry_after: state.single_debounce.window_secs(),
        }
        .into_response();
    }

    let options = StreamOptions {
        platform: query.platform.clone(),
        compression: false,
        use_compressed_layers: query.compressed.as_deref() != Some("false"),
    };

    tracing::info!(image = %image_ref, platform = %display_platform(&query.platform), "image download");

    // Resolve up front so a missing image is a clean error, not a
    // truncated stream.
    if let Err(e) = state.streamer.image_info(&image_ref).await {
        tracing::warn!(image = %image_ref, error = %e, "image download failed");
        return GatewayError::Export(format!("image download failed: {}", e)).into_response();
    }

    let filename = format!("{}.tar", image_ref.replace('/', "_"));
    stream_archive(state, vec![image_ref], options, filename).await
}

/// `GET /api/image/info/{image}` — descriptor summary
pub async fn info(
    State(state): State<SharedState>,
    Path(image): Path<String>,
    request: Request,
) -> Response {
    let query: DownloadQuery = parse_query(request.uri());

    let mut image_ref = image.replace('_', "/");
    if !image_ref.contains(':') && !image_ref.contains('@') {
        let tag = if query.tag.is_empty() { "latest" } else { &query.tag };
        image_ref = format!("{}:{}", image_ref, tag);
    }

    match state.streamer.image_info(&image_ref).await {
        Ok(info) => Json(json!({ "success": true, "data": info })).into_response(),
        Err(e) => {
            tracing::warn!(image = %image_ref, error = %e, "image info failed");
            GatewayError::Export(format!("failed to fetch image info: {}", e)).into_response()
        }
    }
}

/// `POST /api/image/batch` — several images in one archive
pub async fn batch(State(state): State<SharedState>, request: Request) -> Response {
    let cfg = state.config.snapshot();
    let user = request_user(&request);

    let body = match axum::body::to_bytes(request.into_body(), MAX_BATCH_BODY).await {
        Ok(body) => body,
        Err(_) => return GatewayError::BadRequest("request body too large".into()).into_response(),
    };
    let mut req: BatchRequest = match serde_json::from_slice(&body) {
        Ok(req) => req,
        Err(e) => {
            return GatewayError::BadRequest(format!("invalid request body: {}", e)).into_response()
        }
    };

    if req.images.is_empty() {
        return GatewayError::BadRequest("image list is empty".into()).into_response();
    }
    for image in req.images.iter_mut() {
        if !image.contains(':') && !image.contains('@') {
            image.push_str(":latest");
        }
    }

    // The cap is enforced before anything leaves for the upstream.
    if req.images.len() > cfg.download.max_images {
        return GatewayError::BadRequest(format!(
            "too many images requested, limit is {}",
            cfg.download.max_images
        ))
        .into_response();
    }

    let fingerprint = content_fingerprint(&req.images, &req.platform);
    if !state.batch_debounce.should_allow(&user, &fingerprint) {
        return GatewayError::Debounced {
            retry_after: state.batch_debounce.window_secs(),
        }
        .into_response();
    }

    let options = StreamOptions {
        platform: req.platform.clone(),
        compression: false,
        use_compressed_layers: req.use_compressed_layers.unwrap_or(true),
    };

    tracing::info!(
        count = req.images.len(),
        platform = %display_platform(&req.platform),
        "batch image download"
    );

    // Resolve every image before the first tar byte so that a missing one
    // fails the whole request cleanly.
    for image in &req.images {
        if let Err(e) = state.streamer.image_info(image).await {
            tracing::warn!(image = %image, error = %e, "batch image resolve failed");
            return GatewayError::Export(format!("failed to export {}: {}", image, e))
                .into_response();
        }
    }

    let filename = format!("batch_{}_images.tar", req.images.len());
    stream_archive(state, req.images, options, filename).await
}

/// Spawn the export task and wire its output into the response body.
async fn stream_archive(
    state: SharedState,
    images: Vec<String>,
    options: StreamOptions,
    filename: String,
) -> Response {
    let (writer, reader) = tokio::io::duplex(PIPE_BUFFER);
    let streamer = state.streamer.clone();
    let compression = options.compression;

    tokio::spawn(async move {
        let result = if images.len() == 1 {
            streamer.export_image(&images[0], writer, &options).await
        } else {
            streamer.export_batch(&images, writer, &options).await
        };
        // The stream has already begun; an error here can only truncate.
        if let Err(e) = result {
            tracing::error!(error = %e, "image export aborted mid-stream");
        }
    });

    let body = if compression {
        let (gz_writer, gz_reader) = tokio::io::duplex(PIPE_BUFFER);
        tokio::spawn(async move {
            if let Err(e) = gzip_relay(reader, gz_writer).await {
                tracing::error!(error = %e, "archive compression failed");
            }
        });
        Body::from_stream(ReaderStream::new(gz_reader))
    } else {
        Body::from_stream(ReaderStream::new(reader))
    };

    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", filename),
        );
    if compression {
        builder = builder.header(header::CONTENT_ENCODING, "gzip");
    }

    builder
        .body(body)
        .unwrap_or_else(|_| GatewayError::Internal("response build failed".into()).into_response())
}

fn parse_query(uri: &axum::http::Uri) -> DownloadQuery {
    axum::extract::Query::<DownloadQuery>::try_from_uri(uri)
        .map(|q| q.0)
        .unwrap_or_default()
}

/// Debounce identity: session cookie, else hashed address + user agent
fn request_user(request: &Request) -> String {
    let headers = request.headers();
    let session = cookie_value(headers, "session_id");
    let address = client_address(headers, request.extensions());
    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    user_fingerprint(session.as_deref(), &address, user_agent)
}

fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    let cookies = headers.get(header::COOKIE)?.to_str().ok()?;
    for part in cookies.split(';') {
        if let Some((key, value)) = part.trim().split_once('=') {
            if key == name && !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }
    None
}

fn display_platform(platform: &str) -> &str {
    if platform.is_empty() {
        "auto"
    } else {
        platform
    }
}
