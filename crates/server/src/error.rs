//! Gateway error type and its HTTP mapping

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Everything a handler can fail with, mapped onto the wire contract
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Target URL matched no accepted pattern
    #[error("invalid input")]
    InvalidInput,

    /// Allow/deny list said no
    #[error("{0}")]
    AccessDenied(String),

    /// Source address is in a deny CIDR
    #[error("source address is blocked")]
    SourceBlocked,

    /// Token bucket is empty
    #[error("too many requests, slow down")]
    RateLimited,

    /// Duplicate download suppressed
    #[error("duplicate request, retry later")]
    Debounced { retry_after: u64 },

    /// Response larger than the configured cap
    #[error("file too large, limit: {limit_mb} MB")]
    TooLarge { limit_mb: u64 },

    /// Web pages are not proxied
    #[error("content type not allowed")]
    HtmlBlocked,

    #[error("{0}")]
    NotFound(&'static str),

    #[error("{0}")]
    BadRequest(String),

    /// More than the allowed number of redirect hops
    #[error("too many redirects, possible redirect loop")]
    RedirectLoop,

    /// Script rewriter refused the body
    #[error("script processing failed: {0}")]
    ScriptRewrite(String),

    /// Auth shim could not reach its upstream
    #[error("auth request failed: {0}")]
    AuthUpstream(String),

    /// GitHub plane transport failure
    #[error("server error: {0}")]
    GithubUpstream(String),

    /// Registry upstream misbehaved after the lookup succeeded
    #[error("{0}")]
    UpstreamFailure(String),

    /// Image exporter failure, reported as JSON
    #[error("{0}")]
    Export(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        match self {
            GatewayError::InvalidInput | GatewayError::AccessDenied(_) => {
                (StatusCode::FORBIDDEN, self.to_string()).into_response()
            }
            GatewayError::SourceBlocked => (
                StatusCode::FORBIDDEN,
                Json(json!({ "error": self.to_string() })),
            )
                .into_response(),
            GatewayError::RateLimited => (
                StatusCode::TOO_MANY_REQUESTS,
                Json(json!({ "error": self.to_string() })),
            )
                .into_response(),
            GatewayError::Debounced { retry_after } => (
                StatusCode::TOO_MANY_REQUESTS,
                Json(json!({
                    "error": "request repeated too quickly, retry later",
                    "retry_after": retry_after,
                })),
            )
                .into_response(),
            GatewayError::TooLarge { .. } => {
                (StatusCode::PAYLOAD_TOO_LARGE, self.to_string()).into_response()
            }
            GatewayError::HtmlBlocked => (
                StatusCode::FORBIDDEN,
                Json(json!({
                    "error": "Content type not allowed",
                    "message": "web pages are not proxied, check that the link points at a file",
                })),
            )
                .into_response(),
            GatewayError::NotFound(_) => {
                (StatusCode::NOT_FOUND, self.to_string()).into_response()
            }
            GatewayError::BadRequest(_) => {
                (StatusCode::BAD_REQUEST, self.to_string()).into_response()
            }
            GatewayError::RedirectLoop => {
                (StatusCode::LOOP_DETECTED, self.to_string()).into_response()
            }
            GatewayError::ScriptRewrite(_) | GatewayError::AuthUpstream(_) => {
                (StatusCode::BAD_GATEWAY, self.to_string()).into_response()
            }
            GatewayError::GithubUpstream(_) | GatewayError::UpstreamFailure(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()).into_response()
            }
            GatewayError::Export(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": self.to_string() })),
            )
                .into_response(),
            GatewayError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({
                    "error": "Internal server error",
                    "code": "INTERNAL_ERROR",
                })),
            )
                .into_response(),
        }
    }
}
