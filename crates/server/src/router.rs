//! Route table

use crate::handlers;
use crate::middleware::rate_limit;
use crate::state::SharedState;
use axum::body::Body;
use axum::http::{header, Response, StatusCode};
use axum::routing::{any, get, post};
use axum::Router;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;

/// Assemble the full router: registry plane, token shim, image exporter,
/// readiness, and the GitHub proxy as the fallback for everything else.
pub fn build_router(state: SharedState) -> Router {
    Router::new()
        .route("/ready", get(handlers::health::ready))
        .route("/v2/", any(handlers::registry::check))
        .route("/v2/{*path}", any(handlers::registry::proxy))
        .route("/token", any(handlers::token::proxy))
        .route("/token/{*path}", any(handlers::token::proxy))
        .route("/api/image/download/{image}", get(handlers::image::download))
        .route("/api/image/info/{image}", get(handlers::image::info))
        .route("/api/image/batch", post(handlers::image::batch))
        .fallback(handlers::github::proxy)
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            rate_limit,
        ))
        .layer(CatchPanicLayer::custom(handle_panic))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Request-scoped recovery boundary: a panicking handler becomes a JSON
/// 500 and the process keeps serving.
fn handle_panic(err: Box<dyn std::any::Any + Send + 'static>) -> Response<Body> {
    let detail = if let Some(s) = err.downcast_ref::<String>() {
        s.as_str()
    } else if let Some(s) = err.downcast_ref::<&str>() {
        s
    } else {
        "unknown panic"
    };
    tracing::error!(panic = %detail, "handler panicked");

    Response::builder()
        .status(StatusCode::INTERNAL_SERVER_ERROR)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(
            serde_json::json!({
                "error": "Internal server error",
                "code": "INTERNAL_ERROR",
            })
            .to_string(),
        ))
        .expect("static response")
}
