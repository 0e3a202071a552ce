//! Token-auth shim handler for `/token…`

use crate::error::GatewayError;
use crate::handlers::proxy_host;
use crate::state::SharedState;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::response::{IntoResponse, Response};
use hubgate_registry::ActiveRegistry;

/// Token exchanges are tiny; anything larger is not a token request
const MAX_TOKEN_BODY: usize = 1024 * 1024;

pub async fn proxy(State(state): State<SharedState>, request: Request) -> Response {
    let cfg = state.config.snapshot();
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let raw_query = request.uri().query().unwrap_or("").to_string();
    let headers = request.headers().clone();
    let host = proxy_host(&headers, &cfg.advertised_authority());

    // Upstream selection latched by the registry engine, when present.
    // A standalone token request has none and goes to auth.docker.io.
    let latched = request.extensions().get::<ActiveRegistry>().cloned();

    let body = match axum::body::to_bytes(request.into_body(), MAX_TOKEN_BODY).await {
        Ok(body) => body,
        Err(_) => return GatewayError::BadRequest("request body too large".into()).into_response(),
    };

    let shim_response = match state
        .shim
        .proxy(
            method,
            latched.as_ref().map(|a| &a.0),
            &path,
            &raw_query,
            headers,
            body,
            &host,
        )
        .await
    {
        Ok(resp) => resp,
        Err(e) => {
            tracing::warn!(error = %e, "auth shim upstream failure");
            return GatewayError::AuthUpstream(e.to_string()).into_response();
        }
    };

    let mut builder = Response::builder().status(shim_response.status);
    if let Some(headers) = builder.headers_mut() {
        *headers = shim_response.headers;
    }
    builder
        .body(Body::from(shim_response.body))
        .unwrap_or_else(|_| GatewayError::Internal("response build failed".into()).into_response())
}
