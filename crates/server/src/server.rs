//! Listener setup
//!
//! Plain HTTP/1.1 serving via `axum::serve`; when h2c is enabled the
//! accept loop is driven manually through hyper-util's auto builder so
//! clear-text HTTP/2 connections get the configured stream limits.

use crate::router::build_router;
use crate::state::SharedState;
use axum::extract::ConnectInfo;
use axum::Router;
use hyper::body::Incoming;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tower::Service;
use tracing::{debug, info, warn};

/// h2c stream limits
const H2_MAX_CONCURRENT_STREAMS: u32 = 250;
const H2_MAX_FRAME_SIZE: u32 = 4 << 20;
const H2_CONNECTION_WINDOW: u32 = 8 << 20;
const H2_STREAM_WINDOW: u32 = 2 << 20;

/// Bind and serve until the shutdown future completes.
pub async fn run(
    state: SharedState,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let cfg = state.config.snapshot();
    let addr = cfg.bind_authority();
    let enable_h2c = cfg.server.enable_h2c;
    let router = build_router(state);

    let listener = TcpListener::bind(&addr).await?;
    info!(
        bind = %addr,
        h2c = enable_h2c,
        rate_limit = cfg.rate_limit.request_limit,
        period_hours = cfg.rate_limit.period_hours,
        "hubgate listening"
    );

    if enable_h2c {
        run_h2c(listener, router, shutdown).await
    } else {
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown)
        .await?;
        Ok(())
    }
}

/// Accept loop serving both HTTP/1.1 and clear-text HTTP/2 on one port.
async fn run_h2c(
    listener: TcpListener,
    router: Router,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let mut shutdown = std::pin::pin!(shutdown);

    loop {
        let (stream, peer) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(error = %e, "failed to accept connection");
                    continue;
                }
            },
            _ = &mut shutdown => {
                info!("shutting down listener");
                return Ok(());
            }
        };

        let router = router.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_h2c_connection(stream, peer, router).await {
                debug!(peer = %peer, error = %e, "connection error");
            }
        });
    }
}

async fn serve_h2c_connection(
    stream: tokio::net::TcpStream,
    peer: SocketAddr,
    router: Router,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let service = hyper::service::service_fn(move |mut request: Request<Incoming>| {
        request.extensions_mut().insert(ConnectInfo(peer));
        router.clone().call(request.map(axum::body::Body::new))
    });

    let mut builder = auto::Builder::new(TokioExecutor::new());
    builder
        .http2()
        .max_concurrent_streams(H2_MAX_CONCURRENT_STREAMS)
        .max_frame_size(H2_MAX_FRAME_SIZE)
        .initial_connection_window_size(H2_CONNECTION_WINDOW)
        .initial_stream_window_size(H2_STREAM_WINDOW);

    builder
        .serve_connection_with_upgrades(TokioIo::new(stream), service)
        .await
}
