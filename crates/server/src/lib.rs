//! HTTP surface of the HubGate gateway
//!
//! One listener demultiplexes three planes by URL shape: `/v2/…` is the
//! registry proxy (with `/token…` as its auth shim), `/api/image/…` is the
//! docker-archive exporter, and any other path whose tail looks like a URL
//! goes to the GitHub-family proxy.

pub mod clients;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod router;
pub mod server;
pub mod state;

pub use clients::HttpClients;
pub use error::GatewayError;
pub use router::build_router;
pub use server::run;
pub use state::{AppState, SharedState};
