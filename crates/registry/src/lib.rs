//! Docker Registry v2 proxy engine
//!
//! Path classification, upstream selection, the anonymous Bearer-token
//! dance against upstream registries, and the `/token` auth shim.

mod path;
mod shim;
mod upstream;

pub use path::{parse_registry_path, split_registry_domain, ApiKind, RegistryRequest};
pub use shim::{
    resolve_auth_host, rewrite_auth_header, ActiveRegistry, ShimResponse, TokenShim,
    DEFAULT_AUTH_HOST,
};
pub use upstream::{
    blob_url, manifest_url, parse_bearer_challenge, tags_url, BearerChallenge, RegistryError,
    UpstreamClient, DOCKER_HUB_HOST, MANIFEST_ACCEPT,
};
