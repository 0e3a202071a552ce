//! Docker-archive image exporter
//!
//! Pulls one or more upstream images and composes them into a single
//! `docker load`-compatible tar written straight into the response body.

mod archive;
mod debounce;
mod streamer;

pub use archive::{gzip_relay, CountingWriter, TarStream};
pub use debounce::{content_fingerprint, user_fingerprint, Debouncer, BATCH_WINDOW, SINGLE_WINDOW};
pub use streamer::{
    parse_reference, ExportError, ImageInfo, ImageStreamer, StreamOptions, UpstreamSettings,
    PER_IMAGE_TIMEOUT,
};
