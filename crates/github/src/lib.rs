//! GitHub-family URL proxy support
//!
//! Pattern acceptance for the hosts this proxy will forward to, plus the
//! shell/PowerShell script rewriter that points embedded GitHub URLs back
//! through the proxy.

mod patterns;
mod rewrite;

pub use patterns::{check_github_url, is_blob_url, normalize_target, MAX_REDIRECTS};
pub use rewrite::{process_script, transform_url, RewriteError, RewrittenScript, MAX_SCRIPT_SIZE};
