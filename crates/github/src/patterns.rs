//! Acceptance patterns for proxied URLs
//!
//! Exactly one of these must match a target URL before it is forwarded.
//! Capture groups feed the access controller's `{owner, repo}` check and
//! are otherwise unused.

use regex::Regex;
use std::sync::LazyLock;

/// Redirect chains longer than this answer 508
pub const MAX_REDIRECTS: usize = 20;

static GITHUB_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"^(?:https?://)?github\.com/([^/]+)/([^/]+)/(?:releases|archive)/.*",
        r"^(?:https?://)?github\.com/([^/]+)/([^/]+)/(?:blob|raw)/.*",
        r"^(?:https?://)?github\.com/([^/]+)/([^/]+)/(?:info|git-).*",
        r"^(?:https?://)?raw\.github(?:usercontent|)\.com/([^/]+)/([^/]+)/.+?/.+",
        r"^(?:https?://)?gist\.(?:githubusercontent|github)\.com/([^/]+)/([^/]+).*",
        r"^(?:https?://)?api\.github\.com/repos/([^/]+)/([^/]+)/.*",
        r"^(?:https?://)?huggingface\.co(?:/spaces)?/([^/]+)/(.+)",
        r"^(?:https?://)?cdn-lfs\.hf\.co(?:/spaces)?/([^/]+)/([^/]+)(?:/(.*))?",
        r"^(?:https?://)?download\.docker\.com/([^/]+)/.*\.(tgz|zip)",
        r"^(?:https?://)?(github|opengraph)\.githubassets\.com/([^/]+)/.+?",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("static pattern"))
    .collect()
});

const BLOB_PATTERN_INDEX: usize = 1;

/// Match a URL against the accepted patterns, returning the capture groups
/// of the first pattern that matches.
pub fn check_github_url(url: &str) -> Option<Vec<String>> {
    for exp in GITHUB_PATTERNS.iter() {
        if let Some(caps) = exp.captures(url) {
            return Some(
                caps.iter()
                    .skip(1)
                    .map(|m| m.map(|m| m.as_str().to_string()).unwrap_or_default())
                    .collect(),
            );
        }
    }
    None
}

/// Whether the URL is a `github.com/<owner>/<repo>/blob/…` link that should
/// be fetched through the `raw` endpoint instead
pub fn is_blob_url(url: &str) -> bool {
    GITHUB_PATTERNS[BLOB_PATTERN_INDEX].is_match(url) && url.contains("/blob/")
}

/// Normalize the raw tail of a request path into an absolute https URL.
///
/// Proxies in front of us often collapse `https://` to `https:/`; both
/// forms are accepted, and schemeless input defaults to https.
pub fn normalize_target(raw: &str) -> String {
    let mut raw = raw.trim_start_matches('/').to_string();

    if !raw.starts_with("https://") {
        if let Some(rest) = raw.strip_prefix("https:/") {
            raw = rest.to_string();
        } else if let Some(rest) = raw.strip_prefix("http://") {
            raw = rest.to_string();
        } else if let Some(rest) = raw.strip_prefix("http:/") {
            raw = rest.to_string();
        }
        raw = format!("https://{}", raw.trim_start_matches('/'));
    }

    raw
}
