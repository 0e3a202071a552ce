//! Script rewriter
//!
//! Rewrites GitHub URLs embedded in `.sh` / `.ps1` bodies so that nested
//! downloads also route through the proxy. Pure text, single pass; the
//! only buffering in the GitHub plane happens here, capped at 10 MiB.

use bytes::Bytes;
use flate2::read::GzDecoder;
use regex::{Captures, Regex};
use std::io::Read;
use std::sync::LazyLock;
use thiserror::Error;

/// Bodies larger than this are not scripts
pub const MAX_SCRIPT_SIZE: usize = 10 * 1024 * 1024;

/// URL occurrences inside script text. The leading character class keeps a
/// match anchored to a separator so already-rewritten URLs (preceded by the
/// proxy host) are left alone.
static GITHUB_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?:^|[\s'"(=,\[{;|&<>])https?://(?:github\.com|raw\.githubusercontent\.com|raw\.github\.com|gist\.githubusercontent\.com|gist\.github\.com|api\.github\.com)[^\s'")]*"#,
    )
    .expect("static pattern")
});

#[derive(Debug, Error)]
pub enum RewriteError {
    #[error("script exceeds {} MB limit", MAX_SCRIPT_SIZE / 1024 / 1024)]
    TooLarge,

    #[error("gzip decode failed: {0}")]
    Gzip(#[from] std::io::Error),
}

/// Result of running a body through the rewriter
pub struct RewrittenScript {
    pub data: Bytes,
    /// True when URLs were replaced or the body was decompressed — either
    /// way the original Content-Length/Content-Encoding no longer apply.
    pub changed: bool,
}

/// Process a fully-read script body.
///
/// `compressed_hint` reflects the upstream `Content-Encoding: gzip` header;
/// the first two bytes decide whether it is believed.
pub fn process_script(
    body: Bytes,
    compressed_hint: bool,
    proxy_host: &str,
) -> Result<RewrittenScript, RewriteError> {
    let (content, decompressed) = read_content(body, compressed_hint)?;

    if content.is_empty() {
        return Ok(RewrittenScript {
            data: content,
            changed: decompressed,
        });
    }

    // Cheap scan before paying for the regex.
    if !contains(&content, b"github.com") && !contains(&content, b"githubusercontent.com") {
        return Ok(RewrittenScript {
            data: content,
            changed: decompressed,
        });
    }

    let text = String::from_utf8_lossy(&content);
    let rewritten = rewrite_urls(&text, proxy_host);
    let changed = decompressed || rewritten != text;

    Ok(RewrittenScript {
        data: Bytes::from(rewritten.into_owned()),
        changed,
    })
}

fn read_content(body: Bytes, compressed_hint: bool) -> Result<(Bytes, bool), RewriteError> {
    let is_gzip = compressed_hint && body.len() >= 2 && body[0] == 0x1f && body[1] == 0x8b;

    if !is_gzip {
        // The hint was a lie, or there was no hint; take the bytes as-is.
        if body.len() > MAX_SCRIPT_SIZE {
            return Err(RewriteError::TooLarge);
        }
        return Ok((body, false));
    }

    let mut decoder = GzDecoder::new(body.as_ref()).take(MAX_SCRIPT_SIZE as u64 + 1);
    let mut content = Vec::new();
    decoder.read_to_end(&mut content)?;
    if content.len() > MAX_SCRIPT_SIZE {
        return Err(RewriteError::TooLarge);
    }
    Ok((Bytes::from(content), true))
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

fn rewrite_urls<'a>(text: &'a str, proxy_host: &str) -> std::borrow::Cow<'a, str> {
    GITHUB_URL.replace_all(text, |caps: &Captures| {
        let m = &caps[0];
        // A match may carry the one-character separator it was anchored to;
        // keep it in front of the rewritten URL.
        if !m.starts_with('h') {
            let (sep, url) = m.split_at(1);
            format!("{}{}", sep, transform_url(url, proxy_host))
        } else {
            transform_url(m, proxy_host)
        }
    })
}

/// Point one URL at the proxy. Idempotent for a stable proxy host.
pub fn transform_url(url: &str, proxy_host: &str) -> String {
    if url.contains(proxy_host) {
        return url.to_string();
    }

    let url = if let Some(rest) = url.strip_prefix("http://") {
        format!("https://{}", rest)
    } else if !url.starts_with("https://") && !url.starts_with("//") {
        format!("https://{}", url)
    } else {
        url.to_string()
    };

    let host = if proxy_host.starts_with("http://") || proxy_host.starts_with("https://") {
        proxy_host.to_string()
    } else {
        format!("https://{}", proxy_host)
    };
    let host = host.trim_end_matches('/');

    format!("{}/{}", host, url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    const HOST: &str = "proxy.example.com";

    fn run(body: &str) -> String {
        let out = process_script(Bytes::from(body.to_string()), false, HOST).unwrap();
        String::from_utf8(out.data.to_vec()).unwrap()
    }

    #[test]
    fn rewrites_curl_pipe_lines() {
        let input = "curl -fsSL https://github.com/user/repo/raw/main/sub.sh | bash\n";
        assert_eq!(
            run(input),
            "curl -fsSL https://proxy.example.com/https://github.com/user/repo/raw/main/sub.sh | bash\n"
        );
    }

    #[test]
    fn rewrites_all_github_hosts() {
        for host in [
            "github.com",
            "raw.githubusercontent.com",
            "raw.github.com",
            "gist.githubusercontent.com",
            "gist.github.com",
            "api.github.com",
        ] {
            let input = format!("wget https://{}/a/b\n", host);
            let output = run(&input);
            assert!(
                output.contains(&format!("https://proxy.example.com/https://{}/a/b", host)),
                "{} not rewritten: {}",
                host,
                output
            );
        }
    }

    #[test]
    fn preserves_leading_separator() {
        assert_eq!(
            run(r#"URL="https://github.com/u/r/raw/main/x.sh""#),
            r#"URL="https://proxy.example.com/https://github.com/u/r/raw/main/x.sh""#
        );
        assert_eq!(
            run("(https://github.com/u/r/releases/a)"),
            "(https://proxy.example.com/https://github.com/u/r/releases/a)"
        );
    }

    #[test]
    fn promotes_http_to_https() {
        assert_eq!(
            run("curl http://github.com/u/r/x\n"),
            "curl https://proxy.example.com/https://github.com/u/r/x\n"
        );
    }

    #[test]
    fn rewrite_is_idempotent() {
        let once = run("curl https://github.com/u/r/x | sh\n");
        let out = process_script(Bytes::from(once.clone()), false, HOST).unwrap();
        assert_eq!(String::from_utf8(out.data.to_vec()).unwrap(), once);
    }

    #[test]
    fn untouched_bodies_come_back_unchanged() {
        let input = "#!/bin/sh\necho hello\n";
        let out = process_script(Bytes::from(input), false, HOST).unwrap();
        assert!(!out.changed);
        assert_eq!(out.data.as_ref(), input.as_bytes());
    }

    #[test]
    fn unrelated_hosts_survive() {
        let input = "curl https://example.com/install.sh https://github.com/u/r/x\n";
        let output = run(input);
        assert!(output.contains("https://example.com/install.sh"));
        assert!(output.contains("proxy.example.com/https://github.com/u/r/x"));
    }

    #[test]
    fn gzip_bodies_are_decoded_when_magic_matches() {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(b"curl https://github.com/u/r/x\n").unwrap();
        let gz = enc.finish().unwrap();

        let out = process_script(Bytes::from(gz), true, HOST).unwrap();
        assert!(out.changed);
        assert!(String::from_utf8(out.data.to_vec())
            .unwrap()
            .contains("proxy.example.com"));
    }

    #[test]
    fn lying_hint_is_ignored() {
        let out = process_script(Bytes::from_static(b"plain text"), true, HOST).unwrap();
        assert!(!out.changed);
        assert_eq!(out.data.as_ref(), b"plain text");
    }

    #[test]
    fn oversized_bodies_are_fatal() {
        let body = vec![b'a'; MAX_SCRIPT_SIZE + 1];
        assert!(matches!(
            process_script(Bytes::from(body), false, HOST),
            Err(RewriteError::TooLarge)
        ));
    }

    #[test]
    fn transform_skips_urls_already_on_proxy() {
        let url = "https://proxy.example.com/https://github.com/u/r";
        assert_eq!(transform_url(url, HOST), url);
    }

    #[test]
    fn transform_prefixes_scheme_on_bare_host() {
        assert_eq!(
            transform_url("https://github.com/u/r", "proxy.example.com"),
            "https://proxy.example.com/https://github.com/u/r"
        );
        assert_eq!(
            transform_url("https://github.com/u/r", "http://proxy.example.com/"),
            "http://proxy.example.com/https://github.com/u/r"
        );
    }
}
