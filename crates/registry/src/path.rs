//! Registry request path classification

use hubgate_config::AppConfig;

/// Which distribution API a `/v2/` path addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiKind {
    Manifests,
    Blobs,
    Tags,
}

/// A parsed `/v2/` request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryRequest {
    /// Image name as it appeared in the path (no registry domain)
    pub image: String,
    pub kind: ApiKind,
    /// Tag, digest, or the literal `list` for tag listings
    pub reference: String,
}

/// Split a path (already stripped of `/v2/`) at the first API marker.
///
/// Returns `None` when no marker is present or a component is empty.
pub fn parse_registry_path(path: &str) -> Option<RegistryRequest> {
    for (marker, kind) in [
        ("/manifests/", ApiKind::Manifests),
        ("/blobs/", ApiKind::Blobs),
    ] {
        if let Some(idx) = path.find(marker) {
            let image = &path[..idx];
            let reference = &path[idx + marker.len()..];
            if image.is_empty() || reference.is_empty() {
                return None;
            }
            return Some(RegistryRequest {
                image: image.to_string(),
                kind,
                reference: reference.to_string(),
            });
        }
    }

    if let Some(idx) = path.find("/tags/list") {
        let image = &path[..idx];
        if image.is_empty() {
            return None;
        }
        return Some(RegistryRequest {
            image: image.to_string(),
            kind: ApiKind::Tags,
            reference: "list".to_string(),
        });
    }

    None
}

/// When the path starts with a configured registry domain, split it off.
///
/// Only enabled mappings participate; anything else falls through to
/// Docker Hub handling.
pub fn split_registry_domain<'a>(path: &'a str, config: &'a AppConfig) -> Option<(&'a str, &'a str)> {
    for domain in config.registries.keys() {
        if let Some(rest) = path.strip_prefix(domain.as_str()) {
            if let Some(rest) = rest.strip_prefix('/') {
                if config.enabled_registry(domain).is_some() {
                    return Some((domain.as_str(), rest));
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_manifest_paths() {
        let req = parse_registry_path("library/nginx/manifests/latest").unwrap();
        assert_eq!(req.image, "library/nginx");
        assert_eq!(req.kind, ApiKind::Manifests);
        assert_eq!(req.reference, "latest");

        let req = parse_registry_path("library/nginx/manifests/sha256:abc").unwrap();
        assert_eq!(req.reference, "sha256:abc");
    }

    #[test]
    fn parses_blob_and_tag_paths() {
        let req = parse_registry_path("grafana/loki/blobs/sha256:0123").unwrap();
        assert_eq!(req.kind, ApiKind::Blobs);
        assert_eq!(req.image, "grafana/loki");

        let req = parse_registry_path("grafana/loki/tags/list").unwrap();
        assert_eq!(req.kind, ApiKind::Tags);
        assert_eq!(req.reference, "list");
    }

    #[test]
    fn rejects_unmarked_or_empty_paths() {
        assert!(parse_registry_path("library/nginx").is_none());
        assert!(parse_registry_path("/manifests/latest").is_none());
        assert!(parse_registry_path("library/nginx/manifests/").is_none());
        assert!(parse_registry_path("").is_none());
    }

    #[test]
    fn splits_configured_domains_only() {
        let config = AppConfig::default();

        let (domain, rest) =
            split_registry_domain("ghcr.io/owner/tool/manifests/v1", &config).unwrap();
        assert_eq!(domain, "ghcr.io");
        assert_eq!(rest, "owner/tool/manifests/v1");

        assert!(split_registry_domain("example.com/x/manifests/v1", &config).is_none());
        // No slash after the domain means no split.
        assert!(split_registry_domain("ghcr.io", &config).is_none());
    }

    #[test]
    fn disabled_domains_do_not_split() {
        let mut config = AppConfig::default();
        config.registries.get_mut("ghcr.io").unwrap().enabled = false;
        assert!(split_registry_domain("ghcr.io/owner/tool/manifests/v1", &config).is_none());
    }
}
