//! Allow/deny pattern matching for container images and GitHub repositories
//!
//! Both planes share the same list semantics: a non-empty whitelist must
//! match first, then a non-empty blacklist must not match. Patterns are
//! case-insensitive and support exact names, owner-level matches
//! (`owner` / `owner/*`), prefix wildcards (`prefix*`), repository-only
//! matches (`*/repo`, `*/repo*`), and parent prefixes (`item/…`).

use thiserror::Error;

/// Why a request was denied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AccessDenied {
    #[error("image is not in the whitelist")]
    NotInImageWhitelist,

    #[error("image is blacklisted")]
    ImageBlacklisted,

    #[error("repository is not in the whitelist")]
    NotInRepoWhitelist,

    #[error("repository is blacklisted")]
    RepoBlacklisted,
}

/// A parsed Docker image name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageName {
    /// Registry domain, when the first path segment looks like a host
    pub registry: Option<String>,
    /// Namespace; `library` when absent on Docker Hub
    pub namespace: String,
    pub repository: String,
    pub tag: String,
}

impl ImageName {
    /// `namespace/repository`
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.namespace, self.repository)
    }
}

/// Parse an image name of the form `[domain/][namespace/]repo[:tag]`.
///
/// A trailing `:x` is a tag only when `x` contains no `/`; otherwise the
/// colon belongs to a host:port authority.
pub fn parse_image(image: &str) -> ImageName {
    let mut image = image.strip_prefix("docker://").unwrap_or(image);

    let mut tag = String::new();
    if let Some(idx) = image.rfind(':') {
        let candidate = &image[idx + 1..];
        if !candidate.contains('/') {
            tag = candidate.to_string();
            image = &image[..idx];
        }
    }
    if tag.is_empty() {
        tag = "latest".to_string();
    }

    let parts: Vec<&str> = image.split('/').collect();
    let (registry, namespace, repository) = match parts.as_slice() {
        [single] => (None, "library".to_string(), single.to_string()),
        [first, rest @ ..] if first.contains('.') => {
            // First segment is a registry domain.
            match rest {
                [repo] => (
                    Some(first.to_string()),
                    "library".to_string(),
                    repo.to_string(),
                ),
                [ns, repo, ..] => (
                    Some(first.to_string()),
                    ns.to_string(),
                    repo.to_string(),
                ),
                [] => (Some(first.to_string()), "library".to_string(), String::new()),
            }
        }
        [ns, repo, ..] => (None, ns.to_string(), repo.to_string()),
        [] => (None, "library".to_string(), String::new()),
    };

    ImageName {
        registry,
        namespace,
        repository,
        tag,
    }
}

/// Whitelist-then-blacklist matcher over the configured pattern lists
pub struct AccessPolicy {
    white: Vec<String>,
    black: Vec<String>,
}

impl AccessPolicy {
    pub fn new(white: &[String], black: &[String]) -> Self {
        let clean = |list: &[String]| {
            list.iter()
                .map(|s| s.trim().to_lowercase())
                .filter(|s| !s.is_empty())
                .collect()
        };
        Self {
            white: clean(white),
            black: clean(black),
        }
    }

    /// Check a Docker image (full or short name) against the lists
    pub fn check_image(&self, image: &str) -> Result<(), AccessDenied> {
        let info = parse_image(image);

        if !self.white.is_empty() && !matches_image(&info, &self.white) {
            return Err(AccessDenied::NotInImageWhitelist);
        }
        if !self.black.is_empty() && matches_image(&info, &self.black) {
            return Err(AccessDenied::ImageBlacklisted);
        }
        Ok(())
    }

    /// Check a GitHub `{owner, repo}` pair against the lists
    pub fn check_github(&self, owner: &str, repo: &str) -> Result<(), AccessDenied> {
        let owner = owner.trim().to_lowercase();
        let repo = repo
            .trim()
            .trim_end_matches(".git")
            .to_lowercase();

        if !self.white.is_empty() && !matches_repo(&owner, &repo, &self.white) {
            return Err(AccessDenied::NotInRepoWhitelist);
        }
        if !self.black.is_empty() && matches_repo(&owner, &repo, &self.black) {
            return Err(AccessDenied::RepoBlacklisted);
        }
        Ok(())
    }
}

fn matches_image(info: &ImageName, list: &[String]) -> bool {
    let full_name = info.full_name().to_lowercase();
    let namespace = info.namespace.to_lowercase();
    let repository = info.repository.to_lowercase();

    list.iter().any(|item| {
        if full_name == *item {
            return true;
        }
        if *item == namespace || *item == format!("{}/*", namespace) {
            return true;
        }
        if let Some(prefix) = item.strip_suffix('*') {
            if !item.starts_with("*/") && full_name.starts_with(prefix) {
                return true;
            }
        }
        if let Some(repo_pattern) = item.strip_prefix("*/") {
            if let Some(repo_prefix) = repo_pattern.strip_suffix('*') {
                if repository.starts_with(repo_prefix) {
                    return true;
                }
            } else if repository == repo_pattern {
                return true;
            }
        }
        full_name.starts_with(&format!("{}/", item))
    })
}

fn matches_repo(owner: &str, repo: &str, list: &[String]) -> bool {
    let full_repo = format!("{}/{}", owner, repo);

    list.iter().any(|item| {
        if full_repo == *item {
            return true;
        }
        if *item == owner || *item == format!("{}/*", owner) {
            return true;
        }
        if let Some(prefix) = item.strip_suffix('*') {
            if !item.starts_with("*/") && full_repo.starts_with(prefix) {
                return true;
            }
        }
        if full_repo.starts_with(&format!("{}/", item)) {
            return true;
        }
        if let Some(p) = item.strip_prefix("*/") {
            if p == repo {
                return true;
            }
            if let Some(rp) = p.strip_suffix('*') {
                if repo.starts_with(rp) {
                    return true;
                }
            }
        }
        false
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(white: &[&str], black: &[&str]) -> AccessPolicy {
        let w: Vec<String> = white.iter().map(|s| s.to_string()).collect();
        let b: Vec<String> = black.iter().map(|s| s.to_string()).collect();
        AccessPolicy::new(&w, &b)
    }

    #[test]
    fn parse_short_name() {
        let info = parse_image("nginx");
        assert_eq!(info.namespace, "library");
        assert_eq!(info.repository, "nginx");
        assert_eq!(info.tag, "latest");
        assert_eq!(info.registry, None);
        assert_eq!(info.full_name(), "library/nginx");
    }

    #[test]
    fn parse_namespaced_name_with_tag() {
        let info = parse_image("grafana/loki:2.9");
        assert_eq!(info.namespace, "grafana");
        assert_eq!(info.repository, "loki");
        assert_eq!(info.tag, "2.9");
    }

    #[test]
    fn parse_registry_qualified() {
        let info = parse_image("ghcr.io/owner/tool:v1");
        assert_eq!(info.registry.as_deref(), Some("ghcr.io"));
        assert_eq!(info.namespace, "owner");
        assert_eq!(info.repository, "tool");

        let info = parse_image("ghcr.io/tool");
        assert_eq!(info.registry.as_deref(), Some("ghcr.io"));
        assert_eq!(info.namespace, "library");
        assert_eq!(info.repository, "tool");
    }

    #[test]
    fn colon_in_authority_is_not_a_tag() {
        let info = parse_image("localhost:5000/team/app");
        assert_eq!(info.registry.as_deref(), Some("localhost:5000"));
        assert_eq!(info.namespace, "team");
        assert_eq!(info.repository, "app");
        assert_eq!(info.tag, "latest");
    }

    #[test]
    fn empty_lists_allow_everything() {
        let p = policy(&[], &[]);
        assert!(p.check_image("library/nginx").is_ok());
        assert!(p.check_github("anyone", "anything").is_ok());
    }

    #[test]
    fn whitelist_restricts_images() {
        let p = policy(&["library/nginx"], &[]);
        assert!(p.check_image("nginx").is_ok());
        assert_eq!(
            p.check_image("library/redis"),
            Err(AccessDenied::NotInImageWhitelist)
        );
    }

    #[test]
    fn blacklist_patterns() {
        let p = policy(&[], &["badcorp", "*/miner", "evil*"]);
        // Owner-level match.
        assert_eq!(
            p.check_image("badcorp/anything"),
            Err(AccessDenied::ImageBlacklisted)
        );
        // Repository-only match.
        assert_eq!(
            p.check_image("someone/miner"),
            Err(AccessDenied::ImageBlacklisted)
        );
        // Prefix wildcard.
        assert_eq!(
            p.check_image("evilcorp/app"),
            Err(AccessDenied::ImageBlacklisted)
        );
        assert!(p.check_image("library/nginx").is_ok());
    }

    #[test]
    fn matching_is_case_insensitive() {
        let p = policy(&[], &["BadCorp/*"]);
        assert_eq!(
            p.check_image("badcorp/tool"),
            Err(AccessDenied::ImageBlacklisted)
        );
    }

    #[test]
    fn github_patterns() {
        let p = policy(&["rust-lang"], &[]);
        assert!(p.check_github("rust-lang", "cargo").is_ok());
        assert!(p.check_github("Rust-Lang", "rustup.git").is_ok());
        assert_eq!(
            p.check_github("other", "repo"),
            Err(AccessDenied::NotInRepoWhitelist)
        );

        let p = policy(&[], &["*/malware*"]);
        assert_eq!(
            p.check_github("anyone", "malware-kit"),
            Err(AccessDenied::RepoBlacklisted)
        );
        assert!(p.check_github("anyone", "fine").is_ok());
    }
}
