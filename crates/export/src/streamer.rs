//! Image pulling and docker-archive composition

use crate::archive::{CountingWriter, TarStream};
use oci_client::client::{Client, ClientConfig, ClientProtocol};
use oci_client::manifest::{OciDescriptor, OciImageIndex, OciImageManifest, OciManifest};
use oci_client::secrets::RegistryAuth;
use oci_client::Reference;
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::Read;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWrite;

/// Upper bound on one image's pull, independent of the caller
pub const PER_IMAGE_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// Accepted manifest media types when resolving a reference
const MANIFEST_ACCEPT: &[&str] = &[
    "application/vnd.docker.distribution.manifest.v2+json",
    "application/vnd.docker.distribution.manifest.list.v2+json",
    "application/vnd.oci.image.manifest.v1+json",
    "application/vnd.oci.image.index.v1+json",
];

const INDEX_MEDIA_TYPES: [&str; 2] = [
    "application/vnd.docker.distribution.manifest.list.v2+json",
    "application/vnd.oci.image.index.v1+json",
];

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("invalid image reference '{0}'")]
    InvalidReference(String),

    #[error("registry error: {0}")]
    Registry(#[from] oci_client::errors::OciDistributionError),

    #[error("no platform entry in index for '{0}'")]
    NoPlatform(String),

    #[error("layer {digest} size mismatch: expected {expected}, wrote {actual}")]
    LayerSize {
        digest: String,
        expected: u64,
        actual: u64,
    },

    #[error("image pull timed out after {0:?}")]
    Timeout(Duration),

    #[error("archive write failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Options for one export request
#[derive(Debug, Clone)]
pub struct StreamOptions {
    /// Requested platform, e.g. `linux/amd64` or `linux/arm/v7`; empty
    /// picks the first linux/amd64 entry
    pub platform: String,
    /// Gzip the finished archive
    pub compression: bool,
    /// Keep layers as the registry stores them (exact blob bytes) instead
    /// of unpacking to plain tar
    pub use_compressed_layers: bool,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            platform: String::new(),
            compression: false,
            use_compressed_layers: true,
        }
    }
}

/// Connection settings shared with the rest of the gateway
#[derive(Debug, Clone, Default)]
pub struct UpstreamSettings {
    /// Outbound proxy URL; empty disables
    pub proxy: String,
}

/// Descriptor summary for the info endpoint
#[derive(Debug, Serialize)]
pub struct ImageInfo {
    pub name: String,
    #[serde(rename = "mediaType")]
    pub media_type: String,
    pub digest: String,
    pub size: usize,
    #[serde(rename = "multiArch")]
    pub multi_arch: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platforms: Option<Vec<String>>,
}

#[derive(Serialize)]
struct ArchiveManifestEntry {
    #[serde(rename = "Config")]
    config: String,
    #[serde(rename = "RepoTags")]
    repo_tags: Vec<String>,
    #[serde(rename = "Layers")]
    layers: Vec<String>,
}

type Repositories = BTreeMap<String, BTreeMap<String, String>>;

/// Streams upstream images into docker-archive tars
pub struct ImageStreamer {
    client: Client,
}

impl ImageStreamer {
    pub fn new(settings: &UpstreamSettings) -> Self {
        let proxy = (!settings.proxy.is_empty()).then(|| settings.proxy.clone());
        let config = ClientConfig {
            protocol: ClientProtocol::Https,
            connect_timeout: Some(Duration::from_secs(30)),
            read_timeout: Some(Duration::from_secs(300)),
            https_proxy: proxy.clone(),
            http_proxy: proxy,
            ..Default::default()
        };
        Self {
            client: Client::new(config),
        }
    }

    /// Export a single image as a docker-archive tar
    pub async fn export_image<W>(
        &self,
        image_ref: &str,
        writer: W,
        options: &StreamOptions,
    ) -> Result<(), ExportError>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let mut tar = TarStream::new(writer);
        let (entry, repos) = self.write_image_with_timeout(&mut tar, image_ref, options).await?;

        let manifest = serde_json::to_vec(&vec![entry])?;
        tar.append_data("manifest.json", &manifest).await?;

        let repositories = serde_json::to_vec(&repos)?;
        tar.append_data("repositories", &repositories).await?;

        tar.finish().await?;
        Ok(())
    }

    /// Export several images into one combined archive
    pub async fn export_batch<W>(
        &self,
        image_refs: &[String],
        writer: W,
        options: &StreamOptions,
    ) -> Result<(), ExportError>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let mut tar = TarStream::new(writer);
        let mut entries = Vec::with_capacity(image_refs.len());
        let mut repositories = Repositories::new();

        for (i, image_ref) in image_refs.iter().enumerate() {
            tracing::info!(
                image = %image_ref,
                current = i + 1,
                total = image_refs.len(),
                "exporting image"
            );
            let (entry, repos) = self.write_image_with_timeout(&mut tar, image_ref, options).await?;
            entries.push(entry);
            for (repo, tags) in repos {
                repositories.entry(repo).or_default().extend(tags);
            }
        }

        let manifest = serde_json::to_vec(&entries)?;
        tar.append_data("manifest.json", &manifest).await?;

        let repositories = serde_json::to_vec(&repositories)?;
        tar.append_data("repositories", &repositories).await?;

        tar.finish().await?;
        Ok(())
    }

    /// Resolve a reference and describe it without downloading layers
    pub async fn image_info(&self, image_ref: &str) -> Result<ImageInfo, ExportError> {
        let reference = parse_reference(image_ref)?;
        let (raw, digest) = self
            .client
            .pull_manifest_raw(&reference, &RegistryAuth::Anonymous, MANIFEST_ACCEPT)
            .await?;

        let value: serde_json::Value = serde_json::from_slice(&raw)?;
        let media_type = value
            .get("mediaType")
            .and_then(|v| v.as_str())
            .unwrap_or("application/vnd.docker.distribution.manifest.v2+json")
            .to_string();

        let multi_arch = INDEX_MEDIA_TYPES.contains(&media_type.as_str());
        let platforms = if multi_arch {
            let index: OciImageIndex = serde_json::from_slice(&raw)?;
            Some(
                index
                    .manifests
                    .iter()
                    .filter_map(|m| {
                        m.platform
                            .as_ref()
                            .map(|p| format!("{}/{}", p.os, p.architecture))
                    })
                    .collect(),
            )
        } else {
            None
        };

        Ok(ImageInfo {
            name: reference.whole(),
            media_type,
            digest,
            size: raw.len(),
            multi_arch,
            platforms,
        })
    }

    async fn write_image_with_timeout<W>(
        &self,
        tar: &mut TarStream<W>,
        image_ref: &str,
        options: &StreamOptions,
    ) -> Result<(ArchiveManifestEntry, Repositories), ExportError>
    where
        W: AsyncWrite + Unpin + Send,
    {
        tokio::time::timeout(PER_IMAGE_TIMEOUT, self.write_image(tar, image_ref, options))
            .await
            .map_err(|_| ExportError::Timeout(PER_IMAGE_TIMEOUT))?
    }

    /// Pull one image and append its config and layers to the archive
    async fn write_image<W>(
        &self,
        tar: &mut TarStream<W>,
        image_ref: &str,
        options: &StreamOptions,
    ) -> Result<(ArchiveManifestEntry, Repositories), ExportError>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let reference = parse_reference(image_ref)?;
        let manifest = self.resolve_image(&reference, &options.platform).await?;

        let mut config_data = Vec::new();
        self.client
            .pull_blob(&reference, &manifest.config, &mut config_data)
            .await?;

        let config_digest = manifest.config.digest.clone();
        let config_name = format!("{}.json", config_digest);
        tar.append_data(&config_name, &config_data).await?;

        let mut layer_paths = Vec::with_capacity(manifest.layers.len());
        for (i, layer) in manifest.layers.iter().enumerate() {
            tracing::debug!(
                layer = i,
                digest = %layer.digest,
                media_type = %layer.media_type,
                size = layer.size,
                "writing layer"
            );

            tar.append_dir(&layer.digest).await?;
            let entry_name = format!("{}/layer.tar", layer.digest);

            if options.use_compressed_layers || !layer.media_type.contains("gzip") {
                self.stream_layer(tar, &reference, layer, &entry_name).await?;
            } else {
                self.write_unpacked_layer(tar, &reference, layer, &entry_name)
                    .await?;
            }

            layer_paths.push(entry_name);
        }

        let entry = ArchiveManifestEntry {
            config: config_name,
            repo_tags: vec![image_ref.to_string()],
            layers: layer_paths,
        };

        let mut repositories = Repositories::new();
        let parts: Vec<&str> = image_ref.split(':').collect();
        if parts.len() == 2 {
            repositories
                .entry(parts[0].to_string())
                .or_default()
                .insert(parts[1].to_string(), config_digest);
        }

        Ok((entry, repositories))
    }

    /// Stream a layer's exact blob bytes into the archive
    async fn stream_layer<W>(
        &self,
        tar: &mut TarStream<W>,
        reference: &Reference,
        layer: &OciDescriptor,
        entry_name: &str,
    ) -> Result<(), ExportError>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let expected = layer.size as u64;
        tar.begin_entry(entry_name, expected).await?;

        let mut counter = CountingWriter::new(tar.writer());
        self.client
            .pull_blob(reference, layer, &mut counter)
            .await?;
        let actual = counter.written();

        if actual != expected {
            return Err(ExportError::LayerSize {
                digest: layer.digest.clone(),
                expected,
                actual,
            });
        }
        tar.end_entry(actual).await?;
        Ok(())
    }

    /// Gunzip a layer before appending it.
    ///
    /// The tar header needs the exact uncompressed size up front, so the
    /// blob is held in memory for this mode; the default compressed mode
    /// never buffers.
    async fn write_unpacked_layer<W>(
        &self,
        tar: &mut TarStream<W>,
        reference: &Reference,
        layer: &OciDescriptor,
        entry_name: &str,
    ) -> Result<(), ExportError>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let mut compressed = Vec::with_capacity(layer.size as usize);
        self.client
            .pull_blob(reference, layer, &mut compressed)
            .await?;

        let mut unpacked = Vec::new();
        flate2::read::GzDecoder::new(&compressed[..]).read_to_end(&mut unpacked)?;

        tar.append_data(entry_name, &unpacked).await?;
        Ok(())
    }

    /// Resolve a reference to a single-platform image manifest
    async fn resolve_image(
        &self,
        reference: &Reference,
        platform: &str,
    ) -> Result<OciImageManifest, ExportError> {
        let (manifest, _digest) = self
            .client
            .pull_manifest(reference, &RegistryAuth::Anonymous)
            .await?;

        match manifest {
            OciManifest::Image(image) => Ok(image),
            OciManifest::ImageIndex(index) => {
                let child_digest = select_platform(&index, platform)
                    .ok_or_else(|| ExportError::NoPlatform(reference.whole()))?;

                let child = Reference::with_digest(
                    reference.registry().to_string(),
                    reference.repository().to_string(),
                    child_digest,
                );
                let (child_manifest, _) = self
                    .client
                    .pull_manifest(&child, &RegistryAuth::Anonymous)
                    .await?;

                match child_manifest {
                    OciManifest::Image(image) => Ok(image),
                    OciManifest::ImageIndex(_) => Err(ExportError::NoPlatform(reference.whole())),
                }
            }
        }
    }
}

/// Pick a child digest out of an image index.
///
/// A requested platform must match `os/arch[/variant]` exactly; without a
/// request the first linux/amd64 entry wins, and as a last resort the
/// first child is used.
fn select_platform(index: &OciImageIndex, requested: &str) -> Option<String> {
    if !requested.is_empty() {
        let mut parts = requested.splitn(3, '/');
        let os = parts.next().unwrap_or_default();
        let arch = parts.next().unwrap_or_default();
        let variant = parts.next().unwrap_or_default();

        for entry in &index.manifests {
            if let Some(p) = &entry.platform {
                if p.os == os
                    && p.architecture == arch
                    && p.variant.as_deref().unwrap_or_default() == variant
                {
                    return Some(entry.digest.clone());
                }
            }
        }
    } else {
        for entry in &index.manifests {
            if let Some(p) = &entry.platform {
                if p.os == "linux" && p.architecture == "amd64" {
                    return Some(entry.digest.clone());
                }
            }
        }
    }

    index.manifests.first().map(|m| m.digest.clone())
}

/// Parse an image reference, defaulting the tag to `latest`
pub fn parse_reference(image_ref: &str) -> Result<Reference, ExportError> {
    let normalized = if image_ref.contains(':') || image_ref.contains('@') {
        image_ref.to_string()
    } else {
        format!("{}:latest", image_ref)
    };

    normalized
        .parse::<Reference>()
        .map_err(|_| ExportError::InvalidReference(image_ref.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use oci_client::manifest::{ImageIndexEntry, Platform};

    fn entry(digest: &str, os: &str, arch: &str, variant: Option<&str>) -> ImageIndexEntry {
        ImageIndexEntry {
            media_type: "application/vnd.oci.image.manifest.v1+json".to_string(),
            digest: digest.to_string(),
            size: 100,
            platform: Some(Platform {
                architecture: arch.to_string(),
                os: os.to_string(),
                os_version: None,
                os_features: None,
                variant: variant.map(|v| v.to_string()),
                features: None,
            }),
            annotations: None,
        }
    }

    fn index(entries: Vec<ImageIndexEntry>) -> OciImageIndex {
        OciImageIndex {
            schema_version: 2,
            media_type: Some("application/vnd.oci.image.index.v1+json".to_string()),
            manifests: entries,
            annotations: None,
        }
    }

    #[test]
    fn explicit_platform_matches_os_arch_variant() {
        let idx = index(vec![
            entry("sha256:amd", "linux", "amd64", None),
            entry("sha256:armv7", "linux", "arm", Some("v7")),
        ]);
        assert_eq!(
            select_platform(&idx, "linux/arm/v7").unwrap(),
            "sha256:armv7"
        );
        assert_eq!(select_platform(&idx, "linux/amd64").unwrap(), "sha256:amd");
    }

    #[test]
    fn unmatched_platform_falls_back_to_first() {
        let idx = index(vec![
            entry("sha256:first", "linux", "s390x", None),
            entry("sha256:second", "linux", "ppc64le", None),
        ]);
        assert_eq!(
            select_platform(&idx, "windows/amd64").unwrap(),
            "sha256:first"
        );
    }

    #[test]
    fn default_prefers_linux_amd64() {
        let idx = index(vec![
            entry("sha256:arm", "linux", "arm64", None),
            entry("sha256:amd", "linux", "amd64", None),
        ]);
        assert_eq!(select_platform(&idx, "").unwrap(), "sha256:amd");
    }

    #[test]
    fn empty_index_selects_nothing() {
        assert_eq!(select_platform(&index(vec![]), ""), None);
    }

    #[test]
    fn archive_manifest_uses_docker_field_names() {
        let entry = ArchiveManifestEntry {
            config: "sha256:abc.json".to_string(),
            repo_tags: vec!["nginx:1.25".to_string()],
            layers: vec!["sha256:def/layer.tar".to_string()],
        };
        let json = serde_json::to_value(vec![entry]).unwrap();
        assert_eq!(json[0]["Config"], "sha256:abc.json");
        assert_eq!(json[0]["RepoTags"][0], "nginx:1.25");
        assert_eq!(json[0]["Layers"][0], "sha256:def/layer.tar");

        let mut repositories = Repositories::new();
        repositories
            .entry("nginx".to_string())
            .or_default()
            .insert("1.25".to_string(), "sha256:abc".to_string());
        let json = serde_json::to_value(&repositories).unwrap();
        assert_eq!(json["nginx"]["1.25"], "sha256:abc");
    }

    #[test]
    fn reference_parsing_defaults_tag() {
        let r = parse_reference("nginx").unwrap();
        assert_eq!(r.tag(), Some("latest"));
        assert_eq!(r.repository(), "library/nginx");

        let r = parse_reference("ghcr.io/owner/tool:v2").unwrap();
        assert_eq!(r.registry(), "ghcr.io");
        assert_eq!(r.tag(), Some("v2"));

        assert!(parse_reference("UPPER CASE BAD REF").is_err());
    }
}
