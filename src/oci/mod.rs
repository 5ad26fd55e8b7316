//! OCI data model
//!
//! The subset of the OCI image specification the store reads and writes:
//! the `oci-layout` marker, the repository index, image manifests and the
//! descriptors tying them together, plus digest parsing and formatting.
//! Types are serde mappings of the image-spec JSON documents; only the
//! fields the store acts on get convenience accessors.

use crate::error::{Result, StoreError};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::collections::HashMap;

/// Layout version the store writes and accepts in `oci-layout`
pub const LAYOUT_VERSION: &str = "1.0.0";

/// Annotation carrying a descriptor's tag in the repository index
pub const REF_NAME_ANNOTATION: &str = "org.opencontainers.image.ref.name";

/// Media types the store distinguishes when walking the reference graph
///
/// Docker's schema2 types are treated as synonyms of their OCI
/// counterparts; anything else passes through the store opaquely.
pub mod media_types {
    pub const IMAGE_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
    pub const IMAGE_INDEX: &str = "application/vnd.oci.image.index.v1+json";
    pub const IMAGE_CONFIG: &str = "application/vnd.oci.image.config.v1+json";
    pub const EMPTY_JSON: &str = "application/vnd.oci.empty.v1+json";
    pub const LAYER_TAR: &str = "application/vnd.oci.image.layer.v1.tar";
    pub const LAYER_TAR_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";

    pub const DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
    pub const DOCKER_MANIFEST_LIST: &str =
        "application/vnd.docker.distribution.manifest.list.v2+json";
    pub const DOCKER_IMAGE_CONFIG: &str = "application/vnd.docker.container.image.v1+json";
    pub const DOCKER_LAYER_GZIP: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";
}

/// True when the media type names a single-image manifest
pub fn is_manifest_media_type(media_type: &str) -> bool {
    media_type == media_types::IMAGE_MANIFEST || media_type == media_types::DOCKER_MANIFEST
}

/// True when the media type names an image index / manifest list
pub fn is_index_media_type(media_type: &str) -> bool {
    media_type == media_types::IMAGE_INDEX || media_type == media_types::DOCKER_MANIFEST_LIST
}

/// Compute the sha256 digest string of a byte slice
pub fn sha256_digest(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("sha256:{:x}", hasher.finalize())
}

/// Split a digest string into (algorithm, encoded), validating its syntax
pub fn split_digest(digest: &str) -> Result<(&str, &str)> {
    let (algorithm, encoded) = digest
        .split_once(':')
        .ok_or_else(|| StoreError::BadBlobDigest(digest.to_string()))?;

    let algorithm_ok = !algorithm.is_empty()
        && algorithm
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "+._-".contains(c));
    if !algorithm_ok {
        return Err(StoreError::BadBlobDigest(digest.to_string()));
    }

    let encoded_ok = if algorithm == "sha256" {
        encoded.len() == 64
            && encoded
                .chars()
                .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
    } else {
        !encoded.is_empty()
            && encoded
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || "=_-".contains(c))
    };
    if !encoded_ok {
        return Err(StoreError::BadBlobDigest(digest.to_string()));
    }

    Ok((algorithm, encoded))
}

/// Digest referenced by a cosign-style sibling tag (`sha256-<hex>.sig`,
/// `sha256-<hex>.sbom`), if the tag has that shape
pub fn sibling_tag_digest(tag: &str) -> Option<String> {
    let re = regex::Regex::new(r"^sha256-([0-9a-f]{64})\.(sig|sbom)$").unwrap();
    re.captures(tag).map(|caps| format!("sha256:{}", &caps[1]))
}

/// Reference to one piece of content in the blob pool
///
/// The whole layout is stitched together out of these: the index lists its
/// manifests as descriptors, a manifest lists its config and layers, and a
/// referrer names its subject. Within the repository index, the tag (if
/// any) rides in the [`REF_NAME_ANNOTATION`] annotation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    /// MIME type of the referenced content
    pub media_type: String,
    /// Content address, `<algorithm>:<encoded>`
    pub digest: String,
    /// Length of the content in bytes
    pub size: u64,
    /// Kind of artifact, surfaced in referrer listings
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_type: Option<String>,
    /// Alternative fetch locations for the content
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub urls: Vec<String>,
    /// Inlined base64 copy of small contents
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    /// Build target, present on multi-arch index entries
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
    /// Free-form key/value metadata
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub annotations: HashMap<String, String>,
}

impl Descriptor {
    /// Create a descriptor with the given media type, digest and size
    pub fn new(media_type: &str, digest: &str, size: u64) -> Self {
        Self {
            media_type: media_type.to_string(),
            digest: digest.to_string(),
            size,
            artifact_type: None,
            urls: Vec::new(),
            data: None,
            platform: None,
            annotations: HashMap::new(),
        }
    }

    /// Tag carried in the ref.name annotation, if any
    pub fn tag(&self) -> Option<&str> {
        self.annotations.get(REF_NAME_ANNOTATION).map(String::as_str)
    }

    /// Set the ref.name annotation
    pub fn set_tag(&mut self, tag: &str) {
        self.annotations
            .insert(REF_NAME_ANNOTATION.to_string(), tag.to_string());
    }
}

/// Build target of a multi-arch index entry
///
/// Note the dotted `os.version` / `os.features` JSON keys, an image-spec
/// quirk predating its camelCase convention.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Platform {
    /// CPU architecture, a GOARCH value
    pub architecture: String,
    /// Operating system, a GOOS value
    pub os: String,
    /// CPU variant, e.g. `v7` for armv7
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
    /// Operating system version constraint
    #[serde(rename = "os.version", skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,
    /// Operating system features the image needs
    #[serde(rename = "os.features", default, skip_serializing_if = "Vec::is_empty")]
    pub os_features: Vec<String>,
}

/// Single-image manifest: a config blob plus ordered layers
///
/// The store does not interpret config or layer contents; it only follows
/// their digests for validation and garbage collection, and the `subject`
/// digest to resolve referrers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageManifest {
    /// Always 2 for the manifests the store accepts
    pub schema_version: u32,
    /// Self-describing media type; optional for compatibility with older
    /// producers
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    /// Image configuration descriptor
    pub config: Descriptor,
    /// Filesystem layers, base first
    #[serde(default)]
    pub layers: Vec<Descriptor>,
    /// Kind of artifact this manifest packages
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_type: Option<String>,
    /// Manifest this one refers to, making it a referrer
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<Descriptor>,
    /// Free-form key/value metadata
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub annotations: HashMap<String, String>,
}

/// Image index: a list of manifest descriptors
///
/// Serves double duty as the multi-arch manifest list and as the
/// per-repository `index.json`, where descriptor annotations carry tags.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageIndex {
    /// Always 2 for the indexes the store accepts
    pub schema_version: u32,
    /// Self-describing media type; optional for compatibility with older
    /// producers
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    /// Descriptors of the member manifests
    #[serde(default)]
    pub manifests: Vec<Descriptor>,
    /// Kind of artifact this index groups
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_type: Option<String>,
    /// Manifest this index refers to, making it a referrer
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<Descriptor>,
    /// Free-form key/value metadata
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub annotations: HashMap<String, String>,
}

impl Default for ImageIndex {
    fn default() -> Self {
        Self {
            schema_version: 2,
            media_type: Some(media_types::IMAGE_INDEX.to_string()),
            manifests: Vec::new(),
            artifact_type: None,
            subject: None,
            annotations: HashMap::new(),
        }
    }
}

impl ImageIndex {
    /// True if any descriptor carries the given digest
    pub fn contains_digest(&self, digest: &str) -> bool {
        self.manifests.iter().any(|d| d.digest == digest)
    }
}

/// Content of the `oci-layout` marker file at a repository root
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OciLayout {
    pub image_layout_version: String,
}

impl Default for OciLayout {
    fn default() -> Self {
        Self {
            image_layout_version: LAYOUT_VERSION.to_string(),
        }
    }
}

/// Validate manifest content against its media type
///
/// Manifests and indexes must parse and carry schema version 2; unknown
/// media types are accepted opaquely.
pub fn validate_manifest(media_type: &str, body: &[u8]) -> Result<()> {
    if is_manifest_media_type(media_type) {
        let manifest: ImageManifest = serde_json::from_slice(body)
            .map_err(|e| StoreError::BadManifest(format!("invalid manifest: {}", e)))?;
        if manifest.schema_version != 2 {
            return Err(StoreError::BadManifest(format!(
                "unsupported schema version {}",
                manifest.schema_version
            )));
        }
        split_digest(&manifest.config.digest)?;
        for layer in &manifest.layers {
            split_digest(&layer.digest)?;
        }
    } else if is_index_media_type(media_type) {
        let index: ImageIndex = serde_json::from_slice(body)
            .map_err(|e| StoreError::BadManifest(format!("invalid index: {}", e)))?;
        if index.schema_version != 2 {
            return Err(StoreError::BadManifest(format!(
                "unsupported schema version {}",
                index.schema_version
            )));
        }
        for manifest in &index.manifests {
            split_digest(&manifest.digest)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_digest() {
        assert_eq!(
            sha256_digest(b"test"),
            "sha256:9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08"
        );
    }

    #[test]
    fn test_split_digest() {
        let digest = sha256_digest(b"test");
        let (algorithm, encoded) = split_digest(&digest).unwrap();
        assert_eq!(algorithm, "sha256");
        assert_eq!(encoded.len(), 64);

        assert!(split_digest("sha256:short").is_err());
        assert!(split_digest("nocolon").is_err());
        assert!(split_digest(":abc").is_err());
        assert!(split_digest("SHA256:abc").is_err());
    }

    #[test]
    fn test_sibling_tag_digest() {
        let hex = "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08";
        assert_eq!(
            sibling_tag_digest(&format!("sha256-{}.sig", hex)),
            Some(format!("sha256:{}", hex))
        );
        assert_eq!(
            sibling_tag_digest(&format!("sha256-{}.sbom", hex)),
            Some(format!("sha256:{}", hex))
        );
        assert_eq!(sibling_tag_digest("v1.0"), None);
        assert_eq!(sibling_tag_digest("sha256-abc.sig"), None);
    }

    #[test]
    fn test_manifest_serialization() {
        let manifest = ImageManifest {
            schema_version: 2,
            media_type: Some(media_types::IMAGE_MANIFEST.to_string()),
            config: Descriptor::new(media_types::IMAGE_CONFIG, &sha256_digest(b"{}"), 2),
            layers: vec![],
            artifact_type: None,
            subject: None,
            annotations: HashMap::new(),
        };

        let json = serde_json::to_string(&manifest).unwrap();
        assert!(json.contains("schemaVersion"));
        assert!(!json.contains("subject"));

        let parsed: ImageManifest = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.config.digest, manifest.config.digest);
    }

    #[test]
    fn test_platform_uses_dotted_keys() {
        let platform = Platform {
            architecture: "arm64".to_string(),
            os: "linux".to_string(),
            variant: Some("v8".to_string()),
            os_version: Some("6.1".to_string()),
            os_features: vec![],
        };

        let json = serde_json::to_string(&platform).unwrap();
        assert!(json.contains("\"os.version\""));
        assert!(!json.contains("osVersion"));
    }

    #[test]
    fn test_validate_manifest() {
        let config = sha256_digest(b"{}");
        let body = format!(
            r#"{{"schemaVersion":2,"config":{{"mediaType":"{}","digest":"{}","size":2}},"layers":[]}}"#,
            media_types::IMAGE_CONFIG,
            config
        );
        assert!(validate_manifest(media_types::IMAGE_MANIFEST, body.as_bytes()).is_ok());

        let bad_version = body.replace("\"schemaVersion\":2", "\"schemaVersion\":1");
        assert!(validate_manifest(media_types::IMAGE_MANIFEST, bad_version.as_bytes()).is_err());

        assert!(validate_manifest(media_types::IMAGE_MANIFEST, b"not json").is_err());
        assert!(validate_manifest("application/octet-stream", b"not json").is_ok());
    }

    #[test]
    fn test_descriptor_tag() {
        let mut desc = Descriptor::new(media_types::IMAGE_MANIFEST, &sha256_digest(b"m"), 1);
        assert_eq!(desc.tag(), None);
        desc.set_tag("v1");
        assert_eq!(desc.tag(), Some("v1"));
    }
}
