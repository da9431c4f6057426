//! In-memory OCI image model.
//!
//! Hand-rolled serde types for the parts of the OCI image spec smith
//! reads and writes: image config, manifest, index, and descriptors.
//! `BTreeMap` is used wherever JSON object key order matters so that
//! serialization is deterministic.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use smith_core::{Result, SmithError};

/// Media types for OCI-flavored and Docker-flavored images.
pub mod media_types {
    pub const LAYER: &str = "application/vnd.oci.image.layer.v1.tar+gzip";
    pub const CONFIG: &str = "application/vnd.oci.image.config.v1+json";
    pub const MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";

    pub const DOCKER_LAYER: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";
    pub const DOCKER_CONFIG: &str = "application/vnd.docker.container.image.v1+json";
    pub const DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";

    /// Media type of the normalized build spec blob attached to the index.
    pub const SMITH_SPEC: &str = "application/vnd.smith.spec+json";
}

/// Well-known annotation keys.
pub mod annotations {
    pub const REF_NAME: &str = "org.opencontainers.image.ref.name";
    pub const CREATED: &str = "org.opencontainers.image.created";
    pub const SMITH_VERSION: &str = "com.oracle.smith.version";
    pub const SMITH_SHA: &str = "com.oracle.smith.sha";
    pub const SMITH_BUILD: &str = "com.oracle.smith.build";
}

/// Manifest and index schema version.
pub const SCHEMA_VERSION: u32 = 2;

/// An empty JSON object, the value type of port and volume sets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmptyObject {}

/// A content-addressed reference to a blob.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Descriptor {
    #[serde(rename = "mediaType")]
    pub media_type: String,
    pub digest: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
}

impl Descriptor {
    /// Describe `data` under the given media type.
    pub fn for_bytes(media_type: &str, data: &[u8]) -> Self {
        Descriptor {
            media_type: media_type.to_string(),
            digest: digest(data),
            size: data.len() as u64,
            annotations: None,
            platform: None,
        }
    }
}

/// Target platform of a manifest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Platform {
    pub architecture: String,
    pub os: String,
}

impl Platform {
    /// The platform smith is running on, using OCI architecture names.
    pub fn current() -> Self {
        Platform {
            architecture: oci_arch(std::env::consts::ARCH).to_string(),
            os: std::env::consts::OS.to_string(),
        }
    }
}

/// Map a rust target arch to its OCI/GOARCH name.
fn oci_arch(arch: &str) -> &str {
    match arch {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "x86" => "386",
        other => other,
    }
}

/// The runtime half of an image config (the `config` JSON object).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(rename = "User", default, skip_serializing_if = "String::is_empty")]
    pub user: String,
    #[serde(
        rename = "ExposedPorts",
        default,
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub exposed_ports: BTreeMap<String, EmptyObject>,
    #[serde(rename = "Env", default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,
    #[serde(rename = "Entrypoint", default, skip_serializing_if = "Vec::is_empty")]
    pub entrypoint: Vec<String>,
    #[serde(rename = "Cmd", default, skip_serializing_if = "Vec::is_empty")]
    pub cmd: Vec<String>,
    #[serde(
        rename = "Volumes",
        default,
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub volumes: BTreeMap<String, EmptyObject>,
    #[serde(
        rename = "WorkingDir",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub working_dir: String,
}

/// The `rootfs` section of an image config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RootFs {
    #[serde(rename = "type")]
    pub fs_type: String,
    #[serde(default)]
    pub diff_ids: Vec<String>,
}

impl Default for RootFs {
    fn default() -> Self {
        RootFs {
            fs_type: "layers".to_string(),
            diff_ids: Vec::new(),
        }
    }
}

/// An OCI image configuration.
///
/// `created` is never written when building so the config digest stays
/// deterministic; the loader recovers it from manifest or index
/// annotations instead.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
    pub architecture: String,
    pub os: String,
    #[serde(default)]
    pub config: RuntimeConfig,
    #[serde(default)]
    pub rootfs: RootFs,
}

/// An OCI image manifest.
///
/// `media_type` is only populated in Docker mode; OCI manifests omit
/// the field entirely.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,
    #[serde(
        rename = "mediaType",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub media_type: Option<String>,
    pub config: Descriptor,
    pub layers: Vec<Descriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

/// An OCI image index.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Index {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,
    pub manifests: Vec<Descriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

/// The `oci-layout` marker file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageLayout {
    #[serde(rename = "imageLayoutVersion")]
    pub version: String,
}

impl Default for ImageLayout {
    fn default() -> Self {
        ImageLayout {
            version: "1.0.0".to_string(),
        }
    }
}

/// A single image layer.
#[derive(Debug, Clone)]
pub struct Layer {
    /// Descriptor of the compressed blob as stored.
    pub desc: Descriptor,
    /// sha256 of the *uncompressed* tar stream.
    pub diff_id: String,
    /// The gzipped tar bytes.
    pub data: Vec<u8>,
}

/// Arbitrary extra data attached to the image index.
#[derive(Debug, Clone)]
pub struct OpaqueBlob {
    pub media_type: String,
    pub content: Vec<u8>,
}

/// Build metadata recorded as index annotations.
#[derive(Debug, Clone)]
pub struct ImageMetadata {
    pub build_no: String,
    pub build_host: String,
    pub build_time: DateTime<Utc>,
    pub version: String,
    pub sha: String,
}

impl ImageMetadata {
    /// Metadata for a build starting now, stamped with this smith.
    pub fn now() -> Self {
        ImageMetadata {
            build_no: String::new(),
            build_host: String::new(),
            build_time: Utc::now(),
            version: smith_core::VERSION.to_string(),
            sha: smith_core::SHA.to_string(),
        }
    }
}

/// A complete in-memory image.
#[derive(Debug, Clone, Default)]
pub struct Image {
    pub config: ImageConfig,
    pub layers: Vec<Layer>,
    pub additional_blobs: Vec<OpaqueBlob>,
    pub metadata: Option<ImageMetadata>,
}

/// sha256 digest of `data` in `sha256:<hex>` form.
pub fn digest(data: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(data)))
}

/// Split a digest into its algorithm and hex halves.
pub fn split_digest(digest: &str) -> Result<(&str, &str)> {
    match digest.split_once(':') {
        Some((alg, hex)) if !alg.is_empty() && !hex.is_empty() => Ok((alg, hex)),
        _ => Err(SmithError::Format(format!("invalid digest: {digest}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_known_value() {
        // sha256 of "hello"
        assert_eq!(
            digest(b"hello"),
            "sha256:2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn test_split_digest() {
        let (alg, hex) = split_digest("sha256:abc123").unwrap();
        assert_eq!(alg, "sha256");
        assert_eq!(hex, "abc123");

        assert!(split_digest("abc123").is_err());
        assert!(split_digest("sha256:").is_err());
        assert!(split_digest(":abc").is_err());
    }

    #[test]
    fn test_config_created_not_serialized_when_none() {
        let config = ImageConfig {
            architecture: "amd64".to_string(),
            os: "linux".to_string(),
            ..Default::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("created"));
        assert!(json.contains("\"rootfs\""));
    }

    #[test]
    fn test_manifest_media_type_omitted_for_oci() {
        let manifest = Manifest {
            schema_version: SCHEMA_VERSION,
            config: Descriptor::for_bytes(media_types::CONFIG, b"{}"),
            ..Default::default()
        };
        let json = serde_json::to_string(&manifest).unwrap();
        assert!(!json.contains("mediaType\":\"application/vnd.oci.image.manifest"));
        assert!(json.contains("schemaVersion"));

        let docker = Manifest {
            media_type: Some(media_types::DOCKER_MANIFEST.to_string()),
            ..manifest
        };
        let json = serde_json::to_string(&docker).unwrap();
        assert!(json.contains("\"mediaType\":\"application/vnd.docker.distribution.manifest.v2+json\""));
    }

    #[test]
    fn test_descriptor_for_bytes() {
        let desc = Descriptor::for_bytes(media_types::LAYER, b"data");
        assert_eq!(desc.media_type, media_types::LAYER);
        assert_eq!(desc.size, 4);
        assert!(desc.digest.starts_with("sha256:"));
    }

    #[test]
    fn test_runtime_config_serde_names() {
        let mut config = RuntimeConfig {
            user: "10:10".to_string(),
            env: vec!["PATH=/bin".to_string()],
            entrypoint: vec!["/bin/true".to_string()],
            working_dir: "/write".to_string(),
            ..Default::default()
        };
        config
            .exposed_ports
            .insert("8080/tcp".to_string(), EmptyObject {});

        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"User\":\"10:10\""));
        assert!(json.contains("\"ExposedPorts\":{\"8080/tcp\":{}}"));
        assert!(json.contains("\"Entrypoint\""));
        assert!(json.contains("\"WorkingDir\""));
        // empty fields dropped
        assert!(!json.contains("\"Cmd\""));
        assert!(!json.contains("\"Volumes\""));
    }

    #[test]
    fn test_platform_arch_mapping() {
        assert_eq!(oci_arch("x86_64"), "amd64");
        assert_eq!(oci_arch("aarch64"), "arm64");
        assert_eq!(oci_arch("riscv64"), "riscv64");
    }

    #[test]
    fn test_image_layout_default() {
        let json = serde_json::to_string(&ImageLayout::default()).unwrap();
        assert_eq!(json, r#"{"imageLayoutVersion":"1.0.0"}"#);
    }
}
