//! Build specification model.
//!
//! A smith build is described by a small YAML document (`smith.yaml` by
//! convention) naming the package source, the paths to keep, and the
//! runtime configuration baked into the image config.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SmithError};

/// How the input root filesystem for a build is produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageType {
    /// Unpack an existing OCI image and carve executables out of it.
    Oci,
}

/// A smith build specification.
///
/// All fields are optional in the YAML; absent lists deserialize empty.
/// `paths` left empty means "everything" (the copier treats it as `["*"]`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ImageSpec {
    /// Package source type. Inferred from `package` when unset.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<PackageType>,

    /// Package source: a local OCI tar.gz, optionally suffixed `:tag`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub package: String,

    /// Globs of paths to carve out of the package root.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub paths: Vec<String>,

    /// Globs of paths to leave behind.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub excludes: Vec<String>,

    /// Parent image file (`file.tar.gz[:tag]`) whose layers this image extends.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub parent: String,

    /// Force NSS file population and libnss dependency injection.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub nss: bool,

    /// Run the container as root (config `User` becomes `0:0`).
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub root: bool,

    /// Container identity in `user[:group]` form; names or numeric ids.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user: String,

    /// Extra groups the container user belongs to.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<String>,

    /// Directories created in the rootfs and declared as volumes.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mounts: Vec<String>,

    /// Image entrypoint.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entrypoint: Vec<String>,

    /// Image command.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cmd: Vec<String>,

    /// Working directory.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub dir: String,

    /// Environment variables as `KEY=VALUE` strings.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,

    /// Exposed ports, e.g. `8080/tcp`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<String>,
}

impl ImageSpec {
    /// Load a specification from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            SmithError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        let spec: ImageSpec = serde_yaml::from_str(&text).map_err(|e| {
            SmithError::Config(format!("failed to parse {}: {}", path.display(), e))
        })?;
        Ok(spec)
    }

    /// Write the normalized specification back out as YAML.
    pub fn write_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let text = serde_yaml::to_string(self)?;
        std::fs::write(path.as_ref(), text)?;
        Ok(())
    }

    /// Serialize the normalized specification as JSON, the form attached
    /// to built images as an opaque blob.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}
