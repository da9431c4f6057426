//! OCI image reading and layer extraction.
//!
//! The reader walks `index.json` → manifest → config → layers out of a
//! (possibly gzipped) OCI layout tar. Fetching a blob's bytes is a
//! capability supplied by the caller, so the same assembly logic works
//! whether bytes come from a local tar or anywhere else.

use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use smith_core::{Result, SmithError};
use tar::EntryType;

use crate::image::{
    annotations, digest, split_digest, Image, ImageConfig, Index, Layer, Manifest, OpaqueBlob,
};
use crate::symlink::clean_path;

/// Wrap a reader in gzip decompression when the stream leads with the
/// gzip magic; pass plain tars through untouched.
fn maybe_gzip_reader<'a, R: BufRead + 'a>(mut reader: R) -> Result<Box<dyn Read + 'a>> {
    let gzipped = {
        let buf = reader.fill_buf()?;
        buf.len() >= 2 && buf[0] == 0x1f && buf[1] == 0x8b
    };
    if gzipped {
        Ok(Box::new(GzDecoder::new(reader)))
    } else {
        tracing::debug!("file is not a gzip, assuming tar");
        Ok(Box::new(reader))
    }
}

/// Pull a single entry's bytes out of a (possibly gzipped) tar file by
/// linear scan.
pub fn extract_file(tarfile: &Path, filename: &str) -> Result<Vec<u8>> {
    let file = std::fs::File::open(tarfile)?;
    let reader = maybe_gzip_reader(BufReader::new(file))?;
    let mut archive = tar::Archive::new(reader);
    for entry in archive.entries()? {
        let mut entry =
            entry.map_err(|e| SmithError::Format(format!("error reading tar entry: {e}")))?;
        let name = entry
            .path()
            .map_err(|e| SmithError::Format(format!("error reading tar entry: {e}")))?
            .into_owned();
        if clean_path(&name.to_string_lossy()) == Path::new(filename) {
            let mut data = Vec::new();
            entry.read_to_end(&mut data)?;
            return Ok(data);
        }
    }
    Err(SmithError::Format(format!(
        "could not find {} in {}",
        filename,
        tarfile.display()
    )))
}

/// Fetch a blob by digest, verifying the bytes hash back to it.
fn fetch_verified<F>(fetch: &F, want: &str) -> Result<Vec<u8>>
where
    F: Fn(&str) -> Result<Vec<u8>>,
{
    let data = fetch(want)?;
    let (alg, _) = split_digest(want)?;
    if alg == "sha256" {
        let actual = digest(&data);
        if actual != want {
            return Err(SmithError::Integrity {
                digest: want.to_string(),
                actual,
            });
        }
    }
    Ok(data)
}

/// Assemble an image starting from its manifest digest.
///
/// `fetch` supplies the bytes for any digest; `index_annotations` are
/// consulted for the creation time when neither the config nor the
/// manifest carries one.
pub fn image_from_digest<F>(
    fetch: F,
    manifest_digest: &str,
    index_annotations: &BTreeMap<String, String>,
) -> Result<Image>
where
    F: Fn(&str) -> Result<Vec<u8>>,
{
    let manifest_data = fetch_verified(&fetch, manifest_digest)?;
    let manifest: Manifest = serde_json::from_slice(&manifest_data)
        .map_err(|_| SmithError::Format("error unmarshaling image manifest".to_string()))?;
    if manifest.config.digest.is_empty() {
        return Err(SmithError::Format(
            "manifest has no referenced config".to_string(),
        ));
    }

    let config_data = fetch_verified(&fetch, &manifest.config.digest)?;
    let mut config: ImageConfig = serde_json::from_slice(&config_data)
        .map_err(|_| SmithError::Format("error unmarshaling image config json".to_string()))?;

    if manifest.layers.len() != config.rootfs.diff_ids.len() {
        return Err(SmithError::Format(
            "number of layers and number of diff ids don't match".to_string(),
        ));
    }

    // the config is written without a creation time so its digest stays
    // deterministic; recover one from the annotations for tools that
    // want it
    if config.created.is_none() {
        let created = manifest
            .annotations
            .as_ref()
            .and_then(|a| a.get(annotations::CREATED))
            .or_else(|| index_annotations.get(annotations::CREATED));
        if let Some(created) = created {
            if let Ok(when) = DateTime::parse_from_rfc3339(created) {
                config.created = Some(when.with_timezone(&Utc));
            }
        }
    }

    let mut layers = Vec::new();
    for (i, desc) in manifest.layers.iter().enumerate() {
        if desc.digest.is_empty() {
            return Err(SmithError::Format(
                "image manifest has an invalid layer reference".to_string(),
            ));
        }
        let data = fetch_verified(&fetch, &desc.digest)?;
        layers.push(Layer {
            desc: desc.clone(),
            diff_id: config.rootfs.diff_ids[i].clone(),
            data,
        });
    }

    Ok(Image {
        config,
        layers,
        additional_blobs: Vec::new(),
        metadata: None,
    })
}

/// Load an image from a local OCI tar.gz.
///
/// `path` may carry a `:tag` suffix selecting an index entry by its
/// `org.opencontainers.image.ref.name` annotation; the default tag is
/// `latest`.
pub fn image_from_file(path: &str) -> Result<Image> {
    let (tarpath, tag) = match path.split_once(':') {
        Some((file, tag)) => (file.to_string(), tag.to_string()),
        None => (path.to_string(), "latest".to_string()),
    };
    let tarpath = PathBuf::from(tarpath);

    let index_data = extract_file(&tarpath, "index.json")?;
    let index: Index = serde_json::from_slice(&index_data).map_err(|_| {
        SmithError::Format(format!("error unmarshaling index.json from {}", tarpath.display()))
    })?;

    let mut found = None;
    for entry in &index.manifests {
        let matches = entry
            .annotations
            .as_ref()
            .and_then(|a| a.get(annotations::REF_NAME))
            .is_some_and(|name| *name == tag);
        if matches {
            found = Some((
                entry.digest.clone(),
                entry.annotations.clone().unwrap_or_default(),
            ));
        }
    }
    let (manifest_digest, index_annotations) = found.ok_or_else(|| {
        SmithError::Format(format!("unable to locate image named {tag} in index"))
    })?;
    tracing::debug!(tag = %tag, digest = %manifest_digest, "selected manifest from index");

    let fetch = |want: &str| {
        let (alg, hex) = split_digest(want)?;
        extract_file(&tarpath, &format!("blobs/{alg}/{hex}"))
    };
    let mut image = image_from_digest(&fetch, &manifest_digest, &index_annotations)?;

    // index entries that aren't tagged manifests are opaque blobs
    for entry in &index.manifests {
        let tagged = entry
            .annotations
            .as_ref()
            .is_some_and(|a| a.contains_key(annotations::REF_NAME));
        if tagged {
            continue;
        }
        image.additional_blobs.push(OpaqueBlob {
            media_type: entry.media_type.clone(),
            content: fetch_verified(&fetch, &entry.digest)?,
        });
    }
    Ok(image)
}

/// Remove whatever exists at `path`, if anything; failures are demoted
/// to warnings like the rest of layer application.
fn remove_existing(path: &Path) {
    let meta = match std::fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(_) => return,
    };
    let removed = if meta.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    };
    if removed.is_err() {
        tracing::warn!(path = %path.display(), "failed to remove");
    }
}

/// Apply one layer tar.gz to `out_dir`.
///
/// Whiteout entries (base name prefixed `.wh.`) delete the matching
/// path. Anything else replaces what's on disk unless both sides are
/// directories. Regular file modes are normalized to 0755 when any
/// exec bit is set and 0644 otherwise.
pub fn extract_layer(layer: &Layer, out_dir: &Path) -> Result<()> {
    let reader = maybe_gzip_reader(BufReader::new(layer.data.as_slice()))?;
    let mut archive = tar::Archive::new(reader);
    for entry in archive.entries()? {
        let mut entry =
            entry.map_err(|e| SmithError::Format(format!("error reading tar entry: {e}")))?;
        let raw = entry
            .path()
            .map_err(|e| SmithError::Format(format!("error reading tar entry: {e}")))?
            .into_owned();
        let clean = clean_path(&raw.to_string_lossy());
        let base = clean
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        if let Some(hidden) = base.strip_prefix(".wh.") {
            let target = match clean.parent() {
                Some(parent) => parent.join(hidden),
                None => PathBuf::from(hidden),
            };
            tracing::debug!(path = %target.display(), "applying whiteout");
            remove_existing(&out_dir.join(target));
            continue;
        }

        let path = out_dir.join(&clean);
        let entry_type = entry.header().entry_type();
        if let Ok(meta) = std::fs::symlink_metadata(&path) {
            // remove any existing file at the location unless both
            // sides are directories
            if !(entry_type == EntryType::Directory && meta.is_dir()) {
                remove_existing(&path);
            }
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        match entry_type {
            EntryType::Directory => {
                std::fs::create_dir_all(&path)?;
            }
            EntryType::Symlink => {
                let target = entry
                    .link_name()?
                    .ok_or_else(|| SmithError::Format(format!("symlink {base} has no target")))?
                    .into_owned();
                std::os::unix::fs::symlink(target, &path)?;
            }
            EntryType::Link => {
                let target = entry
                    .link_name()?
                    .ok_or_else(|| SmithError::Format(format!("link {base} has no target")))?
                    .into_owned();
                let target = if target.is_absolute() {
                    crate::ldcache::rebase(out_dir, &target)
                } else {
                    out_dir.join(target)
                };
                std::fs::hard_link(target, &path)?;
            }
            EntryType::Regular => {
                let mode = entry.header().mode().unwrap_or(0o644);
                let perm = if mode & 0o111 != 0 { 0o755 } else { 0o644 };
                let mut out = std::fs::OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .mode(perm)
                    .open(&path)?;
                std::io::copy(&mut entry, &mut out)?;
                out.flush()?;
            }
            other => {
                tracing::info!(
                    kind = ?other,
                    path = %clean.display(),
                    "skipping unknown file type"
                );
            }
        }
    }
    Ok(())
}

/// Materialize all of an image's layers, bottom to top.
pub fn extract_oci(image: &Image, out_dir: &Path) -> Result<()> {
    for layer in &image.layers {
        extract_layer(layer, out_dir)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::{media_types, ImageMetadata, OpaqueBlob, RuntimeConfig};
    use crate::pack::{layer_from_path, write_oci_targz};
    use chrono::TimeZone;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn build_test_image(tree: &Path) -> Image {
        let layer = layer_from_path(tree, 10, 10).unwrap();
        Image {
            config: ImageConfig {
                created: None,
                architecture: "amd64".to_string(),
                os: "linux".to_string(),
                config: RuntimeConfig {
                    user: "10:10".to_string(),
                    cmd: vec!["/bin/true".to_string()],
                    env: vec!["PATH=/usr/bin:/bin".to_string()],
                    ..Default::default()
                },
                rootfs: Default::default(),
            },
            layers: vec![layer],
            additional_blobs: vec![OpaqueBlob {
                media_type: media_types::SMITH_SPEC.to_string(),
                content: b"{}".to_vec(),
            }],
            metadata: Some(ImageMetadata {
                build_no: String::new(),
                build_host: "host".to_string(),
                build_time: Utc.with_ymd_and_hms(2020, 5, 6, 7, 8, 9).unwrap(),
                version: "0.1.0".to_string(),
                sha: "cafe".to_string(),
            }),
        }
    }

    fn sample_tree() -> TempDir {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir(tmp.path().join("bin")).unwrap();
        std::fs::write(tmp.path().join("bin/true"), "#!/bin/sh\n").unwrap();
        std::fs::set_permissions(
            tmp.path().join("bin/true"),
            std::fs::Permissions::from_mode(0o755),
        )
        .unwrap();
        tmp
    }

    #[test]
    fn test_image_roundtrip() {
        let tree = sample_tree();
        let image = build_test_image(tree.path());
        let tmp = TempDir::new().unwrap();
        let out = tmp.path().join("image.tar.gz");
        write_oci_targz(&image, &out, false).unwrap();

        let loaded = image_from_file(&out.to_string_lossy()).unwrap();

        // config round-trips except for created, which is recovered
        // from the index annotations
        assert_eq!(loaded.config.architecture, "amd64");
        assert_eq!(loaded.config.config, image.config.config);
        assert_eq!(
            loaded.config.created,
            Some(Utc.with_ymd_and_hms(2020, 5, 6, 7, 8, 9).unwrap())
        );
        assert_eq!(loaded.config.rootfs.diff_ids, vec![image.layers[0].diff_id.clone()]);

        assert_eq!(loaded.layers.len(), 1);
        assert_eq!(loaded.layers[0].diff_id, image.layers[0].diff_id);
        assert_eq!(loaded.layers[0].data, image.layers[0].data);

        assert_eq!(loaded.additional_blobs.len(), 1);
        assert_eq!(
            loaded.additional_blobs[0].media_type,
            media_types::SMITH_SPEC
        );
        assert_eq!(loaded.additional_blobs[0].content, b"{}");
    }

    #[test]
    fn test_image_from_file_unknown_tag() {
        let tree = sample_tree();
        let image = build_test_image(tree.path());
        let tmp = TempDir::new().unwrap();
        let out = tmp.path().join("image.tar.gz");
        write_oci_targz(&image, &out, false).unwrap();

        let spec = format!("{}:nope", out.to_string_lossy());
        let err = image_from_file(&spec).unwrap_err().to_string();
        assert!(err.contains("unable to locate image named nope"));
    }

    #[test]
    fn test_extract_file_missing_entry() {
        let tree = sample_tree();
        let image = build_test_image(tree.path());
        let tmp = TempDir::new().unwrap();
        let out = tmp.path().join("image.tar.gz");
        write_oci_targz(&image, &out, false).unwrap();

        let err = extract_file(&out, "not-there").unwrap_err().to_string();
        assert!(err.contains("could not find not-there"));
    }

    #[test]
    fn test_image_from_digest_integrity() {
        let fetch = |_digest: &str| Ok(b"tampered".to_vec());
        let want = digest(b"original");
        let err = image_from_digest(fetch, &want, &BTreeMap::new()).unwrap_err();
        assert!(matches!(err, SmithError::Integrity { .. }));
    }

    #[test]
    fn test_image_from_digest_cardinality_mismatch() {
        use crate::image::{Descriptor, Manifest, SCHEMA_VERSION};

        let config = ImageConfig {
            architecture: "amd64".to_string(),
            os: "linux".to_string(),
            ..Default::default()
        };
        let config_data = serde_json::to_vec(&config).unwrap();

        let layer_data = b"layer".to_vec();
        let manifest = Manifest {
            schema_version: SCHEMA_VERSION,
            config: Descriptor::for_bytes(media_types::CONFIG, &config_data),
            layers: vec![Descriptor::for_bytes(media_types::LAYER, &layer_data)],
            ..Default::default()
        };
        let manifest_data = serde_json::to_vec(&manifest).unwrap();
        let manifest_digest = digest(&manifest_data);

        let fetch = move |want: &str| {
            for blob in [&manifest_data, &config_data, &layer_data] {
                if digest(blob) == want {
                    return Ok(blob.clone());
                }
            }
            Err(SmithError::Format(format!("no blob {want}")))
        };
        // one layer in the manifest, zero diff ids in the config
        let err = image_from_digest(fetch, &manifest_digest, &BTreeMap::new())
            .unwrap_err()
            .to_string();
        assert!(err.contains("don't match"));
    }

    fn layer_from_entries(entries: &[(&str, EntryType, &[u8], u32)]) -> Layer {
        use flate2::write::GzEncoder;
        use flate2::Compression;

        let encoder = GzEncoder::new(Vec::new(), Compression::default());
        let mut builder = tar::Builder::new(encoder);
        for (name, kind, content, mode) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_entry_type(*kind);
            header.set_mode(*mode);
            header.set_mtime(0);
            header.set_size(content.len() as u64);
            builder.append_data(&mut header, name, *content).unwrap();
        }
        let data = builder.into_inner().unwrap().finish().unwrap();
        Layer {
            desc: Default::default(),
            diff_id: String::new(),
            data,
        }
    }

    #[test]
    fn test_extract_layer_files_and_modes() {
        let tmp = TempDir::new().unwrap();
        let layer = layer_from_entries(&[
            ("bin/", EntryType::Directory, b"", 0o755),
            ("bin/tool", EntryType::Regular, b"#!/bin/sh\n", 0o700),
            ("data.txt", EntryType::Regular, b"text", 0o600),
        ]);
        extract_layer(&layer, tmp.path()).unwrap();

        let tool = std::fs::metadata(tmp.path().join("bin/tool")).unwrap();
        assert_eq!(tool.permissions().mode() & 0o777, 0o755);
        let data = std::fs::metadata(tmp.path().join("data.txt")).unwrap();
        assert_eq!(data.permissions().mode() & 0o777, 0o644);
        assert_eq!(
            std::fs::read_to_string(tmp.path().join("data.txt")).unwrap(),
            "text"
        );
    }

    #[test]
    fn test_extract_layer_whiteout() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("foo/bar")).unwrap();
        std::fs::write(tmp.path().join("foo/bar/baz"), "old").unwrap();

        let layer = layer_from_entries(&[("foo/.wh.bar", EntryType::Regular, b"", 0o644)]);
        extract_layer(&layer, tmp.path()).unwrap();

        assert!(!tmp.path().join("foo/bar").exists());
        assert!(tmp.path().join("foo").exists());
    }

    #[test]
    fn test_extract_layer_replaces_type_mismatch() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("thing")).unwrap();

        let layer = layer_from_entries(&[("thing", EntryType::Regular, b"now a file", 0o644)]);
        extract_layer(&layer, tmp.path()).unwrap();

        assert!(tmp.path().join("thing").is_file());
    }

    #[test]
    fn test_extract_layer_symlink() {
        let tmp = TempDir::new().unwrap();
        let layer = {
            let encoder =
                flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
            let mut builder = tar::Builder::new(encoder);
            let mut header = tar::Header::new_gnu();
            header.set_entry_type(EntryType::Symlink);
            header.set_mode(0o777);
            header.set_mtime(0);
            header.set_size(0);
            builder
                .append_link(&mut header, "alias", "the-target")
                .unwrap();
            let data = builder.into_inner().unwrap().finish().unwrap();
            Layer {
                desc: Default::default(),
                diff_id: String::new(),
                data,
            }
        };
        extract_layer(&layer, tmp.path()).unwrap();

        assert_eq!(
            std::fs::read_link(tmp.path().join("alias")).unwrap(),
            PathBuf::from("the-target")
        );
    }

    #[test]
    fn test_extract_oci_applies_layers_in_order() {
        let tmp = TempDir::new().unwrap();
        let bottom = layer_from_entries(&[("file", EntryType::Regular, b"bottom", 0o644)]);
        let top = layer_from_entries(&[("file", EntryType::Regular, b"top", 0o644)]);
        let image = Image {
            layers: vec![bottom, top],
            ..Default::default()
        };
        extract_oci(&image, tmp.path()).unwrap();

        assert_eq!(
            std::fs::read_to_string(tmp.path().join("file")).unwrap(),
            "top"
        );
    }
}
