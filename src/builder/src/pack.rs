//! OCI image serialization.
//!
//! Packs an in-memory [`Image`] into a gzipped tar holding a
//! content-addressed blob store, an `oci-layout` marker, and an
//! `index.json`. Entry order, header fields, and the omitted config
//! `created` timestamp are all pinned down so that identical inputs
//! produce bit-identical archives.

use std::collections::BTreeMap;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use chrono::SecondsFormat;
use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest as _, Sha256};
use smith_core::{Result, SmithError};
use tar::{EntryType, Header};

use crate::image::{
    annotations, digest, media_types, split_digest, Descriptor, Image, ImageConfig, ImageLayout,
    Index, Layer, Manifest, Platform, SCHEMA_VERSION,
};

// POSIX type bits ORed into tar header modes.
const C_ISDIR: u32 = 0o040000;
const C_ISREG: u32 = 0o100000;
const C_ISLNK: u32 = 0o120000;

/// A writer that hashes exactly the bytes it passes through.
struct DigestWriter<W: Write> {
    inner: W,
    hasher: Sha256,
}

impl<W: Write> DigestWriter<W> {
    fn new(inner: W) -> Self {
        DigestWriter {
            inner,
            hasher: Sha256::new(),
        }
    }

    fn into_parts(self) -> (W, String) {
        (self.inner, format!("sha256:{}", hex::encode(self.hasher.finalize())))
    }
}

impl<W: Write> Write for DigestWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// Tar the tree under `path` into a gzipped layer.
///
/// Header names are relative to `path`, uid/gid are forced to the given
/// identity, modification times are zeroed, permission bits are ORed
/// with the POSIX type bit, and `.gitignore` files are dropped. The
/// uncompressed and compressed streams are hashed as they are produced,
/// yielding the layer's diff-id and blob digest in one pass.
pub fn layer_from_path(path: &Path, uid: u64, gid: u64) -> Result<Layer> {
    let gzip_hash = DigestWriter::new(Vec::new());
    let encoder = GzEncoder::new(gzip_hash, Compression::default());
    let tar_hash = DigestWriter::new(encoder);
    let mut tar = tar::Builder::new(tar_hash);
    tar.follow_symlinks(false);

    append_tree(&mut tar, path, path, uid, gid)?;

    let tar_hash = tar.into_inner()?;
    let (encoder, diff_id) = tar_hash.into_parts();
    let gzip_hash = encoder.finish()?;
    let (data, blob_digest) = gzip_hash.into_parts();

    tracing::info!(diff_id = %diff_id, "layer diff-id computed");
    Ok(Layer {
        desc: Descriptor {
            media_type: media_types::LAYER.to_string(),
            digest: blob_digest,
            size: data.len() as u64,
            annotations: None,
            platform: None,
        },
        diff_id,
        data,
    })
}

/// Recursively append a directory's contents, children in name order.
fn append_tree<W: Write>(
    tar: &mut tar::Builder<W>,
    root: &Path,
    dir: &Path,
    uid: u64,
    gid: u64,
) -> Result<()> {
    let mut children: Vec<_> = std::fs::read_dir(dir)?
        .collect::<std::io::Result<Vec<_>>>()?
        .into_iter()
        .map(|e| e.path())
        .collect();
    children.sort();

    for path in children {
        if path.file_name().is_some_and(|n| n == ".gitignore") {
            continue;
        }
        let rel = path
            .strip_prefix(root)
            .map_err(|e| SmithError::Other(format!("failed to get relative path: {e}")))?
            .to_string_lossy()
            .into_owned();
        let meta = std::fs::symlink_metadata(&path)?;
        let perm = meta.permissions().mode() & 0o777;

        let mut header = Header::new_gnu();
        header.set_uid(uid);
        header.set_gid(gid);
        header.set_mtime(0);
        header.set_size(0);

        if meta.is_dir() {
            header.set_entry_type(EntryType::Directory);
            header.set_mode(perm | C_ISDIR);
            tracing::debug!(path = %path.display(), "adding directory to archive");
            tar.append_data(&mut header, format!("{rel}/"), std::io::empty())?;
            append_tree(tar, root, &path, uid, gid)?;
        } else if meta.file_type().is_symlink() {
            let link = std::fs::read_link(&path)?;
            header.set_entry_type(EntryType::Symlink);
            header.set_mode(perm | C_ISLNK);
            tracing::debug!(path = %path.display(), "adding symlink to archive");
            tar.append_link(&mut header, &rel, &link)?;
        } else if meta.is_file() {
            header.set_entry_type(EntryType::Regular);
            header.set_mode(perm | C_ISREG);
            header.set_size(meta.len());
            tracing::debug!(path = %path.display(), "adding file to archive");
            let file = std::fs::File::open(&path)?;
            tar.append_data(&mut header, &rel, file)?;
        } else {
            tracing::debug!(path = %path.display(), "skipping special file");
        }
    }
    Ok(())
}

/// Serialize the image config with `created` cleared and the rootfs
/// diff-ids regenerated from the layers, so the config digest depends
/// only on image content.
fn serialize_config(image: &Image) -> Result<Vec<u8>> {
    let mut config: ImageConfig = image.config.clone();
    config.created = None;
    config.rootfs = Default::default();
    for layer in &image.layers {
        config.rootfs.diff_ids.push(layer.diff_id.clone());
    }
    Ok(serde_json::to_vec(&config)?)
}

/// Serialize the image manifest, swapping in Docker media types (and an
/// explicit manifest `mediaType`) when `docker` is set.
fn serialize_manifest(config: Descriptor, layers: &[Layer], docker: bool) -> Result<Vec<u8>> {
    let mut manifest = Manifest {
        schema_version: SCHEMA_VERSION,
        ..Default::default()
    };
    if docker {
        manifest.media_type = Some(media_types::DOCKER_MANIFEST.to_string());
    }

    manifest.config = config;
    manifest.config.media_type = if docker {
        media_types::DOCKER_CONFIG.to_string()
    } else {
        media_types::CONFIG.to_string()
    };
    for layer in layers {
        let mut desc = layer.desc.clone();
        desc.media_type = if docker {
            media_types::DOCKER_LAYER.to_string()
        } else {
            media_types::LAYER.to_string()
        };
        manifest.layers.push(desc);
    }
    Ok(serde_json::to_vec(&manifest)?)
}

fn write_dir_entry<W: Write>(tar: &mut tar::Builder<W>, name: &str) -> Result<()> {
    let mut header = Header::new_gnu();
    header.set_entry_type(EntryType::Directory);
    header.set_mode(0o755 | C_ISDIR);
    header.set_mtime(0);
    header.set_size(0);
    tracing::debug!(name, "adding directory to archive");
    tar.append_data(&mut header, format!("{name}/"), std::io::empty())?;
    Ok(())
}

fn write_file_entry<W: Write>(tar: &mut tar::Builder<W>, name: &str, data: &[u8]) -> Result<()> {
    let mut header = Header::new_gnu();
    header.set_entry_type(EntryType::Regular);
    header.set_mode(0o644 | C_ISREG);
    header.set_mtime(0);
    header.set_size(data.len() as u64);
    tracing::debug!(name, "adding file to archive");
    tar.append_data(&mut header, name, data)?;
    Ok(())
}

/// Write the image as an OCI layout tar to `out`.
///
/// Blob files are emitted in lexicographic order with their parent
/// directories first, then `oci-layout`, then `index.json`.
pub fn write_oci_tar(image: &Image, out: &mut dyn Write, docker: bool) -> Result<()> {
    let mut tar = tar::Builder::new(out);
    let mut file_data: BTreeMap<String, Vec<u8>> = BTreeMap::new();

    // layers
    for layer in &image.layers {
        let (alg, hex) = split_digest(&layer.desc.digest)?;
        tracing::info!(digest = %layer.desc.digest, "adding layer to image");
        file_data.insert(format!("blobs/{alg}/{hex}"), layer.data.clone());
    }

    // config
    let config_data = serialize_config(image)?;
    let config_sha = digest(&config_data);
    let (_, hex) = split_digest(&config_sha)?;
    file_data.insert(format!("blobs/sha256/{hex}"), config_data.clone());
    let config_desc = Descriptor::for_bytes(media_types::CONFIG, &config_data);

    // manifest
    let manifest_data = serialize_manifest(config_desc, &image.layers, docker)?;
    let manifest_sha = digest(&manifest_data);
    let (_, hex) = split_digest(&manifest_sha)?;
    file_data.insert(format!("blobs/sha256/{hex}"), manifest_data.clone());

    // extra blobs
    for blob in &image.additional_blobs {
        let blob_sha = digest(&blob.content);
        let (_, hex) = split_digest(&blob_sha)?;
        file_data.insert(format!("blobs/sha256/{hex}"), blob.content.clone());
    }

    // blobs in sorted order, each directory emitted once, parents first
    write_dir_entry(&mut tar, "blobs")?;
    let mut dirs_seen = std::collections::HashSet::new();
    for (name, data) in &file_data {
        if let Some((dir, _)) = name.rsplit_once('/') {
            if dirs_seen.insert(dir.to_string()) {
                write_dir_entry(&mut tar, dir)?;
            }
        }
        write_file_entry(&mut tar, name, data)?;
    }

    write_file_entry(
        &mut tar,
        "oci-layout",
        &serde_json::to_vec(&ImageLayout::default())?,
    )?;

    // index: one entry per extra blob plus the "latest" manifest entry
    let manifest_mt = if docker {
        media_types::DOCKER_MANIFEST
    } else {
        media_types::MANIFEST
    };
    let mut latest = Descriptor {
        media_type: manifest_mt.to_string(),
        digest: manifest_sha,
        size: manifest_data.len() as u64,
        annotations: None,
        platform: Some(Platform::current()),
    };
    if let Some(metadata) = &image.metadata {
        let mut notes = BTreeMap::new();
        notes.insert(annotations::REF_NAME.to_string(), "latest".to_string());
        notes.insert(
            annotations::CREATED.to_string(),
            metadata
                .build_time
                .to_rfc3339_opts(SecondsFormat::Secs, true),
        );
        notes.insert(
            annotations::SMITH_VERSION.to_string(),
            metadata.version.clone(),
        );
        notes.insert(annotations::SMITH_SHA.to_string(), metadata.sha.clone());
        if !metadata.build_no.is_empty() {
            notes.insert(
                annotations::SMITH_BUILD.to_string(),
                metadata.build_no.clone(),
            );
        }
        latest.annotations = Some(notes);
    }

    let blob_notes = image.metadata.as_ref().and_then(|m| {
        if m.build_no.is_empty() {
            None
        } else {
            let mut notes = BTreeMap::new();
            notes.insert(annotations::SMITH_BUILD.to_string(), m.build_no.clone());
            Some(notes)
        }
    });
    let mut manifests = Vec::new();
    for blob in &image.additional_blobs {
        let mut entry = Descriptor::for_bytes(&blob.media_type, &blob.content);
        entry.annotations = blob_notes.clone();
        manifests.push(entry);
    }
    manifests.push(latest);

    let index = Index {
        schema_version: SCHEMA_VERSION,
        manifests,
        annotations: None,
    };
    write_file_entry(&mut tar, "index.json", &serde_json::to_vec(&index)?)?;
    tar.finish()?;
    Ok(())
}

/// Write the image as a gzipped OCI layout tar at `out_path`.
pub fn write_oci_targz(image: &Image, out_path: &Path, docker: bool) -> Result<()> {
    let file = std::fs::File::create(out_path)?;
    let mut encoder = GzEncoder::new(file, Compression::default());
    write_oci_tar(image, &mut encoder, docker)?;
    encoder.finish()?;
    Ok(())
}
