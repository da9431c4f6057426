//! Build driver.
//!
//! Orchestrates a full image build: stage a temporary build directory,
//! unpack the package source, carve the requested paths (and their
//! dependency closures) into a fresh rootfs, overlay local files, and
//! pack everything into an OCI tar.gz.

use std::path::{Path, PathBuf};
use std::process::Command;

use smith_core::{ImageSpec, Result, SmithError, DEFAULT_ID};

use crate::copy::{copy_tree, CopyOptions};
use crate::image::{
    media_types, EmptyObject, Image, ImageConfig, ImageMetadata, OpaqueBlob, Platform,
    RuntimeConfig,
};
use crate::ldcache::LdCache;
use crate::nss::{parse_user, populate_nss};
use crate::pack::{layer_from_path, write_oci_targz};
use crate::unpack::{extract_oci, image_from_file};

/// Name of the image rootfs directory inside the build directory.
const ROOTFS: &str = "rootfs";

/// Options controlling a build.
#[derive(Debug, Clone)]
pub struct BuildOptions {
    /// Directory the spec's relative paths are resolved against.
    pub context_dir: PathBuf,
    /// Reuse the per-uid unpack cache instead of unpacking fresh.
    pub fast: bool,
    /// Build number recorded in the image annotations.
    pub build_no: String,
    /// Emit Docker media types instead of OCI ones.
    pub docker: bool,
}

impl Default for BuildOptions {
    fn default() -> Self {
        BuildOptions {
            context_dir: PathBuf::from("."),
            fast: false,
            build_no: String::new(),
            docker: false,
        }
    }
}

/// True when a package URI names an OCI image rather than some other
/// package format.
fn is_oci(uri: &str) -> bool {
    // urls are oci images
    if uri.starts_with("http://") || uri.starts_with("https://") {
        return true;
    }
    // split off a potential tag from the uri
    let parts: Vec<&str> = uri.split(':').collect();
    let file = if parts.len() > 2 {
        parts[parts.len() - 2]
    } else {
        parts[0]
    };
    file.ends_with(".tar") || file.ends_with(".tar.gz") || file.ends_with(".tgz")
}

/// Build the image config declared by the spec.
fn config_from_spec(spec: &ImageSpec) -> ImageConfig {
    let platform = Platform::current();
    let mut runtime = RuntimeConfig {
        entrypoint: spec.entrypoint.clone(),
        cmd: spec.cmd.clone(),
        env: spec.env.clone(),
        working_dir: spec.dir.clone(),
        ..Default::default()
    };
    runtime.user = if spec.root {
        "0:0".to_string()
    } else if !spec.user.is_empty() {
        spec.user.clone()
    } else {
        format!("{DEFAULT_ID}:{DEFAULT_ID}")
    };
    for port in &spec.ports {
        runtime.exposed_ports.insert(port.clone(), EmptyObject {});
    }
    for mount in &spec.mounts {
        runtime.volumes.insert(mount.clone(), EmptyObject {});
    }
    ImageConfig {
        created: None,
        architecture: platform.architecture,
        os: platform.os,
        config: runtime,
        rootfs: Default::default(),
    }
}

/// Fill unset spec fields from a parent or package image config.
fn set_defaults_from_image(spec: &mut ImageSpec, image: &Image) {
    let config = &image.config.config;
    if spec.dir.is_empty() {
        spec.dir = config.working_dir.clone();
    }
    if spec.entrypoint.is_empty() {
        spec.entrypoint = config.entrypoint.clone();
    }
    if spec.cmd.is_empty() {
        spec.cmd = config.cmd.clone();
    }
    if spec.env.is_empty() {
        spec.env = config.env.clone();
    }
    if spec.ports.is_empty() {
        spec.ports = config.exposed_ports.keys().cloned().collect();
    }
}

/// Create the rootfs skeleton inside the build directory.
fn rootfs_dir(build_dir: &Path) -> Result<PathBuf> {
    let output_dir = build_dir.join(ROOTFS);
    std::fs::create_dir_all(&output_dir)?;
    for dir in ["dev", "read", "write", "run", "proc", "sys"] {
        std::fs::create_dir_all(output_dir.join(dir))?;
    }
    Ok(output_dir)
}

/// The per-uid directory where package images are unpacked and reused
/// across fast incremental builds.
fn unpack_dir() -> PathBuf {
    let uid = nix::unistd::getuid().as_raw();
    std::env::temp_dir().join(format!("smith-unpack-{uid}"))
}

/// Run the loader-cache query against an unpacked root and hand back
/// its verbose listing; failure downgrades to a warning and an empty
/// cache, since the fallback directory search can still resolve
/// common layouts.
fn ldconfig_output(root: &Path) -> String {
    let result = Command::new("ldconfig")
        .arg("-v")
        .arg("-N")
        .arg("-X")
        .arg("-r")
        .arg(root)
        .output();
    match result {
        Ok(output) if output.status.success() => {
            String::from_utf8_lossy(&output.stdout).into_owned()
        }
        Ok(output) => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            tracing::warn!("ldconfig failed: {}", stderr.trim());
            String::new()
        }
        Err(e) => {
            tracing::warn!("ldconfig failed: {e}");
            String::new()
        }
    }
}

/// Resolve a `file[:tag]` package reference against the build context.
fn resolve_package(context_dir: &Path, package: &str) -> String {
    let (file, tag) = match package.split_once(':') {
        Some((file, tag)) => (file, Some(tag)),
        None => (package, None),
    };
    let path = if Path::new(file).is_absolute() {
        PathBuf::from(file)
    } else {
        context_dir.join(file)
    };
    match tag {
        Some(tag) => format!("{}:{}", path.display(), tag),
        None => path.display().to_string(),
    }
}

/// Unpack the spec's package image and carve the requested paths into
/// `output_dir` with their dependency closures.
fn install_oci_package(
    spec: &mut ImageSpec,
    output_dir: &Path,
    opts: &BuildOptions,
) -> Result<()> {
    let package = resolve_package(&opts.context_dir, &spec.package);
    if package.starts_with("http://") || package.starts_with("https://") {
        return Err(SmithError::Config(
            "remote package sources are not supported".to_string(),
        ));
    }

    let image = image_from_file(&package)?;
    // pull the existing data out of the image
    set_defaults_from_image(spec, &image);

    let unpack = unpack_dir();
    if !opts.fast {
        tracing::debug!(path = %unpack.display(), "removing unpack directory");
        if unpack.exists() {
            std::fs::remove_dir_all(&unpack)?;
        }
    }

    // only unpack if the directory doesn't already exist
    if !unpack.exists() {
        std::fs::create_dir_all(&unpack)?;
        extract_oci(&image, &unpack)?;
    }

    let cache = LdCache::parse(&ldconfig_output(&unpack), Vec::new());
    copy_tree(
        &cache,
        &unpack,
        output_dir,
        &spec.paths,
        &spec.excludes,
        CopyOptions {
            nss: spec.nss,
            follow: true,
            chroot: true,
        },
    )
}

/// Build an image layer from the staged rootfs, reusing parent layers.
fn image_from_build(spec: &mut ImageSpec, base_dir: &Path) -> Result<Image> {
    let mut image = if spec.parent.is_empty() {
        Image::default()
    } else {
        let parent = resolve_package(base_dir, &spec.parent);
        let parent_image = image_from_file(&parent)?;
        set_defaults_from_image(spec, &parent_image);
        parent_image
    };
    image.config = config_from_spec(spec);

    let id = parse_user(&spec.user);
    let layer = layer_from_path(&base_dir.join(ROOTFS), id.uid as u64, id.gid as u64)?;
    let duplicate = image.layers.iter().any(|l| l.diff_id == layer.diff_id);
    if duplicate {
        tracing::info!(diff_id = %layer.diff_id, "layer already exists in parent");
    } else {
        image.layers.push(layer);
    }
    Ok(image)
}

/// Run a complete build and write the image to `out_path`.
///
/// The spec is normalized in place (package defaults merged in) so the
/// copy attached to the image records what was actually built.
pub fn build_image(spec: &mut ImageSpec, out_path: &Path, opts: &BuildOptions) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let build_dir = tempfile::Builder::new()
        .prefix("smith-build-")
        .tempdir()?;
    // the package sandbox may run as another uid
    std::fs::set_permissions(build_dir.path(), std::fs::Permissions::from_mode(0o777))?;
    tracing::info!(path = %build_dir.path().display(), "building");

    let output_dir = rootfs_dir(build_dir.path())?;

    let nss_needed = populate_nss(&output_dir, &spec.user, &spec.groups, spec.nss)?;
    // force nss on if named users or groups were specified
    if nss_needed {
        spec.nss = true;
    }

    if !spec.package.is_empty() {
        tracing::info!(package = %spec.package, "installing package");
        match spec.kind {
            Some(smith_core::spec::PackageType::Oci) => {
                install_oci_package(spec, &output_dir, opts)?
            }
            None if is_oci(&spec.package) => install_oci_package(spec, &output_dir, opts)?,
            None => {
                return Err(SmithError::Config(format!(
                    "package type of {} not recognized",
                    spec.package
                )))
            }
        }
    }

    for mount in &spec.mounts {
        std::fs::create_dir_all(crate::ldcache::rebase(&output_dir, Path::new(mount)))?;
    }

    // build metadata and the normalized spec ride along as extra blobs
    let mut metadata = ImageMetadata::now();
    metadata.build_no = opts.build_no.clone();
    if let Ok(hostname) = nix::unistd::gethostname() {
        metadata.build_host = hostname.to_string_lossy().into_owned();
    }
    let extra_blobs = vec![OpaqueBlob {
        media_type: media_types::SMITH_SPEC.to_string(),
        content: spec.to_json()?,
    }];

    // overlay local files over the staged rootfs
    tracing::info!("performing overlay");
    let mut files = vec![ROOTFS.to_string()];
    if !spec.parent.is_empty() {
        let parent_file = spec.parent.split(':').next().unwrap_or_default();
        files.push(parent_file.to_string());
    }
    let cache = LdCache::parse("", Vec::new());
    copy_tree(
        &cache,
        &opts.context_dir,
        build_dir.path(),
        &files,
        &[],
        CopyOptions {
            nss: spec.nss,
            follow: false,
            chroot: false,
        },
    )?;

    tracing::info!(path = %out_path.display(), "packing image");
    let mut image = image_from_build(spec, build_dir.path())?;
    image.additional_blobs = extra_blobs;
    image.metadata = Some(metadata);
    write_oci_targz(&image, out_path, opts.docker)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_is_oci() {
        assert!(is_oci("https://registry.example.com/v2/thing"));
        assert!(is_oci("base.tar.gz"));
        assert!(is_oci("base.tar.gz:latest"));
        assert!(is_oci("base.tgz"));
        assert!(is_oci("dir/base.tar:v2"));
        assert!(!is_oci("coreutils"));
        assert!(!is_oci("coreutils-8.30.rpm"));
    }

    #[test]
    fn test_rootfs_dir_skeleton() {
        let tmp = TempDir::new().unwrap();
        let rootfs = rootfs_dir(tmp.path()).unwrap();
        assert_eq!(rootfs, tmp.path().join("rootfs"));
        for dir in ["dev", "read", "write", "run", "proc", "sys"] {
            assert!(rootfs.join(dir).is_dir(), "{dir} missing");
        }
    }

    #[test]
    fn test_config_from_spec_user() {
        let mut spec = ImageSpec::default();
        assert_eq!(config_from_spec(&spec).config.user, "10:10");

        spec.user = "alice:dev".to_string();
        assert_eq!(config_from_spec(&spec).config.user, "alice:dev");

        spec.root = true;
        assert_eq!(config_from_spec(&spec).config.user, "0:0");
    }

    #[test]
    fn test_config_from_spec_ports_and_mounts() {
        let spec = ImageSpec {
            ports: vec!["8080/tcp".to_string()],
            mounts: vec!["/data".to_string()],
            entrypoint: vec!["/bin/svc".to_string()],
            ..Default::default()
        };
        let config = config_from_spec(&spec);
        assert!(config.config.exposed_ports.contains_key("8080/tcp"));
        assert!(config.config.volumes.contains_key("/data"));
        assert_eq!(config.config.entrypoint, vec!["/bin/svc"]);
        assert_eq!(config.os, "linux");
    }

    #[test]
    fn test_set_defaults_from_image() {
        let mut image = Image::default();
        image.config.config = RuntimeConfig {
            working_dir: "/app".to_string(),
            entrypoint: vec!["/bin/app".to_string()],
            env: vec!["LANG=C".to_string()],
            ..Default::default()
        };
        image
            .config
            .config
            .exposed_ports
            .insert("80/tcp".to_string(), EmptyObject {});

        let mut spec = ImageSpec {
            cmd: vec!["--flag".to_string()],
            ..Default::default()
        };
        set_defaults_from_image(&mut spec, &image);
        assert_eq!(spec.dir, "/app");
        assert_eq!(spec.entrypoint, vec!["/bin/app"]);
        assert_eq!(spec.env, vec!["LANG=C"]);
        assert_eq!(spec.ports, vec!["80/tcp"]);
        // values the spec already set stay put
        assert_eq!(spec.cmd, vec!["--flag"]);
    }

    #[test]
    fn test_resolve_package() {
        let context = Path::new("/ctx");
        assert_eq!(resolve_package(context, "base.tar.gz"), "/ctx/base.tar.gz");
        assert_eq!(
            resolve_package(context, "base.tar.gz:v1"),
            "/ctx/base.tar.gz:v1"
        );
        assert_eq!(
            resolve_package(context, "/abs/base.tar.gz:v1"),
            "/abs/base.tar.gz:v1"
        );
    }

    #[test]
    fn test_image_from_build_no_parent() {
        let tmp = TempDir::new().unwrap();
        let rootfs = rootfs_dir(tmp.path()).unwrap();
        std::fs::write(rootfs.join("write/hello"), "hi").unwrap();

        let mut spec = ImageSpec {
            cmd: vec!["/bin/true".to_string()],
            ..Default::default()
        };
        let image = image_from_build(&mut spec, tmp.path()).unwrap();
        assert_eq!(image.layers.len(), 1);
        assert_eq!(image.config.config.cmd, vec!["/bin/true"]);
        assert_eq!(image.config.config.user, "10:10");
    }

    #[test]
    fn test_image_from_build_parent_layer_dedupe() {
        // stage a parent whose single layer matches the child rootfs
        let parent_tree = TempDir::new().unwrap();
        std::fs::write(parent_tree.path().join("same"), "content").unwrap();
        let parent_layer = layer_from_path(parent_tree.path(), 10, 10).unwrap();
        let parent = Image {
            config: config_from_spec(&ImageSpec::default()),
            layers: vec![parent_layer],
            additional_blobs: Vec::new(),
            metadata: Some(ImageMetadata::now()),
        };

        let build = TempDir::new().unwrap();
        write_oci_targz(&parent, &build.path().join("parent.tar.gz"), false).unwrap();
        std::fs::create_dir_all(build.path().join("rootfs")).unwrap();
        std::fs::write(build.path().join("rootfs/same"), "content").unwrap();

        let mut spec = ImageSpec {
            parent: "parent.tar.gz".to_string(),
            user: "10:10".to_string(),
            ..Default::default()
        };
        let image = image_from_build(&mut spec, build.path()).unwrap();
        // the identical layer is not duplicated
        assert_eq!(image.layers.len(), 1);
    }
}
