//! Transitive shared-library dependency discovery.
//!
//! Given an ELF entry point inside a chroot, finds the libraries named
//! by its dynamic section, the loader from `.interp`, and optionally
//! the NSS modules glibc loads by name at runtime. The tree copier
//! drives this per executable and walks whatever comes back.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use smith_core::Result;

use crate::elf;
use crate::ldcache::LdCache;

/// NSS modules loaded by name, invisible to `DT_NEEDED`.
const NSS_LIBRARIES: &[&str] = &[
    "libnss_dns.so.2",
    "libnss_files.so.2",
    "libnss_compat.so.2",
];

/// Build the resolver search paths for one ELF: preload paths first,
/// then `DT_RUNPATH` (or `DT_RPATH` when RUNPATH is absent) split on
/// `:` with `$ORIGIN` replaced by the ELF's own directory.
fn search_paths(info: &elf::ElfInfo, preload: &[String], origin: &str) -> Vec<String> {
    let mut paths: Vec<String> = preload.to_vec();
    let runpath = info.runpath.as_deref().or(info.rpath.as_deref());
    if let Some(runpath) = runpath {
        let fixed = runpath.replace("$ORIGIN", origin);
        paths.extend(fixed.split(':').map(|s| s.to_string()));
    }
    paths
}

/// Find the direct dependencies of the ELF at `path`.
///
/// Returned paths are absolute inside `chroot` but do not carry the
/// chroot prefix. Non-ELF files produce an empty set. A library that
/// cannot be located is logged and left out so the build can continue.
pub fn deps(
    cache: &LdCache,
    chroot: &Path,
    path: &Path,
    nss: bool,
) -> Result<BTreeSet<PathBuf>> {
    let mut result = BTreeSet::new();
    let info = match elf::inspect(path)? {
        Some(info) => info,
        None => return Ok(result),
    };

    let short_path = strip_chroot(chroot, path);
    let origin = short_path
        .parent()
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_default();
    let paths = search_paths(&info, cache.preload_paths(), &origin);

    if nss {
        for name in NSS_LIBRARIES {
            if let Some(full) = cache.find_library(name, chroot, &paths) {
                tracing::debug!(
                    elf = %short_path.display(),
                    library = %full.display(),
                    "adding nss library"
                );
                result.insert(full);
            }
        }
    }

    for need in &info.needed {
        match cache.find_library(need, chroot, &paths) {
            Some(full) => {
                tracing::debug!(
                    elf = %short_path.display(),
                    library = %full.display(),
                    "depends on library"
                );
                result.insert(full);
            }
            None => {
                tracing::warn!(
                    library = %need,
                    elf = %short_path.display(),
                    "unable to locate library"
                );
            }
        }
    }

    if let Some(interp) = &info.interp {
        tracing::debug!(elf = %short_path.display(), interp = %interp, "uses interpreter");
        result.insert(PathBuf::from(interp));
    }

    Ok(result)
}

/// Strip the chroot prefix, keeping the leading slash of the inner path.
fn strip_chroot(chroot: &Path, path: &Path) -> PathBuf {
    match path.strip_prefix(chroot) {
        Ok(rel) => Path::new("/").join(rel),
        Err(_) => path.to_path_buf(),
    }
}
