//! Shared-library name resolution.
//!
//! The loader cache is queried once per build (`ldconfig -v -N -X` run
//! against the source root by the driver) and its text output parsed
//! into an immutable soname → path snapshot. The dependency walker only
//! ever reads the snapshot.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Directories searched when the loader cache has no answer, as on
/// distributions that ship no useful cache at all.
const FALLBACK_DIRS: &[&str] = &["/lib", "/usr/lib", "/usr/local/lib"];

/// An immutable snapshot of the loader cache.
#[derive(Debug, Clone, Default)]
pub struct LdCache {
    map: HashMap<String, PathBuf>,
    preload: Vec<String>,
}

impl LdCache {
    /// Parse verbose `ldconfig` output.
    ///
    /// Lines of the form `/dir:` set the current directory (a `.so`
    /// suffix on the directory is resolved by taking its parent);
    /// indented `soname -> target` lines map the soname into that
    /// directory. The soname side is kept so the symlink the loader
    /// resolves through stays in the image. First write wins.
    ///
    /// `preload` paths are consulted before RUNPATH paths on every
    /// lookup.
    pub fn parse(ldconfig_out: &str, preload: Vec<String>) -> Self {
        let mut map = HashMap::new();
        let mut dir = PathBuf::new();
        for line in ldconfig_out.lines() {
            if line.is_empty() {
                continue;
            }
            if line.starts_with('/') {
                if let Some(colon) = line.find(':') {
                    let mut path = PathBuf::from(&line[..colon]);
                    if path.extension().is_some_and(|e| e == "so") {
                        path = path.parent().unwrap_or(Path::new("/")).to_path_buf();
                    }
                    dir = path;
                    continue;
                }
            }
            if let Some((source, _target)) = line.split_once("->") {
                let source = source.trim();
                if !source.is_empty() && !map.contains_key(source) {
                    map.insert(source.to_string(), dir.join(source));
                }
            }
        }
        LdCache { map, preload }
    }

    /// Extra search paths consulted before RUNPATH paths.
    pub fn preload_paths(&self) -> &[String] {
        &self.preload
    }

    /// Resolve a soname to an absolute path inside `chroot`.
    ///
    /// Lookup order: `extra_paths` (stat under the chroot), the cache
    /// map, then the fallback directories. Returns the path *without*
    /// the chroot prefix, or `None` when nothing matched.
    pub fn find_library(
        &self,
        library: &str,
        chroot: &Path,
        extra_paths: &[String],
    ) -> Option<PathBuf> {
        for path in extra_paths {
            let full = crate::symlink::clean_path(&format!("{}/{}", path, library));
            if stat_in_chroot(chroot, &full) {
                return Some(full);
            }
        }

        if let Some(full) = self.map.get(library) {
            return Some(full.clone());
        }

        // ldconfig may not have given us anything to look up (alpine),
        // so manually search the common locations
        for dir in FALLBACK_DIRS {
            let full = crate::symlink::clean_path(&format!("{}/{}", dir, library));
            tracing::debug!(path = %full.display(), "checking for library");
            if stat_in_chroot(chroot, &full) {
                return Some(full);
            }
        }
        None
    }
}

/// lstat `path` rebased under `chroot`.
fn stat_in_chroot(chroot: &Path, path: &Path) -> bool {
    let joined = rebase(chroot, path);
    std::fs::symlink_metadata(joined).is_ok()
}

/// Join an absolute in-chroot path onto the chroot directory.
pub(crate) fn rebase(chroot: &Path, path: &Path) -> PathBuf {
    match path.strip_prefix("/") {
        Ok(rel) => chroot.join(rel),
        Err(_) => chroot.join(path),
    }
}
