//! Symlink-chasing path resolution.
//!
//! Canonicalizes a path rooted in a chroot while reproducing every
//! symlink it traverses in the output tree, so the copied image keeps
//! the same link structure the loader will walk at runtime.

use std::path::{Path, PathBuf};

use smith_core::{Result, SmithError};

/// Upper bound on symlink expansions before giving up on a cycle.
const MAX_ITERATIONS: u32 = 255;

/// Lexically normalize a slash-separated path: collapse `//` and `.`,
/// resolve `..` where possible.
pub(crate) fn clean_path(path: &str) -> PathBuf {
    let absolute = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();
    for comp in path.split('/') {
        match comp {
            "" | "." => {}
            ".." => {
                if parts.last().is_some_and(|p| *p != "..") {
                    parts.pop();
                } else if !absolute {
                    parts.push("..");
                }
            }
            other => parts.push(other),
        }
    }
    let joined = parts.join("/");
    if absolute {
        PathBuf::from(format!("/{joined}"))
    } else if joined.is_empty() {
        PathBuf::from(".")
    } else {
        PathBuf::from(joined)
    }
}

/// Create `source` as a symlink to `dest`, creating parent directories.
///
/// An already existing symlink with the same target is accepted; a
/// different target or a non-symlink in the way is an error.
pub fn ensure_symlink(dest: &Path, source: &Path) -> Result<()> {
    if let Some(parent) = source.parent() {
        std::fs::create_dir_all(parent)?;
    }
    match std::os::unix::fs::symlink(dest, source) {
        Ok(()) => {
            tracing::debug!(
                source = %source.display(),
                dest = %dest.display(),
                "symlink created"
            );
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            let meta = std::fs::symlink_metadata(source)?;
            if !meta.file_type().is_symlink() {
                return Err(SmithError::Other(format!(
                    "cannot create symlink at {}: a non-symlink is in the way",
                    source.display()
                )));
            }
            let existing = std::fs::read_link(source)?;
            if existing != dest {
                return Err(SmithError::Other(format!(
                    "symlink {} already exists, but it points to {} instead of {}",
                    source.display(),
                    existing.display(),
                    dest.display()
                )));
            }
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Canonicalize `path` within `chroot`, materializing each traversed
/// symlink at the corresponding location under `output`.
///
/// The path is consumed one leading component at a time; components
/// that turn out to be symlinks have their target spliced back onto
/// the remaining path, and an absolute target resets resolution to the
/// chroot. Returns the fully resolved path.
pub fn walk_and_copy_symlinks(chroot: &Path, output: &Path, path: &Path) -> Result<PathBuf> {
    let original = path.to_string_lossy().into_owned();
    let chroot_str = chroot.to_string_lossy().into_owned();
    let mut rest = original.clone();
    let mut resolved = String::new();

    let mut iterations = 0u32;
    while !rest.is_empty() {
        iterations += 1;
        if iterations > MAX_ITERATIONS {
            return Err(SmithError::Other(format!(
                "too many links in {original}"
            )));
        }

        // take the frontmost component off rest
        let component = match rest.find('/') {
            Some(i) => {
                let c = rest[..i].to_string();
                rest = rest[i + 1..].to_string();
                c
            }
            None => std::mem::take(&mut rest),
        };
        if component.is_empty() {
            if resolved.is_empty() {
                // must be an absolute path
                resolved.push('/');
            }
            continue;
        }

        let current = format!("{resolved}{component}");
        let meta = std::fs::symlink_metadata(&current)?;
        if !meta.file_type().is_symlink() {
            resolved.push_str(&component);
            if !rest.is_empty() {
                resolved.push('/');
            }
            continue;
        }

        let dest = std::fs::read_link(&current)?;
        tracing::debug!(link = %current, target = %dest.display(), "traversing symlink");

        let stripped = current
            .strip_prefix(chroot_str.as_str())
            .unwrap_or(current.as_str())
            .trim_start_matches('/');
        ensure_symlink(&dest, &output.join(stripped))?;

        if dest.is_absolute() {
            resolved.clear();
            resolved.push_str(&chroot_str);
            resolved.push('/');
        }
        rest = if rest.is_empty() {
            dest.to_string_lossy().into_owned()
        } else {
            format!("{}/{}", dest.to_string_lossy(), rest)
        };
    }

    Ok(clean_path(&resolved))
}
