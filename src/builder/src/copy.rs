//! Tree copying with dependency closure.
//!
//! Walks glob-selected paths under a base directory into an output
//! tree. In follow mode every traversed symlink is mirrored into the
//! output, and every executable's shared-library closure is pulled in
//! by feeding the dependency walker's results back into the work
//! queue.

use std::collections::{HashSet, VecDeque};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use smith_core::{Result, SmithError};

use crate::deps::deps;
use crate::ldcache::{rebase, LdCache};
use crate::symlink::{ensure_symlink, walk_and_copy_symlinks};

/// Behavior switches for [`copy_tree`].
#[derive(Debug, Clone, Copy, Default)]
pub struct CopyOptions {
    /// Inject NSS libraries into every dependency walk.
    pub nss: bool,
    /// Follow symlinks (mirroring them) and pull in dependencies of
    /// executables. Without this, symlinks are reproduced verbatim and
    /// no dependency discovery happens.
    pub follow: bool,
    /// Treat `base` as a chroot: dependency paths and symlink targets
    /// are interpreted relative to it.
    pub chroot: bool,
}

/// Copy the paths matching `globs` from `base` into `output`.
///
/// Globs are shell-style and relative to `base`; absolute patterns are
/// rebased. An empty include list means everything. `excludes` are
/// expanded once up front and checked against base-relative paths.
pub fn copy_tree(
    cache: &LdCache,
    base: &Path,
    output: &Path,
    globs: &[String],
    excludes: &[String],
    opts: CopyOptions,
) -> Result<()> {
    let chroot = if opts.chroot {
        base.to_path_buf()
    } else {
        PathBuf::new()
    };

    let mut excluded = HashSet::new();
    for pattern in excludes {
        if pattern.is_empty() {
            continue;
        }
        for path in expand_glob(base, pattern)? {
            if let Ok(rel) = path.strip_prefix(base) {
                excluded.insert(rel.to_path_buf());
            }
        }
    }

    let all = ["*".to_string()];
    let globs: &[String] = if globs.is_empty() { &all } else { globs };

    let mut copier = Copier {
        cache,
        base,
        output,
        chroot: &chroot,
        excluded,
        opts,
        queue: VecDeque::new(),
        visited: HashSet::new(),
    };

    for pattern in globs {
        if pattern.is_empty() {
            continue;
        }
        for path in expand_glob(base, pattern)? {
            copier.push(path);
        }
    }
    copier.run()
}

/// Expand a shell glob under `base`, rebasing absolute patterns.
fn expand_glob(base: &Path, pattern: &str) -> Result<Vec<PathBuf>> {
    let relative = pattern.trim_start_matches('/');
    let full = format!("{}/{}", glob::Pattern::escape(&base.to_string_lossy()), relative);
    let paths = glob::glob(&full)
        .map_err(|e| SmithError::Config(format!("illegal glob pattern {pattern}: {e}")))?;
    let mut out = Vec::new();
    for entry in paths {
        match entry {
            Ok(path) => out.push(path),
            Err(e) => return Err(SmithError::Io(e.into_error())),
        }
    }
    Ok(out)
}

struct Copier<'a> {
    cache: &'a LdCache,
    base: &'a Path,
    output: &'a Path,
    chroot: &'a Path,
    excluded: HashSet<PathBuf>,
    opts: CopyOptions,
    queue: VecDeque<PathBuf>,
    visited: HashSet<PathBuf>,
}

impl<'a> Copier<'a> {
    fn push(&mut self, root: PathBuf) {
        if self.visited.insert(root.clone()) {
            self.queue.push_back(root);
        }
    }

    fn run(&mut self) -> Result<()> {
        while let Some(root) = self.queue.pop_front() {
            self.walk(&root)?;
        }
        Ok(())
    }

    /// Depth-first walk from `root`, children in name order. Like the
    /// walk in a plain `find`, symlinked directories are not descended
    /// into; the node itself is still processed.
    fn walk(&mut self, root: &Path) -> Result<()> {
        let mut stack = vec![root.to_path_buf()];
        while let Some(path) = stack.pop() {
            let meta = match std::fs::symlink_metadata(&path) {
                Ok(meta) => Some(meta),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound && self.opts.follow => {
                    // the symlink walker may still find it
                    None
                }
                Err(e) => return Err(e.into()),
            };
            if let Some(meta) = &meta {
                if meta.is_dir() {
                    let mut children: Vec<PathBuf> = std::fs::read_dir(&path)?
                        .collect::<std::io::Result<Vec<_>>>()?
                        .into_iter()
                        .map(|e| e.path())
                        .collect();
                    children.sort();
                    // reversed so the stack pops them in name order
                    for child in children.into_iter().rev() {
                        stack.push(child);
                    }
                }
            }
            self.visit(path, meta)?;
        }
        Ok(())
    }

    fn rel(&self, path: &Path) -> PathBuf {
        path.strip_prefix(self.base)
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|_| path.to_path_buf())
    }

    fn visit(&mut self, path: PathBuf, meta: Option<std::fs::Metadata>) -> Result<()> {
        let mut path = path;
        let mut rel = self.rel(&path);
        if self.excluded.contains(&rel) {
            return Ok(());
        }

        let mut meta = meta;
        if self.opts.follow {
            // NOTE: directory symlinks will not be excluded by excludes
            let resolved = match walk_and_copy_symlinks(self.chroot, self.output, &path) {
                Ok(resolved) => resolved,
                Err(e) if e.is_not_found() => {
                    tracing::debug!(path = %path.display(), "skipping dangling link");
                    return Ok(());
                }
                Err(e) => return Err(e),
            };
            if resolved != path {
                rel = self.rel(&resolved);
                if self.excluded.contains(&rel) {
                    return Ok(());
                }
                path = resolved;
                meta = Some(std::fs::symlink_metadata(&path)?);
            }
        }
        let meta = match meta {
            Some(meta) => meta,
            // only reachable when follow resolved nothing new for a
            // path that never existed
            None => return Ok(()),
        };

        let rel_stripped = rel
            .strip_prefix("/")
            .map(|p| p.to_path_buf())
            .unwrap_or(rel);
        let outpath = self.output.join(&rel_stripped);
        if outpath.exists() {
            if self.opts.follow || meta.is_dir() {
                tracing::debug!(path = %outpath.display(), "path already exists");
                return Ok(());
            }
            tracing::debug!(path = %outpath.display(), "overwriting");
            remove_any(&outpath)?;
        }

        let parent = if meta.is_dir() {
            outpath.as_path()
        } else {
            outpath.parent().unwrap_or(self.output)
        };
        std::fs::create_dir_all(parent)?;
        if meta.is_dir() {
            return Ok(());
        }

        if meta.file_type().is_symlink() {
            // only happens when follow is off
            let dest = std::fs::read_link(&path)?;
            return ensure_symlink(&dest, &outpath);
        }

        tracing::debug!(
            from = %path.display(),
            to = %outpath.display(),
            "copying file"
        );
        copy_file(&path, &outpath)?;

        if meta.permissions().mode() & 0o100 != 0 {
            // executable
            std::fs::set_permissions(&outpath, std::fs::Permissions::from_mode(0o755))?;
            if self.opts.follow {
                for dep in deps(self.cache, self.chroot, &path, self.opts.nss)? {
                    tracing::debug!(dep = %dep.display(), "walking dependency");
                    let dep = if dep.is_absolute() {
                        rebase(self.chroot, &dep)
                    } else {
                        path.parent().unwrap_or(Path::new("/")).join(dep)
                    };
                    self.push(dep);
                }
            }
        }
        Ok(())
    }
}

/// Remove whatever sits at `path`, file or tree.
fn remove_any(path: &Path) -> Result<()> {
    let meta = std::fs::symlink_metadata(path)?;
    if meta.is_dir() {
        std::fs::remove_dir_all(path)?;
    } else {
        std::fs::remove_file(path)?;
    }
    Ok(())
}

/// Hard-link `src` to `dst`, falling back to a byte copy when linking
/// isn't possible (different filesystems, for one).
fn copy_file(src: &Path, dst: &Path) -> Result<()> {
    if std::fs::hard_link(src, dst).is_ok() {
        return Ok(());
    }
    std::fs::copy(src, dst)?;
    Ok(())
}
