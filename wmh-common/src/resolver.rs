//! PathResolver: single-file template lookups and relative symlink farms
//!
//! A lookup substitutes placeholders, then glob-expands. More than one match
//! is always fatal (`AmbiguousMatch`), whatever the caller's tolerance for
//! empty results. Picking the first match would silently mix runs or
//! acquisitions.

use crate::template::{Bindings, PathTemplate};
use crate::{Error, Result};
use std::path::{Component, Path, PathBuf};
use tracing::debug;

/// Whether zero matches is an error or a meaningful "absent"
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnEmpty {
    Raise,
    Allow,
}

/// Resolves templates relative to a filesystem root
#[derive(Debug, Clone)]
pub struct PathResolver {
    root: PathBuf,
}

impl PathResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Render a template under the root without touching the filesystem
    pub fn format(&self, template: &PathTemplate, bindings: &Bindings<'_>) -> Result<PathBuf> {
        Ok(self.root.join(template.render(bindings)?))
    }

    /// Resolve a template to exactly one existing file
    ///
    /// Returns `Ok(None)` only for zero matches with [`OnEmpty::Allow`].
    pub fn resolve(
        &self,
        template: &PathTemplate,
        bindings: &Bindings<'_>,
        on_empty: OnEmpty,
    ) -> Result<Option<PathBuf>> {
        let pattern = self.format(template, bindings)?;
        let pattern = pattern.to_string_lossy().into_owned();
        let mut matches = glob_sorted(&pattern)?;

        debug!(pattern = %pattern, matches = matches.len(), "Resolved template");

        match matches.len() {
            0 => match on_empty {
                OnEmpty::Raise => Err(Error::MissingFile(PathBuf::from(pattern))),
                OnEmpty::Allow => Ok(None),
            },
            1 => Ok(matches.pop()),
            _ => Err(Error::AmbiguousMatch { pattern, matches }),
        }
    }

    /// Resolve a template that must match; shorthand for [`OnEmpty::Raise`]
    pub fn resolve_one(&self, template: &PathTemplate, bindings: &Bindings<'_>) -> Result<PathBuf> {
        self.resolve(template, bindings, OnEmpty::Raise)?
            .ok_or_else(|| Error::MissingFile(self.root.join(template.as_str())))
    }

    /// Link `dest` (rendered under `dest_root`) to the resolved source
    ///
    /// The link is relative to the destination's parent directory. An existing
    /// destination is an error; callers wanting idempotent re-runs remove it
    /// first. Returns the created link, or `None` when the source is absent and
    /// `on_empty` allows it.
    pub fn link(
        &self,
        source: &PathTemplate,
        dest_root: &Path,
        dest: &PathTemplate,
        bindings: &Bindings<'_>,
        on_empty: OnEmpty,
    ) -> Result<Option<PathBuf>> {
        let Some(src) = self.resolve(source, bindings, on_empty)? else {
            return Ok(None);
        };
        let dest = dest_root.join(dest.render(bindings)?);
        create_relative_symlink(&src, &dest)?;
        Ok(Some(dest))
    }
}

/// Expand a glob pattern into a sorted list of existing paths
pub fn glob_sorted(pattern: &str) -> Result<Vec<PathBuf>> {
    let paths = glob::glob(pattern)
        .map_err(|e| Error::Template(format!("invalid glob '{pattern}': {e}")))?;
    let mut out = Vec::new();
    for entry in paths {
        match entry {
            Ok(path) => out.push(path),
            Err(e) => return Err(Error::Io(e.into_error())),
        }
    }
    out.sort();
    Ok(out)
}

/// Create `dest` as a symlink pointing at `src` by a path relative to `dest`'s directory
pub fn create_relative_symlink(src: &Path, dest: &Path) -> Result<()> {
    let parent = dest
        .parent()
        .ok_or_else(|| Error::InvalidInput(format!("link destination has no parent: {}", dest.display())))?;
    std::fs::create_dir_all(parent)?;

    let target = relative_path(&absolute(src)?, &absolute(parent)?);
    debug!(link = %dest.display(), target = %target.display(), "Creating symlink");
    symlink(&target, dest)?;
    Ok(())
}

#[cfg(unix)]
fn symlink(target: &Path, link: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(windows)]
fn symlink(target: &Path, link: &Path) -> std::io::Result<()> {
    std::os::windows::fs::symlink_file(target, link)
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(normalize(path))
    } else {
        Ok(normalize(&std::env::current_dir()?.join(path)))
    }
}

/// Lexically remove `.` and `..` components
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Path from `base` to `target`; both absolute and normalized
fn relative_path(target: &Path, base: &Path) -> PathBuf {
    let target: Vec<_> = target.components().collect();
    let base: Vec<_> = base.components().collect();
    let common = target
        .iter()
        .zip(base.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut out = PathBuf::new();
    for _ in common..base.len() {
        out.push("..");
    }
    for component in &target[common..] {
        out.push(component.as_os_str());
    }
    out
}
