//! Randomized working-tree paths and traversal-safe path resolution.
//!
//! Every repository gets a randomized directory under the scratch root, so a
//! request can never predict (or collide with) another repository's tree.
//! The mapping from canonical URL to path lives for the process lifetime and
//! is rebuilt from disk by the startup scan.

use anyhow::Result;
use dashmap::DashMap;
use std::path::{Component, Path, PathBuf};
use uuid::Uuid;

use crate::core::RenderError;

/// Process-lifetime mapping from a canonical key (normalized URL) to a
/// randomized directory under the scratch root.
pub struct RandomizedTempPaths {
    root: PathBuf,
    paths: DashMap<String, PathBuf>,
}

impl RandomizedTempPaths {
    /// Creates an empty mapping rooted at `root`.
    #[must_use]
    pub fn new(root: PathBuf) -> Self {
        Self { root, paths: DashMap::new() }
    }

    /// The scratch root all paths live under.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Registers an existing directory for a key (startup scan).
    pub fn add(&self, key: &str, path: PathBuf) {
        self.paths.insert(key.to_string(), path);
    }

    /// The directory for a key, if one has been assigned.
    #[must_use]
    pub fn get_if_exists(&self, key: &str) -> Option<PathBuf> {
        self.paths.get(key).map(|entry| entry.value().clone())
    }

    /// The directory for a key, assigning a fresh randomized one on first
    /// use.
    #[must_use]
    pub fn get_or_create(&self, key: &str) -> PathBuf {
        self.paths
            .entry(key.to_string())
            .or_insert_with(|| self.root.join(Uuid::new_v4().to_string()))
            .value()
            .clone()
    }

    /// All assigned directories, for path redaction.
    #[must_use]
    pub fn all_paths(&self) -> Vec<PathBuf> {
        self.paths.iter().map(|entry| entry.value().clone()).collect()
    }
}

/// Lexically normalizes a path, resolving `.` and `..` without touching the
/// filesystem. Leading `..` components that would climb above the root of
/// the path are dropped.
#[must_use]
pub fn normalize_lexically(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other),
        }
    }
    normalized
}

/// Resolves the application path inside an acquired tree.
///
/// The returned path is guaranteed to stay inside `root`; requests carrying
/// `..` escapes or absolute paths fail.
pub fn app_path(root: &Path, rel: &str) -> Result<PathBuf> {
    let rel = rel.trim();
    if rel.is_empty() || rel == "." {
        return Ok(root.to_path_buf());
    }
    if Path::new(rel).is_absolute() {
        return Err(RenderError::PathOutsideRepository { path: rel.to_string() }.into());
    }
    let joined = normalize_lexically(&root.join(rel));
    if !joined.starts_with(root) {
        return Err(RenderError::PathOutsideRepository { path: rel.to_string() }.into());
    }
    Ok(joined)
}

/// Resolves a file or directory path relative to `base`, constrained to stay
/// inside `root`. Used for value files and script library directories.
pub fn resolve_within(root: &Path, base: &Path, rel: &str) -> Result<PathBuf> {
    let candidate = if Path::new(rel).is_absolute() {
        // Absolute-style paths are interpreted relative to the tree root.
        normalize_lexically(&root.join(rel.trim_start_matches('/')))
    } else {
        normalize_lexically(&base.join(rel))
    };
    if !candidate.starts_with(root) {
        return Err(RenderError::PathOutsideRepository { path: rel.to_string() }.into());
    }
    Ok(candidate)
}

/// Whether a raw value-file string is a remote URL with one of the allowed
/// schemes. Returns an error for URLs with a disallowed scheme.
pub fn remote_value_file(raw: &str, allowed_schemes: &[String]) -> Result<Option<String>> {
    let Some((scheme, rest)) = raw.split_once("://") else {
        return Ok(None);
    };
    if scheme.is_empty() || rest.is_empty() || !scheme.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Ok(None);
    }
    if allowed_schemes.iter().any(|allowed| allowed.eq_ignore_ascii_case(scheme)) {
        Ok(Some(raw.to_string()))
    } else {
        anyhow::bail!("value file {raw:?} has scheme {scheme:?} which is not allowed")
    }
}
