//! Checksum manifests for directory trees
//!
//! A manifest maps every regular file under a root, by `/`-separated
//! relative path, to its content hash. Symlinks are not followed.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use tether_document::ContentHash;
use walkdir::WalkDir;

use crate::error::StoreError;

/// Relative path → content hash
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeManifest {
    /// Tracked files
    pub files: BTreeMap<String, ContentHash>,
}

impl TreeManifest {
    /// Empty manifest
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Hash every regular file under `root`
    ///
    /// A missing root yields an empty manifest.
    ///
    /// # Errors
    /// Returns `StoreError::Io` if a file cannot be read
    pub fn scan(root: &Path) -> Result<Self, StoreError> {
        let mut files = BTreeMap::new();
        if !root.exists() {
            return Ok(Self { files });
        }
        for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
            let entry = entry.map_err(|e| {
                let path = e.path().map_or_else(|| root.to_path_buf(), Path::to_path_buf);
                StoreError::io("walk tree", path, e.into())
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = relative_key(root, entry.path())?;
            let file =
                File::open(entry.path()).map_err(|e| StoreError::io("open", entry.path(), e))?;
            let hash = ContentHash::compute_reader(file)
                .map_err(|e| StoreError::io("hash", entry.path(), e))?;
            files.insert(relative, hash);
        }
        Ok(Self { files })
    }

    /// Number of tracked files
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// True if no files are tracked
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Hash for a relative path
    #[must_use]
    pub fn get(&self, relative: &str) -> Option<&ContentHash> {
        self.files.get(relative)
    }

    /// Record a file hash
    pub fn insert(&mut self, relative: impl Into<String>, hash: ContentHash) {
        self.files.insert(relative.into(), hash);
    }

    /// Differences going from `self` to `other`
    #[must_use]
    pub fn diff(&self, other: &TreeManifest) -> ManifestDiff {
        let mut diff = ManifestDiff::default();
        for (path, hash) in &self.files {
            match other.files.get(path) {
                None => diff.removed.push(path.clone()),
                Some(h) if h != hash => diff.changed.push(path.clone()),
                Some(_) => {}
            }
        }
        for path in other.files.keys() {
            if !self.files.contains_key(path) {
                diff.added.push(path.clone());
            }
        }
        diff
    }
}

/// Differences between two manifests
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ManifestDiff {
    /// Present only in the newer manifest
    pub added: Vec<String>,
    /// Present only in the older manifest
    pub removed: Vec<String>,
    /// Present in both with different hashes
    pub changed: Vec<String>,
}

impl ManifestDiff {
    /// True if the manifests match
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

impl std::fmt::Display for ManifestDiff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for p in &self.added {
            writeln!(f, "+ {p}")?;
        }
        for p in &self.removed {
            writeln!(f, "- {p}")?;
        }
        for p in &self.changed {
            writeln!(f, "~ {p}")?;
        }
        Ok(())
    }
}

/// `/`-separated key for `path` relative to `root`
pub(crate) fn relative_key(root: &Path, path: &Path) -> Result<String, StoreError> {
    let relative = path
        .strip_prefix(root)
        .map_err(|_| StoreError::OutsideTree(path.display().to_string()))?;
    let mut parts = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            _ => return Err(StoreError::OutsideTree(path.display().to_string())),
        }
    }
    Ok(parts.join("/"))
}

/// Filesystem path for a manifest key under `root`
///
/// # Errors
/// Returns `StoreError::OutsideTree` for keys with `..`, absolute parts or
/// empty segments
pub fn resolve_key(root: &Path, key: &str) -> Result<PathBuf, StoreError> {
    let mut out = root.to_path_buf();
    for part in key.split('/') {
        if part.is_empty() || part == "." || part == ".." || part.contains('\\') {
            return Err(StoreError::OutsideTree(key.to_string()));
        }
        out.push(part);
    }
    Ok(out)
}
