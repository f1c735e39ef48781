//! Atomic file replacement
//!
//! Readers observe either the old contents or the new contents of a path,
//! never a partial write: data goes to a temp file in the same directory,
//! is fsynced, then renamed over the target, and the directory is fsynced
//! to make the rename durable.

use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use crate::error::StoreError;

/// Replace `path` with `data` atomically
///
/// Creates the parent directory if needed.
///
/// # Errors
/// - `StoreError::NoParentDirectory` if `path` has no parent
/// - `StoreError::Io` if any filesystem step fails; `path` is untouched
pub fn atomic_write(path: &Path, data: &[u8]) -> Result<(), StoreError> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    if path.file_name().is_none() {
        return Err(StoreError::NoParentDirectory(path.to_path_buf()));
    }
    fs::create_dir_all(parent).map_err(|e| StoreError::io("create directory", parent, e))?;

    let mut tmp = tempfile::NamedTempFile::new_in(parent)
        .map_err(|e| StoreError::io("create temp file in", parent, e))?;
    tmp.write_all(data)
        .map_err(|e| StoreError::io("write temp file for", path, e))?;
    tmp.flush()
        .map_err(|e| StoreError::io("flush temp file for", path, e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| StoreError::io("fsync temp file for", path, e))?;
    tmp.persist(path)
        .map_err(|e| StoreError::io("rename temp file onto", path, e.error))?;

    fsync_directory(parent)
}

#[cfg(unix)]
fn fsync_directory(dir: &Path) -> Result<(), StoreError> {
    File::open(dir)
        .and_then(|f| f.sync_all())
        .map_err(|e| StoreError::io("fsync directory", dir, e))
}

#[cfg(not(unix))]
fn fsync_directory(_dir: &Path) -> Result<(), StoreError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_new_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("live.json");
        atomic_write(&path, b"{}\n").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"{}\n");
    }

    #[test]
    fn replaces_existing_file_without_leftovers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("live.json");
        fs::write(&path, b"old").unwrap();
        atomic_write(&path, b"new").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"new");
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn creates_missing_parent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a/b/c.json");
        atomic_write(&path, b"x").unwrap();
        assert!(path.exists());
    }
}
