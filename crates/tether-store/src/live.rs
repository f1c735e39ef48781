//! Live document handle
//!
//! The only path through which the live configuration file is written.
//! Holders of a [`LiveDocument`] are the single writer; everyone else reads.

use std::fs;
use std::path::{Path, PathBuf};

use tether_document::{ConfigDocument, ContentHash};

use crate::atomic::atomic_write;
use crate::error::StoreError;

/// Handle to the live configuration document on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveDocument {
    path: PathBuf,
}

impl LiveDocument {
    /// Handle for `path`
    #[inline]
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// File location
    #[inline]
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// True if the file exists
    #[must_use]
    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Raw bytes
    ///
    /// # Errors
    /// Returns `StoreError::Io` if the file cannot be read
    pub fn read_bytes(&self) -> Result<Vec<u8>, StoreError> {
        fs::read(&self.path).map_err(|e| StoreError::io("read live document", &self.path, e))
    }

    /// Contents as text
    ///
    /// # Errors
    /// Returns `StoreError::Io` if the file cannot be read or is not UTF-8
    pub fn read_text(&self) -> Result<String, StoreError> {
        fs::read_to_string(&self.path)
            .map_err(|e| StoreError::io("read live document", &self.path, e))
    }

    /// Parsed document
    ///
    /// # Errors
    /// - `StoreError::Io` if the file cannot be read
    /// - `StoreError::Document` if it does not parse
    pub fn load(&self) -> Result<ConfigDocument, StoreError> {
        Ok(ConfigDocument::parse(&self.read_text()?)?)
    }

    /// Hash of the raw bytes
    ///
    /// # Errors
    /// Returns `StoreError::Io` if the file cannot be read
    pub fn hash(&self) -> Result<ContentHash, StoreError> {
        Ok(ContentHash::compute(&self.read_bytes()?))
    }

    /// Replace the file atomically with `bytes`
    ///
    /// # Errors
    /// Returns `StoreError::Io` if the write fails; the previous contents
    /// remain in place
    pub fn write_bytes(&self, bytes: &[u8]) -> Result<(), StoreError> {
        atomic_write(&self.path, bytes)?;
        tracing::debug!(path = %self.path.display(), bytes = bytes.len(), "live document replaced");
        Ok(())
    }

    /// Write a document in its on-disk form
    ///
    /// # Errors
    /// Same as [`LiveDocument::write_bytes`]
    pub fn write_document(&self, doc: &ConfigDocument) -> Result<(), StoreError> {
        self.write_bytes(doc.to_pretty_json().as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn write_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let live = LiveDocument::new(dir.path().join("host.json"));
        assert!(!live.exists());

        let doc = ConfigDocument::from_value(json!({"ui": {"theme": "dark"}})).unwrap();
        live.write_document(&doc).unwrap();
        assert!(live.exists());
        assert_eq!(live.load().unwrap(), doc);
    }

    #[test]
    fn load_reports_syntax_errors() {
        let dir = tempfile::tempdir().unwrap();
        let live = LiveDocument::new(dir.path().join("host.json"));
        live.write_bytes(b"{\"ui\": ").unwrap();
        assert!(matches!(live.load(), Err(StoreError::Document(_))));
    }

    #[test]
    fn missing_file_is_not_found() {
        let live = LiveDocument::new("/nonexistent/tether/host.json");
        assert!(live.read_bytes().unwrap_err().is_not_found());
    }
}
