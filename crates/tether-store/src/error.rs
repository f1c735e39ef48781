//! Store errors

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tether_document::DocumentError;

/// Errors from the snapshot store and the live document handle
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Filesystem operation failed
    #[error("{context} '{}': {source}", path.display())]
    Io {
        /// What was being done
        context: &'static str,
        /// Path involved
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Path has no parent directory to stage a temp file in
    #[error("no parent directory for '{}'", .0.display())]
    NoParentDirectory(PathBuf),

    /// Requested snapshot does not exist
    #[error("snapshot not found: {0}")]
    SnapshotNotFound(String),

    /// The store holds no snapshots yet
    #[error("no snapshot available in '{}'", .0.display())]
    NoSnapshots(PathBuf),

    /// File name in the snapshot directory is not a snapshot name
    #[error("invalid snapshot name: '{0}'")]
    InvalidSnapshotName(String),

    /// Manifest or lock file could not be (de)serialized
    #[error("malformed {what} at '{}': {source}", path.display())]
    Malformed {
        /// Which file
        what: &'static str,
        /// Path involved
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// Tree path escaped the tracked root
    #[error("path outside tracked tree: '{0}'")]
    OutsideTree(String),

    /// Another mutation holds the lock
    #[error("mutation lock held by {holder} (pid {pid}) since {acquired_at}")]
    Locked {
        /// Holder label
        holder: String,
        /// Holder process id
        pid: u32,
        /// Acquisition time
        acquired_at: DateTime<Utc>,
    },

    /// Live document is not a valid document
    #[error("live document: {0}")]
    Document(#[from] DocumentError),
}

impl StoreError {
    pub(crate) fn io(context: &'static str, path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            context,
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    pub(crate) fn malformed(
        what: &'static str,
        path: impl AsRef<Path>,
        source: serde_json::Error,
    ) -> Self {
        Self::Malformed {
            what,
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// True if the error means a missing file rather than a fault
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::Io { source, .. } => source.kind() == std::io::ErrorKind::NotFound,
            Self::SnapshotNotFound(_) | Self::NoSnapshots(_) => true,
            _ => false,
        }
    }
}
