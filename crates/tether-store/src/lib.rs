//! Tether Snapshot Store
//!
//! The filesystem boundary of the control plane:
//! - [`LiveDocument`]: single-writer handle for the live configuration file
//! - [`SnapshotStore`]: append-only, timestamp-named snapshots plus "latest" pointers
//! - [`TreeManifest`]: checksum manifests for plugin trees
//! - [`MutationLock`]: cross-process lock taken before any live write
//!
//! Every write goes through [`atomic_write`]; no reader ever observes a
//! partially written file.

#![warn(unreachable_pub)]

mod atomic;
mod error;
mod live;
mod lock;
mod manifest;
mod snapshot;

pub use atomic::atomic_write;
pub use error::StoreError;
pub use live::LiveDocument;
pub use lock::{LockInfo, MutationLock};
pub use manifest::{resolve_key, ManifestDiff, TreeManifest};
pub use snapshot::{SnapshotId, SnapshotInfo, SnapshotStore, TreeSnapshot};
