//! Append-only snapshot store
//!
//! Directory layout:
//!
//! ```text
//! <dir>/config-20261016T120000.123Z.json     document snapshots
//! <dir>/config-20261016T120000.123Z-1.json   same-millisecond successor
//! <dir>/LATEST                               id of the newest document snapshot
//! <dir>/tree-20261016T120500.000Z/files/...  tree snapshot contents
//! <dir>/tree-20261016T120500.000Z/manifest.json
//! <dir>/LATEST-TREE                          id of the newest tree snapshot
//! ```
//!
//! Snapshots are never modified after creation and never pruned. The
//! pointer files are replaced atomically after the snapshot itself is
//! durable, so a pointer never names a half-written snapshot.

use std::cmp::Ordering;
use std::fmt::{self, Display, Formatter};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, SubsecRound, Utc};
use serde::Serialize;
use tether_document::ContentHash;

use crate::atomic::atomic_write;
use crate::error::StoreError;
use crate::live::LiveDocument;
use crate::manifest::{resolve_key, TreeManifest};

const STAMP_FORMAT: &str = "%Y%m%dT%H%M%S%.3fZ";
const DOCUMENT_PREFIX: &str = "config-";
const DOCUMENT_SUFFIX: &str = ".json";
const TREE_PREFIX: &str = "tree-";
const LATEST: &str = "LATEST";
const LATEST_TREE: &str = "LATEST-TREE";
const MANIFEST: &str = "manifest.json";
const FILES: &str = "files";

/// Snapshot identifier: creation timestamp plus a collision counter
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SnapshotId {
    created_at: DateTime<Utc>,
    seq: u32,
}

impl SnapshotId {
    /// Identifier for a snapshot taken at `created_at` (millisecond precision)
    #[inline]
    #[must_use]
    pub fn new(created_at: DateTime<Utc>) -> Self {
        Self {
            created_at: created_at.trunc_subsecs(3),
            seq: 0,
        }
    }

    /// Creation time
    #[inline]
    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn successor(&self) -> Self {
        Self {
            created_at: self.created_at,
            seq: self.seq + 1,
        }
    }
}

impl Ord for SnapshotId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.created_at
            .cmp(&other.created_at)
            .then(self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for SnapshotId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Display for SnapshotId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.created_at.format(STAMP_FORMAT))?;
        if self.seq > 0 {
            write!(f, "-{}", self.seq)?;
        }
        Ok(())
    }
}

impl FromStr for SnapshotId {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || StoreError::InvalidSnapshotName(s.to_string());
        let (stamp, seq) = match s.split_once('-') {
            Some((stamp, seq)) => (stamp, seq.parse().map_err(|_| invalid())?),
            None => (s, 0),
        };
        let naive = NaiveDateTime::parse_from_str(stamp, STAMP_FORMAT).map_err(|_| invalid())?;
        Ok(Self {
            created_at: naive.and_utc(),
            seq,
        })
    }
}

impl Serialize for SnapshotId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// A document snapshot on disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotInfo {
    /// Identifier
    pub id: SnapshotId,
    /// File location
    pub path: PathBuf,
    /// Size in bytes
    pub size: u64,
}

/// A tree snapshot on disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TreeSnapshot {
    /// Identifier
    pub id: SnapshotId,
    /// Snapshot directory
    pub dir: PathBuf,
    /// Files captured, by relative path
    pub manifest: TreeManifest,
}

impl TreeSnapshot {
    /// Root of the captured copies
    #[must_use]
    pub fn files_dir(&self) -> PathBuf {
        self.dir.join(FILES)
    }

    /// Location of the captured copy of `relative`
    ///
    /// # Errors
    /// Returns `StoreError::OutsideTree` for keys escaping the tree
    pub fn file_path(&self, relative: &str) -> Result<PathBuf, StoreError> {
        resolve_key(&self.dir.join(FILES), relative)
    }
}

/// Timestamp-named snapshot store with "latest" pointers
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    /// Open (creating if needed) a store rooted at `dir`
    ///
    /// # Errors
    /// Returns `StoreError::Io` if the directory cannot be created
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| StoreError::io("create snapshot dir", &dir, e))?;
        Ok(Self { dir })
    }

    /// Store directory
    #[inline]
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn document_path(&self, id: &SnapshotId) -> PathBuf {
        self.dir
            .join(format!("{DOCUMENT_PREFIX}{id}{DOCUMENT_SUFFIX}"))
    }

    fn tree_dir(&self, id: &SnapshotId) -> PathBuf {
        self.dir.join(format!("{TREE_PREFIX}{id}"))
    }

    fn fresh_id(&self, exists: impl Fn(&SnapshotId) -> bool) -> SnapshotId {
        let mut id = SnapshotId::new(Utc::now());
        while exists(&id) {
            id = id.successor();
        }
        id
    }

    // ---------------------------------------------------------------------
    // Document snapshots
    // ---------------------------------------------------------------------

    /// Store `contents` as a new snapshot and point `LATEST` at it
    ///
    /// # Errors
    /// Returns `StoreError::Io` if either write fails
    pub fn create(&self, contents: &[u8]) -> Result<SnapshotInfo, StoreError> {
        let id = self.fresh_id(|id| self.document_path(id).exists());
        let path = self.document_path(&id);
        atomic_write(&path, contents)?;
        atomic_write(&self.dir.join(LATEST), format!("{id}\n").as_bytes())?;
        tracing::info!(snapshot = %id, bytes = contents.len(), "snapshot created");
        Ok(SnapshotInfo {
            id,
            path,
            size: contents.len() as u64,
        })
    }

    /// Snapshot the live document
    ///
    /// # Errors
    /// Returns `StoreError::Io` if the live document cannot be read or the
    /// snapshot cannot be written
    pub fn capture(&self, live: &LiveDocument) -> Result<SnapshotInfo, StoreError> {
        self.create(&live.read_bytes()?)
    }

    /// All document snapshots, oldest first
    ///
    /// # Errors
    /// Returns `StoreError::Io` if the directory cannot be listed
    pub fn list(&self) -> Result<Vec<SnapshotInfo>, StoreError> {
        let entries =
            fs::read_dir(&self.dir).map_err(|e| StoreError::io("list snapshots", &self.dir, e))?;
        let mut out = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io("list snapshots", &self.dir, e))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(stem) = name
                .strip_prefix(DOCUMENT_PREFIX)
                .and_then(|n| n.strip_suffix(DOCUMENT_SUFFIX))
            else {
                continue;
            };
            let Ok(id) = stem.parse::<SnapshotId>() else {
                tracing::warn!(file = %name, "ignoring unrecognised file in snapshot dir");
                continue;
            };
            let size = entry
                .metadata()
                .map_err(|e| StoreError::io("stat snapshot", entry.path(), e))?
                .len();
            out.push(SnapshotInfo {
                id,
                path: entry.path(),
                size,
            });
        }
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }

    /// Most recent document snapshot
    ///
    /// Follows the `LATEST` pointer, falling back to the newest file name
    /// if the pointer is missing.
    ///
    /// # Errors
    /// - `StoreError::SnapshotNotFound` if the pointer names a missing file
    /// - `StoreError::Io` on read failures
    pub fn latest(&self) -> Result<Option<SnapshotInfo>, StoreError> {
        match self.read_pointer(LATEST)? {
            Some(id) => self.get(&id).map(Some),
            None => Ok(self.list()?.pop()),
        }
    }

    /// Look up one snapshot
    ///
    /// # Errors
    /// Returns `StoreError::SnapshotNotFound` if it does not exist
    pub fn get(&self, id: &SnapshotId) -> Result<SnapshotInfo, StoreError> {
        let path = self.document_path(id);
        let meta = fs::metadata(&path).map_err(|_| StoreError::SnapshotNotFound(id.to_string()))?;
        Ok(SnapshotInfo {
            id: id.clone(),
            path,
            size: meta.len(),
        })
    }

    /// Snapshot contents
    ///
    /// # Errors
    /// Returns `StoreError::SnapshotNotFound` if it does not exist
    pub fn read(&self, id: &SnapshotId) -> Result<Vec<u8>, StoreError> {
        fs::read(self.document_path(id)).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => StoreError::SnapshotNotFound(id.to_string()),
            _ => StoreError::io("read snapshot", self.document_path(id), e),
        })
    }

    /// Copy a snapshot back onto the live document byte-for-byte
    ///
    /// # Errors
    /// - `StoreError::SnapshotNotFound` if it does not exist
    /// - `StoreError::Io` if the live write fails
    pub fn restore(&self, id: &SnapshotId, live: &LiveDocument) -> Result<ContentHash, StoreError> {
        let bytes = self.read(id)?;
        live.write_bytes(&bytes)?;
        tracing::info!(snapshot = %id, path = %live.path().display(), "snapshot restored");
        Ok(ContentHash::compute(&bytes))
    }

    /// Restore the latest snapshot
    ///
    /// # Errors
    /// - `StoreError::NoSnapshots` if the store is empty
    /// - otherwise as [`SnapshotStore::restore`]
    pub fn restore_latest(&self, live: &LiveDocument) -> Result<SnapshotInfo, StoreError> {
        let latest = self
            .latest()?
            .ok_or_else(|| StoreError::NoSnapshots(self.dir.clone()))?;
        self.restore(&latest.id, live)?;
        Ok(latest)
    }

    fn read_pointer(&self, name: &str) -> Result<Option<SnapshotId>, StoreError> {
        let path = self.dir.join(name);
        match fs::read_to_string(&path) {
            Ok(text) => text.trim().parse().map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::io("read pointer", path, e)),
        }
    }

    // ---------------------------------------------------------------------
    // Tree snapshots
    // ---------------------------------------------------------------------

    /// Copy every file under `root` into a new tree snapshot with manifest
    ///
    /// # Errors
    /// Returns `StoreError::Io` if any file cannot be read or copied
    pub fn create_tree(&self, root: &Path) -> Result<TreeSnapshot, StoreError> {
        let id = self.fresh_id(|id| self.tree_dir(id).exists());
        let dir = self.tree_dir(&id);
        let files_dir = dir.join(FILES);
        fs::create_dir_all(&files_dir)
            .map_err(|e| StoreError::io("create tree snapshot", &files_dir, e))?;

        let manifest = TreeManifest::scan(root)?;
        for key in manifest.files.keys() {
            let src = resolve_key(root, key)?;
            let dst = resolve_key(&files_dir, key)?;
            if let Some(parent) = dst.parent() {
                fs::create_dir_all(parent)
                    .map_err(|e| StoreError::io("create directory", parent, e))?;
            }
            fs::copy(&src, &dst).map_err(|e| StoreError::io("copy into snapshot", &src, e))?;
        }

        let manifest_json = serde_json::to_vec_pretty(&manifest)
            .map_err(|e| StoreError::malformed("manifest", dir.join(MANIFEST), e))?;
        atomic_write(&dir.join(MANIFEST), &manifest_json)?;
        atomic_write(&self.dir.join(LATEST_TREE), format!("{id}\n").as_bytes())?;
        tracing::info!(snapshot = %id, files = manifest.len(), "tree snapshot created");

        Ok(TreeSnapshot { id, dir, manifest })
    }

    /// Load a tree snapshot by id
    ///
    /// # Errors
    /// - `StoreError::SnapshotNotFound` if it does not exist
    /// - `StoreError::Malformed` if its manifest does not parse
    pub fn get_tree(&self, id: &SnapshotId) -> Result<TreeSnapshot, StoreError> {
        let dir = self.tree_dir(id);
        let path = dir.join(MANIFEST);
        let bytes = fs::read(&path).map_err(|_| StoreError::SnapshotNotFound(id.to_string()))?;
        let manifest =
            serde_json::from_slice(&bytes).map_err(|e| StoreError::malformed("manifest", &path, e))?;
        Ok(TreeSnapshot {
            id: id.clone(),
            dir,
            manifest,
        })
    }

    /// Most recent tree snapshot
    ///
    /// # Errors
    /// As [`SnapshotStore::get_tree`]
    pub fn latest_tree(&self) -> Result<Option<TreeSnapshot>, StoreError> {
        match self.read_pointer(LATEST_TREE)? {
            Some(id) => self.get_tree(&id).map(Some),
            None => Ok(None),
        }
    }

    /// Make `root` match a tree snapshot exactly
    ///
    /// Every captured file is written back byte-for-byte; files under `root`
    /// absent from the snapshot manifest are removed.
    ///
    /// # Errors
    /// Returns `StoreError::Io` if any copy or removal fails
    pub fn restore_tree(&self, snapshot: &TreeSnapshot, root: &Path) -> Result<(), StoreError> {
        let current = TreeManifest::scan(root)?;
        for key in current.files.keys() {
            if snapshot.manifest.get(key).is_none() {
                let path = resolve_key(root, key)?;
                fs::remove_file(&path).map_err(|e| StoreError::io("remove", &path, e))?;
            }
        }
        for (key, hash) in &snapshot.manifest.files {
            if current.get(key) == Some(hash) {
                continue;
            }
            let src = snapshot.file_path(key)?;
            let bytes = fs::read(&src).map_err(|e| StoreError::io("read snapshot file", &src, e))?;
            atomic_write(&resolve_key(root, key)?, &bytes)?;
        }
        tracing::info!(snapshot = %snapshot.id, root = %root.display(), "tree snapshot restored");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn store() -> (tempfile::TempDir, SnapshotStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::open(dir.path().join("snapshots")).unwrap();
        (dir, store)
    }

    #[test]
    fn snapshot_id_round_trips_and_orders() {
        let t = Utc.with_ymd_and_hms(2026, 10, 16, 12, 0, 0).unwrap();
        let a = SnapshotId::new(t);
        let b = a.successor();
        assert_eq!(a.to_string(), "20261016T120000.000Z");
        assert_eq!(b.to_string(), "20261016T120000.000Z-1");
        assert_eq!(b.to_string().parse::<SnapshotId>().unwrap(), b);
        assert!(a < b);
        assert!("garbage".parse::<SnapshotId>().is_err());
    }

    #[test]
    fn create_list_latest() {
        let (_tmp, store) = store();
        assert!(store.latest().unwrap().is_none());

        let first = store.create(b"{\"a\":1}").unwrap();
        let second = store.create(b"{\"a\":2}").unwrap();
        assert!(first.id < second.id);

        let listed: Vec<_> = store.list().unwrap().into_iter().map(|s| s.id).collect();
        assert_eq!(listed, vec![first.id.clone(), second.id.clone()]);
        assert_eq!(store.latest().unwrap().unwrap().id, second.id);
        assert_eq!(store.read(&first.id).unwrap(), b"{\"a\":1}");
    }

    #[test]
    fn latest_falls_back_without_pointer() {
        let (_tmp, store) = store();
        let snap = store.create(b"{}").unwrap();
        fs::remove_file(store.dir().join(LATEST)).unwrap();
        assert_eq!(store.latest().unwrap().unwrap().id, snap.id);
    }

    #[test]
    fn restore_is_byte_exact() {
        let (tmp, store) = store();
        let live = LiveDocument::new(tmp.path().join("host.json"));
        let original = b"{\n  \"ui\": {\"theme\": \"dark\"}\n}\n";
        live.write_bytes(original).unwrap();
        store.capture(&live).unwrap();

        live.write_bytes(b"{}").unwrap();
        store.restore_latest(&live).unwrap();
        assert_eq!(live.read_bytes().unwrap(), original);
    }

    #[test]
    fn restore_latest_on_empty_store() {
        let (tmp, store) = store();
        let live = LiveDocument::new(tmp.path().join("host.json"));
        assert!(matches!(
            store.restore_latest(&live),
            Err(StoreError::NoSnapshots(_))
        ));
    }

    #[test]
    fn tree_snapshot_restores_exact_tree() {
        let (tmp, store) = store();
        let root = tmp.path().join("plugins");
        fs::create_dir_all(root.join("alpha")).unwrap();
        fs::write(root.join("alpha/index.js"), "v1").unwrap();
        fs::write(root.join("alpha/plugin.json"), "{\"name\":\"alpha\"}").unwrap();

        let snap = store.create_tree(&root).unwrap();
        assert_eq!(snap.manifest.len(), 2);

        fs::write(root.join("alpha/index.js"), "v2").unwrap();
        fs::write(root.join("alpha/extra.js"), "junk").unwrap();

        let reloaded = store.latest_tree().unwrap().unwrap();
        assert_eq!(reloaded, snap);
        store.restore_tree(&reloaded, &root).unwrap();

        assert_eq!(TreeManifest::scan(&root).unwrap(), snap.manifest);
        assert_eq!(fs::read_to_string(root.join("alpha/index.js")).unwrap(), "v1");
    }
}
