//! Hash-chained audit journal
//!
//! JSON lines, one record per finished mutation attempt, manual rollback or
//! watchdog action. Each record carries the SHA-256 of its predecessor, so
//! truncation in the middle or edits to any record break the chain.

use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::AuditError;

const GENESIS: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// One journal line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// 0-based position in the chain
    pub seq: u64,
    /// Append time
    pub recorded_at: DateTime<Utc>,
    /// Record kind (`apply`, `upgrade`, `rollback`, `watchdog`)
    pub kind: String,
    /// Record body
    pub payload: serde_json::Value,
    /// Hash of the previous record (hex)
    pub prev_hash: String,
    /// Hash of this record (hex)
    pub hash: String,
}

#[derive(Debug)]
struct ChainHead {
    next_seq: u64,
    last_hash: String,
}

/// Append-only journal
#[derive(Debug)]
pub struct AuditLog {
    path: PathBuf,
    head: Mutex<ChainHead>,
}

impl AuditLog {
    /// Open `path`, resuming the chain after its last record
    ///
    /// # Errors
    /// - `AuditError::Io` if the file exists but cannot be read
    /// - `AuditError::Malformed` if its last line does not parse
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, AuditError> {
        let path = path.into();
        let mut head = ChainHead {
            next_seq: 0,
            last_hash: GENESIS.to_string(),
        };
        if path.exists() {
            let file = fs::File::open(&path).map_err(|source| AuditError::Io {
                path: path.clone(),
                source,
            })?;
            let mut last = None;
            let mut count = 0;
            for line in BufReader::new(file).lines() {
                let line = line.map_err(|source| AuditError::Io {
                    path: path.clone(),
                    source,
                })?;
                if !line.trim().is_empty() {
                    count += 1;
                    last = Some(line);
                }
            }
            if let Some(line) = last {
                let record: AuditRecord = serde_json::from_str(&line)
                    .map_err(|source| AuditError::Malformed { line: count, source })?;
                head = ChainHead {
                    next_seq: record.seq + 1,
                    last_hash: record.hash,
                };
            }
        }
        Ok(Self {
            path,
            head: Mutex::new(head),
        })
    }

    /// Journal location
    #[inline]
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a record
    ///
    /// # Errors
    /// - `AuditError::Malformed` if `payload` cannot be serialized
    /// - `AuditError::Io` if the line cannot be written
    pub fn append<T: Serialize>(&self, kind: &str, payload: &T) -> Result<AuditRecord, AuditError> {
        let payload =
            serde_json::to_value(payload).map_err(|source| AuditError::Malformed { line: 0, source })?;

        let mut head = self.head.lock();
        let recorded_at = Utc::now();
        let hash = compute_hash(head.next_seq, &recorded_at, kind, &payload, &head.last_hash);
        let record = AuditRecord {
            seq: head.next_seq,
            recorded_at,
            kind: kind.to_string(),
            payload,
            prev_hash: head.last_hash.clone(),
            hash,
        };

        let mut line = serde_json::to_string(&record).map_err(|source| AuditError::Malformed {
            line: 0,
            source,
        })?;
        line.push('\n');

        let io_err = |source| AuditError::Io {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(io_err)?;
        file.write_all(line.as_bytes()).map_err(io_err)?;
        file.sync_data().map_err(io_err)?;

        head.next_seq += 1;
        head.last_hash.clone_from(&record.hash);
        Ok(record)
    }

    /// Check the whole chain, returning the number of records
    ///
    /// A missing journal is an empty, valid chain.
    ///
    /// # Errors
    /// - `AuditError::Broken` at the first record that does not link or hash
    /// - `AuditError::Malformed` / `AuditError::Io` if the file cannot be read
    pub fn verify(path: &Path) -> Result<u64, AuditError> {
        if !path.exists() {
            return Ok(0);
        }
        let file = fs::File::open(path).map_err(|source| AuditError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let mut prev = GENESIS.to_string();
        let mut expected_seq = 0u64;
        for (idx, line) in BufReader::new(file).lines().enumerate() {
            let line_no = idx + 1;
            let line = line.map_err(|source| AuditError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            if line.trim().is_empty() {
                continue;
            }
            let record: AuditRecord = serde_json::from_str(&line)
                .map_err(|source| AuditError::Malformed { line: line_no, source })?;

            if record.seq != expected_seq {
                return Err(AuditError::Broken {
                    line: line_no,
                    reason: format!("expected seq {expected_seq}, found {}", record.seq),
                });
            }
            if record.prev_hash != prev {
                return Err(AuditError::Broken {
                    line: line_no,
                    reason: "prev_hash does not match previous record".to_string(),
                });
            }
            let recomputed = compute_hash(
                record.seq,
                &record.recorded_at,
                &record.kind,
                &record.payload,
                &record.prev_hash,
            );
            if recomputed != record.hash {
                return Err(AuditError::Broken {
                    line: line_no,
                    reason: "record hash mismatch".to_string(),
                });
            }
            prev = record.hash;
            expected_seq += 1;
        }
        Ok(expected_seq)
    }
}

fn compute_hash(
    seq: u64,
    recorded_at: &DateTime<Utc>,
    kind: &str,
    payload: &serde_json::Value,
    prev_hash: &str,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(seq.to_le_bytes());
    hasher.update(recorded_at.to_rfc3339().as_bytes());
    hasher.update([0]);
    hasher.update(kind.as_bytes());
    hasher.update([0]);
    hasher.update(payload.to_string().as_bytes());
    hasher.update([0]);
    hasher.update(prev_hash.as_bytes());
    hex::encode(hasher.finalize())
}
