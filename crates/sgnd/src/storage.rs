//! Persistent KU store, outbox, and subscriber cursors using sled
//!
//! The KU insert and its outbox row are committed in one multi-tree
//! transaction and flushed before the publish path reports success: after a
//! crash either both are visible or neither is. Outbox rows are append-only;
//! delivery state lives entirely in the per-subscriber cursors.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::Transactional;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

const META_OUTBOX_SEQ: &[u8] = b"outbox_seq";

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<TransactionError<StorageError>> for StorageError {
    fn from(err: TransactionError<StorageError>) -> Self {
        match err {
            TransactionError::Abort(inner) => inner,
            TransactionError::Storage(e) => StorageError::Sled(e),
        }
    }
}

/// Result of an idempotent put
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PutOutcome {
    /// False when the CID was already present (no new outbox row)
    pub stored: bool,
    /// Outbox sequence allocated for a fresh store
    pub seq: Option<u64>,
}

/// Filesystem-vs-database consistency report
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ConsistencyReport {
    pub total_db: u64,
    pub total_fs: u64,
    pub mismatches: u64,
}

/// Envelope persisted per KU: the monotonic stored-at sequence plus the KU
#[derive(Serialize, Deserialize)]
struct StoredKu {
    seq: u64,
    ku: Value,
}

/// Storage backend for sgnd
pub struct Storage {
    db: sled::Db,
    /// KU tree: cid -> StoredKu JSON
    kus: sled::Tree,
    /// Outbox tree: seq (u64 BE) -> cid
    outbox: sled::Tree,
    /// Cursor tree: subscriber id -> last contiguously acked seq (u64 BE)
    cursors: sled::Tree,
    /// Metadata tree: sequence counters
    meta: sled::Tree,
    /// Optional per-CID blob mirror
    blobs_dir: Option<PathBuf>,
}

impl Storage {
    /// Open storage at the given path
    pub fn open(path: impl AsRef<Path>, blobs_dir: Option<PathBuf>) -> Result<Self, StorageError> {
        let db = sled::open(path)?;
        let kus = db.open_tree("kus")?;
        let outbox = db.open_tree("outbox")?;
        let cursors = db.open_tree("cursors")?;
        let meta = db.open_tree("meta")?;

        if let Some(dir) = &blobs_dir {
            std::fs::create_dir_all(dir)?;
        }

        Ok(Self {
            db,
            kus,
            outbox,
            cursors,
            meta,
            blobs_dir,
        })
    }

    /// Idempotent insert: stores the KU and appends its outbox row in one
    /// transaction, then flushes. Re-inserting an existing CID is a no-op
    /// that allocates no outbox row.
    pub fn put(&self, cid: &str, ku: &Value) -> Result<PutOutcome, StorageError> {
        let outcome = (&self.kus, &self.outbox, &self.meta)
            .transaction(|(kus, outbox, meta)| {
                if kus.get(cid.as_bytes())?.is_some() {
                    return Ok(PutOutcome {
                        stored: false,
                        seq: None,
                    });
                }

                let seq = match meta.get(META_OUTBOX_SEQ)? {
                    Some(raw) => decode_u64(&raw) + 1,
                    None => 1,
                };
                let stored = StoredKu {
                    seq,
                    ku: ku.clone(),
                };
                let bytes = serde_json::to_vec(&stored)
                    .map_err(|e| ConflictableTransactionError::Abort(StorageError::from(e)))?;

                meta.insert(META_OUTBOX_SEQ, &seq.to_be_bytes())?;
                kus.insert(cid.as_bytes(), bytes)?;
                outbox.insert(&seq.to_be_bytes(), cid.as_bytes())?;

                Ok(PutOutcome {
                    stored: true,
                    seq: Some(seq),
                })
            })
            .map_err(StorageError::from)?;

        if outcome.stored {
            self.db.flush()?;
            if let Some(dir) = &self.blobs_dir {
                // Blob mirror is advisory; divergence surfaces in consistency()
                if let Err(e) = write_blob(dir, cid, ku) {
                    warn!(cid, error = %e, "blob mirror write failed");
                }
            }
        }
        Ok(outcome)
    }

    /// Get a KU by CID
    pub fn get(&self, cid: &str) -> Result<Option<Value>, StorageError> {
        match self.kus.get(cid.as_bytes())? {
            Some(bytes) => {
                let stored: StoredKu = serde_json::from_slice(&bytes)?;
                Ok(Some(stored.ku))
            }
            None => Ok(None),
        }
    }

    /// Check if a CID exists
    pub fn exists(&self, cid: &str) -> Result<bool, StorageError> {
        Ok(self.kus.contains_key(cid.as_bytes())?)
    }

    /// Monotonic stored-at sequence for a CID
    pub fn stored_seq(&self, cid: &str) -> Result<Option<u64>, StorageError> {
        match self.kus.get(cid.as_bytes())? {
            Some(bytes) => {
                let stored: StoredKu = serde_json::from_slice(&bytes)?;
                Ok(Some(stored.seq))
            }
            None => Ok(None),
        }
    }

    /// Count stored KUs
    pub fn count(&self) -> usize {
        self.kus.len()
    }

    /// Total outbox rows (append-only)
    pub fn outbox_len(&self) -> usize {
        self.outbox.len()
    }

    /// Highest allocated outbox sequence, 0 when empty
    pub fn max_seq(&self) -> Result<u64, StorageError> {
        Ok(self
            .outbox
            .last()?
            .map(|(key, _)| decode_u64(&key))
            .unwrap_or(0))
    }

    /// Fetch up to `limit` outbox rows with seq strictly greater than `after`,
    /// in sequence order.
    pub fn outbox_after(
        &self,
        after: u64,
        limit: usize,
    ) -> Result<Vec<(u64, String)>, StorageError> {
        let start = after.saturating_add(1).to_be_bytes();
        let mut rows = Vec::new();
        for entry in self.outbox.range(start.as_slice()..).take(limit) {
            let (key, value) = entry?;
            let cid = String::from_utf8_lossy(&value).into_owned();
            rows.push((decode_u64(&key), cid));
        }
        Ok(rows)
    }

    /// Last contiguously acked sequence for a subscriber, if any
    pub fn cursor(&self, subscriber: &str) -> Result<Option<u64>, StorageError> {
        Ok(self
            .cursors
            .get(subscriber.as_bytes())?
            .map(|raw| decode_u64(&raw)))
    }

    /// Advance a subscriber cursor; regressions are ignored
    pub fn advance_cursor(&self, subscriber: &str, seq: u64) -> Result<(), StorageError> {
        let current = self.cursor(subscriber)?.unwrap_or(0);
        if seq > current {
            self.cursors
                .insert(subscriber.as_bytes(), &seq.to_be_bytes())?;
        }
        Ok(())
    }

    /// Compare the KU tree against the blob mirror. Reports divergence
    /// without repairing it. With no mirror configured the fs side is zero.
    pub fn consistency(&self) -> Result<ConsistencyReport, StorageError> {
        let mut db_cids = HashSet::new();
        for entry in self.kus.iter() {
            let (key, _) = entry?;
            db_cids.insert(String::from_utf8_lossy(&key).into_owned());
        }
        let total_db = db_cids.len() as u64;

        let Some(dir) = &self.blobs_dir else {
            return Ok(ConsistencyReport {
                total_db,
                total_fs: 0,
                mismatches: 0,
            });
        };

        let mut fs_cids = HashSet::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                fs_cids.insert(name.to_string());
            }
        }

        let mismatches = db_cids.symmetric_difference(&fs_cids).count() as u64;
        Ok(ConsistencyReport {
            total_db,
            total_fs: fs_cids.len() as u64,
            mismatches,
        })
    }

    /// Flush all pending writes
    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }
}

fn decode_u64(raw: &[u8]) -> u64 {
    u64::from_be_bytes(raw.try_into().unwrap_or([0; 8]))
}

fn write_blob(dir: &Path, cid: &str, ku: &Value) -> Result<(), StorageError> {
    let path = dir.join(cid);
    let bytes = serde_json::to_vec(ku)?;
    std::fs::write(path, bytes)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn note(n: u64) -> Value {
        json!({
            "schema_id": "ku.v1",
            "type": "ku.note",
            "content_type": "application/json",
            "payload": {"n": n},
            "parents": [],
            "sources": [],
            "tests": [],
            "provenance": {"agent_pubkey": null},
            "tags": [],
        })
    }

    #[test]
    fn put_is_idempotent_and_enqueues_once() {
        let dir = tempdir().unwrap();
        let storage = Storage::open(dir.path().join("db"), None).unwrap();

        let first = storage.put("cid-a", &note(1)).unwrap();
        assert!(first.stored);
        assert_eq!(first.seq, Some(1));

        let second = storage.put("cid-a", &note(1)).unwrap();
        assert!(!second.stored);
        assert_eq!(second.seq, None);

        assert_eq!(storage.count(), 1);
        assert_eq!(storage.outbox_len(), 1);
        assert_eq!(storage.max_seq().unwrap(), 1);
    }

    #[test]
    fn sequences_are_monotonic() {
        let dir = tempdir().unwrap();
        let storage = Storage::open(dir.path().join("db"), None).unwrap();

        for i in 0..5 {
            let outcome = storage.put(&format!("cid-{i}"), &note(i)).unwrap();
            assert_eq!(outcome.seq, Some(i + 1));
        }
        assert_eq!(storage.max_seq().unwrap(), 5);
        assert_eq!(storage.stored_seq("cid-3").unwrap(), Some(4));
    }

    #[test]
    fn outbox_after_respects_order_and_limit() {
        let dir = tempdir().unwrap();
        let storage = Storage::open(dir.path().join("db"), None).unwrap();
        for i in 0..10 {
            storage.put(&format!("cid-{i}"), &note(i)).unwrap();
        }

        let rows = storage.outbox_after(3, 4).unwrap();
        let seqs: Vec<u64> = rows.iter().map(|(seq, _)| *seq).collect();
        assert_eq!(seqs, vec![4, 5, 6, 7]);
        assert_eq!(rows[0].1, "cid-3");
    }

    #[test]
    fn cursor_advances_monotonically() {
        let dir = tempdir().unwrap();
        let storage = Storage::open(dir.path().join("db"), None).unwrap();

        assert_eq!(storage.cursor("sub-a").unwrap(), None);
        storage.advance_cursor("sub-a", 5).unwrap();
        storage.advance_cursor("sub-a", 3).unwrap();
        assert_eq!(storage.cursor("sub-a").unwrap(), Some(5));
    }

    #[test]
    fn get_round_trips_the_ku() {
        let dir = tempdir().unwrap();
        let storage = Storage::open(dir.path().join("db"), None).unwrap();
        let ku = note(7);
        storage.put("cid-7", &ku).unwrap();

        assert_eq!(storage.get("cid-7").unwrap(), Some(ku));
        assert_eq!(storage.get("cid-missing").unwrap(), None);
    }

    #[test]
    fn state_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db");
        {
            let storage = Storage::open(&path, None).unwrap();
            storage.put("cid-a", &note(1)).unwrap();
            storage.advance_cursor("sub", 1).unwrap();
        }

        let storage = Storage::open(&path, None).unwrap();
        assert!(storage.exists("cid-a").unwrap());
        assert_eq!(storage.max_seq().unwrap(), 1);
        assert_eq!(storage.cursor("sub").unwrap(), Some(1));

        // Sequence allocation continues past the restart
        let outcome = storage.put("cid-b", &note(2)).unwrap();
        assert_eq!(outcome.seq, Some(2));
    }

    #[test]
    fn blob_mirror_feeds_consistency() {
        let dir = tempdir().unwrap();
        let blobs = dir.path().join("blobs");
        let storage = Storage::open(dir.path().join("db"), Some(blobs.clone())).unwrap();

        storage.put("cid-a", &note(1)).unwrap();
        storage.put("cid-b", &note(2)).unwrap();

        let report = storage.consistency().unwrap();
        assert_eq!(report.total_db, 2);
        assert_eq!(report.total_fs, 2);
        assert_eq!(report.mismatches, 0);

        // Orphan a blob and delete another to force divergence
        std::fs::remove_file(blobs.join("cid-a")).unwrap();
        std::fs::write(blobs.join("cid-x"), b"{}").unwrap();

        let report = storage.consistency().unwrap();
        assert_eq!(report.mismatches, 2);
    }
}
