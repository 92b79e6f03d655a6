//! File-backed state store.
//!
//! Each record lives in its own file, `<data_dir>/<kind>/<key>.json`. A
//! record is written to a temporary file, synced and renamed over the old
//! one, so a crash leaves either the previous record or the new one. Every
//! file carries a CRC32 of its record body.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{RecordKind, StateStore, StoreError, StoreResult};

/// Record file format version.
const RECORD_FORMAT: u32 = 1;

/// Suffix of record files.
const RECORD_SUFFIX: &str = ".json";

/// Suffix of in-flight temporary files.
const TMP_SUFFIX: &str = ".json.tmp";

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    format: u32,
    key: String,
    checksum: u32,
    record: serde_json::Value,
}

/// A [`StateStore`] that keeps one JSON file per record.
#[derive(Debug)]
pub struct FileStore {
    /// Root data directory.
    dir: PathBuf,
    /// Whether to fsync writes.
    sync_writes: bool,
    /// Serializes writers.
    write_lock: Mutex<()>,
}

impl FileStore {
    /// Opens (creating if needed) a store rooted at `dir`.
    pub fn open<P: AsRef<Path>>(dir: P) -> StoreResult<Self> {
        Self::with_sync(dir, true)
    }

    /// Opens a store, choosing whether writes are synced to disk.
    pub fn with_sync<P: AsRef<Path>>(dir: P, sync_writes: bool) -> StoreResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        for kind in RecordKind::ALL {
            fs::create_dir_all(dir.join(kind.dir_name()))?;
        }
        Ok(Self {
            dir,
            sync_writes,
            write_lock: Mutex::new(()),
        })
    }

    /// The root directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn kind_dir(&self, kind: RecordKind) -> PathBuf {
        self.dir.join(kind.dir_name())
    }

    fn record_path(&self, kind: RecordKind, key: &str) -> PathBuf {
        self.kind_dir(kind)
            .join(format!("{}{}", encode_key(key), RECORD_SUFFIX))
    }
}

/// Maps a key onto a portable file name.
fn encode_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for b in key.bytes() {
        if b.is_ascii_alphanumeric() || b == b'-' || b == b'_' {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}

fn checksum_of(record: &serde_json::Value) -> StoreResult<u32> {
    Ok(crc32fast::hash(&serde_json::to_vec(record)?))
}

impl StateStore for FileStore {
    fn put(&self, kind: RecordKind, key: &str, value: &serde_json::Value) -> StoreResult<()> {
        let _guard = self.write_lock.lock();

        let path = self.record_path(kind, key);
        let tmp_path = self
            .kind_dir(kind)
            .join(format!("{}{}", encode_key(key), TMP_SUFFIX));

        let envelope = Envelope {
            format: RECORD_FORMAT,
            key: key.to_string(),
            checksum: checksum_of(value)?,
            record: value.clone(),
        };
        let bytes = serde_json::to_vec_pretty(&envelope)?;

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        file.write_all(&bytes)?;
        if self.sync_writes {
            file.sync_all()?;
        }
        drop(file);

        fs::rename(&tmp_path, &path)?;

        if self.sync_writes {
            if let Ok(dir) = File::open(self.kind_dir(kind)) {
                let _ = dir.sync_all();
            }
        }

        debug!(%kind, key, "record written");
        Ok(())
    }

    fn delete(&self, kind: RecordKind, key: &str) -> StoreResult<()> {
        let _guard = self.write_lock.lock();
        match fs::remove_file(self.record_path(kind, key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn load_all(&self, kind: RecordKind) -> StoreResult<Vec<(String, serde_json::Value)>> {
        let mut records = Vec::new();
        for entry in fs::read_dir(self.kind_dir(kind))? {
            let path = entry?.path();
            let is_record = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(RECORD_SUFFIX));
            if !is_record {
                continue;
            }

            let bytes = fs::read(&path)?;
            let envelope: Envelope = serde_json::from_slice(&bytes)
                .map_err(|e| StoreError::Corrupted(format!("{}: {}", path.display(), e)))?;
            if envelope.format != RECORD_FORMAT {
                return Err(StoreError::Corrupted(format!(
                    "{}: unsupported format {}",
                    path.display(),
                    envelope.format
                )));
            }
            let computed = checksum_of(&envelope.record)?;
            if computed != envelope.checksum {
                return Err(StoreError::Corrupted(format!(
                    "{}: checksum mismatch: expected {:08x}, got {:08x}",
                    path.display(),
                    envelope.checksum,
                    computed
                )));
            }
            records.push((envelope.key, envelope.record));
        }
        records.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_put_and_reload() {
        let tmp = TempDir::new().unwrap();
        {
            let store = FileStore::with_sync(tmp.path(), false).unwrap();
            store
                .put(RecordKind::Transaction, "txn-1", &json!({"state": "pending"}))
                .unwrap();
            store
                .put(RecordKind::History, "doc/with spaces", &json!([1, 2]))
                .unwrap();
        }

        let store = FileStore::open(tmp.path()).unwrap();
        let txns = store.load_all(RecordKind::Transaction).unwrap();
        assert_eq!(txns, vec![("txn-1".to_string(), json!({"state": "pending"}))]);
        let history = store.load_all(RecordKind::History).unwrap();
        assert_eq!(history[0].0, "doc/with spaces");
    }

    #[test]
    fn test_overwrite_and_delete() {
        let tmp = TempDir::new().unwrap();
        let store = FileStore::with_sync(tmp.path(), false).unwrap();
        store.put(RecordKind::Snapshot, "1", &json!(1)).unwrap();
        store.put(RecordKind::Snapshot, "1", &json!(2)).unwrap();
        assert_eq!(store.load_all(RecordKind::Snapshot).unwrap()[0].1, json!(2));

        store.delete(RecordKind::Snapshot, "1").unwrap();
        store.delete(RecordKind::Snapshot, "1").unwrap();
        assert!(store.load_all(RecordKind::Snapshot).unwrap().is_empty());
    }

    #[test]
    fn test_corruption_detected() {
        let tmp = TempDir::new().unwrap();
        let store = FileStore::with_sync(tmp.path(), false).unwrap();
        store.put(RecordKind::Conflict, "c1", &json!({"value": 1})).unwrap();

        let path = store.record_path(RecordKind::Conflict, "c1");
        let text = fs::read_to_string(&path).unwrap().replace("\"value\": 1", "\"value\": 2");
        fs::write(&path, text).unwrap();

        let err = store.load_all(RecordKind::Conflict).unwrap_err();
        assert!(matches!(err, StoreError::Corrupted(_)));
    }

    #[test]
    fn test_key_encoding() {
        assert_eq!(encode_key("S1"), "S1");
        assert_eq!(encode_key("a/b"), "a%2Fb");
        assert_eq!(encode_key("x.y"), "x%2Ey");
    }
}
