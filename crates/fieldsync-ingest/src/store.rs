//! Append-only record store backed by a single JSON file.
//!
//! # File Format
//!
//! One pretty-printed JSON array of [`TelemetryRecord`] objects, in admission
//! order. The whole array is read at startup and the whole array is rewritten
//! on every [`RecordStore::persist`].
//!
//! # Durability
//!
//! Writes go to a temporary file in the target's directory, are fsynced, and
//! are then renamed over the target. A crash at any point leaves either the
//! previous file or the new one, never a truncated mix. The directory is
//! fsynced after the rename so the new entry survives power loss.
//!
//! Persisting is blocking I/O and runs on the caller's thread; callers in
//! async code hold up their task for one write plus two fsyncs.
//!
//! Full rewrites keep this simple but bound it to single-device or
//! small-fleet record counts.

use crate::error::{Error, Result};
use fieldsync_core::TelemetryRecord;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info};

/// The ordered, append-only collection of admitted records.
///
/// Does not check for duplicates itself; callers go through
/// [`DedupeIndex`](crate::DedupeIndex) first.
pub struct RecordStore {
    path: PathBuf,
    records: Vec<TelemetryRecord>,
    /// Number of leading records known to be on disk.
    persisted_len: usize,
}

impl RecordStore {
    /// Load the store from `path`.
    ///
    /// A missing file is the first-run state and yields an empty store. A file
    /// that exists but does not parse is [`Error::CorruptState`]: starting
    /// empty instead would re-ingest or drop history.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No record file at {}, starting fresh", path.display());
                return Ok(Self::empty(path));
            }
            Err(e) => return Err(Error::Io(e)),
        };

        let records: Vec<TelemetryRecord> =
            serde_json::from_slice(&bytes).map_err(|e| Error::CorruptState {
                path: path.clone(),
                reason: e.to_string(),
            })?;

        info!(
            "Loaded {} existing records from {}",
            records.len(),
            path.display()
        );

        let persisted_len = records.len();
        Ok(Self {
            path,
            records,
            persisted_len,
        })
    }

    /// An empty store that will persist to `path`.
    pub fn empty<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            path: path.into(),
            records: Vec::new(),
            persisted_len: 0,
        }
    }

    /// Append records in the given order.
    pub fn append<I>(&mut self, records: I)
    where
        I: IntoIterator<Item = TelemetryRecord>,
    {
        self.records.extend(records);
    }

    /// Atomically rewrite the backing file with every record in memory.
    pub fn persist(&mut self) -> Result<()> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir).map_err(|e| self.persist_error(e))?;

        let mut tmp = NamedTempFile::new_in(&dir).map_err(|e| self.persist_error(e))?;
        {
            let mut writer = BufWriter::new(tmp.as_file_mut());
            serde_json::to_writer_pretty(&mut writer, &self.records)
                .map_err(|e| self.persist_error(e))?;
            writer
                .write_all(b"\n")
                .and_then(|()| writer.flush())
                .map_err(|e| self.persist_error(e))?;
        }
        tmp.as_file()
            .sync_all()
            .map_err(|e| self.persist_error(e))?;
        tmp.persist(&self.path)
            .map_err(|e| self.persist_error(e.error))?;
        sync_dir(&dir).map_err(|e| self.persist_error(e))?;

        self.persisted_len = self.records.len();
        debug!(
            "Saved {} records to {}",
            self.records.len(),
            self.path.display()
        );
        Ok(())
    }

    /// Drop records appended after the first `len`, but never ones already
    /// on disk.
    ///
    /// Used to undo an append whose persist failed, so memory never holds a
    /// record the file does not.
    pub fn rollback(&mut self, len: usize) {
        let keep = len.max(self.persisted_len);
        if keep < self.records.len() {
            debug!(
                "Rolling back {} unpersisted records",
                self.records.len() - keep
            );
            self.records.truncate(keep);
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Alias for [`len`](Self::len).
    pub fn size(&self) -> usize {
        self.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[TelemetryRecord] {
        &self.records
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of records on disk as of the last successful persist.
    pub fn persisted_len(&self) -> usize {
        self.persisted_len
    }

    /// Whether memory holds records the file does not.
    pub fn is_dirty(&self) -> bool {
        self.records.len() != self.persisted_len
    }

    fn persist_error(&self, e: impl std::fmt::Display) -> Error {
        Error::Persist {
            path: self.path.clone(),
            reason: e.to_string(),
        }
    }
}

/// Flush a directory entry change (create, rename) to disk.
#[cfg(unix)]
fn sync_dir(dir: &Path) -> std::io::Result<()> {
    fs::File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldsync_core::RawEnvelope;
    use serde_json::json;
    use std::io::Write as _;
    use tempfile::TempDir;

    fn record(device_id: &str, received_at: &str) -> TelemetryRecord {
        let env = RawEnvelope::historical(json!({
            "end_device_ids": { "device_id": device_id },
            "received_at": received_at,
            "uplink_message": { "decoded_payload": { "Bat": 3.6 } }
        }));
        TelemetryRecord::from_envelope(&env, chrono::Utc::now())
    }

    #[test]
    fn test_load_missing_file_is_empty() {
        let tmp = TempDir::new().unwrap();
        let store = RecordStore::load(tmp.path().join("data.json")).unwrap();
        assert!(store.is_empty());
        assert!(!store.is_dirty());
    }

    #[test]
    fn test_load_corrupt_file_fails() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("data.json");
        fs::write(&path, b"[{\"timestamp\": \"2024").unwrap();

        let result = RecordStore::load(&path);
        assert!(matches!(result, Err(Error::CorruptState { .. })));
    }

    #[test]
    fn test_load_empty_file_is_corrupt() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("data.json");
        fs::write(&path, b"").unwrap();

        assert!(matches!(
            RecordStore::load(&path),
            Err(Error::CorruptState { .. })
        ));
    }

    #[test]
    fn test_sync_dir() {
        let tmp = TempDir::new().unwrap();
        sync_dir(tmp.path()).unwrap();
        #[cfg(unix)]
        assert!(sync_dir(&tmp.path().join("missing")).is_err());
    }

    #[test]
    fn test_append_persist_and_reload() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("data.json");

        let mut store = RecordStore::load(&path).unwrap();
        store.append([
            record("sensor-1", "2024-01-01T00:00:00Z"),
            record("sensor-1", "2024-01-01T01:00:00Z"),
        ]);
        assert!(store.is_dirty());
        store.persist().unwrap();
        assert!(!store.is_dirty());

        let reloaded = RecordStore::load(&path).unwrap();
        assert_eq!(reloaded.size(), 2);
        assert_eq!(reloaded.records(), store.records());
        assert_eq!(
            reloaded.records()[1].received_at(),
            Some("2024-01-01T01:00:00Z")
        );
    }

    #[test]
    fn test_persist_creates_parent_directories() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nested").join("dir").join("data.json");

        let mut store = RecordStore::empty(&path);
        store.append([record("sensor-1", "t1")]);
        store.persist().unwrap();

        assert!(path.exists());
    }

    #[test]
    fn test_interrupted_write_leaves_previous_file_loadable() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("data.json");

        let mut store = RecordStore::empty(&path);
        store.append([record("sensor-1", "t1"), record("sensor-1", "t2")]);
        store.persist().unwrap();

        // A writer that died before its rename leaves a partial temp file behind.
        let mut partial = NamedTempFile::new_in(tmp.path()).unwrap();
        partial.write_all(b"[{\"timestamp\": \"t3\", \"dev").unwrap();
        let _leftover = partial.into_temp_path().keep().unwrap();

        let reloaded = RecordStore::load(&path).unwrap();
        assert_eq!(reloaded.len(), 2);
    }

    #[test]
    fn test_failed_persist_keeps_previous_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("data.json");

        let mut store = RecordStore::empty(&path);
        store.append([record("sensor-1", "t1")]);
        store.persist().unwrap();

        // Point a second store at a path whose parent is a regular file.
        let mut broken = RecordStore::empty(path.join("child.json"));
        broken.append([record("sensor-1", "t2")]);
        assert!(matches!(broken.persist(), Err(Error::Persist { .. })));
        assert!(broken.is_dirty());

        let reloaded = RecordStore::load(&path).unwrap();
        assert_eq!(reloaded.len(), 1);
    }

    #[test]
    fn test_rollback_never_drops_persisted_records() {
        let tmp = TempDir::new().unwrap();
        let mut store = RecordStore::empty(tmp.path().join("data.json"));
        store.append([record("a", "t1"), record("a", "t2")]);
        store.persist().unwrap();

        store.append([record("a", "t3")]);
        store.rollback(0);
        assert_eq!(store.len(), 2);

        store.append([record("a", "t4")]);
        store.rollback(2);
        assert_eq!(store.len(), 2);
        assert!(!store.is_dirty());
    }

    #[test]
    fn test_persist_preserves_admission_order() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("data.json");

        let mut store = RecordStore::empty(&path);
        store.append([record("a", "2024-01-02T00:00:00Z")]);
        store.append([record("a", "2024-01-01T00:00:00Z")]);
        store.persist().unwrap();

        let reloaded = RecordStore::load(&path).unwrap();
        let order: Vec<_> = reloaded
            .records()
            .iter()
            .filter_map(|r| r.received_at())
            .collect();
        assert_eq!(order, vec!["2024-01-02T00:00:00Z", "2024-01-01T00:00:00Z"]);
    }
}
