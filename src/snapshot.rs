//! On-disk snapshot history.
//!
//! ```text
//! snapshots_dir/
//! ├── 20240912_083000_000123.json   history, one file per change
//! ├── 20240912_090000_004567.json
//! └── current.json                  last successful extraction
//! ```
//!
//! History names are fixed-width UTC timestamps, so lexicographic order is
//! chronological order. Every file is written to a temporary file in the
//! same directory and renamed into place; readers never observe a partial
//! file, and a failed write leaves the previous file untouched. History
//! files are never replaced: when a name is taken, the next free
//! microsecond is used.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Timelike, Utc};
use schedule_watch_core::models::Snapshot;
use serde::Serialize;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use crate::error::PersistenceError;

/// Name of the current-pointer file.
pub const CURRENT_FILE: &str = "current.json";

const NAME_FORMAT: &str = "%Y%m%d_%H%M%S_%6f";
const NAME_LEN: usize = "YYYYMMDD_HHMMSS_ffffff.json".len();
/// Free names tried after the capture time's own name is taken.
const NAME_ATTEMPTS: i64 = 1_000;

/// A historical snapshot file.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SnapshotEntry {
    pub name: String,
    pub captured_at: DateTime<Utc>,
    pub size_bytes: u64,
}

/// Snapshot history rooted at one directory.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    dir: PathBuf,
    history_limit: usize,
}

impl SnapshotStore {
    pub fn new(dir: impl Into<PathBuf>, history_limit: usize) -> Self {
        Self {
            dir: dir.into(),
            history_limit: history_limit.max(1),
        }
    }

    /// History file name for a capture time.
    pub fn file_name(captured_at: &DateTime<Utc>) -> String {
        format!("{}.json", captured_at.format(NAME_FORMAT))
    }

    /// Appends a history entry, replaces the current pointer, and prunes
    /// history to the configured limit. Returns the history file name.
    pub fn put(&self, snapshot: &Snapshot) -> Result<String, PersistenceError> {
        self.ensure_dir()?;
        let name = self.write_history(snapshot)?;
        self.write_atomic(CURRENT_FILE, snapshot)?;
        let removed = self.prune()?;
        if removed > 0 {
            tracing::debug!(removed, "pruned snapshot history");
        }
        Ok(name)
    }

    /// Replaces the current pointer only.
    pub fn set_current(&self, snapshot: &Snapshot) -> Result<(), PersistenceError> {
        self.ensure_dir()?;
        self.write_atomic(CURRENT_FILE, snapshot)
    }

    /// The current pointer, if one has been written.
    pub fn current(&self) -> Result<Option<Snapshot>, PersistenceError> {
        let path = self.dir.join(CURRENT_FILE);
        if !path.exists() {
            return Ok(None);
        }
        read_snapshot(&path).map(Some)
    }

    /// History entries, newest first. `current.json` is not listed.
    pub fn list(&self) -> Result<Vec<SnapshotEntry>, PersistenceError> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let read_dir =
            std::fs::read_dir(&self.dir).map_err(|e| PersistenceError::io(&self.dir, e))?;

        let mut entries = Vec::new();
        for item in read_dir {
            let item = item.map_err(|e| PersistenceError::io(&self.dir, e))?;
            let name = item.file_name().to_string_lossy().into_owned();
            let Some(captured_at) = parse_history_name(&name) else {
                continue;
            };
            let size_bytes = item.metadata().map(|m| m.len()).unwrap_or(0);
            entries.push(SnapshotEntry {
                name,
                captured_at,
                size_bytes,
            });
        }
        entries.sort_by(|a, b| b.name.cmp(&a.name));
        Ok(entries)
    }

    /// Loads a history entry or `current.json` by file name.
    pub fn load(&self, name: &str) -> Result<Snapshot, PersistenceError> {
        if name != CURRENT_FILE && parse_history_name(name).is_none() {
            return Err(PersistenceError::InvalidName(name.to_string()));
        }
        let path = self.dir.join(name);
        if !path.exists() {
            return Err(PersistenceError::NotFound(name.to_string()));
        }
        read_snapshot(&path)
    }

    /// Deletes the oldest history entries beyond the limit.
    pub fn prune(&self) -> Result<usize, PersistenceError> {
        let entries = self.list()?;
        let mut removed = 0;
        for entry in entries.iter().skip(self.history_limit) {
            let path = self.dir.join(&entry.name);
            std::fs::remove_file(&path).map_err(|e| PersistenceError::io(&path, e))?;
            removed += 1;
        }
        Ok(removed)
    }

    fn ensure_dir(&self) -> Result<(), PersistenceError> {
        std::fs::create_dir_all(&self.dir).map_err(|e| PersistenceError::io(&self.dir, e))
    }

    /// Writes a new history file without replacing an existing one.
    fn write_history(&self, snapshot: &Snapshot) -> Result<String, PersistenceError> {
        let mut tmp = self.staged(snapshot)?;
        for offset in 0..=NAME_ATTEMPTS {
            let at = snapshot.captured_at + chrono::Duration::microseconds(offset);
            let name = Self::file_name(&at);
            let path = self.dir.join(&name);
            match tmp.persist_noclobber(&path) {
                Ok(_) => return Ok(name),
                Err(e) if e.error.kind() == ErrorKind::AlreadyExists => tmp = e.file,
                Err(e) => return Err(PersistenceError::io(&path, e.error)),
            }
        }
        Err(PersistenceError::io(
            &self.dir,
            std::io::Error::new(ErrorKind::AlreadyExists, "no free history file name"),
        ))
    }

    fn write_atomic(&self, name: &str, snapshot: &Snapshot) -> Result<(), PersistenceError> {
        let path = self.dir.join(name);
        self.staged(snapshot)?
            .persist(&path)
            .map_err(|e| PersistenceError::io(&path, e.error))?;
        Ok(())
    }

    /// A synced temporary file in the store directory holding `snapshot`.
    fn staged(&self, snapshot: &Snapshot) -> Result<tempfile::NamedTempFile, PersistenceError> {
        let body = serde_json::to_vec_pretty(snapshot).map_err(|source| {
            PersistenceError::Malformed {
                path: self.dir.clone(),
                source,
            }
        })?;
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)
            .map_err(|e| PersistenceError::io(&self.dir, e))?;
        tmp.write_all(&body)
            .and_then(|_| tmp.as_file().sync_all())
            .map_err(|e| PersistenceError::io(tmp.path(), e))?;
        Ok(tmp)
    }
}

fn read_snapshot(path: &Path) -> Result<Snapshot, PersistenceError> {
    let bytes = std::fs::read(path).map_err(|e| PersistenceError::io(path, e))?;
    serde_json::from_slice(&bytes).map_err(|source| PersistenceError::Malformed {
        path: path.to_path_buf(),
        source,
    })
}

/// Capture time encoded in a history file name, or `None` for any other name.
pub fn parse_history_name(name: &str) -> Option<DateTime<Utc>> {
    if name.len() != NAME_LEN || !name.is_ascii() {
        return None;
    }
    let stem = name.strip_suffix(".json")?;
    let bytes = stem.as_bytes();
    let digits_ok = bytes
        .iter()
        .enumerate()
        .all(|(i, b)| if i == 8 || i == 15 { *b == b'_' } else { b.is_ascii_digit() });
    if !digits_ok {
        return None;
    }

    let date = NaiveDate::parse_from_str(&stem[..8], "%Y%m%d").ok()?;
    let time = NaiveTime::parse_from_str(&stem[9..15], "%H%M%S").ok()?;
    let micros: u32 = stem[16..].parse().ok()?;
    let time = time.with_nanosecond(micros * 1_000)?;
    Some(NaiveDateTime::new(date, time).and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use schedule_watch_core::models::{Day, Lesson, ScheduleDocument};
    use tempfile::TempDir;

    fn document(name: &str) -> ScheduleDocument {
        let mut doc = ScheduleDocument::new();
        doc.insert(
            "12.09.2024",
            Day {
                weekday: "Чт".to_string(),
                lessons: vec![Lesson::placeholder("1", name)],
            },
        );
        doc
    }

    fn snapshot_at(secs: i64, name: &str) -> Snapshot {
        let at = Utc.timestamp_opt(1_726_000_000 + secs, 123_456_000).unwrap();
        Snapshot::capture_at(document(name), at)
    }

    #[test]
    fn test_file_name_round_trip() {
        let at = Utc.with_ymd_and_hms(2024, 9, 12, 8, 30, 5).unwrap()
            + chrono::Duration::microseconds(42);
        let name = SnapshotStore::file_name(&at);
        assert_eq!(name, "20240912_083005_000042.json");
        assert_eq!(parse_history_name(&name), Some(at));
    }

    #[test]
    fn test_parse_rejects_other_names() {
        assert!(parse_history_name(CURRENT_FILE).is_none());
        assert!(parse_history_name("../etc/passwd").is_none());
        assert!(parse_history_name("20240912_083005_00004x.json").is_none());
        assert!(parse_history_name("20241312_083005_000042.json").is_none());
    }

    #[test]
    fn test_put_writes_history_and_current() {
        let tmp = TempDir::new().unwrap();
        let store = SnapshotStore::new(tmp.path().join("snaps"), 10);
        assert!(store.current().unwrap().is_none());
        assert!(store.list().unwrap().is_empty());

        let snap = snapshot_at(0, "Math");
        let name = store.put(&snap).unwrap();

        assert_eq!(store.current().unwrap(), Some(snap.clone()));
        assert_eq!(store.load(&name).unwrap(), snap);
        let listed = store.list().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].captured_at, snap.captured_at);
    }

    #[test]
    fn test_same_instant_never_replaces_history() {
        let tmp = TempDir::new().unwrap();
        let store = SnapshotStore::new(tmp.path(), 10);
        let first = snapshot_at(0, "Math");
        let second = Snapshot::capture_at(document("Physics"), first.captured_at);

        let first_name = store.put(&first).unwrap();
        let second_name = store.put(&second).unwrap();

        assert_ne!(first_name, second_name);
        assert_eq!(store.load(&first_name).unwrap(), first);
        assert_eq!(store.load(&second_name).unwrap(), second);
        assert_eq!(store.list().unwrap()[0].name, second_name);
        assert_eq!(store.current().unwrap(), Some(second));
    }

    #[test]
    fn test_set_current_leaves_history_alone() {
        let tmp = TempDir::new().unwrap();
        let store = SnapshotStore::new(tmp.path(), 10);
        store.put(&snapshot_at(0, "Math")).unwrap();

        let refreshed = snapshot_at(60, "Math");
        store.set_current(&refreshed).unwrap();

        assert_eq!(store.list().unwrap().len(), 1);
        assert_eq!(
            store.current().unwrap().map(|s| s.captured_at),
            Some(refreshed.captured_at)
        );
    }

    #[test]
    fn test_prune_keeps_newest_and_current() {
        let tmp = TempDir::new().unwrap();
        let store = SnapshotStore::new(tmp.path(), 3);
        for i in 0..5 {
            store.put(&snapshot_at(i, &format!("v{}", i))).unwrap();
        }

        let listed = store.list().unwrap();
        assert_eq!(listed.len(), 3);
        let newest = SnapshotStore::file_name(&snapshot_at(4, "v4").captured_at);
        let oldest_kept = SnapshotStore::file_name(&snapshot_at(2, "v2").captured_at);
        assert_eq!(listed[0].name, newest);
        assert_eq!(listed[2].name, oldest_kept);
        assert!(tmp.path().join(CURRENT_FILE).exists());
    }

    #[test]
    fn test_load_validates_name() {
        let tmp = TempDir::new().unwrap();
        let store = SnapshotStore::new(tmp.path(), 3);
        assert!(matches!(
            store.load("../secret.json"),
            Err(PersistenceError::InvalidName(_))
        ));
        assert!(matches!(
            store.load("20240912_083005_000042.json"),
            Err(PersistenceError::NotFound(_))
        ));
    }

    #[test]
    fn test_malformed_current_is_error() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join(CURRENT_FILE), b"{ not json").unwrap();
        let store = SnapshotStore::new(tmp.path(), 3);
        assert!(matches!(
            store.current(),
            Err(PersistenceError::Malformed { .. })
        ));
    }

    #[test]
    fn test_no_temp_files_left_behind() {
        let tmp = TempDir::new().unwrap();
        let store = SnapshotStore::new(tmp.path(), 3);
        store.put(&snapshot_at(0, "Math")).unwrap();
        let names: Vec<String> = std::fs::read_dir(tmp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 2);
    }
}
