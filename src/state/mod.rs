// SPDX-License-Identifier: Apache-2.0

//! Persistent per-file read progress.
//!
//! Maps each watched file path to the byte offset that has been delivered so far and
//! the inode the offset belongs to. Every mutation is saved to disk immediately.

mod json_file;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use json_file::Entries;

#[derive(Error, Debug)]
pub enum StateError {
    #[error("state file {path} is not accessible: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode state for {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("state directory {dir} is not writable: {source}")]
    Unwritable {
        dir: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Read progress for a single file. Stored on disk as `[offset, inode]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "(u64, u64)", into = "(u64, u64)")]
pub struct WatchEntry {
    pub offset: u64,
    pub inode: u64,
}

impl WatchEntry {
    pub fn new(offset: u64, inode: u64) -> Self {
        Self { offset, inode }
    }
}

impl From<(u64, u64)> for WatchEntry {
    fn from((offset, inode): (u64, u64)) -> Self {
        Self { offset, inode }
    }
}

impl From<WatchEntry> for (u64, u64) {
    fn from(entry: WatchEntry) -> Self {
        (entry.offset, entry.inode)
    }
}

pub struct StateStore {
    path: PathBuf,
    entries: Entries,
}

impl StateStore {
    /// Open the state document at `path`, loading any previous progress.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StateError> {
        let path = path.as_ref().to_path_buf();
        let entries = json_file::load(&path)?;

        debug!(path = ?path, entries = entries.len(), "Loaded state");

        Ok(Self { path, entries })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, path: &str) -> Option<WatchEntry> {
        self.entries.get(path).copied()
    }

    pub fn set(&mut self, path: &str, offset: u64, inode: u64) -> Result<(), StateError> {
        self.entries
            .insert(path.to_string(), WatchEntry::new(offset, inode));
        self.save()
    }

    /// Remove the entry for `path`. Removing an unknown path does not touch the disk.
    pub fn delete(&mut self, path: &str) -> Result<(), StateError> {
        if self.entries.remove(path).is_some() {
            self.save()?;
        }
        Ok(())
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &WatchEntry)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop entries whose files no longer exist. Returns the number removed.
    pub fn retain_existing(&mut self) -> Result<usize, StateError> {
        let before = self.entries.len();
        self.entries.retain(|path, _| Path::new(path).exists());

        let removed = before - self.entries.len();
        if removed > 0 {
            self.save()?;
        }
        Ok(removed)
    }

    fn save(&self) -> Result<(), StateError> {
        json_file::atomic_write(&self.path, &self.entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn read_doc(path: &Path) -> serde_json::Value {
        serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap()
    }

    #[test]
    fn test_load_existing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, r#"{"/var/log/foo.log": [1234, 99]}"#).unwrap();

        let store = StateStore::open(&path).unwrap();
        assert_eq!(store.get("/var/log/foo.log"), Some(WatchEntry::new(1234, 99)));
        assert_eq!(store.get("/var/log/bar.log"), None);
    }

    #[test]
    fn test_set_saves_immediately() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");

        let mut store = StateStore::open(&path).unwrap();
        store.set("/var/log/foo.log", 42, 7).unwrap();

        assert_eq!(
            read_doc(&path),
            serde_json::json!({"/var/log/foo.log": [42, 7]})
        );
    }

    #[test]
    fn test_delete_saves_immediately() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, r#"{"/a.log": [1, 2], "/b.log": [3, 4]}"#).unwrap();

        let mut store = StateStore::open(&path).unwrap();
        store.delete("/a.log").unwrap();

        assert_eq!(read_doc(&path), serde_json::json!({"/b.log": [3, 4]}));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_round_trip_preserves_entries() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");

        {
            let mut store = StateStore::open(&path).unwrap();
            store.set("/logs/one.log", 0, 1).unwrap();
            store.set("/logs/two.log", u64::MAX, 12345678901).unwrap();
            store.set("/logs/sub dir/three.log", 4096, 3).unwrap();
        }

        let store = StateStore::open(&path).unwrap();
        let entries: Vec<_> = store.entries().map(|(p, e)| (p.to_string(), *e)).collect();
        assert_eq!(
            entries,
            vec![
                ("/logs/one.log".to_string(), WatchEntry::new(0, 1)),
                ("/logs/sub dir/three.log".to_string(), WatchEntry::new(4096, 3)),
                ("/logs/two.log".to_string(), WatchEntry::new(u64::MAX, 12345678901)),
            ]
        );
    }

    #[test]
    fn test_invalid_file_starts_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, "this is not json {").unwrap();

        let store = StateStore::open(&path).unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn test_missing_file_writable_dir() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");

        let store = StateStore::open(&path).unwrap();
        assert!(store.is_empty());
        assert!(!path.exists());
    }

    #[test]
    fn test_missing_file_unwritable_dir() {
        let dir = tempdir().unwrap();
        // A regular file standing where the state directory should be
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, "").unwrap();

        let result = StateStore::open(blocker.join("state.json"));
        assert!(matches!(result, Err(StateError::Unwritable { .. })));
    }

    #[test]
    fn test_exists_but_unreadable() {
        let dir = tempdir().unwrap();
        // A directory opens fine but fails on read
        let path = dir.path().join("state.json");
        fs::create_dir(&path).unwrap();

        let result = StateStore::open(&path);
        assert!(matches!(result, Err(StateError::Io { .. })));
    }

    #[test]
    fn test_retain_existing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        let live = dir.path().join("live.log");
        fs::write(&live, "x\n").unwrap();

        let mut store = StateStore::open(&path).unwrap();
        store.set(live.to_str().unwrap(), 2, 1).unwrap();
        store.set("/definitely/not/here.log", 5, 1).unwrap();

        assert_eq!(store.retain_existing().unwrap(), 1);
        assert_eq!(store.len(), 1);
        assert!(store.get(live.to_str().unwrap()).is_some());
    }
}
