// SPDX-License-Identifier: Apache-2.0

//! On-disk encoding of the state document.
//!
//! The document is rewritten wholesale on every change. Writes go to a temp file in the
//! same directory which is then renamed over the target, so a crash mid-write leaves
//! either the old or the new document, never a truncated one.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::error;

use super::{StateError, WatchEntry};

pub(crate) type Entries = BTreeMap<String, WatchEntry>;

/// Load the document at `path`.
///
/// A missing file yields empty state as long as the directory can be written to.
/// A file that exists but cannot be read is an error. Content that does not parse is
/// logged and discarded.
pub(crate) fn load(path: &Path) -> Result<Entries, StateError> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            ensure_writable(path)?;
            return Ok(Entries::new());
        }
        Err(e) => {
            return Err(StateError::Io {
                path: path.to_path_buf(),
                source: e,
            });
        }
    };

    match serde_json::from_reader::<_, Entries>(BufReader::new(file)) {
        Ok(entries) => Ok(entries),
        Err(e) if e.is_io() => Err(StateError::Io {
            path: path.to_path_buf(),
            source: e.into(),
        }),
        Err(e) => {
            error!(path = ?path, error = %e, "Invalid state file, starting with empty state");
            Ok(Entries::new())
        }
    }
}

/// Check that the directory holding `path` exists and accepts new files.
fn ensure_writable(path: &Path) -> Result<(), StateError> {
    let dir = parent_dir(path);

    let unwritable = |source: io::Error| StateError::Unwritable {
        dir: dir.clone(),
        source,
    };

    if !dir.exists() {
        fs::create_dir_all(&dir).map_err(unwritable)?;
    }

    let probe = temp_path(path, "probe");
    OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&probe)
        .map_err(unwritable)?;
    // Leftover probe files are harmless.
    let _ = fs::remove_file(&probe);

    Ok(())
}

/// Write the document to `path` atomically (write to temp, then rename).
pub(crate) fn atomic_write<T: Serialize>(path: &Path, state: &T) -> Result<(), StateError> {
    let temp_path = temp_path(path, "tmp");

    let io_err = |source: io::Error| StateError::Io {
        path: temp_path.clone(),
        source,
    };

    let file = File::create(&temp_path).map_err(io_err)?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer(&mut writer, state).map_err(|e| StateError::Json {
        path: path.to_path_buf(),
        source: e,
    })?;
    writer.flush().map_err(io_err)?;
    drop(writer);

    fs::rename(&temp_path, path).map_err(|e| StateError::Io {
        path: path.to_path_buf(),
        source: e,
    })
}

fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

fn temp_path(path: &Path, kind: &str) -> PathBuf {
    use portable_atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let unique_id = COUNTER.fetch_add(1, Ordering::SeqCst);
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "state".to_string());

    parent_dir(path).join(format!(
        ".{}.{}.{}.{}",
        name,
        kind,
        std::process::id(),
        unique_id
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_atomic_write_leaves_no_temp_files() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");

        let mut entries = Entries::new();
        entries.insert("/var/log/a.log".to_string(), WatchEntry::new(10, 7));
        atomic_write(&path, &entries).unwrap();
        atomic_write(&path, &entries).unwrap();

        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("state.json")]);
    }

    #[test]
    fn test_document_format() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");

        let mut entries = Entries::new();
        entries.insert("/b.log".to_string(), WatchEntry::new(20, 2));
        entries.insert("/a.log".to_string(), WatchEntry::new(10, 1));
        atomic_write(&path, &entries).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content, r#"{"/a.log":[10,1],"/b.log":[20,2]}"#);
    }

    #[test]
    fn test_load_creates_missing_directory() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");

        let entries = load(&path).unwrap();
        assert!(entries.is_empty());
        assert!(dir.path().join("nested").is_dir());
    }
}
