// SPDX-License-Identifier: Apache-2.0

//! Traits and types for file system watchers.

use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum WatcherError {
    #[error("watcher initialization failed: {0}")]
    Init(String),

    #[error("failed to watch {path}: {reason}")]
    Watch { path: PathBuf, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("channel error: {0}")]
    Channel(String),
}

/// Kind of file event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileEventKind {
    /// File was created
    Create,
    /// File content changed
    Modify,
    /// File was removed or moved away
    Remove,
    /// File was renamed, `paths` holds the old and the new path
    Rename,
}

/// A file system event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEvent {
    pub kind: FileEventKind,
    pub paths: Vec<PathBuf>,
}

impl FileEvent {
    pub fn new(kind: FileEventKind, paths: Vec<PathBuf>) -> Self {
        Self { kind, paths }
    }

    pub fn create(path: PathBuf) -> Self {
        Self::new(FileEventKind::Create, vec![path])
    }

    pub fn modify(path: PathBuf) -> Self {
        Self::new(FileEventKind::Modify, vec![path])
    }

    pub fn remove(path: PathBuf) -> Self {
        Self::new(FileEventKind::Remove, vec![path])
    }

    pub fn rename(from: PathBuf, to: PathBuf) -> Self {
        Self::new(FileEventKind::Rename, vec![from, to])
    }
}

/// Source of file system change notifications.
///
/// Implementations can use native OS notifications or polling. Events are pulled with
/// [`FileWatcher::try_recv`]; while nobody pulls, events stay queued in the watcher.
pub trait FileWatcher: Send {
    /// Start watching a directory, descending into subdirectories when `recursive`.
    fn watch(&mut self, path: &Path, recursive: bool) -> Result<(), WatcherError>;

    fn unwatch(&mut self, path: &Path) -> Result<(), WatcherError>;

    /// Return any pending events without blocking.
    fn try_recv(&mut self) -> Result<Vec<FileEvent>, WatcherError>;

    /// True for inotify/kqueue/FSEvents watchers, false for poll watchers.
    fn is_native(&self) -> bool;

    /// Name of the watcher backend for logging.
    fn backend_name(&self) -> &'static str;
}
