// SPDX-License-Identifier: Apache-2.0

//! Directory tailer.
//!
//! The tailer watches a set of directories and, whenever a matching file changes, reads
//! the complete lines appended since the last read and pushes them to a [`LineConsumer`].
//! Progress is tracked per file as `(offset, inode)` in a [`StateStore`], so a restart
//! resumes where it left off and a rotated or truncated file is read from the start.
//! A file that is renamed or moved keeps its read position under the new name.
//!
//! Backpressure runs the other way through the [`Producer`] trait: a consumer may pause
//! the tailer from inside [`LineConsumer::write`], in which case the current read stops
//! after that line and the file is queued to be resumed later.

mod reader;
pub mod watcher;

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};

use regex::Regex;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::state::{StateStore, WatchEntry};
use reader::LineReader;
use watcher::{FileEvent, FileEventKind, FileWatcher, WatcherError};

const MAX_VANISHED: usize = 64;

/// The pausable side of backpressure.
pub trait Producer: Send {
    fn pause_producing(&mut self);

    /// Resume delivery, replaying any reads that were interrupted by a pause into
    /// `consumer`.
    fn resume_producing(&mut self, consumer: &mut dyn LineConsumer);

    fn is_paused(&self) -> bool;
}

/// Receives complete lines, including the trailing newline.
///
/// The producer is handed back on every call so the consumer can pause it before the
/// next line is read.
pub trait LineConsumer: Send {
    fn write(&mut self, line: &[u8], producer: &mut dyn Producer);
}

/// A registered directory.
#[derive(Debug, Clone)]
pub struct WatchRoot {
    pub path: PathBuf,
    pub pattern: Option<Regex>,
    pub recursive: bool,
}

impl WatchRoot {
    fn contains(&self, path: &Path) -> bool {
        if !path.starts_with(&self.path) {
            return false;
        }
        if !self.recursive {
            return path.parent() == Some(self.path.as_path());
        }
        true
    }

    /// Unanchored match used for change notifications.
    fn matches(&self, path: &Path) -> bool {
        match &self.pattern {
            None => true,
            Some(pattern) => pattern.is_match(&path.to_string_lossy()),
        }
    }

    /// Anchored match used for the backlog scan.
    fn matches_from_start(&self, path: &Path) -> bool {
        match &self.pattern {
            None => true,
            Some(pattern) => pattern
                .find(&path.to_string_lossy())
                .is_some_and(|m| m.start() == 0),
        }
    }
}

pub struct Tailer {
    state: StateStore,
    watcher: Box<dyn FileWatcher>,
    roots: Vec<WatchRoot>,
    paused: bool,
    paused_in_read: VecDeque<PathBuf>,
    pending_backlog: Vec<usize>,
    // Entries dropped by removals in the current event batch, kept so a move
    // reported as remove followed by create can carry its position over.
    vanished: VecDeque<WatchEntry>,
}

impl Tailer {
    /// Create a tailer. It starts paused; nothing is delivered until [`Tailer::start`].
    pub fn new(state: StateStore, watcher: Box<dyn FileWatcher>) -> Self {
        Self {
            state,
            watcher,
            roots: Vec::new(),
            paused: true,
            paused_in_read: VecDeque::new(),
            pending_backlog: Vec::new(),
            vanished: VecDeque::new(),
        }
    }

    /// Register a directory for change notifications and schedule its backlog scan.
    ///
    /// `pattern` is matched against full file paths.
    pub fn watch(
        &mut self,
        path: impl AsRef<Path>,
        pattern: Option<Regex>,
        recursive: bool,
    ) -> Result<(), WatcherError> {
        let path = std::path::absolute(path.as_ref())?;
        self.watcher.watch(&path, recursive)?;

        info!(
            path = ?path,
            pattern = pattern.as_ref().map(|p| p.as_str()),
            recursive,
            backend = self.watcher.backend_name(),
            "Watching directory"
        );

        self.roots.push(WatchRoot {
            path,
            pattern,
            recursive,
        });
        self.pending_backlog.push(self.roots.len() - 1);
        Ok(())
    }

    pub fn start(&mut self) {
        self.paused = false;
        info!(roots = self.roots.len(), "Tailer started");
    }

    pub fn roots(&self) -> &[WatchRoot] {
        &self.roots
    }

    pub fn state(&self) -> &StateStore {
        &self.state
    }

    /// Paths whose read was interrupted by a pause, in replay order.
    pub fn paused_paths(&self) -> impl Iterator<Item = &Path> {
        self.paused_in_read.iter().map(PathBuf::as_path)
    }

    /// Find the registered root responsible for `path`.
    ///
    /// Roots are tried most specific first; the first one containing the path whose
    /// pattern is absent or matches wins.
    pub fn check_pattern(&self, path: &Path) -> Option<&WatchRoot> {
        let mut candidates: Vec<&WatchRoot> =
            self.roots.iter().filter(|r| r.contains(path)).collect();
        candidates.sort_by_key(|r| std::cmp::Reverse(r.path.as_os_str().len()));
        candidates.into_iter().find(|r| r.matches(path))
    }

    /// Drop state entries for files that no longer exist.
    pub fn clean_state(&mut self) {
        match self.state.retain_existing() {
            Ok(0) => {}
            Ok(removed) => info!(removed, "Removed state for vanished files"),
            Err(e) => error!(error = %e, "Failed to clean up state"),
        }
    }

    /// Read every matching file under the roots registered since the last scan.
    pub fn scan_backlog(&mut self, consumer: &mut dyn LineConsumer) {
        for index in std::mem::take(&mut self.pending_backlog) {
            let root = self.roots[index].clone();
            let depth = if root.recursive { usize::MAX } else { 1 };

            let files: Vec<PathBuf> = WalkDir::new(&root.path)
                .max_depth(depth)
                .sort_by_file_name()
                .into_iter()
                .filter_map(|entry| match entry {
                    Ok(entry) => Some(entry),
                    Err(e) => {
                        warn!(root = ?root.path, error = %e, "Error scanning backlog");
                        None
                    }
                })
                .filter(|entry| entry.file_type().is_file())
                .map(walkdir::DirEntry::into_path)
                .filter(|path| root.matches_from_start(path))
                .collect();

            info!(
                root = ?root.path,
                files = files.len(),
                "Processing backlog"
            );
            for path in files {
                self.do_read(&path, consumer);
            }
        }
    }

    /// Pull pending notifications from the watcher and handle them.
    pub fn drain_events(&mut self, consumer: &mut dyn LineConsumer) {
        let events = match self.watcher.try_recv() {
            Ok(events) => events,
            Err(e) => {
                error!(error = %e, "Failed to receive file events");
                return;
            }
        };
        for event in events {
            self.handle_event(event, consumer);
        }
        self.vanished.clear();
    }

    pub fn handle_event(&mut self, event: FileEvent, consumer: &mut dyn LineConsumer) {
        match event.kind {
            FileEventKind::Remove => {
                for path in &event.paths {
                    self.forget(path);
                }
            }
            FileEventKind::Create | FileEventKind::Modify => {
                for path in &event.paths {
                    self.on_change(path, consumer);
                }
            }
            FileEventKind::Rename => {
                if let [from, to] = event.paths.as_slice() {
                    self.rename(from, to, consumer);
                }
            }
        }
    }

    fn on_change(&mut self, path: &Path, consumer: &mut dyn LineConsumer) {
        if self.check_pattern(path).is_none() {
            debug!(path = ?path, "Ignoring change to unmatched file");
            return;
        }
        self.do_read(path, consumer);
    }

    fn rename(&mut self, from: &Path, to: &Path, consumer: &mut dyn LineConsumer) {
        let from_key = from.to_string_lossy();
        match self.state.get(&from_key) {
            Some(entry) if self.check_pattern(to).is_some() => {
                debug!(from = ?from, to = ?to, offset = entry.offset, "File renamed, moving state");
                if let Err(e) = self
                    .state
                    .set(&to.to_string_lossy(), entry.offset, entry.inode)
                    .and_then(|_| self.state.delete(&from_key))
                {
                    error!(path = ?to, error = %e, "Failed to persist state");
                }
                for queued in self.paused_in_read.iter_mut().filter(|p| p.as_path() == from) {
                    *queued = to.to_path_buf();
                }
            }
            _ => self.forget(from),
        }
        self.on_change(to, consumer);
    }

    fn forget(&mut self, path: &Path) {
        let key = path.to_string_lossy();
        let Some(entry) = self.state.get(&key) else {
            return;
        };
        debug!(path = ?path, "File removed, dropping state");
        if let Err(e) = self.state.delete(&key) {
            error!(path = ?path, error = %e, "Failed to persist state");
        }
        if self.vanished.len() == MAX_VANISHED {
            self.vanished.pop_front();
        }
        self.vanished.push_back(entry);
    }

    /// Look for the read position of a file that was moved to `key`: an entry with the
    /// same inode whose path is gone, or one dropped earlier in this event batch.
    fn adopt(&mut self, key: &str, inode: u64) -> Option<WatchEntry> {
        let moved = self
            .state
            .entries()
            .find(|(path, entry)| {
                entry.inode == inode && *path != key && !Path::new(path).exists()
            })
            .map(|(path, entry)| (path.to_string(), *entry));

        let entry = match moved {
            Some((old, entry)) => {
                if let Err(e) = self.state.delete(&old) {
                    error!(path = %old, error = %e, "Failed to persist state");
                }
                entry
            }
            None => {
                let index = self.vanished.iter().position(|e| e.inode == inode)?;
                self.vanished.remove(index)?
            }
        };

        info!(path = key, offset = entry.offset, "File moved, keeping read position");
        if let Err(e) = self.state.set(key, entry.offset, entry.inode) {
            error!(path = key, error = %e, "Failed to persist state");
        }
        Some(entry)
    }

    fn defer(&mut self, path: &Path) {
        if !self.paused_in_read.iter().any(|p| p == path) {
            self.paused_in_read.push_back(path.to_path_buf());
        }
    }

    /// Read the complete lines appended to `path` since the last read.
    ///
    /// Stops after the line during which the consumer paused the tailer; the path is
    /// then queued and resumed from the persisted offset by [`Producer::resume_producing`].
    pub fn do_read(&mut self, path: &Path, consumer: &mut dyn LineConsumer) {
        if self.paused {
            self.defer(path);
            return;
        }

        let metadata = match fs::metadata(path) {
            Ok(m) if m.is_file() => m,
            Ok(_) => return,
            Err(e) => {
                debug!(path = ?path, error = %e, "Unable to stat file");
                return;
            }
        };

        let key = path.to_string_lossy().into_owned();
        let inode = reader::inode(&metadata);
        let stored = self
            .state
            .get(&key)
            .or_else(|| self.adopt(&key, inode));
        let mut offset = stored.map_or(0, |entry| entry.offset);

        if let Some(entry) = stored {
            if entry.inode != inode {
                info!(path = ?path, old_inode = entry.inode, inode, "File rotated, reading from start");
                offset = 0;
            } else if metadata.len() < offset {
                warn!(path = ?path, size = metadata.len(), offset, "File truncated, reading from start");
                offset = 0;
            }
        }

        let mut reader = match LineReader::open_at(path, offset) {
            Ok(r) => r,
            Err(e) => {
                error!(path = ?path, error = %e, "Unable to open file");
                return;
            }
        };

        let mut line = Vec::with_capacity(1024);
        let mut interrupted = false;
        loop {
            match reader.next_line(&mut line) {
                Ok(true) => {
                    consumer.write(&line, self);
                    if self.paused {
                        interrupted = true;
                        break;
                    }
                }
                Ok(false) => break,
                Err(e) => {
                    error!(path = ?path, error = %e, "Error reading file");
                    return;
                }
            }
        }

        let entry = WatchEntry::new(reader.offset(), inode);
        if stored != Some(entry) {
            if let Err(e) = self.state.set(&key, entry.offset, entry.inode) {
                error!(path = ?path, error = %e, "Failed to persist state");
            }
        }

        if interrupted {
            debug!(path = ?path, offset = entry.offset, "Paused mid-read");
            self.defer(path);
        }
    }
}

impl Producer for Tailer {
    fn pause_producing(&mut self) {
        if !self.paused {
            debug!("Paused producing");
        }
        self.paused = true;
    }

    fn resume_producing(&mut self, consumer: &mut dyn LineConsumer) {
        self.paused = false;
        debug!(pending = self.paused_in_read.len(), "Resuming production");

        while !self.paused {
            let Some(path) = self.paused_in_read.pop_front() else {
                break;
            };
            debug!(path = ?path, "Resuming read");
            self.do_read(&path, consumer);
        }
    }

    fn is_paused(&self) -> bool {
        self.paused
    }
}
