// SPDX-License-Identifier: Apache-2.0

//! Polling-based file watcher as a fallback for systems where native
//! file system notifications are unavailable or unreliable (e.g., NFS).

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use walkdir::WalkDir;

use super::traits::{FileEvent, FileWatcher, WatcherError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileState {
    modified: SystemTime,
    size: u64,
}

/// Periodically scans the watched directories and reports files that appeared,
/// changed size or mtime, or disappeared since the previous scan.
pub struct PollWatcher {
    roots: Vec<(PathBuf, bool)>,
    file_states: HashMap<PathBuf, FileState>,
    poll_interval: Duration,
    last_poll: Instant,
}

impl PollWatcher {
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            roots: Vec::new(),
            file_states: HashMap::new(),
            poll_interval,
            last_poll: Instant::now(),
        }
    }

    fn scan(&self) -> HashMap<PathBuf, FileState> {
        let mut found = HashMap::with_capacity(self.file_states.len());

        for (root, recursive) in &self.roots {
            let depth = if *recursive { usize::MAX } else { 1 };
            for entry in WalkDir::new(root).max_depth(depth).into_iter() {
                let entry = match entry {
                    Ok(e) => e,
                    Err(e) => {
                        tracing::debug!(root = ?root, error = %e, "Error scanning directory");
                        continue;
                    }
                };
                if !entry.file_type().is_file() {
                    continue;
                }
                let Ok(metadata) = entry.metadata() else {
                    continue;
                };
                let Ok(modified) = metadata.modified() else {
                    continue;
                };
                found.insert(
                    entry.into_path(),
                    FileState {
                        modified,
                        size: metadata.len(),
                    },
                );
            }
        }

        found
    }

    fn poll(&mut self) -> Vec<FileEvent> {
        let current = self.scan();
        let mut events = Vec::new();

        for (path, state) in &current {
            match self.file_states.get(path) {
                None => events.push(FileEvent::create(path.clone())),
                Some(old) if old != state => events.push(FileEvent::modify(path.clone())),
                Some(_) => {}
            }
        }

        let seen: HashSet<&PathBuf> = current.keys().collect();
        for path in self.file_states.keys() {
            if !seen.contains(path) {
                events.push(FileEvent::remove(path.clone()));
            }
        }

        self.file_states = current;
        self.last_poll = Instant::now();
        events
    }
}

impl FileWatcher for PollWatcher {
    fn watch(&mut self, path: &Path, recursive: bool) -> Result<(), WatcherError> {
        if !path.is_dir() {
            return Err(WatcherError::Watch {
                path: path.to_path_buf(),
                reason: "not a directory".to_string(),
            });
        }

        if !self.roots.iter().any(|(p, _)| p == path) {
            self.roots.push((path.to_path_buf(), recursive));
        }

        // Files already present are picked up by the backlog scan, not reported here.
        self.file_states = self.scan();
        Ok(())
    }

    fn unwatch(&mut self, path: &Path) -> Result<(), WatcherError> {
        self.roots.retain(|(p, _)| p != path);
        self.file_states.retain(|p, _| !p.starts_with(path));
        Ok(())
    }

    fn try_recv(&mut self) -> Result<Vec<FileEvent>, WatcherError> {
        if self.last_poll.elapsed() < self.poll_interval {
            return Ok(Vec::new());
        }
        Ok(self.poll())
    }

    fn is_native(&self) -> bool {
        false
    }

    fn backend_name(&self) -> &'static str {
        "poll"
    }
}
