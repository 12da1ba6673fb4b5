// SPDX-License-Identifier: Apache-2.0

//! Native file system watcher using the `notify` crate.
//!
//! Uses OS-level file system notifications:
//! - Linux: inotify
//! - macOS: FSEvents
//! - Windows: ReadDirectoryChangesW

use std::path::Path;

use flume::{Receiver, TryRecvError};
use notify::event::{ModifyKind, RenameMode};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};

use super::traits::{FileEvent, FileWatcher, WatcherError};

pub struct NativeWatcher {
    watcher: RecommendedWatcher,
    receiver: Receiver<Result<Event, notify::Error>>,
}

impl NativeWatcher {
    pub fn new() -> Result<Self, WatcherError> {
        let (tx, rx) = flume::unbounded();

        let watcher = RecommendedWatcher::new(
            move |res| {
                let _ = tx.send(res);
            },
            Config::default(),
        )
        .map_err(|e| WatcherError::Init(e.to_string()))?;

        Ok(Self {
            watcher,
            receiver: rx,
        })
    }

    fn convert_event(event: Event) -> Option<FileEvent> {
        let mut paths = event.paths;
        let first = paths.first()?.clone();

        let event = match event.kind {
            EventKind::Create(_) => FileEvent::create(first),
            EventKind::Remove(_) => FileEvent::remove(first),
            EventKind::Modify(ModifyKind::Name(RenameMode::From)) => FileEvent::remove(first),
            EventKind::Modify(ModifyKind::Name(RenameMode::To)) => FileEvent::create(first),
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if paths.len() == 2 => {
                let to = paths.pop()?;
                FileEvent::rename(first, to)
            }
            EventKind::Modify(ModifyKind::Metadata(_)) => return None,
            EventKind::Modify(_) => FileEvent::modify(first),
            EventKind::Access(_) | EventKind::Other | EventKind::Any => return None,
        };

        Some(event)
    }
}

impl FileWatcher for NativeWatcher {
    fn watch(&mut self, path: &Path, recursive: bool) -> Result<(), WatcherError> {
        let mode = if recursive {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };
        self.watcher
            .watch(path, mode)
            .map_err(|e| WatcherError::Watch {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })
    }

    fn unwatch(&mut self, path: &Path) -> Result<(), WatcherError> {
        self.watcher.unwatch(path).map_err(|e| WatcherError::Watch {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    fn try_recv(&mut self) -> Result<Vec<FileEvent>, WatcherError> {
        let mut events = Vec::new();

        loop {
            match self.receiver.try_recv() {
                Ok(Ok(event)) => {
                    if let Some(file_event) = Self::convert_event(event) {
                        events.push(file_event);
                    }
                }
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "File watcher error");
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    return Err(WatcherError::Channel("watcher channel disconnected".into()));
                }
            }
        }

        Ok(events)
    }

    fn is_native(&self) -> bool {
        true
    }

    fn backend_name(&self) -> &'static str {
        #[cfg(target_os = "linux")]
        {
            "inotify"
        }
        #[cfg(target_os = "macos")]
        {
            "FSEvents"
        }
        #[cfg(target_os = "windows")]
        {
            "ReadDirectoryChangesW"
        }
        #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
        {
            "native"
        }
    }
}
