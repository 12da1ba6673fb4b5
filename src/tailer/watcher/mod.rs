// SPDX-License-Identifier: Apache-2.0

//! File system watchers feeding the tailer.
//!
//! Two strategies are available:
//! - **Native watching**: OS-level notifications (inotify on Linux, FSEvents on macOS,
//!   ReadDirectoryChangesW on Windows).
//! - **Poll watching**: periodic directory scans, for file systems where native
//!   notifications are missing or unreliable (NFS, network shares).
//!
//! `auto` mode tries native watching first and falls back to polling.

mod native;
mod poll;
mod traits;

pub use native::NativeWatcher;
pub use poll::PollWatcher;
pub use traits::{FileEvent, FileEventKind, FileWatcher, WatcherError};

use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WatchMode {
    /// Native watching with a polling fallback
    #[default]
    Auto,
    /// Native watching only
    Native,
    /// Periodic directory scans
    Poll,
}

impl std::str::FromStr for WatchMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(WatchMode::Auto),
            "native" => Ok(WatchMode::Native),
            "poll" | "polling" => Ok(WatchMode::Poll),
            _ => Err(format!(
                "Invalid watch mode '{}'. Valid options: auto, native, poll",
                s
            )),
        }
    }
}

pub fn create_watcher(
    mode: WatchMode,
    poll_interval: Duration,
) -> Result<Box<dyn FileWatcher>, WatcherError> {
    match mode {
        WatchMode::Native => Ok(Box::new(NativeWatcher::new()?)),
        WatchMode::Poll => Ok(Box::new(PollWatcher::new(poll_interval))),
        WatchMode::Auto => match NativeWatcher::new() {
            Ok(watcher) => {
                tracing::info!(backend = watcher.backend_name(), "Using native file system watcher");
                Ok(Box::new(watcher))
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    "Native file watching unavailable, falling back to polling"
                );
                Ok(Box::new(PollWatcher::new(poll_interval)))
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_watch_mode_from_str() {
        assert_eq!("auto".parse::<WatchMode>().unwrap(), WatchMode::Auto);
        assert_eq!("native".parse::<WatchMode>().unwrap(), WatchMode::Native);
        assert_eq!("poll".parse::<WatchMode>().unwrap(), WatchMode::Poll);
        assert_eq!("polling".parse::<WatchMode>().unwrap(), WatchMode::Poll);
        assert_eq!("AUTO".parse::<WatchMode>().unwrap(), WatchMode::Auto);
        assert!("invalid".parse::<WatchMode>().is_err());
    }

    #[test]
    fn test_create_poll_watcher() {
        let watcher = create_watcher(WatchMode::Poll, Duration::from_millis(250)).unwrap();
        assert!(!watcher.is_native());
    }
}
