// SPDX-License-Identifier: Apache-2.0

//! Append-only record of rows that will not be delivered.
//!
//! Each line is one JSON array of `{"insertId": .., "json": ..}` rows.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, error};

use crate::transport::InsertRow;

#[derive(Debug, Clone)]
pub struct DeadLetter {
    path: PathBuf,
}

impl DeadLetter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record `rows` as dropped. Failures are logged, never returned.
    pub fn write(&self, upload_id: &str, rows: &[InsertRow]) {
        if rows.is_empty() {
            return;
        }
        match self.append(rows) {
            Ok(()) => debug!(
                upload_id,
                rows = rows.len(),
                path = ?self.path,
                "Failed rows written to disk"
            ),
            Err(e) => error!(
                upload_id,
                rows = rows.len(),
                path = ?self.path,
                error = %e,
                "Failed saving failed rows to file"
            ),
        }
    }

    fn append(&self, rows: &[InsertRow]) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut line = serde_json::to_vec(rows)?;
        line.push(b'\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(&line)
    }
}
