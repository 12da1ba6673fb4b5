// SPDX-License-Identifier: Apache-2.0

//! Positioning and line reading for a single file.

use std::fs::{File, Metadata};
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::Path;

const SCAN_BLOCK: u64 = 4096;

/// Inode number of a file. Stays stable across renames, so a same-named file with a
/// different inode means the original was rotated away.
#[cfg(unix)]
pub(crate) fn inode(metadata: &Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    metadata.ino()
}

/// Platforms without inodes never report a rotation; truncation is still detected.
#[cfg(not(unix))]
pub(crate) fn inode(_metadata: &Metadata) -> u64 {
    0
}

/// Reads complete lines from a file, tracking the byte offset after the last one.
pub(crate) struct LineReader {
    reader: BufReader<File>,
    offset: u64,
}

impl LineReader {
    /// Open `path` positioned at the start of the line containing `offset - 1`, so a
    /// stored offset that lands mid-line resumes at the beginning of that line.
    pub(crate) fn open_at(path: &Path, offset: u64) -> io::Result<Self> {
        let mut file = File::open(path)?;
        let start = if offset == 0 {
            0
        } else {
            line_start(&mut file, offset)?
        };
        file.seek(SeekFrom::Start(start))?;

        Ok(Self {
            reader: BufReader::new(file),
            offset: start,
        })
    }

    /// Byte offset just past the last complete line returned.
    pub(crate) fn offset(&self) -> u64 {
        self.offset
    }

    /// Read the next newline-terminated line into `buf`, including the newline.
    ///
    /// Returns `false` at end of file. A trailing fragment without a newline is not
    /// returned and does not advance the offset.
    pub(crate) fn next_line(&mut self, buf: &mut Vec<u8>) -> io::Result<bool> {
        buf.clear();
        let n = self.reader.read_until(b'\n', buf)?;
        if n == 0 || buf.last() != Some(&b'\n') {
            return Ok(false);
        }
        self.offset += n as u64;
        Ok(true)
    }
}

/// Find the offset of the first byte of the line that contains `offset - 1`.
fn line_start(file: &mut File, offset: u64) -> io::Result<u64> {
    let mut byte = [0u8; 1];
    file.seek(SeekFrom::Start(offset - 1))?;
    file.read_exact(&mut byte)?;
    if byte[0] == b'\n' {
        return Ok(offset);
    }

    let mut end = offset;
    let mut block = vec![0u8; SCAN_BLOCK as usize];
    while end > 0 {
        let start = end.saturating_sub(SCAN_BLOCK);
        let len = (end - start) as usize;
        file.seek(SeekFrom::Start(start))?;
        file.read_exact(&mut block[..len])?;
        if let Some(pos) = block[..len].iter().rposition(|b| *b == b'\n') {
            return Ok(start + pos as u64 + 1);
        }
        end = start;
    }

    Ok(0)
}
