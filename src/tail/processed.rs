//! Append-only record of log lines that were already handled.
//!
//! One raw line per entry. The file is replayed in full at the start of
//! every scan and only ever grows. Entries are compared as bytes.

use super::{complete_lines, is_blank};
use anyhow::{Context, Result};
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

pub struct ProcessedLines {
    path: PathBuf,
    lines: HashSet<Vec<u8>>,
}

impl ProcessedLines {
    /// Load the set, creating an empty file if there is none yet.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)
            .with_context(|| format!("Failed to open processed lines file: {}", path.display()))?;

        let mut content = Vec::new();
        file.read_to_end(&mut content)
            .with_context(|| format!("Failed to read processed lines file: {}", path.display()))?;

        let lines = content
            .split(|b| *b == b'\n')
            .map(|line| line.strip_suffix(b"\r").unwrap_or(line))
            .filter(|line| !line.is_empty())
            .map(<[u8]>::to_vec)
            .collect();

        Ok(Self { path, lines })
    }

    pub fn contains(&self, line: &[u8]) -> bool {
        self.lines.contains(line)
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Durably append `line`. It only counts as processed once it is on disk.
    pub fn record(&mut self, line: &[u8]) -> Result<()> {
        if self.lines.contains(line) {
            return Ok(());
        }

        let mut entry = Vec::with_capacity(line.len() + 1);
        entry.extend_from_slice(line);
        entry.push(b'\n');

        let mut file = self.open_append()?;
        file.write_all(&entry)
            .and_then(|_| file.sync_all())
            .with_context(|| format!("Failed to append to {}", self.path.display()))?;

        self.lines.insert(line.to_vec());
        Ok(())
    }

    /// Lines of `log` that are not in the set, in log order.
    ///
    /// Blank lines and an unterminated trailing fragment are never
    /// candidates.
    pub fn unseen<'a>(&self, log: &'a [u8]) -> Vec<&'a [u8]> {
        complete_lines(log)
            .filter(|line| !is_blank(line))
            .filter(|line| !self.lines.contains(*line))
            .collect()
    }

    fn open_append(&self) -> Result<File> {
        OpenOptions::new()
            .append(true)
            .create(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open {} for append", self.path.display()))
    }
}
