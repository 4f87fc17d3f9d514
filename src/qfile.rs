//! HylaFAX queue file access.
//!
//! A queue file is an ordered list of `tag:value` lines. Tags may repeat
//! (`!tiff`, `fax`, ...). The file is held under an exclusive `flock` for as
//! long as a [`Qfile`] is alive, the same way HylaFAX itself locks it.

use fs2::FileExt;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors from opening, reading or rewriting a queue file.
#[derive(Debug, Error)]
pub enum QfileError {
    #[error("queue file not found: {}", path.display())]
    NotFound { path: PathBuf },

    #[error("failed to open queue file {}: {source}", path.display())]
    Open { path: PathBuf, source: io::Error },

    #[error("failed to lock queue file {}: {source}", path.display())]
    LockFailed { path: PathBuf, source: io::Error },

    #[error("{}: error parsing line {line}: {text:?}", path.display())]
    Parse {
        path: PathBuf,
        line: usize,
        text: String,
    },

    #[error("invalid queue file entry {tag:?}: {value:?}")]
    InvalidEntry { tag: String, value: String },

    #[error("tag not found: {0}")]
    TagNotFound(String),

    #[error("tag {tag} is not an integer: {value:?}")]
    NotAnInteger { tag: String, value: String },

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// How to behave when another process already holds the queue file lock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LockPolicy {
    /// Wait for the lock (what HylaFAX does).
    #[default]
    Block,
    /// Give up immediately with [`QfileError::LockFailed`].
    Fail,
}

/// One `tag:value` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Param {
    pub tag: String,
    pub value: String,
}

impl Param {
    /// A trimmed entry that reads back unchanged.
    ///
    /// The tag must not contain `:`, and neither part may span lines.
    fn new(tag: &str, value: &str) -> Result<Self, QfileError> {
        let tag = tag.trim();
        let value = value.trim();
        let breaks_line = |s: &str| s.contains(['\n', '\r']);
        if tag.contains(':') || breaks_line(tag) || breaks_line(value) {
            return Err(QfileError::InvalidEntry {
                tag: tag.to_string(),
                value: value.to_string(),
            });
        }
        Ok(Self {
            tag: tag.to_string(),
            value: value.to_string(),
        })
    }
}

/// An open, locked queue file.
#[derive(Debug)]
pub struct Qfile {
    path: PathBuf,
    file: File,
    params: Vec<Param>,
}

impl Qfile {
    /// Open and parse a queue file, blocking until the lock is available.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, QfileError> {
        Self::open_with(path, LockPolicy::Block)
    }

    /// Open and parse a queue file with an explicit lock policy.
    ///
    /// The whole file must parse; a single line without `:` fails the open
    /// and the lock is released before returning.
    pub fn open_with(path: impl AsRef<Path>, policy: LockPolicy) -> Result<Self, QfileError> {
        let path = path.as_ref().to_path_buf();

        let file = match OpenOptions::new().read(true).write(true).open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(QfileError::NotFound { path })
            }
            Err(source) => return Err(QfileError::Open { path, source }),
        };

        let locked = match policy {
            LockPolicy::Block => file.lock_exclusive(),
            LockPolicy::Fail => file.try_lock_exclusive(),
        };
        if let Err(source) = locked {
            return Err(QfileError::LockFailed { path, source });
        }

        // From here on `file` owns the lock; any early return drops it.
        let params = read_params(&path, &file)?;

        Ok(Self { path, file, params })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All entries in file order.
    pub fn params(&self) -> &[Param] {
        &self.params
    }

    /// Value of the first entry with `tag`, or `""` when absent.
    pub fn get_string(&self, tag: &str) -> &str {
        self.params
            .iter()
            .find(|p| p.tag == tag)
            .map(|p| p.value.as_str())
            .unwrap_or("")
    }

    /// Value of the first entry with `tag`, parsed as an integer.
    ///
    /// An empty value counts as absent.
    pub fn get_int(&self, tag: &str) -> Result<i64, QfileError> {
        let value = self.get_string(tag);
        if value.is_empty() {
            return Err(QfileError::TagNotFound(tag.to_string()));
        }
        value.parse().map_err(|_| QfileError::NotAnInteger {
            tag: tag.to_string(),
            value: value.to_string(),
        })
    }

    /// All values for `tag`, in file order.
    pub fn get_all(&self, tag: &str) -> Vec<&str> {
        self.params
            .iter()
            .filter(|p| p.tag == tag)
            .map(|p| p.value.as_str())
            .collect()
    }

    /// Replace the first entry with `tag`, or append one if there is none.
    ///
    /// Tag and value are trimmed, as they would be when read back.
    pub fn set(&mut self, tag: &str, value: &str) -> Result<(), QfileError> {
        let param = Param::new(tag, value)?;
        match self.params.iter_mut().find(|p| p.tag == param.tag) {
            Some(existing) => existing.value = param.value,
            None => self.params.push(param),
        }
        Ok(())
    }

    /// Append an entry, even if `tag` already exists.
    pub fn add(&mut self, tag: &str, value: &str) -> Result<(), QfileError> {
        self.params.push(Param::new(tag, value)?);
        Ok(())
    }

    /// Rewrite the file in place from the current entries.
    ///
    /// The file is truncated to exactly the bytes written and synced before
    /// returning.
    pub fn write(&mut self) -> Result<(), QfileError> {
        let mut buf = Vec::new();
        for param in &self.params {
            writeln!(buf, "{}:{}", param.tag, param.value)?;
        }

        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&buf)?;
        self.file.set_len(buf.len() as u64)?;
        self.file.sync_all()?;
        Ok(())
    }

    /// Release the lock and close the file.
    ///
    /// Dropping a `Qfile` does the same; this form reports unlock errors.
    pub fn close(self) -> Result<(), QfileError> {
        FileExt::unlock(&self.file)?;
        Ok(())
    }

    /// Spool-relative path of the first `!tiff` document, if any.
    ///
    /// Document entries look like `!tiff:0::docq/doc111.tif.1177`; the path
    /// is the last `:`-separated component of the value.
    pub fn tiff_path(&self) -> Option<&str> {
        let value = self.params.iter().find(|p| p.tag == "!tiff")?.value.as_str();
        let rel = value.rsplit(':').next().unwrap_or(value).trim();
        if rel.is_empty() {
            None
        } else {
            Some(rel)
        }
    }
}

fn read_params(path: &Path, file: &File) -> Result<Vec<Param>, QfileError> {
    let reader = BufReader::new(file);
    let mut params = Vec::new();

    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        let Some((tag, value)) = line.split_once(':') else {
            return Err(QfileError::Parse {
                path: path.to_path_buf(),
                line: idx + 1,
                text: line,
            });
        };
        params.push(Param {
            tag: tag.trim().to_string(),
            value: value.trim().to_string(),
        });
    }

    Ok(params)
}
