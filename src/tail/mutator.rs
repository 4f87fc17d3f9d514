//! In-place removal of handled lines from the live transaction log.
//!
//! Only the tail task may rewrite the log. The gateway can still append
//! between our read and the rename; that window is kept as small as possible
//! by reading the file fresh right before filtering.

use anyhow::{Context, Result};
use std::fs;
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;

/// Remove every complete line equal to `line` from the file at `path`.
///
/// Returns `false` (and leaves the file untouched) when no such line exists.
/// The replacement is written to a temporary file in the same directory and
/// renamed over the original, keeping its permissions.
pub fn remove_line(path: &Path, line: &[u8]) -> Result<bool> {
    let content = fs::read(path)
        .with_context(|| format!("Failed to read log file: {}", path.display()))?;

    let mut kept = Vec::with_capacity(content.len());
    let mut removed = 0usize;
    for segment in content.split_inclusive(|b| *b == b'\n') {
        let is_match = segment
            .strip_suffix(b"\n")
            .map(|l| l.strip_suffix(b"\r").unwrap_or(l) == line)
            .unwrap_or(false);
        if is_match {
            removed += 1;
        } else {
            kept.extend_from_slice(segment);
        }
    }

    if removed == 0 {
        return Ok(false);
    }

    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let permissions = fs::metadata(path)
        .with_context(|| format!("Failed to stat log file: {}", path.display()))?
        .permissions();

    let mut tmp = NamedTempFile::new_in(dir)
        .with_context(|| format!("Failed to create temp file in {}", dir.display()))?;
    tmp.write_all(&kept)
        .context("Failed to write temp log file")?;
    tmp.as_file()
        .set_permissions(permissions)
        .context("Failed to set temp log file permissions")?;
    tmp.as_file().sync_all().context("Failed to sync temp log file")?;

    tmp.persist(path)
        .with_context(|| format!("Failed to replace log file: {}", path.display()))?;

    Ok(true)
}
