//! PDF previews of job documents.

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::path::Path;
use std::process::Command;

/// Converts a TIFF document to PDF with an external program.
///
/// The program is run as `<program> -o <out.pdf> <in.tif>`, which is how
/// `tiff2pdf` takes its arguments.
pub struct PdfPreview {
    program: String,
}

impl Default for PdfPreview {
    fn default() -> Self {
        Self::new("tiff2pdf")
    }
}

impl PdfPreview {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Convert `tiff` and return the PDF base64-encoded.
    pub fn render(&self, tiff: &Path) -> Result<String> {
        let out = tempfile::Builder::new()
            .prefix("faxrelay-preview")
            .suffix(".pdf")
            .tempfile()
            .context("Failed to create preview file")?;

        let output = Command::new(&self.program)
            .arg("-o")
            .arg(out.path())
            .arg(tiff)
            .output()
            .with_context(|| format!("Failed to execute {}", self.program))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!(
                "{} failed for {} ({}): {}",
                self.program,
                tiff.display(),
                output.status,
                stderr.trim()
            );
        }

        let pdf = std::fs::read(out.path())
            .with_context(|| format!("Failed to read {}", out.path().display()))?;
        Ok(STANDARD.encode(pdf))
    }
}
