use super::{FaxSender, OutboundFax};
use anyhow::{Context, Result};
use std::process::Command;

/// `sendfax` command wrapper.
///
/// Runs `sendfax -n -S <cidnum> -o <cidnum> -c <cidname> -d <dest> <file>`
/// and waits for it to finish.
pub struct SendfaxCommand {
    program: String,
}

impl Default for SendfaxCommand {
    fn default() -> Self {
        Self::new("sendfax")
    }
}

impl SendfaxCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn args(fax: &OutboundFax) -> Vec<String> {
        vec![
            "-n".to_string(),
            "-S".to_string(),
            fax.source_number.clone(),
            "-o".to_string(),
            fax.source_number.clone(),
            "-c".to_string(),
            fax.caller_id_name.clone(),
            "-d".to_string(),
            fax.destination_number.clone(),
            fax.file.to_string_lossy().into_owned(),
        ]
    }
}

impl FaxSender for SendfaxCommand {
    fn send(&self, fax: &OutboundFax) -> Result<()> {
        let output = Command::new(&self.program)
            .args(Self::args(fax))
            .output()
            .with_context(|| format!("Failed to execute {}", self.program))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!(
                "{} failed for {} ({}): {}",
                self.program,
                fax.destination_number,
                output.status,
                stderr.trim()
            );
        }

        Ok(())
    }
}
