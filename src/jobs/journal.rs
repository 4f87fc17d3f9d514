//! Reading `faxq` notifications from the systemd journal.

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use regex::Regex;
use std::process::Command;

/// Timestamp layout shared by `journalctl --since` and the last-run file.
pub const SINCE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Source of scheduler log output.
pub trait Journal: Send + Sync {
    /// Log text written since `since` (local time).
    fn since(&self, since: NaiveDateTime) -> Result<String>;
}

/// `journalctl --no-pager -u <unit> --since <ts>`.
pub struct Journalctl {
    unit: String,
}

impl Journalctl {
    pub fn new(unit: impl Into<String>) -> Self {
        Self { unit: unit.into() }
    }

    fn args(&self, since: NaiveDateTime) -> Vec<String> {
        vec![
            "--no-pager".to_string(),
            "-u".to_string(),
            self.unit.clone(),
            "--since".to_string(),
            since.format(SINCE_FORMAT).to_string(),
        ]
    }
}

impl Journal for Journalctl {
    fn since(&self, since: NaiveDateTime) -> Result<String> {
        let output = Command::new("journalctl")
            .args(self.args(since))
            .output()
            .context("Failed to execute journalctl")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("journalctl failed ({}): {}", output.status, stderr.trim());
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// A job notification: the scheduler ran `bin/notify <qfile> <why>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Queue file path relative to the spool root, e.g. `doneq/q1177`.
    pub qfile: String,
    pub why: String,
}

/// Extracts [`Notification`]s from journal text.
pub struct NotifyScanner {
    re: Regex,
}

impl NotifyScanner {
    pub fn new() -> Result<Self> {
        let re = Regex::new(r#"NOTIFY: bin/notify "([^"]*)" "([^"]*)""#)
            .context("Failed to compile notify pattern")?;
        Ok(Self { re })
    }

    pub fn scan(&self, output: &str) -> Vec<Notification> {
        output
            .lines()
            .filter_map(|line| self.re.captures(line))
            .map(|caps| Notification {
                qfile: caps[1].to_string(),
                why: caps[2].to_string(),
            })
            .collect()
    }
}
