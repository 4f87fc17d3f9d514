//! Job-notification poller.
//!
//! Periodically reads the scheduler's journal for `bin/notify` calls, and
//! for jobs that ended in a terminal failure posts a summary of the job's
//! queue file to a webhook.

pub mod journal;
pub mod preview;
pub mod report;
pub mod webhook;

pub use journal::{Journal, Journalctl};
pub use preview::PdfPreview;
pub use report::JobReport;
pub use webhook::WebhookClient;

use crate::qfile::Qfile;
use anyhow::{Context, Result};
use chrono::{Local, NaiveDateTime};
use journal::{Notification, NotifyScanner, SINCE_FORMAT};
use std::path::PathBuf;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::time::Duration;
use tracing::{debug, error, info, warn};

const LAST_RUN_FILE: &str = "last_run.txt";

#[derive(Debug, Clone)]
pub struct JobsOptions {
    /// Queue file paths in notifications are relative to this.
    pub spool_root: PathBuf,
    /// Holds the last-run timestamp.
    pub state_dir: PathBuf,
    pub interval: Duration,
    /// How far back the first pass looks.
    pub lookback: Duration,
    /// Notification reasons that get reported.
    pub reasons: Vec<String>,
}

/// Counts from one pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PassReport {
    pub notifications: usize,
    pub reported: usize,
    pub failed: usize,
}

pub struct JobPoller {
    journal: Box<dyn Journal>,
    scanner: NotifyScanner,
    webhook: WebhookClient,
    preview: Option<PdfPreview>,
    options: JobsOptions,
}

impl JobPoller {
    pub fn new(
        journal: Box<dyn Journal>,
        webhook: WebhookClient,
        preview: Option<PdfPreview>,
        options: JobsOptions,
    ) -> Result<Self> {
        Ok(Self {
            journal,
            scanner: NotifyScanner::new()?,
            webhook,
            preview,
            options,
        })
    }

    /// Run passes every interval until `shutdown` receives or disconnects.
    pub fn run(&self, shutdown: &Receiver<()>) {
        info!(
            interval_secs = self.options.interval.as_secs(),
            "Job notification poller started"
        );
        loop {
            if let Err(e) = self.run_pass() {
                let message = format!("{:#}", e);
                error!(error = %message, "Job pass failed");
            }
            match shutdown.recv_timeout(self.options.interval) {
                Err(RecvTimeoutError::Timeout) => continue,
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        info!("Job notification poller stopped");
    }

    /// Read the journal since the last run and report terminal jobs.
    ///
    /// The last-run timestamp only advances when the journal could be read.
    pub fn run_pass(&self) -> Result<PassReport> {
        let now = Local::now().naive_local();
        let since = self.last_run(now);
        debug!(since = %since.format(SINCE_FORMAT), "Reading journal");

        let output = self.journal.since(since)?;
        let mut pass = PassReport::default();

        for notification in self.scanner.scan(&output) {
            pass.notifications += 1;
            info!(qfile = %notification.qfile, why = %notification.why, "Job notification");
            if !self.options.reasons.iter().any(|r| *r == notification.why) {
                continue;
            }

            match self.report(&notification) {
                Ok(report) => match self.webhook.send(&report) {
                    Ok(()) => {
                        pass.reported += 1;
                        info!(job_id = report.job_id, why = %report.why, "Webhook sent");
                    }
                    Err(e) => {
                        pass.failed += 1;
                        let message = format!("{:#}", e);
                        error!(job_id = report.job_id, error = %message, "Failed to send webhook");
                    }
                },
                Err(e) => {
                    pass.failed += 1;
                    let message = format!("{:#}", e);
                    error!(qfile = %notification.qfile, error = %message, "Failed to read queue file");
                }
            }
        }

        self.save_last_run(now)?;
        Ok(pass)
    }

    fn report(&self, notification: &Notification) -> Result<JobReport> {
        let path = self.options.spool_root.join(&notification.qfile);
        let qfile = Qfile::open(&path)?;
        let mut report = JobReport::from_qfile(&qfile, &notification.why)?;
        let tiff = qfile.tiff_path().map(|rel| self.options.spool_root.join(rel));
        // Don't hold the scheduler's lock while converting.
        qfile.close()?;

        if let (Some(preview), Some(tiff)) = (&self.preview, tiff) {
            match preview.render(&tiff) {
                Ok(pdf) => report.preview_pdf = Some(pdf),
                Err(e) => {
                    let message = format!("{:#}", e);
                    warn!(file = %tiff.display(), error = %message, "No preview for job");
                }
            }
        }
        Ok(report)
    }

    fn last_run_path(&self) -> PathBuf {
        self.options.state_dir.join(LAST_RUN_FILE)
    }

    fn last_run(&self, now: NaiveDateTime) -> NaiveDateTime {
        let fallback = || {
            now - chrono::Duration::from_std(self.options.lookback)
                .unwrap_or_else(|_| chrono::Duration::minutes(10))
        };
        match std::fs::read_to_string(self.last_run_path()) {
            Ok(text) => NaiveDateTime::parse_from_str(text.trim(), SINCE_FORMAT).unwrap_or_else(|e| {
                warn!(error = %e, "Unreadable last-run timestamp, using lookback");
                fallback()
            }),
            Err(_) => fallback(),
        }
    }

    fn save_last_run(&self, now: NaiveDateTime) -> Result<()> {
        let path = self.last_run_path();
        std::fs::write(&path, now.format(SINCE_FORMAT).to_string())
            .with_context(|| format!("Failed to update last run time: {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::Path;
    use std::sync::Mutex;

    /// Returns canned output and remembers the `since` it was asked for.
    struct CannedJournal {
        output: Result<String, String>,
        asked: Mutex<Vec<NaiveDateTime>>,
    }

    impl CannedJournal {
        fn new(output: &str) -> Self {
            Self {
                output: Ok(output.to_string()),
                asked: Mutex::new(Vec::new()),
            }
        }
    }

    impl Journal for std::sync::Arc<CannedJournal> {
        fn since(&self, since: NaiveDateTime) -> Result<String> {
            self.asked.lock().unwrap().push(since);
            self.output.clone().map_err(anyhow::Error::msg)
        }
    }

    const JOURNAL: &str = "\
Jan 24 10:12:31 fax faxq[812]: NOTIFY: bin/notify \"doneq/q1177\" \"killed\"
Jan 24 10:13:00 fax faxq[812]: NOTIFY: bin/notify \"doneq/q1178\" \"done\"
";

    const QFILE: &str = "\
totpages:1
totdials:8
tottries:0
external:12505652556
number:12505652556
jobid:1177
tsi:2507632912
owner:2507632912
status:The call dropped prematurely
";

    fn options(root: &Path) -> JobsOptions {
        JobsOptions {
            spool_root: root.to_path_buf(),
            state_dir: root.to_path_buf(),
            interval: Duration::from_secs(120),
            lookback: Duration::from_secs(600),
            reasons: vec!["rejected".into(), "removed".into(), "killed".into()],
        }
    }

    #[test]
    fn test_pass_reports_terminal_jobs_only() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("doneq")).unwrap();
        fs::write(dir.path().join("doneq/q1177"), QFILE).unwrap();

        let mut server = mockito::Server::new();
        let mock = server
            .mock("POST", "/hook")
            .match_body(mockito::Matcher::PartialJsonString(
                r#"{"job_id":1177,"why":"killed","total_dials":8}"#.to_string(),
            ))
            .with_status(200)
            .expect(1)
            .create();

        let journal = std::sync::Arc::new(CannedJournal::new(JOURNAL));
        let poller = JobPoller::new(
            Box::new(journal.clone()),
            WebhookClient::new(format!("{}/hook", server.url()), "u", "p").unwrap(),
            None,
            options(dir.path()),
        )
        .unwrap();

        let pass = poller.run_pass().unwrap();
        assert_eq!(
            pass,
            PassReport {
                notifications: 2,
                reported: 1,
                failed: 0
            }
        );
        mock.assert();

        let saved = fs::read_to_string(dir.path().join(LAST_RUN_FILE)).unwrap();
        let saved = NaiveDateTime::parse_from_str(&saved, SINCE_FORMAT).unwrap();

        // The next pass starts where this one ended.
        poller.run_pass().unwrap();
        assert_eq!(journal.asked.lock().unwrap()[1], saved);
    }

    #[test]
    fn test_missing_qfile_fails_job_not_pass() {
        let dir = tempfile::tempdir().unwrap();
        let server = mockito::Server::new();

        let poller = JobPoller::new(
            Box::new(std::sync::Arc::new(CannedJournal::new(JOURNAL))),
            WebhookClient::new(format!("{}/hook", server.url()), "u", "p").unwrap(),
            None,
            options(dir.path()),
        )
        .unwrap();

        let pass = poller.run_pass().unwrap();
        assert_eq!(pass.failed, 1);
        assert!(dir.path().join(LAST_RUN_FILE).exists());
    }

    #[test]
    fn test_journal_failure_keeps_last_run() {
        let dir = tempfile::tempdir().unwrap();
        let server = mockito::Server::new();
        let journal = std::sync::Arc::new(CannedJournal {
            output: Err("journalctl failed".to_string()),
            asked: Mutex::new(Vec::new()),
        });

        let poller = JobPoller::new(
            Box::new(journal),
            WebhookClient::new(server.url(), "u", "p").unwrap(),
            None,
            options(dir.path()),
        )
        .unwrap();

        assert!(poller.run_pass().is_err());
        assert!(!dir.path().join(LAST_RUN_FILE).exists());
    }

    #[test]
    fn test_last_run_falls_back_to_lookback() {
        let dir = tempfile::tempdir().unwrap();
        let server = mockito::Server::new();
        let poller = JobPoller::new(
            Box::new(std::sync::Arc::new(CannedJournal::new(""))),
            WebhookClient::new(server.url(), "u", "p").unwrap(),
            None,
            options(dir.path()),
        )
        .unwrap();
        let now = NaiveDateTime::parse_from_str("2024-01-24 10:00:00", SINCE_FORMAT).unwrap();

        assert_eq!(
            poller.last_run(now),
            NaiveDateTime::parse_from_str("2024-01-24 09:50:00", SINCE_FORMAT).unwrap()
        );

        fs::write(dir.path().join(LAST_RUN_FILE), "garbage").unwrap();
        assert_eq!(poller.last_run(now).to_string(), "2024-01-24 09:50:00");

        fs::write(dir.path().join(LAST_RUN_FILE), "2024-01-24 09:58:00").unwrap();
        assert_eq!(poller.last_run(now).to_string(), "2024-01-24 09:58:00");
    }
}
