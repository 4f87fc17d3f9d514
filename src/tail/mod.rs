//! Idempotent tailing of the transaction log.
//!
//! Every scan re-reads the whole log and handles each complete line at most
//! once. Which lines are already handled is tracked either in a side file
//! ([`TailMode::ProcessedSet`]) or by removing handled lines from the log
//! itself ([`TailMode::InPlace`]).

pub mod mutator;
pub mod processed;

use crate::dispatch::Dispatcher;
use crate::loki::LokiClient;
use crate::metrics::FaxMetrics;
use crate::xferlog::{parse_line, DateOrder, TransactionRecord};
use anyhow::{Context, Result};
use processed::ProcessedLines;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Newline-terminated lines of `content`, without the terminator.
///
/// A trailing fragment without `\n` is still being written and is skipped.
/// Lines stay raw bytes; the gateway does not promise any encoding.
pub fn complete_lines(content: &[u8]) -> impl Iterator<Item = &[u8]> {
    content
        .split_inclusive(|b| *b == b'\n')
        .filter_map(|segment| segment.strip_suffix(b"\n"))
        .map(|line| line.strip_suffix(b"\r").unwrap_or(line))
}

fn is_blank(line: &[u8]) -> bool {
    line.iter().all(u8::is_ascii_whitespace)
}

/// How handled lines are remembered across scans and restarts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TailMode {
    /// Append handled lines to a side file and skip them on later scans.
    ProcessedSet { path: PathBuf },
    /// Remove handled lines from the log.
    InPlace,
}

/// Told whenever the tailer rewrote the log file.
pub trait RewriteListener: Send + Sync {
    fn log_rewritten(&self);
}

/// Counts from a single scan.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScanReport {
    /// Lines that were parsed and dispatched.
    pub handled: usize,
    /// Lines that were not valid UTF-8 or did not match either grammar.
    pub unparsed: usize,
}

pub struct Tailer {
    log_path: PathBuf,
    mode: TailMode,
    date_order: DateOrder,
    dispatcher: Dispatcher,
    metrics: Arc<FaxMetrics>,
    loki: Option<LokiClient>,
    rewrite_listener: Option<Arc<dyn RewriteListener>>,
}

impl Tailer {
    pub fn new(
        log_path: impl Into<PathBuf>,
        mode: TailMode,
        date_order: DateOrder,
        dispatcher: Dispatcher,
        metrics: Arc<FaxMetrics>,
    ) -> Self {
        Self {
            log_path: log_path.into(),
            mode,
            date_order,
            dispatcher,
            metrics,
            loki: None,
            rewrite_listener: None,
        }
    }

    /// Ship every handled record to Loki as JSON.
    pub fn with_loki(mut self, loki: LokiClient) -> Self {
        self.loki = Some(loki);
        self
    }

    pub fn with_rewrite_listener(mut self, listener: Arc<dyn RewriteListener>) -> Self {
        self.rewrite_listener = Some(listener);
        self
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    /// Read the log and handle every line not handled before.
    ///
    /// A read failure aborts the scan; the next trigger retries. Failing to
    /// persist a handled line also aborts it, so that line may be handled
    /// again after a restart.
    pub fn scan(&self) -> Result<ScanReport> {
        let content = std::fs::read(&self.log_path)
            .with_context(|| format!("Failed to read log file: {}", self.log_path.display()))?;

        let report = match &self.mode {
            TailMode::ProcessedSet { path } => self.scan_processed_set(&content, path)?,
            TailMode::InPlace => self.scan_in_place(&content)?,
        };

        if report.handled > 0 || report.unparsed > 0 {
            info!(
                handled = report.handled,
                unparsed = report.unparsed,
                "Scanned log"
            );
        } else {
            debug!("No new lines");
        }
        Ok(report)
    }

    fn scan_processed_set(&self, content: &[u8], path: &Path) -> Result<ScanReport> {
        let mut processed = ProcessedLines::load(path)?;
        let mut report = ScanReport::default();

        for raw in processed.unseen(content) {
            // The same line may appear twice in one batch.
            if processed.contains(raw) {
                continue;
            }
            let Some(record) = self.handle(raw, &mut report) else {
                continue;
            };
            processed.record(raw)?;
            self.ship(&record);
        }

        Ok(report)
    }

    fn scan_in_place(&self, content: &[u8]) -> Result<ScanReport> {
        let mut report = ScanReport::default();
        let mut removed = HashSet::new();

        for raw in complete_lines(content).filter(|l| !is_blank(l)) {
            if removed.contains(raw) {
                continue;
            }
            let Some(record) = self.handle(raw, &mut report) else {
                continue;
            };
            if mutator::remove_line(&self.log_path, raw)? {
                if let Some(listener) = &self.rewrite_listener {
                    listener.log_rewritten();
                }
            }
            removed.insert(raw);
            self.ship(&record);
        }

        Ok(report)
    }

    /// Parse and dispatch one line. Unparsed lines are left for a later scan.
    fn handle(&self, raw: &[u8], report: &mut ScanReport) -> Option<TransactionRecord> {
        let line = match std::str::from_utf8(raw) {
            Ok(line) => line,
            Err(e) => {
                self.metrics.unparsed_lines.inc();
                report.unparsed += 1;
                let line = String::from_utf8_lossy(raw);
                warn!(error = %e, line = %line, "Skipping log line that is not UTF-8");
                return None;
            }
        };
        match parse_line(line, self.date_order) {
            Ok(record) => {
                self.dispatcher.dispatch(&record);
                report.handled += 1;
                Some(record)
            }
            Err(e) => {
                self.metrics.unparsed_lines.inc();
                report.unparsed += 1;
                warn!(error = %e, line = %line, "Skipping unparsed log line");
                None
            }
        }
    }

    fn ship(&self, record: &TransactionRecord) {
        if let Some(loki) = &self.loki {
            if let Err(e) = loki.push_json(record) {
                let message = format!("{:#}", e);
                error!(error = %message, "Failed to push record to Loki");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{DispatchOptions, Dispatcher};
    use crate::testing::{recv_with_file, recv_with_reason, RecordingSender, RECV_OK, SEND_OK};
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Fixture {
        dir: tempfile::TempDir,
        sender: Arc<RecordingSender>,
        metrics: Arc<FaxMetrics>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                dir: tempfile::tempdir().unwrap(),
                sender: Arc::new(RecordingSender::default()),
                metrics: Arc::new(FaxMetrics::new().unwrap()),
            }
        }

        fn log(&self) -> PathBuf {
            self.dir.path().join("xferfaxlog")
        }

        fn processed(&self) -> PathBuf {
            self.dir.path().join("processed_faxes.log")
        }

        fn tailer(&self, mode: TailMode) -> Tailer {
            let dispatcher = Dispatcher::new(
                self.sender.clone(),
                Arc::clone(&self.metrics),
                DispatchOptions {
                    spool_dir: self.dir.path().to_path_buf(),
                    settle_delay: Duration::ZERO,
                    delete_after_send: false,
                    forward: true,
                },
            );
            Tailer::new(
                self.log(),
                mode,
                DateOrder::MonthFirst,
                dispatcher,
                Arc::clone(&self.metrics),
            )
        }

        fn processed_set(&self) -> Tailer {
            self.tailer(TailMode::ProcessedSet {
                path: self.processed(),
            })
        }
    }

    #[derive(Default)]
    struct CountingListener(AtomicUsize);

    impl RewriteListener for CountingListener {
        fn log_rewritten(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_complete_lines_skips_partial_tail() {
        let lines: Vec<_> = complete_lines(b"a\r\nb\n\npartial").collect();
        let expected: Vec<&[u8]> = vec![b"a", b"b", b""];
        assert_eq!(lines, expected);
    }

    #[test]
    fn test_rescan_is_idempotent() {
        let fx = Fixture::new();
        fs::write(
            fx.log(),
            format!("{}\n{}\n{}\n", RECV_OK, recv_with_reason("FAILED"), SEND_OK),
        )
        .unwrap();
        let tailer = fx.processed_set();

        let first = tailer.scan().unwrap();
        assert_eq!(first.handled, 3);
        assert_eq!(fx.sender.count(), 1);

        let second = tailer.scan().unwrap();
        assert_eq!(second, ScanReport::default());
        assert_eq!(fx.sender.count(), 1);
        assert_eq!(fx.metrics.received.get(), 2);
        assert_eq!(fx.metrics.sent.get(), 1);
    }

    #[test]
    fn test_processed_set_survives_restart() {
        let fx = Fixture::new();
        fs::write(fx.log(), format!("{}\n", RECV_OK)).unwrap();
        fx.processed_set().scan().unwrap();

        let mut f = fs::OpenOptions::new().append(true).open(fx.log()).unwrap();
        use std::io::Write;
        writeln!(f, "{}", recv_with_file("fax002.tif")).unwrap();
        drop(f);

        // A fresh tailer only sees the appended line.
        let report = fx.processed_set().scan().unwrap();
        assert_eq!(report.handled, 1);
        let sent = fx.sender.sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].file, fx.dir.path().join("fax002.tif"));
    }

    #[test]
    fn test_unparsed_lines_are_not_recorded() {
        let fx = Fixture::new();
        fs::write(fx.log(), format!("garbage line\n{}\n", RECV_OK)).unwrap();
        let tailer = fx.processed_set();

        let report = tailer.scan().unwrap();
        assert_eq!(report.handled, 1);
        assert_eq!(report.unparsed, 1);
        assert_eq!(fx.metrics.unparsed_lines.get(), 1);
        assert_eq!(
            fs::read_to_string(fx.processed()).unwrap(),
            format!("{}\n", RECV_OK)
        );

        // Retried, and counted again, on the next scan.
        assert_eq!(tailer.scan().unwrap().unparsed, 1);
    }

    /// `RECV_OK` with a Latin-1 byte in the remote station ID.
    fn latin1_recv() -> Vec<u8> {
        let mut line = RECV_OK.as_bytes().to_vec();
        let at = RECV_OK.find("REMOTE1").unwrap() + "REMOTE".len();
        line.insert(at, 0xE9);
        line
    }

    #[test]
    fn test_non_utf8_line_is_skipped_not_fatal() {
        let fx = Fixture::new();
        let mut content = latin1_recv();
        content.push(b'\n');
        content.extend_from_slice(recv_with_file("fax002.tif").as_bytes());
        content.push(b'\n');
        fs::write(fx.log(), &content).unwrap();
        let tailer = fx.processed_set();

        for _ in 0..3 {
            let report = tailer.scan().unwrap();
            assert_eq!(report.unparsed, 1);
        }
        let sent = fx.sender.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].file, fx.dir.path().join("fax002.tif"));
        assert_eq!(fx.metrics.unparsed_lines.get(), 3);
    }

    #[test]
    fn test_in_place_keeps_non_utf8_line() {
        let fx = Fixture::new();
        let bad = latin1_recv();
        let mut content = format!("{}\n", RECV_OK).into_bytes();
        content.extend_from_slice(&bad);
        content.push(b'\n');
        fs::write(fx.log(), &content).unwrap();

        let report = fx.tailer(TailMode::InPlace).scan().unwrap();
        assert_eq!(report.handled, 1);
        assert_eq!(report.unparsed, 1);
        assert_eq!(fx.sender.count(), 1);

        let mut expected = bad;
        expected.push(b'\n');
        assert_eq!(fs::read(fx.log()).unwrap(), expected);
    }

    #[test]
    fn test_duplicate_lines_in_one_batch_dispatch_once() {
        let fx = Fixture::new();
        fs::write(fx.log(), format!("{}\n{}\n", RECV_OK, RECV_OK)).unwrap();

        let report = fx.processed_set().scan().unwrap();
        assert_eq!(report.handled, 1);
        assert_eq!(fx.sender.count(), 1);
    }

    #[test]
    fn test_partial_trailing_line_waits() {
        let fx = Fixture::new();
        let partial = &RECV_OK[..40];
        fs::write(fx.log(), partial).unwrap();
        let tailer = fx.processed_set();

        assert_eq!(tailer.scan().unwrap(), ScanReport::default());
        assert_eq!(fx.sender.count(), 0);

        fs::write(fx.log(), format!("{}\n", RECV_OK)).unwrap();
        assert_eq!(tailer.scan().unwrap().handled, 1);
        assert_eq!(fx.sender.count(), 1);
    }

    #[test]
    fn test_missing_log_is_an_error() {
        let fx = Fixture::new();
        assert!(fx.processed_set().scan().is_err());
    }

    #[test]
    fn test_in_place_removes_handled_lines() {
        let fx = Fixture::new();
        fs::write(
            fx.log(),
            format!("{}\nnot a record\n{}\n{}\n", RECV_OK, SEND_OK, RECV_OK),
        )
        .unwrap();
        let listener = Arc::new(CountingListener::default());
        let tailer = fx
            .tailer(TailMode::InPlace)
            .with_rewrite_listener(listener.clone());

        let report = tailer.scan().unwrap();
        assert_eq!(report.handled, 2);
        assert_eq!(report.unparsed, 1);
        assert_eq!(fx.sender.count(), 1);
        assert_eq!(listener.0.load(Ordering::SeqCst), 2);
        assert_eq!(fs::read_to_string(fx.log()).unwrap(), "not a record\n");
        assert!(!fx.processed().exists());

        let again = tailer.scan().unwrap();
        assert_eq!(again.handled, 0);
        assert_eq!(fx.sender.count(), 1);
    }

    #[test]
    fn test_loki_receives_record_json() {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("POST", "/loki/api/v1/push")
            .match_body(mockito::Matcher::Regex(r#"\\"direction\\":\\"RECV\\""#.to_string()))
            .with_status(204)
            .expect(1)
            .create();

        let fx = Fixture::new();
        fs::write(fx.log(), format!("{}\n", RECV_OK)).unwrap();
        let loki = LokiClient::new(format!("{}/loki/api/v1/push", server.url()), None, None).unwrap();
        let tailer = fx.processed_set().with_loki(loki);

        tailer.scan().unwrap();
        tailer.scan().unwrap();
        mock.assert();
    }
}
