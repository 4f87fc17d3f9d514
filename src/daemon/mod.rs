//! Watch loop: scan the log on filesystem events and on a fixed poll tick.

pub mod watcher;

pub use watcher::{LogWatch, WatchAction};

use crate::tail::Tailer;
use anyhow::{Context, Result};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::mpsc;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Pause between a rename/remove event and watching the path again, so a
/// rotating writer has time to create the new file.
const REWATCH_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy)]
pub struct WatchOptions {
    /// Scan at least this often, even without events.
    pub poll_interval: Duration,
    /// Wait after a trigger so bursts of writes end up in one scan.
    pub debounce: Duration,
    /// How long events are ignored after we rewrote the log ourselves.
    pub quiet_window: Duration,
}

/// Runs scans on a dedicated thread, one at a time.
///
/// Triggers that arrive while a scan is pending collapse into that scan.
pub struct ScanWorker {
    tx: SyncSender<()>,
    handle: JoinHandle<()>,
}

impl ScanWorker {
    pub fn spawn<F>(mut scan: F, debounce: Duration) -> Result<Self>
    where
        F: FnMut() + Send + 'static,
    {
        let (tx, rx) = sync_channel::<()>(1);
        let handle = std::thread::Builder::new()
            .name("faxrelay-scan".to_string())
            .spawn(move || scan_loop(&rx, &mut scan, debounce))
            .context("Failed to spawn scan thread")?;
        Ok(Self { tx, handle })
    }

    pub fn trigger(&self) {
        match self.tx.try_send(()) {
            Ok(()) | Err(TrySendError::Full(())) => {}
            Err(TrySendError::Disconnected(())) => warn!("Scan thread is gone"),
        }
    }

    /// Let a running scan finish, then stop the thread.
    pub fn stop(self) -> std::thread::Result<()> {
        drop(self.tx);
        self.handle.join()
    }
}

fn scan_loop(rx: &Receiver<()>, scan: &mut dyn FnMut(), debounce: Duration) {
    while rx.recv().is_ok() {
        if !debounce.is_zero() {
            std::thread::sleep(debounce);
        }
        while rx.try_recv().is_ok() {}
        scan();
    }
    debug!("Scan thread stopped");
}

/// Tail the log until `shutdown` is cancelled.
///
/// The log is scanned once at start, then after every relevant filesystem
/// event and on every poll tick. The poll tick also re-registers the watch
/// when the file at the path was replaced.
pub async fn run(tailer: Tailer, options: WatchOptions, shutdown: CancellationToken) -> Result<()> {
    let (event_tx, mut event_rx) = mpsc::channel(64);
    let watch = match LogWatch::new(tailer.log_path(), options.quiet_window, event_tx) {
        Ok(watch) => Arc::new(watch),
        Err(e) => {
            // The tailer may own blocking HTTP clients, which must not be
            // dropped on a runtime thread.
            let _ = tokio::task::spawn_blocking(move || drop(tailer)).await;
            return Err(e);
        }
    };
    let tailer = tailer.with_rewrite_listener(watch.clone());

    match watch.register() {
        Ok(()) => info!(path = %watch.path().display(), "Watching transaction log"),
        Err(e) => {
            let message = format!("{:#}", e);
            warn!(error = %message, "Log file not watchable yet, polling");
        }
    }

    let worker = ScanWorker::spawn(
        move || {
            if let Err(e) = tailer.scan() {
                let message = format!("{:#}", e);
                error!(error = %message, "Scan failed");
            }
        },
        options.debounce,
    )?;
    worker.trigger();

    let mut ticker = interval(options.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick completes immediately; the initial scan is already queued.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            Some(action) = event_rx.recv() => {
                let quiet = watch.in_quiet_window();
                match action {
                    WatchAction::Rescan if quiet => {
                        debug!("Ignoring event from our own rewrite");
                    }
                    WatchAction::Rescan => worker.trigger(),
                    // Even inside the quiet window: notify drops the path's
                    // watch when the delete event of the replaced file
                    // arrives after we already watched the new one.
                    WatchAction::Rewatch => {
                        tokio::time::sleep(REWATCH_DELAY).await;
                        match watch.register() {
                            Ok(()) if quiet => debug!("Re-watched log after our own rewrite"),
                            Ok(()) => info!("Log file replaced, watching the new file"),
                            Err(e) => warn!(error = %e, "Log file gone, polling until it returns"),
                        }
                        if !quiet {
                            worker.trigger();
                        }
                    }
                    WatchAction::Ignore => {}
                }
            }
            _ = ticker.tick() => {
                match watch.ensure_registered() {
                    Ok(true) => info!("Log file changed under the watch, re-registered"),
                    Ok(false) => {}
                    Err(e) => warn!(error = %e, "Failed to re-register watch"),
                }
                worker.trigger();
            }
        }
    }

    info!("Stopping watch loop");
    tokio::task::spawn_blocking(move || worker.stop())
        .await
        .context("Scan thread join task failed")?
        .map_err(|_| anyhow::anyhow!("Scan thread panicked"))?;
    Ok(())
}
