//! Filesystem watch on the transaction log.
//!
//! The watch is on the file itself, so it follows one inode. When the log is
//! rotated, recreated, or rewritten by us, the watch has to be registered
//! again on the new file.

use crate::tail::RewriteListener;
use anyhow::{anyhow, Context, Result};
use notify::event::ModifyKind;
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// What a filesystem event asks the event loop to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchAction {
    Ignore,
    /// The log may have new lines.
    Rescan,
    /// The watched file was renamed or removed; watch the path again.
    Rewatch,
}

pub fn classify(kind: &EventKind) -> WatchAction {
    match kind {
        EventKind::Modify(ModifyKind::Name(_)) | EventKind::Remove(_) => WatchAction::Rewatch,
        EventKind::Create(_) | EventKind::Modify(_) => WatchAction::Rescan,
        EventKind::Access(_) | EventKind::Any | EventKind::Other => WatchAction::Ignore,
    }
}

pub struct LogWatch {
    path: PathBuf,
    watcher: Mutex<RecommendedWatcher>,
    /// Inode the watch is registered on, if any.
    inode: Mutex<Option<u64>>,
    quiet_window: Duration,
    quiet_until: Mutex<Option<Instant>>,
}

impl LogWatch {
    /// Create the watcher. Nothing is watched until [`LogWatch::register`].
    ///
    /// Events are forwarded to `tx`; when the channel is full the event is
    /// dropped, since one pending rescan covers any number of changes.
    pub fn new(
        path: impl Into<PathBuf>,
        quiet_window: Duration,
        tx: mpsc::Sender<WatchAction>,
    ) -> Result<Self> {
        let watcher = RecommendedWatcher::new(
            move |res: Result<Event, notify::Error>| {
                let action = match res {
                    Ok(event) => classify(&event.kind),
                    Err(e) => {
                        warn!(error = %e, "Watch error");
                        WatchAction::Rewatch
                    }
                };
                if action != WatchAction::Ignore {
                    let _ = tx.try_send(action);
                }
            },
            Config::default(),
        )
        .context("Failed to create file watcher")?;

        Ok(Self {
            path: path.into(),
            watcher: Mutex::new(watcher),
            inode: Mutex::new(None),
            quiet_window,
            quiet_until: Mutex::new(None),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Drop any existing watch and watch the file currently at the path.
    pub fn register(&self) -> Result<()> {
        let mut watcher = self
            .watcher
            .lock()
            .map_err(|_| anyhow!("watcher lock poisoned"))?;
        let mut inode = self.inode.lock().map_err(|_| anyhow!("inode lock poisoned"))?;

        // The old inode may already be gone.
        let _ = watcher.unwatch(&self.path);
        *inode = None;

        watcher
            .watch(&self.path, RecursiveMode::NonRecursive)
            .with_context(|| format!("Failed to watch {}", self.path.display()))?;
        *inode = current_inode(&self.path);
        debug!(path = %self.path.display(), inode = ?*inode, "Watching log file");
        Ok(())
    }

    /// Register again if the file at the path is not the one being watched.
    ///
    /// Returns `true` when a new watch was registered.
    pub fn ensure_registered(&self) -> Result<bool> {
        let Some(current) = current_inode(&self.path) else {
            return Ok(false);
        };
        let watched = *self.inode.lock().map_err(|_| anyhow!("inode lock poisoned"))?;
        if watched == Some(current) {
            return Ok(false);
        }
        self.register()?;
        Ok(true)
    }

    /// Note that we just replaced the log ourselves.
    ///
    /// Events during the quiet window are ignored and the watch moves to
    /// the new file.
    pub fn mark_self_write(&self) {
        if let Ok(mut until) = self.quiet_until.lock() {
            *until = Some(Instant::now() + self.quiet_window);
        }
        if let Err(e) = self.register() {
            warn!(error = %e, "Failed to re-watch log file after rewrite");
        }
    }

    pub fn in_quiet_window(&self) -> bool {
        self.quiet_until
            .lock()
            .map(|until| until.is_some_and(|t| Instant::now() < t))
            .unwrap_or(false)
    }
}

impl RewriteListener for LogWatch {
    fn log_rewritten(&self) {
        self.mark_self_write();
    }
}

fn current_inode(path: &Path) -> Option<u64> {
    std::fs::metadata(path).ok().map(|m| m.ino())
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{AccessKind, CreateKind, DataChange, RemoveKind, RenameMode};
    use std::fs;
    use std::io::Write;

    #[test]
    fn test_classify() {
        assert_eq!(
            classify(&EventKind::Modify(ModifyKind::Name(RenameMode::From))),
            WatchAction::Rewatch
        );
        assert_eq!(
            classify(&EventKind::Remove(RemoveKind::File)),
            WatchAction::Rewatch
        );
        assert_eq!(
            classify(&EventKind::Modify(ModifyKind::Data(DataChange::Content))),
            WatchAction::Rescan
        );
        assert_eq!(
            classify(&EventKind::Create(CreateKind::File)),
            WatchAction::Rescan
        );
        assert_eq!(
            classify(&EventKind::Access(AccessKind::Read)),
            WatchAction::Ignore
        );
        assert_eq!(classify(&EventKind::Any), WatchAction::Ignore);
    }

    #[test]
    fn test_register_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, _rx) = mpsc::channel(4);
        let watch = LogWatch::new(dir.path().join("xferfaxlog"), Duration::ZERO, tx).unwrap();

        assert!(watch.register().is_err());
        assert!(!watch.ensure_registered().unwrap());
    }

    #[test]
    fn test_ensure_registered_follows_replaced_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("xferfaxlog");
        fs::write(&path, "").unwrap();
        let (tx, _rx) = mpsc::channel(4);
        let watch = LogWatch::new(&path, Duration::ZERO, tx).unwrap();

        watch.register().unwrap();
        assert!(!watch.ensure_registered().unwrap());

        let replacement = dir.path().join("xferfaxlog.new");
        fs::write(&replacement, "").unwrap();
        fs::rename(&replacement, &path).unwrap();

        assert!(watch.ensure_registered().unwrap());
        assert!(!watch.ensure_registered().unwrap());
    }

    #[test]
    fn test_quiet_window() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("xferfaxlog");
        fs::write(&path, "").unwrap();
        let (tx, _rx) = mpsc::channel(4);
        let watch = LogWatch::new(&path, Duration::from_secs(60), tx).unwrap();

        assert!(!watch.in_quiet_window());
        watch.mark_self_write();
        assert!(watch.in_quiet_window());
    }

    #[tokio::test]
    async fn test_append_emits_rescan() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("xferfaxlog");
        fs::write(&path, "").unwrap();
        let (tx, mut rx) = mpsc::channel(16);
        let watch = LogWatch::new(&path, Duration::ZERO, tx).unwrap();
        watch.register().unwrap();

        let mut f = fs::OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(f, "line").unwrap();
        drop(f);

        let action = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(action, WatchAction::Rescan);
    }
}
