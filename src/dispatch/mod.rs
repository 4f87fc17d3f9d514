//! Outcome-based side effects for parsed transaction records.
//!
//! A successfully received fax is forwarded with `sendfax`; everything else
//! is only counted and logged. Sent records are never forwarded, otherwise a
//! relayed fax would be relayed again when its own `SEND` line shows up.

pub mod sendfax;

pub use sendfax::SendfaxCommand;

use crate::metrics::FaxMetrics;
use crate::xferlog::{Direction, TransactionRecord};
use anyhow::Result;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// A fax to be sent out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundFax {
    pub source_number: String,
    pub caller_id_name: String,
    pub destination_number: String,
    /// Absolute path of the image in the spool.
    pub file: PathBuf,
}

/// Outbound send collaborator. Blocks until the send was queued or failed.
pub trait FaxSender: Send + Sync {
    fn send(&self, fax: &OutboundFax) -> Result<()>;
}

/// What dispatch did with a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Received OK and handed to the sender.
    Forwarded,
    /// Received OK but the sender failed.
    ForwardFailed(String),
    /// Received OK but forwarding is disabled.
    ForwardSkipped,
    /// Receive failed; nothing to forward.
    ReceiveFailed,
    /// Sent record; counted only.
    SentLogged { ok: bool },
}

/// Dispatch settings.
#[derive(Debug, Clone)]
pub struct DispatchOptions {
    pub spool_dir: PathBuf,
    /// Wait before sending so the gateway can finish writing the image.
    pub settle_delay: Duration,
    /// Remove the spool image after a successful send.
    pub delete_after_send: bool,
    /// When false, successful receives are logged but not forwarded.
    pub forward: bool,
}

pub struct Dispatcher {
    sender: Arc<dyn FaxSender>,
    metrics: Arc<FaxMetrics>,
    options: DispatchOptions,
}

impl Dispatcher {
    pub fn new(
        sender: Arc<dyn FaxSender>,
        metrics: Arc<FaxMetrics>,
        options: DispatchOptions,
    ) -> Self {
        Self {
            sender,
            metrics,
            options,
        }
    }

    /// Act on one record. Never fails: errors are logged and counted.
    pub fn dispatch(&self, record: &TransactionRecord) -> DispatchOutcome {
        match record.direction {
            Direction::Received => {
                self.metrics.received.inc();
                info!(
                    commid = %record.commid,
                    destnum = %record.destnum,
                    pages = record.pages,
                    "Received fax"
                );
                if !record.is_ok() {
                    self.metrics.failed_received.inc();
                    warn!(commid = %record.commid, reason = %record.reason, "Failed to receive fax");
                    return DispatchOutcome::ReceiveFailed;
                }
                if !self.options.forward {
                    return DispatchOutcome::ForwardSkipped;
                }
                match self.forward(record) {
                    Ok(()) => DispatchOutcome::Forwarded,
                    Err(e) => {
                        self.metrics.forward_errors.inc();
                        let message = format!("{:#}", e);
                        error!(commid = %record.commid, error = %message, "Failed to send fax");
                        DispatchOutcome::ForwardFailed(message)
                    }
                }
            }
            Direction::Sent => {
                self.metrics.sent.inc();
                let ok = record.is_ok();
                if ok {
                    info!(jobid = %record.jobid, destnum = %record.destnum, "Sent fax, not forwarding");
                } else {
                    self.metrics.failed_sent.inc();
                    warn!(jobid = %record.jobid, reason = %record.reason, "Failed to bridge fax");
                }
                DispatchOutcome::SentLogged { ok }
            }
        }
    }

    fn forward(&self, record: &TransactionRecord) -> Result<()> {
        let file = spool_path(&self.options.spool_dir, &record.filename)?;
        let fax = OutboundFax {
            source_number: record.cidnum.clone(),
            caller_id_name: record.cidname.clone(),
            destination_number: record.destnum.clone(),
            file,
        };

        if !self.options.settle_delay.is_zero() {
            std::thread::sleep(self.options.settle_delay);
        }

        info!(
            src = %fax.source_number,
            dest = %fax.destination_number,
            file = %fax.file.display(),
            "Sending fax"
        );
        self.sender.send(&fax)?;

        if self.options.delete_after_send {
            match std::fs::remove_file(&fax.file) {
                Ok(()) => info!(file = %fax.file.display(), "Fax file deleted"),
                Err(e) => warn!(file = %fax.file.display(), error = %e, "Failed to delete fax file"),
            }
        }

        Ok(())
    }
}

/// Resolve a spool-relative file name, refusing names that leave the spool.
fn spool_path(spool_dir: &Path, filename: &str) -> Result<PathBuf> {
    let rel = Path::new(filename);
    let escapes = rel
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if filename.is_empty() || escapes {
        anyhow::bail!("Refusing spool file name outside the spool: {:?}", filename);
    }
    Ok(spool_dir.join(rel))
}
