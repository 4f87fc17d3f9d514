//! Shared fixtures for unit tests.

use crate::dispatch::{FaxSender, OutboundFax};
use anyhow::Result;
use std::sync::Mutex;

/// A successful receive, as GOfax.IP writes it.
pub const RECV_OK: &str = "01/15/24 14:30\tRECV\tID001\tModemA\tfax001.tif\t\"\"\tfax\t\"5551234567\"\t\"REMOTE1\"\t0\t\t3\t0:01:20\t0:01:45\t\"OK\"\t\"\"CallerName\"\"\t\"\"5559876543\"\"\t\"\"\t\"\"\t\"V.29\"";

/// A successful send.
pub const SEND_OK: &str = "01/15/24 15:02\tSEND\t00000431\tttyS0\t1177\t\"report\"\tjdoe\t\"12505652556\"\t\"REMOTE CSI\"\t0\t2\t0:00:50\t0:00:40\t\"OK\"\t\"\"\t\"\"\t\"\"\t\"2507632912\"\t\"V.17\"";

/// `RECV_OK` with a different reason.
pub fn recv_with_reason(reason: &str) -> String {
    RECV_OK.replace("\"OK\"", &format!("\"{}\"", reason))
}

/// `RECV_OK` for a different spool file.
pub fn recv_with_file(filename: &str) -> String {
    RECV_OK.replace("fax001.tif", filename)
}

/// Records every fax it is asked to send.
#[derive(Default)]
pub struct RecordingSender {
    pub sent: Mutex<Vec<OutboundFax>>,
    pub fail: bool,
}

impl RecordingSender {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub fn count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

impl FaxSender for RecordingSender {
    fn send(&self, fax: &OutboundFax) -> Result<()> {
        self.sent.lock().unwrap().push(fax.clone());
        if self.fail {
            anyhow::bail!("sendfax exited with status 1");
        }
        Ok(())
    }
}
