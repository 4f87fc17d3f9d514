use crate::qfile::{Qfile, QfileError};
use serde::Serialize;

/// Summary of a finished outbound job, as posted to the webhook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobReport {
    pub src_num: String,
    pub src_cid: String,
    pub dest_num: String,
    pub dest_cid: String,
    pub total_pages: i64,
    pub total_dials: i64,
    pub total_tries: i64,
    pub job_id: i64,
    pub status: String,
    pub why: String,
    /// Base64 PDF rendering of the job's document.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preview_pdf: Option<String>,
}

impl JobReport {
    /// Build a report from a queue file. The counter tags must be integers.
    pub fn from_qfile(qfile: &Qfile, why: &str) -> Result<Self, QfileError> {
        Ok(Self {
            src_num: qfile.get_string("owner").to_string(),
            src_cid: qfile.get_string("tsi").to_string(),
            dest_num: qfile.get_string("number").to_string(),
            dest_cid: qfile.get_string("external").to_string(),
            total_pages: qfile.get_int("totpages")?,
            total_dials: qfile.get_int("totdials")?,
            total_tries: qfile.get_int("tottries")?,
            job_id: qfile.get_int("jobid")?,
            status: qfile.get_string("status").to_string(),
            why: why.to_string(),
            preview_pdf: None,
        })
    }
}
