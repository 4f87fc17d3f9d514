//! Parsed transaction records.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// Which way the fax went.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Direction {
    #[serde(rename = "RECV")]
    Received,
    #[serde(rename = "SEND")]
    Sent,
}

impl Direction {
    /// The marker used in the transaction log.
    pub fn marker(&self) -> &'static str {
        match self {
            Direction::Received => "RECV",
            Direction::Sent => "SEND",
        }
    }
}

/// Field order of the date column.
///
/// The log writes two-digit years and a 24-hour clock, but the
/// day/month/year order follows the gateway's locale.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum DateOrder {
    /// `MM/DD/YY HH:MM`
    #[default]
    MonthFirst,
    /// `DD/MM/YY HH:MM`
    DayFirst,
    /// `YY/MM/DD HH:MM`
    YearFirst,
}

impl DateOrder {
    pub fn format(&self) -> &'static str {
        match self {
            DateOrder::MonthFirst => "%m/%d/%y %H:%M",
            DateOrder::DayFirst => "%d/%m/%y %H:%M",
            DateOrder::YearFirst => "%y/%m/%d %H:%M",
        }
    }
}

/// Reason value the gateway writes for a successful transfer.
pub const REASON_OK: &str = "OK";

/// One line of the transaction log.
///
/// Received records carry `filename` and caller-id; sent records carry
/// `jobid`, `jobtag`, `sender` and `owner`. Fields that a direction does not
/// carry stay empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransactionRecord {
    pub ts: NaiveDateTime,
    pub direction: Direction,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub commid: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub modem: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub jobid: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub jobtag: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub filename: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub sender: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub destnum: String,
    #[serde(rename = "remoteID", skip_serializing_if = "String::is_empty")]
    pub remote_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub params: String,
    pub pages: u32,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub jobtime: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub conntime: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub cidname: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub cidnum: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub owner: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub dcs: String,
}

impl TransactionRecord {
    pub(crate) fn empty(ts: NaiveDateTime, direction: Direction) -> Self {
        Self {
            ts,
            direction,
            commid: String::new(),
            modem: String::new(),
            jobid: String::new(),
            jobtag: String::new(),
            filename: String::new(),
            sender: String::new(),
            destnum: String::new(),
            remote_id: String::new(),
            params: String::new(),
            pages: 0,
            jobtime: String::new(),
            conntime: String::new(),
            reason: String::new(),
            cidname: String::new(),
            cidnum: String::new(),
            owner: String::new(),
            dcs: String::new(),
        }
    }

    /// True when the gateway reported the transfer as successful.
    pub fn is_ok(&self) -> bool {
        self.reason == REASON_OK
    }
}
