//! Transaction log line grammar.
//!
//! A line is a TAB-separated list of columns. Each direction has its own
//! fixed column table; parsing walks the table against the tokens, so the
//! two grammars are data and share one code path.

use super::record::{DateOrder, Direction, TransactionRecord};
use chrono::NaiveDateTime;
use thiserror::Error;

/// Why a line was rejected.
#[derive(Debug, Error, PartialEq)]
pub enum ParseError {
    #[error("invalid fax direction: no RECV or SEND marker")]
    NoDirection,

    #[error("invalid fax direction: both RECV and SEND markers present")]
    AmbiguousDirection,

    #[error("invalid log line format: {direction} line is missing the {column} column")]
    MissingColumn {
        direction: &'static str,
        column: &'static str,
    },

    #[error("invalid log line format: bad {column} column {token:?}")]
    InvalidColumn { column: &'static str, token: String },

    #[error("invalid date format {text:?}: {source}")]
    InvalidDate {
        text: String,
        source: chrono::ParseError,
    },

    #[error("invalid page count {0:?}")]
    InvalidPages(String),
}

#[derive(Debug, Clone, Copy)]
enum Field {
    Date,
    CommId,
    Modem,
    Filename,
    JobId,
    JobTag,
    Sender,
    DestNum,
    RemoteId,
    Params,
    Pages,
    JobTime,
    ConnTime,
    Reason,
    CidName,
    CidNum,
    Owner,
    Dcs,
}

impl Field {
    fn name(&self) -> &'static str {
        match self {
            Field::Date => "date",
            Field::CommId => "commid",
            Field::Modem => "modem",
            Field::Filename => "filename",
            Field::JobId => "jobid",
            Field::JobTag => "jobtag",
            Field::Sender => "sender",
            Field::DestNum => "destnum",
            Field::RemoteId => "remote id",
            Field::Params => "params",
            Field::Pages => "pages",
            Field::JobTime => "job time",
            Field::ConnTime => "connect time",
            Field::Reason => "reason",
            Field::CidName => "caller-id name",
            Field::CidNum => "caller-id number",
            Field::Owner => "owner",
            Field::Dcs => "dcs",
        }
    }
}

/// What a column's value must look like.
#[derive(Debug, Clone, Copy)]
enum Shape {
    /// Anything non-empty.
    Any,
    /// Letters, digits and `_`.
    Word,
    Digits,
    /// `H:MM:SS`
    Duration,
    /// Anything, including empty (quoted columns only).
    Text,
}

impl Shape {
    fn accepts(&self, value: &str) -> bool {
        match self {
            Shape::Any => !value.is_empty(),
            Shape::Word => {
                !value.is_empty() && value.chars().all(|c| c.is_alphanumeric() || c == '_')
            }
            Shape::Digits => is_digits(value),
            Shape::Duration => {
                let mut parts = value.split(':');
                match (parts.next(), parts.next(), parts.next(), parts.next()) {
                    (Some(h), Some(m), Some(s), None) => {
                        is_digits(h) && m.len() == 2 && is_digits(m) && s.len() == 2 && is_digits(s)
                    }
                    _ => false,
                }
            }
            Shape::Text => true,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Column {
    /// Unquoted value.
    Bare(Field, Shape),
    /// `"value"` or `""value""`.
    Quoted(Field, Shape),
    /// Exact token.
    Literal(&'static str),
    /// A token made only of double quotes.
    Blank,
}

impl Column {
    fn name(&self) -> &'static str {
        match self {
            Column::Bare(field, _) | Column::Quoted(field, _) => field.name(),
            Column::Literal(text) => text,
            Column::Blank => "empty quoted",
        }
    }
}

const RECV_GRAMMAR: &[Column] = &[
    Column::Bare(Field::Date, Shape::Any),
    Column::Literal("RECV"),
    Column::Bare(Field::CommId, Shape::Word),
    Column::Bare(Field::Modem, Shape::Word),
    Column::Bare(Field::Filename, Shape::Any),
    Column::Blank,
    Column::Literal("fax"),
    Column::Quoted(Field::DestNum, Shape::Digits),
    Column::Quoted(Field::RemoteId, Shape::Text),
    Column::Bare(Field::Params, Shape::Digits),
    Column::Bare(Field::Pages, Shape::Digits),
    Column::Bare(Field::JobTime, Shape::Duration),
    Column::Bare(Field::ConnTime, Shape::Duration),
    Column::Quoted(Field::Reason, Shape::Text),
    Column::Quoted(Field::CidName, Shape::Text),
    Column::Quoted(Field::CidNum, Shape::Text),
    Column::Blank,
    Column::Blank,
    Column::Quoted(Field::Dcs, Shape::Text),
];

const SEND_GRAMMAR: &[Column] = &[
    Column::Bare(Field::Date, Shape::Any),
    Column::Literal("SEND"),
    Column::Bare(Field::CommId, Shape::Word),
    Column::Bare(Field::Modem, Shape::Word),
    Column::Bare(Field::JobId, Shape::Any),
    Column::Quoted(Field::JobTag, Shape::Text),
    Column::Bare(Field::Sender, Shape::Any),
    Column::Quoted(Field::DestNum, Shape::Digits),
    Column::Quoted(Field::RemoteId, Shape::Text),
    Column::Bare(Field::Params, Shape::Digits),
    Column::Bare(Field::Pages, Shape::Digits),
    Column::Bare(Field::JobTime, Shape::Duration),
    Column::Bare(Field::ConnTime, Shape::Duration),
    Column::Quoted(Field::Reason, Shape::Text),
    Column::Blank,
    Column::Blank,
    Column::Blank,
    Column::Quoted(Field::Owner, Shape::Text),
    Column::Quoted(Field::Dcs, Shape::Text),
];

fn grammar_for(direction: Direction) -> &'static [Column] {
    match direction {
        Direction::Received => RECV_GRAMMAR,
        Direction::Sent => SEND_GRAMMAR,
    }
}

fn is_digits(value: &str) -> bool {
    !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit())
}

/// Split a line on TABs, dropping empty columns left by repeated TABs.
fn tokenize(line: &str) -> Vec<&str> {
    line.split('\t')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .collect()
}

fn detect_direction(tokens: &[&str]) -> Result<Direction, ParseError> {
    let recv = tokens.iter().any(|t| *t == Direction::Received.marker());
    let send = tokens.iter().any(|t| *t == Direction::Sent.marker());
    match (recv, send) {
        (true, false) => Ok(Direction::Received),
        (false, true) => Ok(Direction::Sent),
        (true, true) => Err(ParseError::AmbiguousDirection),
        (false, false) => Err(ParseError::NoDirection),
    }
}

/// Strip one or two layers of surrounding double quotes.
fn unquote(token: &str) -> Option<&str> {
    if token.len() < 2 || !token.starts_with('"') || !token.ends_with('"') {
        return None;
    }
    let inner = token.trim_matches('"');
    if inner.contains('"') {
        return None;
    }
    Some(inner)
}

fn invalid(column: &Column, token: &str) -> ParseError {
    ParseError::InvalidColumn {
        column: column.name(),
        token: token.to_string(),
    }
}

fn assign(
    record: &mut TransactionRecord,
    field: Field,
    value: &str,
    order: DateOrder,
) -> Result<(), ParseError> {
    let value_owned = value.to_string();
    match field {
        Field::Date => {
            record.ts = NaiveDateTime::parse_from_str(value, order.format()).map_err(|source| {
                ParseError::InvalidDate {
                    text: value_owned,
                    source,
                }
            })?;
        }
        Field::Pages => {
            record.pages = value
                .parse()
                .map_err(|_| ParseError::InvalidPages(value_owned))?;
        }
        Field::CommId => record.commid = value_owned,
        Field::Modem => record.modem = value_owned,
        Field::Filename => record.filename = value_owned,
        Field::JobId => record.jobid = value_owned,
        Field::JobTag => record.jobtag = value_owned,
        Field::Sender => record.sender = value_owned,
        Field::DestNum => record.destnum = value_owned,
        Field::RemoteId => record.remote_id = value_owned,
        Field::Params => record.params = value_owned,
        Field::JobTime => record.jobtime = value_owned,
        Field::ConnTime => record.conntime = value_owned,
        Field::Reason => record.reason = value_owned,
        Field::CidName => record.cidname = value_owned,
        Field::CidNum => record.cidnum = value_owned,
        Field::Owner => record.owner = value_owned,
        Field::Dcs => record.dcs = value_owned,
    }
    Ok(())
}

/// Parse one transaction log line.
///
/// Pure: no I/O and no side effects. A line that does not fully match the
/// grammar for its direction is rejected as a whole.
pub fn parse_line(line: &str, order: DateOrder) -> Result<TransactionRecord, ParseError> {
    let tokens = tokenize(line);
    let direction = detect_direction(&tokens)?;
    let mut record = TransactionRecord::empty(NaiveDateTime::default(), direction);

    for (idx, column) in grammar_for(direction).iter().enumerate() {
        let token = tokens
            .get(idx)
            .copied()
            .ok_or(ParseError::MissingColumn {
                direction: direction.marker(),
                column: column.name(),
            })?;

        match column {
            Column::Literal(expected) => {
                if token != *expected {
                    return Err(invalid(column, token));
                }
            }
            Column::Blank => {
                if token.len() < 2 || !token.bytes().all(|b| b == b'"') {
                    return Err(invalid(column, token));
                }
            }
            Column::Bare(field, shape) => {
                if token.starts_with('"') || !shape.accepts(token) {
                    return Err(invalid(column, token));
                }
                assign(&mut record, *field, token, order)?;
            }
            Column::Quoted(field, shape) => {
                let value = unquote(token).ok_or_else(|| invalid(column, token))?;
                if !shape.accepts(value) {
                    return Err(invalid(column, token));
                }
                assign(&mut record, *field, value, order)?;
            }
        }
    }

    Ok(record)
}
