//! HylaFAX/GOfax.IP transaction log (`xferfaxlog`) records.
//!
//! Every fax attempt is appended to the log as one TAB-separated line,
//! either a `RECV` or a `SEND` record.

mod grammar;
mod record;

pub use grammar::{parse_line, ParseError};
pub use record::{DateOrder, Direction, TransactionRecord, REASON_OK};
