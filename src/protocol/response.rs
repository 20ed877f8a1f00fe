//! Response definitions
//!
//! Represents responses to clients.

use crate::engine::{Row, Value};
use crate::error::Error;

/// Response frame types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResponseType {
    Ack = 0x01,
    Db = 0x02,
    Stmt = 0x03,
    ExecResult = 0x04,
    RowsHeader = 0x05,
    RowBatch = 0x06,
    RowsDone = 0x07,
    Error = 0xFF,
}

/// A response to send to a client
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    /// Positive acknowledgement with no payload (handshake, finalize)
    Ack,

    /// Database bound to the connection
    Db { id: u32 },

    /// Prepared statement handle plus static analysis
    Stmt { id: u32, mutates: bool, param_count: u16 },

    /// Result of a committed mutating statement
    ExecResult { last_insert_id: u64, rows_affected: u64 },

    /// Column names, sent once before the first row batch
    RowsHeader { columns: Vec<String> },

    /// A bounded batch of rows
    RowBatch { rows: Vec<Row> },

    /// End-of-rows marker terminating a result set
    RowsDone,

    /// Error report; `detail` carries the leader address for NotLeader
    Error { code: u16, message: String, detail: String },
}

impl Response {
    /// Get the response frame type
    pub fn response_type(&self) -> ResponseType {
        match self {
            Response::Ack => ResponseType::Ack,
            Response::Db { .. } => ResponseType::Db,
            Response::Stmt { .. } => ResponseType::Stmt,
            Response::ExecResult { .. } => ResponseType::ExecResult,
            Response::RowsHeader { .. } => ResponseType::RowsHeader,
            Response::RowBatch { .. } => ResponseType::RowBatch,
            Response::RowsDone => ResponseType::RowsDone,
            Response::Error { .. } => ResponseType::Error,
        }
    }

    /// Build the error frame for a failed request
    pub fn from_error(err: &Error) -> Self {
        let detail = match err {
            Error::NotLeader { leader } => leader.clone().unwrap_or_default(),
            _ => String::new(),
        };
        Response::Error {
            code: err.wire_code(),
            message: err.to_string(),
            detail,
        }
    }

    /// Rough encoded size of a row, used to bound batch flushing
    pub fn row_wire_size(row: &[Value]) -> usize {
        row.iter()
            .map(|v| match v {
                Value::Null => 1,
                Value::Integer(_) | Value::Real(_) => 9,
                Value::Text(s) => 5 + s.len(),
                Value::Blob(b) => 5 + b.len(),
            })
            .sum()
    }
}
