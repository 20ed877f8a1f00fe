//! Request definitions
//!
//! Represents requests from clients.

use crate::engine::Value;

/// Request frame types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RequestType {
    Handshake = 0x01,
    Open = 0x02,
    Prepare = 0x03,
    Exec = 0x04,
    Query = 0x05,
    Finalize = 0x06,
}

/// Read consistency selected per query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Consistency {
    /// Barrier against the consensus log before reading; observes every
    /// write committed before the read began
    #[default]
    Linearizable = 0x00,

    /// Read the local image as-is; may be stale on a follower
    Local = 0x01,
}

impl Consistency {
    pub fn from_wire(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(Consistency::Linearizable),
            0x01 => Some(Consistency::Local),
            _ => None,
        }
    }
}

/// A parsed request
#[derive(Debug, Clone)]
pub enum Request {
    /// Protocol version negotiation; must be the first request
    Handshake { version: u64 },

    /// Bind the connection to a named database, creating it on first use
    Open { name: String },

    /// Parse a statement, returning a handle plus its static analysis
    Prepare { db_id: u32, sql: String },

    /// Execute a mutating statement through the consensus log
    Exec { stmt_id: u32, params: Vec<Value> },

    /// Execute a read, streaming rows back in batches
    Query { stmt_id: u32, params: Vec<Value>, consistency: Consistency },

    /// Release a prepared statement
    Finalize { stmt_id: u32 },
}

impl Request {
    /// Get the request frame type
    pub fn request_type(&self) -> RequestType {
        match self {
            Request::Handshake { .. } => RequestType::Handshake,
            Request::Open { .. } => RequestType::Open,
            Request::Prepare { .. } => RequestType::Prepare,
            Request::Exec { .. } => RequestType::Exec,
            Request::Query { .. } => RequestType::Query,
            Request::Finalize { .. } => RequestType::Finalize,
        }
    }
}
