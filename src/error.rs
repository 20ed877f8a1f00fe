//! Error types for QuorumSQL
//!
//! Provides a unified error type for all operations, plus the stable wire
//! codes used by the error response frame.

use thiserror::Error;

/// Result type alias using Error
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for QuorumSQL operations
#[derive(Debug, Error)]
pub enum Error {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // -------------------------------------------------------------------------
    // Protocol Errors
    // -------------------------------------------------------------------------
    #[error("protocol version mismatch: client sent {client}, server speaks {server}")]
    ProtocolMismatch { client: u64, server: u64 },

    #[error("frame error: {0}")]
    Frame(String),

    // -------------------------------------------------------------------------
    // Gateway Errors
    // -------------------------------------------------------------------------
    #[error("not found: {0}")]
    NotFound(String),

    #[error("busy: {0}")]
    Busy(String),

    #[error("invalid statement handle {0}")]
    InvalidHandle(u32),

    // -------------------------------------------------------------------------
    // Engine Errors
    // -------------------------------------------------------------------------
    #[error("syntax error: {0}")]
    Syntax(String),

    #[error("schema error: {0}")]
    Schema(String),

    // -------------------------------------------------------------------------
    // Replication Errors
    // -------------------------------------------------------------------------
    #[error("not leader{}", .leader.as_deref().map(|a| format!(", leader is {a}")).unwrap_or_default())]
    NotLeader { leader: Option<String> },

    #[error("leadership lost while the write was in flight; outcome unknown")]
    LeadershipLost,

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("fatal apply divergence: {0}")]
    Fatal(String),

    #[error("consensus error: {0}")]
    Consensus(String),

    // -------------------------------------------------------------------------
    // Serialization Errors
    // -------------------------------------------------------------------------
    #[error("serialization error: {0}")]
    Serialization(String),
}

// =============================================================================
// Wire Codes
// =============================================================================

impl Error {
    /// Stable code carried by the error response frame.
    pub fn wire_code(&self) -> u16 {
        match self {
            Error::Io(_) => 0x0001,
            Error::ProtocolMismatch { .. } => 0x0002,
            Error::Frame(_) => 0x0003,
            Error::NotFound(_) => 0x0004,
            Error::Busy(_) => 0x0005,
            Error::InvalidHandle(_) => 0x0006,
            Error::Syntax(_) => 0x0007,
            Error::Schema(_) => 0x0008,
            Error::NotLeader { .. } => 0x0009,
            Error::LeadershipLost => 0x000A,
            Error::Timeout(_) => 0x000B,
            Error::Fatal(_) => 0x000C,
            Error::Consensus(_) => 0x000D,
            Error::Serialization(_) => 0x000E,
        }
    }

    /// Whether the gateway must close the connection after reporting this
    /// error. Only framing errors poison the stream position.
    pub fn closes_connection(&self) -> bool {
        matches!(self, Error::Frame(_) | Error::ProtocolMismatch { .. })
    }

    /// Rebuild an error from the wire representation (client side).
    /// `detail` carries the leader address for `NotLeader`.
    pub fn from_wire(code: u16, message: String, detail: String) -> Error {
        match code {
            0x0002 => Error::ProtocolMismatch { client: 0, server: 0 },
            0x0003 => Error::Frame(message),
            0x0004 => Error::NotFound(message),
            0x0005 => Error::Busy(message),
            0x0006 => Error::InvalidHandle(0),
            0x0007 => Error::Syntax(message),
            0x0008 => Error::Schema(message),
            0x0009 => Error::NotLeader {
                leader: (!detail.is_empty()).then_some(detail),
            },
            0x000A => Error::LeadershipLost,
            0x000B => Error::Timeout("remote operation"),
            0x000C => Error::Fatal(message),
            0x000D => Error::Consensus(message),
            0x000E => Error::Serialization(message),
            _ => Error::Io(std::io::Error::new(std::io::ErrorKind::Other, message)),
        }
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
