//! Embedded Engine Module
//!
//! The seam between the replicated execution core and the SQL engine that
//! actually evaluates statements against local storage pages.
//!
//! ## Responsibilities
//! - Static analysis at prepare time (does the statement mutate state?)
//! - Speculative execution on the leader, capturing page-level WAL frames
//! - Deterministic application of captured frames on every replica
//! - Full-image snapshot and restore
//!
//! The core never re-executes SQL on followers: the WAL frames captured on
//! the leader already encode the exact byte-level mutation, so every replica
//! applies identical bytes and the images stay bit-identical.

mod pages;
mod sql;
mod mem;

pub use mem::MemEngine;
pub use pages::PAGE_SIZE;
pub use sql::{ColumnType, Statement};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::Result;

// =============================================================================
// Values
// =============================================================================

/// A single SQL value, as bound to a parameter, stored in a row, or
/// returned in a result column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl Value {
    /// Tag byte used by both the page format and the wire protocol
    pub fn tag(&self) -> u8 {
        match self {
            Value::Null => 0x00,
            Value::Integer(_) => 0x01,
            Value::Real(_) => 0x02,
            Value::Text(_) => 0x03,
            Value::Blob(_) => 0x04,
        }
    }
}

/// One result row
pub type Row = Vec<Value>;

// =============================================================================
// Execution Results
// =============================================================================

/// Outcome of executing a mutating statement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExecResult {
    /// Row id assigned by the most recent insert, 0 if none
    pub last_insert_id: u64,

    /// Number of rows created, changed, or removed
    pub rows_affected: u64,
}

/// A single captured page mutation.
///
/// Empty `data` means the page was freed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalFrame {
    pub page_no: u32,
    pub data: Vec<u8>,
}

/// The atomic unit of replicated mutation: every frame in the set applies
/// together or not at all.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WalFrames {
    pub frames: Vec<WalFrame>,
}

impl WalFrames {
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

// =============================================================================
// Prepared Statements
// =============================================================================

/// Result of preparing a statement: the parsed form plus the static
/// analysis the gateway needs to pick the write or read path.
#[derive(Debug, Clone)]
pub struct Prepared {
    pub statement: Statement,
    pub mutates: bool,
    pub param_count: u16,
}

// =============================================================================
// Row Cursors
// =============================================================================

/// Lazy row source for a query. Rows are decoded on demand from page
/// handles captured when the query started; the full result set is never
/// materialized at once.
pub trait RowCursor: Send {
    /// Column names, available before the first row
    fn columns(&self) -> &[String];

    /// Next row, or `None` at end of rows
    fn next_row(&mut self) -> Result<Option<Row>>;
}

// =============================================================================
// Engine Seam
// =============================================================================

/// The embedded SQL engine, as consumed by the replicated execution core.
///
/// Implementations must be deterministic: `apply_frames` with identical
/// payloads must produce bit-identical images on every node (the core's
/// replication guarantee depends on it).
pub trait SqlEngine: Send {
    /// Parse and statically analyze a statement
    fn prepare(&self, sql: &str) -> Result<Prepared>;

    /// Execute a mutating statement speculatively: evaluate against a
    /// copy-on-write overlay, capture the page mutations as WAL frames, and
    /// leave the committed image untouched. The frames are applied later,
    /// after the consensus log commits them.
    fn exec_capture(&mut self, stmt: &Statement, params: &[Value]) -> Result<(ExecResult, WalFrames)>;

    /// Execute a non-mutating statement against the committed image
    fn query(&self, stmt: &Statement, params: &[Value]) -> Result<Box<dyn RowCursor>>;

    /// Apply a committed frame set directly to the image
    fn apply_frames(&mut self, frames: &WalFrames) -> Result<()>;

    /// Capture a self-consistent handle on the committed image. This must
    /// be cheap (page handles, not page bytes): the caller holds the image
    /// lock across the capture and serializes afterwards.
    fn snapshot_image(&self) -> Result<ImageCapture>;

    /// Replace the committed image with a serialized snapshot
    fn restore_image(&mut self, image: &[u8]) -> Result<()>;
}

// =============================================================================
// Image Captures
// =============================================================================

/// A cheap, self-consistent capture of a page image. Pages are shared
/// handles, so holding a capture costs pointers, not copies; serialization
/// happens outside any engine lock.
#[derive(Debug, Clone)]
pub struct ImageCapture {
    pages: std::collections::BTreeMap<u32, Bytes>,
}

impl ImageCapture {
    pub fn new(pages: std::collections::BTreeMap<u32, Bytes>) -> Self {
        Self { pages }
    }

    /// Serialize to the snapshot wire format: `crc (4) + bincode pages`
    pub fn serialize(&self) -> Result<Bytes> {
        let pages: Vec<(u32, Vec<u8>)> = self
            .pages
            .iter()
            .map(|(no, data)| (*no, data.to_vec()))
            .collect();
        let body = bincode::serialize(&pages)?;
        let crc = crc32fast::hash(&body);
        let mut image = Vec::with_capacity(4 + body.len());
        image.extend_from_slice(&crc.to_be_bytes());
        image.extend_from_slice(&body);
        Ok(Bytes::from(image))
    }

    /// Decode the snapshot wire format back into a page map
    pub fn deserialize(image: &[u8]) -> Result<std::collections::BTreeMap<u32, Bytes>> {
        use crate::error::Error;
        if image.len() < 4 {
            return Err(Error::Serialization("snapshot image too short".to_string()));
        }
        let (crc_bytes, body) = image.split_at(4);
        let expected = u32::from_be_bytes(crc_bytes.try_into().expect("4 bytes"));
        if crc32fast::hash(body) != expected {
            return Err(Error::Serialization(
                "snapshot image checksum mismatch".to_string(),
            ));
        }
        let pages: Vec<(u32, Vec<u8>)> = bincode::deserialize(body)?;
        Ok(pages
            .into_iter()
            .map(|(no, data)| (no, Bytes::from(data)))
            .collect())
    }
}
