//! Database Image Module
//!
//! One [`Database`] exists per database name per node: the locally
//! materialized image of that database, mutated only by the apply path.
//! Gateways read it (queries, prepared-statement binding) and drive writes
//! through the consensus log; they never touch the image directly.
//!
//! ## Lock Discipline
//! - `inner` guards the engine state, `applied_index`, `epoch`, and the
//!   lifecycle phase; apply, snapshot, and restore serialize on it.
//! - `write_pipeline` is held across speculative-exec → append →
//!   commit-wait, so writes to one image form a single ordered pipeline.
//! - `applied_cv` signals `applied_index` advancement for barrier waits.

mod apply;
mod statements;

pub use apply::{decode_payload, encode_payload};
pub use statements::{PreparedStatement, StatementRegistry};

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

use crate::consensus::CommitWaiters;
use crate::engine::{ExecResult, Prepared, RowCursor, SqlEngine, Statement, Value, WalFrames};
use crate::error::{Error, Result};

// =============================================================================
// Snapshots
// =============================================================================

/// A full database image at a known log position
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    /// Index of the last log entry reflected in the image
    pub applied_index: u64,

    /// Serialized image (see `engine::ImageCapture`)
    pub image: Vec<u8>,
}

impl Snapshot {
    /// Write the snapshot to a file
    pub fn write_to(&self, path: &std::path::Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let bytes = bincode::serialize(self)?;
        std::fs::write(path, bytes)?;
        Ok(())
    }

    /// Read a snapshot back from a file
    pub fn read_from(path: &std::path::Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        Ok(bincode::deserialize(&bytes)?)
    }
}

// =============================================================================
// Lifecycle
// =============================================================================

/// Lifecycle phase of a database image
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phase {
    /// Serving normally
    Ready,

    /// A snapshot install is replacing the image; requests bounce with Busy
    Installing,

    /// Apply diverged; only a snapshot install can revive this image
    Halted(String),
}

// =============================================================================
// Database
// =============================================================================

struct DbInner {
    engine: Box<dyn SqlEngine>,
    applied_index: u64,
    epoch: u64,
    phase: Phase,
}

/// The local image of one named database
pub struct Database {
    name: String,
    inner: Mutex<DbInner>,
    applied_cv: Condvar,
    write_pipeline: Mutex<()>,
    waiters: CommitWaiters,
}

impl Database {
    pub fn new(name: impl Into<String>, engine: Box<dyn SqlEngine>) -> Self {
        Self {
            name: name.into(),
            inner: Mutex::new(DbInner {
                engine,
                applied_index: 0,
                epoch: 0,
                phase: Phase::Ready,
            }),
            applied_cv: Condvar::new(),
            write_pipeline: Mutex::new(()),
            waiters: CommitWaiters::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn applied_index(&self) -> u64 {
        self.inner.lock().applied_index
    }

    pub fn epoch(&self) -> u64 {
        self.inner.lock().epoch
    }

    /// Serialization point for this image's writes
    pub(crate) fn write_pipeline(&self) -> &Mutex<()> {
        &self.write_pipeline
    }

    pub(crate) fn waiters(&self) -> &CommitWaiters {
        &self.waiters
    }

    fn ensure_ready(inner: &DbInner, name: &str) -> Result<()> {
        match &inner.phase {
            Phase::Ready => Ok(()),
            Phase::Installing => Err(Error::Busy(format!(
                "database '{name}' is installing a snapshot"
            ))),
            Phase::Halted(reason) => Err(Error::Fatal(format!(
                "database '{name}' is halted: {reason}"
            ))),
        }
    }

    /// Whether the image can serve requests right now
    pub fn check_ready(&self) -> Result<()> {
        Self::ensure_ready(&self.inner.lock(), &self.name)
    }

    // -------------------------------------------------------------------------
    // Gateway Operations
    // -------------------------------------------------------------------------

    /// Prepare a statement, capturing the epoch the handle is valid for
    pub fn prepare(&self, sql: &str) -> Result<(Prepared, u64)> {
        let inner = self.inner.lock();
        Self::ensure_ready(&inner, &self.name)?;
        let prepared = inner.engine.prepare(sql)?;
        Ok((prepared, inner.epoch))
    }

    /// A statement handle is valid only while its captured epoch matches
    /// the image epoch
    pub fn check_epoch(&self, stmt_id: u32, epoch: u64) -> Result<()> {
        if self.inner.lock().epoch != epoch {
            return Err(Error::InvalidHandle(stmt_id));
        }
        Ok(())
    }

    /// Run a mutating statement speculatively, capturing its WAL frames.
    /// The committed image is untouched until the frames come back through
    /// the apply path.
    pub fn exec_speculative(
        &self,
        stmt: &Statement,
        params: &[Value],
    ) -> Result<(ExecResult, WalFrames)> {
        let mut inner = self.inner.lock();
        Self::ensure_ready(&inner, &self.name)?;
        inner.engine.exec_capture(stmt, params)
    }

    /// Run a read against the committed image
    pub fn query(&self, stmt: &Statement, params: &[Value]) -> Result<Box<dyn RowCursor>> {
        let inner = self.inner.lock();
        Self::ensure_ready(&inner, &self.name)?;
        inner.engine.query(stmt, params)
    }

    /// Block until `applied_index` reaches `index`, bounded by `timeout`
    pub fn wait_applied(&self, index: u64, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        while inner.applied_index < index {
            if let Phase::Halted(reason) = &inner.phase {
                return Err(Error::Fatal(format!(
                    "database '{}' is halted: {reason}",
                    self.name
                )));
            }
            if self.applied_cv.wait_until(&mut inner, deadline).timed_out() {
                return Err(Error::Timeout("read barrier"));
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Database")
            .field("name", &self.name)
            .field("applied_index", &inner.applied_index)
            .field("epoch", &inner.epoch)
            .field("phase", &inner.phase)
            .finish()
    }
}
