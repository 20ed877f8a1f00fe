//! Node Module
//!
//! The composition root of one QuorumSQL node: owns the database image
//! registry, routes operations through the leadership router, drives
//! writes through the consensus log, and receives committed entries back
//! as the attached commit sink.
//!
//! Exposed seams: `handle_connection` for the accept loop,
//! `apply_committed` / `install_snapshot` for the consensus integration.

use std::collections::HashMap;
use std::net::TcpStream;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::RwLock;

use crate::config::Config;
use crate::consensus::{
    validate_db_name, CommitOutcome, CommitSink, Consensus, LogEntry,
};
use crate::db::{encode_payload, Database, Snapshot};
use crate::engine::{ExecResult, MemEngine, RowCursor, Statement, Value};
use crate::error::{Error, Result};
use crate::network::Connection;
use crate::protocol::Consistency;
use crate::router::Router;

/// One QuorumSQL node
pub struct Node {
    config: Config,
    consensus: Arc<dyn Consensus>,
    router: Router,
    databases: RwLock<HashMap<String, Arc<Database>>>,
}

impl Node {
    /// Build a node and attach it to the consensus service. Attachment
    /// replays any entries the service recovered from durable storage, so
    /// the images are rebuilt before the first connection is accepted.
    pub fn new(config: Config, consensus: Arc<dyn Consensus>) -> Arc<Self> {
        let node = Arc::new(Self {
            router: Router::new(Arc::clone(&consensus)),
            config,
            consensus,
            databases: RwLock::new(HashMap::new()),
        });
        let node_dyn: Arc<dyn CommitSink> = Arc::clone(&node) as Arc<dyn CommitSink>;
        let sink: Weak<dyn CommitSink> = Arc::downgrade(&node_dyn);
        node.consensus.attach(sink);
        node
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    // -------------------------------------------------------------------------
    // Database Registry
    // -------------------------------------------------------------------------

    /// Bind to a named database, creating its image on first use
    pub fn open_database(&self, name: &str) -> Result<Arc<Database>> {
        validate_db_name(name)?;
        let db = self.get_or_create(name);
        db.check_ready()?;
        Ok(db)
    }

    /// Look up an image without creating it
    pub fn database(&self, name: &str) -> Option<Arc<Database>> {
        self.databases.read().get(name).cloned()
    }

    fn get_or_create(&self, name: &str) -> Arc<Database> {
        if let Some(db) = self.databases.read().get(name) {
            return Arc::clone(db);
        }
        let mut databases = self.databases.write();
        Arc::clone(
            databases
                .entry(name.to_string())
                .or_insert_with(|| {
                    tracing::debug!("creating database image '{name}'");
                    Arc::new(Database::new(name, Box::new(MemEngine::new())))
                }),
        )
    }

    // -------------------------------------------------------------------------
    // Write / Read Paths
    // -------------------------------------------------------------------------

    /// Execute a mutating statement: speculative run, consensus append,
    /// then wait for the commit to apply locally. The result is
    /// acknowledged only after the entry is durably committed.
    pub fn execute_write(
        &self,
        db: &Database,
        stmt: &Statement,
        params: &[Value],
    ) -> Result<ExecResult> {
        self.router.check_write()?;

        // One ordered commit pipeline per image: speculative exec, append,
        // and commit-wait happen under the same pipeline lock
        let _pipeline = db.write_pipeline().lock();

        let (result, frames) = db.exec_speculative(stmt, params)?;
        if frames.is_empty() {
            // Nothing to order (BEGIN/COMMIT, or a mutation that matched
            // no rows); answer without a consensus round
            return Ok(result);
        }

        let payload = encode_payload(&frames)?;
        let index = self.consensus.append(db.name(), payload)?;

        let outcome = db
            .waiters()
            .claim(index)
            .wait(Duration::from_millis(self.config.commit_timeout_ms))?;
        match outcome {
            CommitOutcome::Committed { .. } => Ok(result),
            CommitOutcome::Superseded { .. } => Err(Error::LeadershipLost),
        }
    }

    /// Execute a read at the requested consistency
    pub fn execute_query(
        &self,
        db: &Database,
        stmt: &Statement,
        params: &[Value],
        consistency: Consistency,
    ) -> Result<Box<dyn RowCursor>> {
        self.router.read_barrier(
            db,
            consistency,
            Duration::from_millis(self.config.barrier_timeout_ms),
        )?;
        db.query(stmt, params)
    }

    // -------------------------------------------------------------------------
    // Consensus Integration Surface
    // -------------------------------------------------------------------------

    /// Capture a snapshot of a database for a replica that needs to catch up
    pub fn snapshot(&self, name: &str) -> Result<Snapshot> {
        self.database(name)
            .ok_or_else(|| Error::NotFound(format!("database '{name}'")))?
            .snapshot()
    }

    /// Install a snapshot, replacing the image (created on demand)
    pub fn install_snapshot(&self, name: &str, snapshot: &Snapshot) -> Result<()> {
        validate_db_name(name)?;
        self.get_or_create(name).restore(snapshot)
    }

    // -------------------------------------------------------------------------
    // Connection Surface
    // -------------------------------------------------------------------------

    /// Serve one client connection to completion
    pub fn handle_connection(self: Arc<Self>, stream: TcpStream) -> Result<()> {
        Connection::new(stream, self)?.handle()
    }
}

impl CommitSink for Node {
    fn apply_committed(&self, db: &str, entry: LogEntry) {
        // Apply surfaces its own diagnostics and halts the image on
        // divergence; there is nothing further to do here
        let _ = self.get_or_create(db).apply(&entry);
    }

    fn entry_superseded(&self, db: &str, index: u64, term: u64) {
        if let Some(db) = self.database(db) {
            db.entry_superseded(index, term);
        }
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("node_id", &self.config.node_id)
            .field("databases", &self.databases.read().len())
            .finish()
    }
}
