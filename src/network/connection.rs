//! Connection Gateway
//!
//! Owns one client connection's lifecycle: decodes requests, consults the
//! router through the node, drives writes through the consensus log, and
//! streams responses back.
//!
//! The gateway is strictly request→response: the next request is not
//! decoded until the previous response is fully encoded, so a connection
//! can never interleave with itself and connection-local state (the bound
//! database, the statement registry) needs no locking.

use std::io::{BufReader, BufWriter};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use crate::db::{Database, StatementRegistry};
use crate::error::{Error, Result};
use crate::node::Node;
use crate::protocol::{read_request, write_response, Consistency, Request, Response};
use crate::PROTOCOL_VERSION;

/// Upper bound on rows per batch frame (the batch header counts rows in a u16)
const MAX_ROWS_PER_BATCH: usize = 8192;

/// The database a connection is currently bound to
struct BoundDb {
    id: u32,
    db: Arc<Database>,
}

/// Handles a single client connection
pub struct Connection {
    /// TCP stream reader (buffered for efficiency)
    reader: BufReader<TcpStream>,

    /// TCP stream writer (buffered for efficiency)
    writer: BufWriter<TcpStream>,

    /// The node serving this connection
    node: Arc<Node>,

    /// Peer address for logging
    peer_addr: String,

    /// Set once the protocol handshake succeeds
    handshaken: bool,

    /// Currently bound database, if any
    bound: Option<BoundDb>,

    /// Connection-local database id counter
    next_db_id: u32,

    /// Prepared statements owned by this connection
    statements: StatementRegistry,
}

impl Connection {
    /// Create a new connection handler
    ///
    /// Sets up buffered I/O and applies the configured timeouts
    pub fn new(stream: TcpStream, node: Arc<Node>) -> Result<Self> {
        // Get peer address for logging before we split the stream
        let peer_addr = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());

        // Disable Nagle's algorithm for low latency
        stream.set_nodelay(true)?;

        let read_ms = node.config().read_timeout_ms;
        let write_ms = node.config().write_timeout_ms;
        if read_ms > 0 {
            stream.set_read_timeout(Some(Duration::from_millis(read_ms)))?;
        }
        if write_ms > 0 {
            stream.set_write_timeout(Some(Duration::from_millis(write_ms)))?;
        }

        // Clone stream for separate read/write handles
        let read_stream = stream.try_clone()?;
        let write_stream = stream;

        Ok(Self {
            reader: BufReader::new(read_stream),
            writer: BufWriter::new(write_stream),
            node,
            peer_addr,
            handshaken: false,
            bound: None,
            next_db_id: 0,
            statements: StatementRegistry::new(),
        })
    }

    /// Handle the connection (blocking until closed)
    ///
    /// Reads requests in a loop and sends responses.
    /// Returns when the client disconnects or an error occurs.
    pub fn handle(&mut self) -> Result<()> {
        tracing::debug!("connection established from {}", self.peer_addr);

        loop {
            // Read next request
            let request = match read_request(&mut self.reader) {
                Ok(req) => req,
                Err(Error::Io(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    // Client disconnected gracefully
                    tracing::debug!("client {} disconnected", self.peer_addr);
                    return Ok(());
                }
                Err(Error::Io(ref e)) if e.kind() == std::io::ErrorKind::ConnectionReset => {
                    tracing::debug!("connection reset by client {}", self.peer_addr);
                    return Ok(());
                }
                Err(Error::Io(ref e)) if e.kind() == std::io::ErrorKind::ConnectionAborted => {
                    tracing::debug!("connection aborted by client {}", self.peer_addr);
                    return Ok(());
                }
                Err(Error::Io(ref e))
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    tracing::debug!("read timeout for client {}", self.peer_addr);
                    return Ok(());
                }
                Err(e) => {
                    // Framing is no longer trustworthy; report and close
                    tracing::warn!("error reading from {}: {}", self.peer_addr, e);
                    let _ = self.send(&Response::from_error(&e));
                    return Err(e);
                }
            };

            tracing::trace!("received request from {}: {:?}", self.peer_addr, request);

            if let Err(e) = self.process(request) {
                if self.report(&e).is_err() {
                    // Client went away before the response could be sent
                    tracing::debug!(
                        "client {} disconnected before response could be sent",
                        self.peer_addr
                    );
                    return Ok(());
                }
                if e.closes_connection() {
                    tracing::debug!("closing {} after: {}", self.peer_addr, e);
                    return Ok(());
                }
            }
        }
    }

    /// Process one request, writing its response(s)
    fn process(&mut self, request: Request) -> Result<()> {
        // Nothing but a handshake is valid on a fresh connection
        if !self.handshaken && !matches!(request, Request::Handshake { .. }) {
            return Err(Error::Frame("request before handshake".to_string()));
        }

        match request {
            Request::Handshake { version } => {
                if version != PROTOCOL_VERSION {
                    return Err(Error::ProtocolMismatch {
                        client: version,
                        server: PROTOCOL_VERSION,
                    });
                }
                self.handshaken = true;
                self.send(&Response::Ack)
            }

            Request::Open { name } => {
                let db = self.node.open_database(&name)?;
                self.next_db_id += 1;
                let id = self.next_db_id;
                self.bound = Some(BoundDb { id, db });
                self.send(&Response::Db { id })
            }

            Request::Prepare { db_id, sql } => {
                let db = self.bound_db(db_id)?;
                let (prepared, epoch) = db.prepare(&sql)?;
                let mutates = prepared.mutates;
                let param_count = prepared.param_count;
                let id = self.statements.insert(prepared, epoch);
                self.send(&Response::Stmt { id, mutates, param_count })
            }

            Request::Exec { stmt_id, params } => self.exec(stmt_id, &params),

            Request::Query { stmt_id, params, consistency } => {
                self.query(stmt_id, &params, consistency)
            }

            Request::Finalize { stmt_id } => {
                if !self.statements.remove(stmt_id) {
                    return Err(Error::InvalidHandle(stmt_id));
                }
                self.send(&Response::Ack)
            }
        }
    }

    /// Execute a prepared statement. Mutating statements go through the
    /// write path; non-mutating ones run the read path and report no
    /// changes.
    fn exec(&mut self, stmt_id: u32, params: &[crate::engine::Value]) -> Result<()> {
        let stmt = self.lookup(stmt_id)?;
        let db = self.current_db()?;
        db.check_epoch(stmt_id, stmt.epoch)?;
        check_param_count(stmt.param_count, params.len())?;

        let result = if stmt.mutates {
            self.node.execute_write(&db, &stmt.statement, params)?
        } else {
            self.node
                .execute_query(&db, &stmt.statement, params, Consistency::default())?;
            Default::default()
        };
        self.send(&Response::ExecResult {
            last_insert_id: result.last_insert_id,
            rows_affected: result.rows_affected,
        })
    }

    /// Run a query, streaming rows in batches bounded by the configured
    /// frame size and terminated by an explicit end marker
    fn query(
        &mut self,
        stmt_id: u32,
        params: &[crate::engine::Value],
        consistency: Consistency,
    ) -> Result<()> {
        let stmt = self.lookup(stmt_id)?;
        let db = self.current_db()?;
        db.check_epoch(stmt_id, stmt.epoch)?;
        check_param_count(stmt.param_count, params.len())?;
        if stmt.mutates {
            return Err(Error::Schema(
                "statement mutates state; use exec".to_string(),
            ));
        }

        let mut cursor = self.node.execute_query(&db, &stmt.statement, params, consistency)?;
        self.send(&Response::RowsHeader { columns: cursor.columns().to_vec() })?;

        // Leave room for the batch framing itself; the row count also must
        // fit the batch header's u16
        let budget = self.node.config().max_frame_size.saturating_sub(1024);
        let mut batch: Vec<crate::engine::Row> = Vec::new();
        let mut batch_bytes = 0usize;
        while let Some(row) = cursor.next_row()? {
            let row_bytes = Response::row_wire_size(&row);
            let full = batch_bytes + row_bytes > budget || batch.len() >= MAX_ROWS_PER_BATCH;
            if !batch.is_empty() && full {
                self.send(&Response::RowBatch { rows: std::mem::take(&mut batch) })?;
                batch_bytes = 0;
            }
            batch_bytes += row_bytes;
            batch.push(row);
        }
        if !batch.is_empty() {
            self.send(&Response::RowBatch { rows: batch })?;
        }
        self.send(&Response::RowsDone)
    }

    // -------------------------------------------------------------------------
    // Helpers
    // -------------------------------------------------------------------------

    fn bound_db(&self, db_id: u32) -> Result<Arc<Database>> {
        match &self.bound {
            Some(bound) if bound.id == db_id => Ok(Arc::clone(&bound.db)),
            Some(_) => Err(Error::NotFound(format!("database id {db_id}"))),
            None => Err(Error::NotFound("no database open".to_string())),
        }
    }

    fn current_db(&self) -> Result<Arc<Database>> {
        self.bound
            .as_ref()
            .map(|b| Arc::clone(&b.db))
            .ok_or_else(|| Error::NotFound("no database open".to_string()))
    }

    fn lookup(&self, stmt_id: u32) -> Result<crate::db::PreparedStatement> {
        self.statements
            .get(stmt_id)
            .cloned()
            .ok_or(Error::InvalidHandle(stmt_id))
    }

    /// Send a response to the client
    fn send(&mut self, response: &Response) -> Result<()> {
        write_response(&mut self.writer, response)
    }

    /// Report a request failure as an error frame
    fn report(&mut self, err: &Error) -> Result<()> {
        tracing::debug!("request from {} failed: {}", self.peer_addr, err);
        self.send(&Response::from_error(err))
    }

    /// Get the peer address string
    pub fn peer_addr(&self) -> &str {
        &self.peer_addr
    }
}

fn check_param_count(expected: u16, got: usize) -> Result<()> {
    if expected as usize != got {
        return Err(Error::Schema(format!(
            "statement takes {expected} parameters, {got} bound"
        )));
    }
    Ok(())
}
