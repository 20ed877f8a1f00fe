//! Protocol client
//!
//! A typed client for the wire protocol, used by the CLI shell and the
//! integration tests. One outstanding request at a time, matching the
//! server's strict request→response cycle.

use std::io::{BufReader, BufWriter};
use std::net::{TcpStream, ToSocketAddrs};

use crate::engine::{ExecResult, Row, Value};
use crate::error::{Error, Result};
use crate::protocol::{
    read_response, write_request, Consistency, Request, Response,
};
use crate::PROTOCOL_VERSION;

/// A prepared statement handle as reported by the server
#[derive(Debug, Clone, Copy)]
pub struct StmtHandle {
    pub id: u32,
    pub mutates: bool,
    pub param_count: u16,
}

/// A fully drained query result
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
}

/// Client connection to a QuorumSQL node
pub struct Client {
    reader: BufReader<TcpStream>,
    writer: BufWriter<TcpStream>,
}

impl Client {
    /// Connect to a node; the protocol handshake is a separate step
    pub fn connect(addr: impl ToSocketAddrs) -> Result<Self> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        let read_stream = stream.try_clone()?;
        Ok(Self {
            reader: BufReader::new(read_stream),
            writer: BufWriter::new(stream),
        })
    }

    /// Negotiate the protocol version; must precede every other request
    pub fn handshake(&mut self) -> Result<()> {
        match self.request(&Request::Handshake { version: PROTOCOL_VERSION })? {
            Response::Ack => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    /// Open (and bind to) a named database
    pub fn open(&mut self, name: &str) -> Result<u32> {
        match self.request(&Request::Open { name: name.to_string() })? {
            Response::Db { id } => Ok(id),
            other => Err(unexpected(&other)),
        }
    }

    /// Prepare a statement against the opened database
    pub fn prepare(&mut self, db_id: u32, sql: &str) -> Result<StmtHandle> {
        let request = Request::Prepare { db_id, sql: sql.to_string() };
        match self.request(&request)? {
            Response::Stmt { id, mutates, param_count } => {
                Ok(StmtHandle { id, mutates, param_count })
            }
            other => Err(unexpected(&other)),
        }
    }

    /// Execute a prepared statement
    pub fn exec(&mut self, stmt_id: u32, params: &[Value]) -> Result<ExecResult> {
        let request = Request::Exec { stmt_id, params: params.to_vec() };
        match self.request(&request)? {
            Response::ExecResult { last_insert_id, rows_affected } => {
                Ok(ExecResult { last_insert_id, rows_affected })
            }
            other => Err(unexpected(&other)),
        }
    }

    /// Run a query at the default (linearizable) consistency
    pub fn query(&mut self, stmt_id: u32, params: &[Value]) -> Result<QueryResult> {
        self.query_with(stmt_id, params, Consistency::Linearizable)
    }

    /// Run a query at an explicit consistency, draining all row batches
    pub fn query_with(
        &mut self,
        stmt_id: u32,
        params: &[Value],
        consistency: Consistency,
    ) -> Result<QueryResult> {
        let request = Request::Query {
            stmt_id,
            params: params.to_vec(),
            consistency,
        };
        let columns = match self.request(&request)? {
            Response::RowsHeader { columns } => columns,
            other => return Err(unexpected(&other)),
        };

        let mut rows = Vec::new();
        loop {
            match self.receive()? {
                Response::RowBatch { rows: batch } => rows.extend(batch),
                Response::RowsDone => break,
                other => return Err(unexpected(&other)),
            }
        }
        Ok(QueryResult { columns, rows })
    }

    /// Release a prepared statement
    pub fn finalize(&mut self, stmt_id: u32) -> Result<()> {
        match self.request(&Request::Finalize { stmt_id })? {
            Response::Ack => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    // -------------------------------------------------------------------------
    // Round Trips
    // -------------------------------------------------------------------------

    fn request(&mut self, request: &Request) -> Result<Response> {
        write_request(&mut self.writer, request)?;
        self.receive()
    }

    /// Read one response, surfacing error frames as errors
    fn receive(&mut self) -> Result<Response> {
        match read_response(&mut self.reader)? {
            Response::Error { code, message, detail } => {
                Err(Error::from_wire(code, message, detail))
            }
            response => Ok(response),
        }
    }
}

fn unexpected(response: &Response) -> Error {
    Error::Frame(format!("unexpected response frame: {response:?}"))
}
