//! Statement registry
//!
//! Maps opaque statement handles to prepared statements. Each connection
//! owns one registry; entries die with the connection or on explicit
//! finalize, and are invalidated wholesale when the owning image's epoch
//! moves (snapshot restore).

use std::collections::HashMap;

use crate::engine::{Prepared, Statement};

/// A registered prepared statement
#[derive(Debug, Clone)]
pub struct PreparedStatement {
    pub id: u32,
    pub statement: Statement,
    pub mutates: bool,
    pub param_count: u16,
    /// Image epoch captured at prepare time; the handle is dead once the
    /// image's epoch moves past it
    pub epoch: u64,
}

/// Connection-local statement handle table
#[derive(Debug, Default)]
pub struct StatementRegistry {
    next_id: u32,
    entries: HashMap<u32, PreparedStatement>,
}

impl StatementRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly prepared statement, returning its handle
    pub fn insert(&mut self, prepared: Prepared, epoch: u64) -> u32 {
        self.next_id += 1;
        let id = self.next_id;
        self.entries.insert(
            id,
            PreparedStatement {
                id,
                statement: prepared.statement,
                mutates: prepared.mutates,
                param_count: prepared.param_count,
                epoch,
            },
        );
        id
    }

    pub fn get(&self, id: u32) -> Option<&PreparedStatement> {
        self.entries.get(&id)
    }

    /// Release a handle; false when the handle is unknown (already
    /// finalized or never issued)
    pub fn remove(&mut self, id: u32) -> bool {
        self.entries.remove(&id).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// =============================================================================
// Tests
// =============================================================================
