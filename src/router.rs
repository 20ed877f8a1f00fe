//! Leadership Router
//!
//! Stateless per-operation decision function backed by live status from
//! the consensus service: writes may only originate on the leader, reads
//! either run locally (possibly stale) or behind a barrier guaranteeing
//! they observe every previously committed write.

use std::sync::Arc;
use std::time::Duration;

use crate::consensus::Consensus;
use crate::db::Database;
use crate::error::{Error, Result};
use crate::protocol::Consistency;

/// Routes operations based on leadership status
pub struct Router {
    consensus: Arc<dyn Consensus>,
}

impl Router {
    pub fn new(consensus: Arc<dyn Consensus>) -> Self {
        Self { consensus }
    }

    /// Whether this node may originate a new log entry. Followers fail
    /// immediately with the best-known leader address; writes are never
    /// queued behind an election.
    pub fn check_write(&self) -> Result<()> {
        let status = self.consensus.status();
        if status.is_leader {
            Ok(())
        } else {
            Err(Error::NotLeader { leader: status.leader_address })
        }
    }

    /// Gate a read on the selected consistency mode. Linearizable reads
    /// wait for the local image to reach the consensus barrier index;
    /// local reads run against the image as-is.
    pub fn read_barrier(
        &self,
        db: &Database,
        consistency: Consistency,
        timeout: Duration,
    ) -> Result<()> {
        match consistency {
            Consistency::Local => Ok(()),
            Consistency::Linearizable => {
                let index = self.consensus.barrier(db.name())?;
                if index == 0 {
                    return Ok(());
                }
                db.wait_applied(index, timeout)
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
