//! Consensus Module
//!
//! The seam between the replicated execution core and the consensus
//! algorithm that orders writes. The core consumes consensus as a service:
//! append a payload to a database's log, learn the current leadership
//! status, obtain a read barrier, and receive committed entries through an
//! attached sink. Leader election, log replication, and term management all
//! live behind this trait.
//!
//! The bundled [`LocalConsensus`] implements the seam for a single node
//! with a durable on-disk log, so a one-node deployment is a complete
//! system and the core is testable without a real consensus stack.

mod storage;
mod local;

pub use local::{validate_db_name, LocalConsensus};
pub use storage::LogFile;

use std::collections::{BTreeMap, HashMap};
use std::sync::Weak;
use std::time::Duration;

use crossbeam::channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// =============================================================================
// Log Entries
// =============================================================================

/// One committed unit of replicated mutation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    /// Position in the owning database's log; unique and gap-free
    pub index: u64,

    /// Consensus term under which the entry was appended
    pub term: u64,

    /// CRC-framed, serialized WAL frame set (see `db::apply`)
    pub payload: Vec<u8>,
}

/// Live leadership status reported by the consensus service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeadershipStatus {
    pub is_leader: bool,
    pub term: u64,
    /// Best-known leader address; `None` when no leader is known
    pub leader_address: Option<String>,
}

// =============================================================================
// Seam Traits
// =============================================================================

/// The consensus service, as consumed by the core
pub trait Consensus: Send + Sync {
    /// Append a payload to the named database's log, returning the index
    /// the entry was assigned. Committing is asynchronous: the entry is
    /// reported through the attached [`CommitSink`] once agreed upon.
    fn append(&self, db: &str, payload: Vec<u8>) -> Result<u64>;

    /// Current leadership status of this node
    fn status(&self) -> LeadershipStatus;

    /// Index a linearizable read must observe before executing. The caller
    /// waits for the local image to reach it.
    fn barrier(&self, db: &str) -> Result<u64>;

    /// Attach the sink that receives committed entries. Implementations
    /// re-deliver any entries recovered from durable storage so a restarted
    /// node rebuilds its images before serving.
    fn attach(&self, sink: Weak<dyn CommitSink>);
}

/// Receiver side of the consensus integration: the core implements this and
/// mutates database images from it.
pub trait CommitSink: Send + Sync {
    /// An entry is committed; apply it. Entries for one database arrive in
    /// strict index order.
    fn apply_committed(&self, db: &str, entry: LogEntry);

    /// A previously appended entry was lost to a term change and will never
    /// commit. Resolves the entry's waiter with `LeadershipLost`.
    fn entry_superseded(&self, db: &str, index: u64, term: u64);
}

// =============================================================================
// Commit Waiters
// =============================================================================

/// Final fate of an appended entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Durably committed and applied locally (possibly under a later term)
    Committed { term: u64 },

    /// Authoritatively superseded; the write never took effect
    Superseded { term: u64 },
}

/// Resolved outcomes kept around for writers that have not claimed them
/// yet. Commit delivery can race the writer registering its waiter, so the
/// window must be wide enough to cover that gap; follower-side applies are
/// never claimed and age out of it.
const RESOLVED_WINDOW: u64 = 1024;

/// Registry of per-index completion handles, resolved by the apply path.
///
/// One registry per database image. A writer claims its index right after
/// the append returns; the apply path resolves it once the entry commits
/// and applies (or is superseded).
#[derive(Default)]
pub struct CommitWaiters {
    inner: Mutex<WaitersInner>,
}

#[derive(Default)]
struct WaitersInner {
    pending: HashMap<u64, Sender<CommitOutcome>>,
    resolved: BTreeMap<u64, CommitOutcome>,
}

impl CommitWaiters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the completion handle for an index
    pub fn claim(&self, index: u64) -> CommitWaiter {
        let mut inner = self.inner.lock();
        if let Some(outcome) = inner.resolved.remove(&index) {
            return CommitWaiter(WaiterState::Ready(outcome));
        }
        let (tx, rx) = bounded(1);
        inner.pending.insert(index, tx);
        CommitWaiter(WaiterState::Pending(rx))
    }

    /// Resolve an index with its final outcome
    pub fn resolve(&self, index: u64, outcome: CommitOutcome) {
        let mut inner = self.inner.lock();
        match inner.pending.remove(&index) {
            // A disconnected receiver means the waiter gave up; the outcome
            // is then nobody's business anymore.
            Some(tx) => {
                let _ = tx.send(outcome);
            }
            None => {
                inner.resolved.insert(index, outcome);
                let cutoff = index.saturating_sub(RESOLVED_WINDOW);
                inner.resolved = inner.resolved.split_off(&cutoff);
            }
        }
    }
}

enum WaiterState {
    Ready(CommitOutcome),
    Pending(Receiver<CommitOutcome>),
}

/// One-shot completion handle for an appended entry
pub struct CommitWaiter(WaiterState);

impl CommitWaiter {
    /// Wait for the entry's fate, bounded by `timeout`. On timeout the
    /// entry's ultimate fate is unresolved from the caller's perspective.
    pub fn wait(self, timeout: Duration) -> Result<CommitOutcome> {
        match self.0 {
            WaiterState::Ready(outcome) => Ok(outcome),
            WaiterState::Pending(rx) => rx
                .recv_timeout(timeout)
                .map_err(|_| Error::Timeout("log entry commit")),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn claim_then_resolve() {
        let waiters = Arc::new(CommitWaiters::new());
        let waiter = waiters.claim(1);

        let resolver = Arc::clone(&waiters);
        let handle = std::thread::spawn(move || {
            resolver.resolve(1, CommitOutcome::Committed { term: 1 });
        });

        let outcome = waiter.wait(Duration::from_secs(1)).unwrap();
        assert_eq!(outcome, CommitOutcome::Committed { term: 1 });
        handle.join().unwrap();
    }

    #[test]
    fn resolve_before_claim_is_buffered() {
        let waiters = CommitWaiters::new();
        waiters.resolve(7, CommitOutcome::Superseded { term: 3 });

        let outcome = waiters.claim(7).wait(Duration::from_millis(10)).unwrap();
        assert_eq!(outcome, CommitOutcome::Superseded { term: 3 });
    }

    #[test]
    fn unclaimed_outcomes_age_out() {
        let waiters = CommitWaiters::new();
        waiters.resolve(1, CommitOutcome::Committed { term: 1 });
        waiters.resolve(1 + RESOLVED_WINDOW + 1, CommitOutcome::Committed { term: 1 });

        // Index 1 fell out of the window; a late claim times out
        let err = waiters.claim(1).wait(Duration::from_millis(10)).unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }

    #[test]
    fn wait_times_out_without_resolution() {
        let waiters = CommitWaiters::new();
        let err = waiters.claim(5).wait(Duration::from_millis(10)).unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }
}
