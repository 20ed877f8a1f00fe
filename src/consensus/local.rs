//! Bundled single-node consensus
//!
//! Implements the [`Consensus`] seam for a standalone deployment: one
//! durable log file per database, every appended entry immediately
//! committed and delivered to the attached sink. There is no election and
//! no replication; this node is always the leader of itself.
//!
//! Besides making a one-node server complete, this implementation gives the
//! tests a deterministic consensus: appends commit synchronously, and on
//! restart the recovered entries are re-delivered in order so the node
//! rebuilds its database images before serving.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Weak;

use parking_lot::{Mutex, RwLock};

use crate::error::{Error, Result};
use super::storage::LogFile;
use super::{CommitSink, Consensus, LeadershipStatus, LogEntry};

/// Term reported by a log that answers only to itself
const LOCAL_TERM: u64 = 1;

/// Single-node consensus over per-database durable logs
pub struct LocalConsensus {
    logs_dir: PathBuf,
    advertise_addr: String,
    logs: Mutex<HashMap<String, LogFile>>,
    sink: RwLock<Option<Weak<dyn CommitSink>>>,
    /// Entries recovered at open, delivered once on attach
    recovered: Mutex<Vec<(String, Vec<LogEntry>)>>,
}

impl LocalConsensus {
    /// Open the logs directory, recovering every database log in it
    pub fn open(data_dir: &std::path::Path, advertise_addr: impl Into<String>) -> Result<Self> {
        let logs_dir = data_dir.join("logs");
        std::fs::create_dir_all(&logs_dir)?;

        let mut logs = HashMap::new();
        let mut recovered = Vec::new();
        for dir_entry in std::fs::read_dir(&logs_dir)? {
            let path = dir_entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("log") {
                continue;
            }
            let Some(db) = path.file_stem().and_then(|s| s.to_str()).map(String::from) else {
                continue;
            };
            let (log, entries) = LogFile::open(&path)?;
            tracing::info!("recovered {} log entries for database '{}'", entries.len(), db);
            if !entries.is_empty() {
                recovered.push((db.clone(), entries));
            }
            logs.insert(db, log);
        }
        recovered.sort_by(|a, b| a.0.cmp(&b.0));

        Ok(Self {
            logs_dir,
            advertise_addr: advertise_addr.into(),
            logs: Mutex::new(logs),
            sink: RwLock::new(None),
            recovered: Mutex::new(recovered),
        })
    }

    fn deliver(&self, db: &str, entry: LogEntry) {
        let sink = self.sink.read().as_ref().and_then(Weak::upgrade);
        if let Some(sink) = sink {
            sink.apply_committed(db, entry);
        }
    }
}

impl Consensus for LocalConsensus {
    fn append(&self, db: &str, payload: Vec<u8>) -> Result<u64> {
        let mut logs = self.logs.lock();
        if !logs.contains_key(db) {
            let path = self.logs_dir.join(format!("{db}.log"));
            let (log, _) = LogFile::open(&path)?;
            logs.insert(db.to_string(), log);
        }
        let log = logs.get_mut(db).expect("log present after insert");
        let entry = LogEntry {
            index: log.last_index() + 1,
            term: LOCAL_TERM,
            payload,
        };
        log.append(&entry)?;
        let index = entry.index;

        // Durable means committed here; hand the entry straight to the
        // sink. Delivery stays under the logs lock so commits for one
        // database can never be observed out of index order.
        self.deliver(db, entry);
        Ok(index)
    }

    fn status(&self) -> LeadershipStatus {
        LeadershipStatus {
            is_leader: true,
            term: LOCAL_TERM,
            leader_address: Some(self.advertise_addr.clone()),
        }
    }

    fn barrier(&self, db: &str) -> Result<u64> {
        let logs = self.logs.lock();
        Ok(logs.get(db).map(|l| l.last_index()).unwrap_or(0))
    }

    fn attach(&self, sink: Weak<dyn CommitSink>) {
        *self.sink.write() = Some(sink);

        // Replay everything recovered from disk so the node rebuilds its
        // images before the first request arrives
        let recovered = std::mem::take(&mut *self.recovered.lock());
        for (db, entries) in recovered {
            for entry in entries {
                self.deliver(&db, entry);
            }
        }
    }
}

impl std::fmt::Debug for LocalConsensus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalConsensus")
            .field("logs_dir", &self.logs_dir)
            .field("advertise_addr", &self.advertise_addr)
            .finish()
    }
}

/// Reject database names that cannot be used as log file stems
pub fn validate_db_name(name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && name.len() <= 128
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if ok {
        Ok(())
    } else {
        Err(Error::Schema(format!("invalid database name '{name}'")))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[derive(Default)]
    struct RecordingSink {
        seen: Mutex<Vec<(String, u64)>>,
    }

    impl CommitSink for RecordingSink {
        fn apply_committed(&self, db: &str, entry: LogEntry) {
            self.seen.lock().push((db.to_string(), entry.index));
        }

        fn entry_superseded(&self, _db: &str, _index: u64, _term: u64) {}
    }

    #[test]
    fn append_assigns_consecutive_indices_and_delivers() {
        let dir = tempfile::tempdir().unwrap();
        let consensus = LocalConsensus::open(dir.path(), "127.0.0.1:1").unwrap();
        let sink = Arc::new(RecordingSink::default());
        let sink_dyn: Arc<dyn CommitSink> = Arc::clone(&sink) as Arc<dyn CommitSink>;
        let weak: Weak<dyn CommitSink> = Arc::downgrade(&sink_dyn);
        consensus.attach(weak);

        assert_eq!(consensus.append("app", b"a".to_vec()).unwrap(), 1);
        assert_eq!(consensus.append("app", b"b".to_vec()).unwrap(), 2);
        assert_eq!(consensus.append("other", b"c".to_vec()).unwrap(), 1);

        let seen = sink.seen.lock();
        assert_eq!(
            *seen,
            vec![
                ("app".to_string(), 1),
                ("app".to_string(), 2),
                ("other".to_string(), 1)
            ]
        );
    }

    #[test]
    fn restart_replays_recovered_entries() {
        let dir = tempfile::tempdir().unwrap();

        {
            let consensus = LocalConsensus::open(dir.path(), "127.0.0.1:1").unwrap();
            consensus.append("app", b"a".to_vec()).unwrap();
            consensus.append("app", b"b".to_vec()).unwrap();
        }

        let consensus = LocalConsensus::open(dir.path(), "127.0.0.1:1").unwrap();
        let sink = Arc::new(RecordingSink::default());
        let sink_dyn: Arc<dyn CommitSink> = Arc::clone(&sink) as Arc<dyn CommitSink>;
        let weak: Weak<dyn CommitSink> = Arc::downgrade(&sink_dyn);
        consensus.attach(weak);

        assert_eq!(
            *sink.seen.lock(),
            vec![("app".to_string(), 1), ("app".to_string(), 2)]
        );

        // New appends continue after the recovered tail
        assert_eq!(consensus.append("app", b"c".to_vec()).unwrap(), 3);
    }

    #[test]
    fn always_leader() {
        let dir = tempfile::tempdir().unwrap();
        let consensus = LocalConsensus::open(dir.path(), "127.0.0.1:9").unwrap();
        let status = consensus.status();
        assert!(status.is_leader);
        assert_eq!(status.leader_address.as_deref(), Some("127.0.0.1:9"));
    }

    #[test]
    fn db_name_validation() {
        assert!(validate_db_name("app_db-1").is_ok());
        assert!(validate_db_name("").is_err());
        assert!(validate_db_name("../escape").is_err());
        assert!(validate_db_name("name with spaces").is_err());
    }
}
