//! Apply engine
//!
//! Turns committed log entries into mutations of the local database image,
//! in strict log-index order. The payload already encodes the exact
//! page-level mutation agreed upon, so apply never re-executes SQL and two
//! nodes applying the same entries hold bit-identical images.
//!
//! ## Payload Format
//! ```text
//! ┌─────────┬───────────────────────────────┐
//! │ CRC (4) │ bincode-encoded WAL frame set │
//! └─────────┴───────────────────────────────┘
//! ```
//!
//! A payload that fails its checksum or decode at apply time means the
//! replicas no longer agree on bytes; the image halts rather than guess.

use crate::consensus::{CommitOutcome, LogEntry};
use crate::engine::WalFrames;
use crate::error::{Error, Result};
use super::{Database, Phase, Snapshot};

// =============================================================================
// Payload Framing
// =============================================================================

/// Encode a frame set as a log entry payload
pub fn encode_payload(frames: &WalFrames) -> Result<Vec<u8>> {
    let body = bincode::serialize(frames)?;
    let crc = crc32fast::hash(&body);
    let mut payload = Vec::with_capacity(4 + body.len());
    payload.extend_from_slice(&crc.to_be_bytes());
    payload.extend_from_slice(&body);
    Ok(payload)
}

/// Decode and verify a log entry payload
pub fn decode_payload(payload: &[u8]) -> Result<WalFrames> {
    if payload.len() < 4 {
        return Err(Error::Fatal("log payload shorter than its checksum".to_string()));
    }
    let (crc_bytes, body) = payload.split_at(4);
    let expected = u32::from_be_bytes(crc_bytes.try_into().expect("4 bytes"));
    if crc32fast::hash(body) != expected {
        return Err(Error::Fatal("log payload checksum mismatch".to_string()));
    }
    bincode::deserialize(body).map_err(|e| Error::Fatal(format!("undecodable log payload: {e}")))
}

// =============================================================================
// Apply / Snapshot / Restore
// =============================================================================

impl Database {
    /// Apply one committed entry.
    ///
    /// Requires `entry.index == applied_index + 1`. A violated precondition
    /// or a malformed payload is a cross-node divergence: the image halts,
    /// the diagnostic is surfaced, and the error is never retried.
    pub fn apply(&self, entry: &LogEntry) -> Result<()> {
        let result = self.apply_inner(entry);
        match &result {
            Ok(()) => {
                self.waiters
                    .resolve(entry.index, CommitOutcome::Committed { term: entry.term });
            }
            Err(e) => {
                tracing::error!(
                    "halting apply for database '{}' at index {}: {}",
                    self.name,
                    entry.index,
                    e
                );
            }
        }
        result
    }

    fn apply_inner(&self, entry: &LogEntry) -> Result<()> {
        let mut inner = self.inner.lock();

        if let Phase::Halted(reason) = &inner.phase {
            return Err(Error::Fatal(format!(
                "database '{}' is halted: {reason}",
                self.name
            )));
        }

        if entry.index != inner.applied_index + 1 {
            let reason = format!(
                "apply expected index {}, got {}",
                inner.applied_index + 1,
                entry.index
            );
            inner.phase = Phase::Halted(reason.clone());
            return Err(Error::Fatal(reason));
        }

        let frames = match decode_payload(&entry.payload) {
            Ok(frames) => frames,
            Err(e) => {
                inner.phase = Phase::Halted(e.to_string());
                return Err(e);
            }
        };

        if let Err(e) = inner.engine.apply_frames(&frames) {
            inner.phase = Phase::Halted(e.to_string());
            return Err(e);
        }

        inner.applied_index = entry.index;
        self.applied_cv.notify_all();
        Ok(())
    }

    /// Resolve an in-flight write that a term change made obsolete
    pub fn entry_superseded(&self, index: u64, term: u64) {
        self.waiters.resolve(index, CommitOutcome::Superseded { term });
    }

    /// Capture a snapshot of the image at the current `applied_index`.
    ///
    /// The image lock is held only for the page-handle capture; the byte
    /// serialization happens outside it, so concurrent applies are stalled
    /// for no longer than a metadata copy.
    pub fn snapshot(&self) -> Result<Snapshot> {
        let (capture, applied_index) = {
            let inner = self.inner.lock();
            Self::ensure_ready(&inner, &self.name)?;
            (inner.engine.snapshot_image()?, inner.applied_index)
        };
        Ok(Snapshot {
            applied_index,
            image: capture.serialize()?.to_vec(),
        })
    }

    /// Atomically replace the image from a snapshot.
    ///
    /// Sets `applied_index` to the snapshot's position and increments the
    /// image epoch, invalidating every outstanding statement handle. Also
    /// the recovery path for a halted image.
    pub fn restore(&self, snapshot: &Snapshot) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.phase == Phase::Installing {
            return Err(Error::Busy(format!(
                "database '{}' is already installing a snapshot",
                self.name
            )));
        }

        let prior = std::mem::replace(&mut inner.phase, Phase::Installing);
        match inner.engine.restore_image(&snapshot.image) {
            Ok(()) => {
                inner.applied_index = snapshot.applied_index;
                inner.epoch += 1;
                inner.phase = Phase::Ready;
                self.applied_cv.notify_all();
                tracing::info!(
                    "database '{}' restored to index {} (epoch {})",
                    self.name,
                    inner.applied_index,
                    inner.epoch
                );
                Ok(())
            }
            Err(e) => {
                // The engine validates before replacing, so the old image
                // is intact and the prior phase still describes it
                inner.phase = prior;
                Err(e)
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::engine::{MemEngine, SqlEngine};
    use super::*;

    fn test_db() -> Database {
        Database::new("test", Box::new(MemEngine::new()))
    }

    /// Build the payload a leader would replicate for one statement
    fn payload_for(engine: &mut MemEngine, sql: &str) -> Vec<u8> {
        let prepared = engine.prepare(sql).unwrap();
        let (_, frames) = engine.exec_capture(&prepared.statement, &[]).unwrap();
        engine.apply_frames(&frames).unwrap();
        encode_payload(&frames).unwrap()
    }

    fn entry(index: u64, payload: Vec<u8>) -> LogEntry {
        LogEntry { index, term: 1, payload }
    }

    #[test]
    fn applies_in_order_and_advances() {
        let db = test_db();
        let mut leader = MemEngine::new();

        db.apply(&entry(1, payload_for(&mut leader, "CREATE TABLE t (n INT)")))
            .unwrap();
        db.apply(&entry(2, payload_for(&mut leader, "INSERT INTO t (n) VALUES (1)")))
            .unwrap();
        assert_eq!(db.applied_index(), 2);
    }

    #[test]
    fn skipped_index_halts_the_image() {
        let db = test_db();
        let mut leader = MemEngine::new();
        let payload = payload_for(&mut leader, "CREATE TABLE t (n INT)");

        let err = db.apply(&entry(3, payload)).unwrap_err();
        assert!(matches!(err, Error::Fatal(_)));
        assert_eq!(db.applied_index(), 0);

        // Every subsequent operation reports the halt
        assert!(matches!(db.check_ready(), Err(Error::Fatal(_))));
    }

    #[test]
    fn corrupt_payload_halts_the_image() {
        let db = test_db();
        let mut leader = MemEngine::new();
        let mut payload = payload_for(&mut leader, "CREATE TABLE t (n INT)");
        let last = payload.len() - 1;
        payload[last] ^= 0xFF;

        assert!(matches!(db.apply(&entry(1, payload)), Err(Error::Fatal(_))));
        assert!(db.check_ready().is_err());
    }

    #[test]
    fn restore_sets_index_and_bumps_epoch() {
        let db = test_db();
        let mut leader = MemEngine::new();
        db.apply(&entry(1, payload_for(&mut leader, "CREATE TABLE t (n INT)")))
            .unwrap();

        let (_, epoch_before) = db.prepare("SELECT n FROM t").unwrap();

        // Snapshot from a peer that is further ahead
        let mut ahead = MemEngine::new();
        for sql in ["CREATE TABLE t (n INT)", "INSERT INTO t (n) VALUES (9)"] {
            let prepared = ahead.prepare(sql).unwrap();
            let (_, frames) = ahead.exec_capture(&prepared.statement, &[]).unwrap();
            ahead.apply_frames(&frames).unwrap();
        }
        let snapshot = Snapshot {
            applied_index: 2,
            image: ahead.snapshot_image().unwrap().serialize().unwrap().to_vec(),
        };

        db.restore(&snapshot).unwrap();
        assert_eq!(db.applied_index(), 2);
        assert_eq!(db.epoch(), epoch_before + 1);

        // Handles from before the restore are invalid now
        assert!(matches!(
            db.check_epoch(1, epoch_before),
            Err(Error::InvalidHandle(1))
        ));
    }

    #[test]
    fn restore_revives_a_halted_image() {
        let db = test_db();
        let mut leader = MemEngine::new();
        let payload = payload_for(&mut leader, "CREATE TABLE t (n INT)");
        db.apply(&entry(5, payload)).unwrap_err();
        assert!(db.check_ready().is_err());

        let snapshot = Snapshot {
            applied_index: 5,
            image: MemEngine::new().snapshot_image().unwrap().serialize().unwrap().to_vec(),
        };
        db.restore(&snapshot).unwrap();
        assert!(db.check_ready().is_ok());
        assert_eq!(db.applied_index(), 5);
    }

    #[test]
    fn wait_applied_observes_apply() {
        let db = std::sync::Arc::new(test_db());
        let mut leader = MemEngine::new();
        let payload = payload_for(&mut leader, "CREATE TABLE t (n INT)");

        let waiter = std::sync::Arc::clone(&db);
        let handle = std::thread::spawn(move || waiter.wait_applied(1, Duration::from_secs(2)));

        db.apply(&entry(1, payload)).unwrap();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn speculative_exec_does_not_advance_applied_index() {
        let db = test_db();
        let mut leader = MemEngine::new();
        db.apply(&entry(1, payload_for(&mut leader, "CREATE TABLE t (n INT)")))
            .unwrap();

        let (prepared, _) = db.prepare("INSERT INTO t (n) VALUES (1)").unwrap();
        let (result, frames) = db.exec_speculative(&prepared.statement, &[]).unwrap();
        assert_eq!(result.rows_affected, 1);
        assert!(!frames.is_empty());
        assert_eq!(db.applied_index(), 1);

        // No rows visible until the frames come back through apply
        let (prepared, _) = db.prepare("SELECT n FROM t").unwrap();
        let mut cursor = db.query(&prepared.statement, &[]).unwrap();
        assert!(cursor.next_row().unwrap().is_none());
    }
}
