//! Durable log storage for the bundled consensus
//!
//! Append-only file of checksummed records, one file per database log.
//!
//! ## File Format
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │ Record 1                                            │
//! │ ┌───────────┬──────────┬─────────┬─────────┬──────┐ │
//! │ │ Index (8) │ Term (8) │ CRC (4) │ Len (4) │ Data │ │
//! │ └───────────┴──────────┴─────────┴─────────┴──────┘ │
//! ├─────────────────────────────────────────────────────┤
//! │ Record 2 ...                                        │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! Recovery scans from the start and truncates at the first torn or
//! corrupt record: a crash mid-append loses at most the unacknowledged
//! tail, never an acknowledged entry.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use super::LogEntry;

/// Fixed record header: index (8) + term (8) + crc (4) + len (4)
const RECORD_HEADER_SIZE: usize = 24;

/// Upper bound on a single record payload (16 MB); larger means corruption
const MAX_RECORD_SIZE: u32 = 16 * 1024 * 1024;

/// Append-only, checksummed log file
pub struct LogFile {
    file: File,
    path: PathBuf,
    last_index: u64,
}

impl LogFile {
    /// Open or create a log file, recovering all intact entries.
    ///
    /// Returns the file positioned for appending plus the recovered
    /// entries in index order.
    pub fn open(path: &Path) -> Result<(Self, Vec<LogEntry>)> {
        let file = OpenOptions::new()
            .read(true)
            .create(true)
            .append(true)
            .open(path)?;

        let (entries, good_bytes) = Self::scan(&file)?;
        let file_len = file.metadata()?.len();
        if good_bytes < file_len {
            tracing::warn!(
                "truncating {} torn bytes from {}",
                file_len - good_bytes,
                path.display()
            );
            file.set_len(good_bytes)?;
        }

        let last_index = entries.last().map(|e| e.index).unwrap_or(0);
        Ok((
            Self {
                file,
                path: path.to_path_buf(),
                last_index,
            },
            entries,
        ))
    }

    /// Scan intact records from the start; returns entries plus the byte
    /// offset of the first record that failed validation
    fn scan(file: &File) -> Result<(Vec<LogEntry>, u64)> {
        let mut reader = BufReader::new(file.try_clone()?);
        reader.seek(SeekFrom::Start(0))?;

        let mut entries = Vec::new();
        let mut good_bytes = 0u64;
        let mut expected_index = 1u64;

        loop {
            let mut header = [0u8; RECORD_HEADER_SIZE];
            match reader.read_exact(&mut header) {
                Ok(()) => {}
                Err(ref e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }

            let index = u64::from_be_bytes(header[0..8].try_into().expect("8 bytes"));
            let term = u64::from_be_bytes(header[8..16].try_into().expect("8 bytes"));
            let crc = u32::from_be_bytes(header[16..20].try_into().expect("4 bytes"));
            let len = u32::from_be_bytes(header[20..24].try_into().expect("4 bytes"));

            if len > MAX_RECORD_SIZE || index != expected_index {
                break;
            }

            let mut payload = vec![0u8; len as usize];
            match reader.read_exact(&mut payload) {
                Ok(()) => {}
                Err(ref e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }

            if crc32fast::hash(&payload) != crc {
                break;
            }

            good_bytes += (RECORD_HEADER_SIZE + len as usize) as u64;
            expected_index += 1;
            entries.push(LogEntry { index, term, payload });
        }

        Ok((entries, good_bytes))
    }

    /// Append an entry and sync it to disk. The entry index must follow
    /// the last appended index.
    pub fn append(&mut self, entry: &LogEntry) -> Result<()> {
        if entry.index != self.last_index + 1 {
            return Err(Error::Consensus(format!(
                "log {} expects index {}, got {}",
                self.path.display(),
                self.last_index + 1,
                entry.index
            )));
        }
        if entry.payload.len() > MAX_RECORD_SIZE as usize {
            return Err(Error::Consensus(format!(
                "log record of {} bytes exceeds the record bound",
                entry.payload.len()
            )));
        }

        let mut record = Vec::with_capacity(RECORD_HEADER_SIZE + entry.payload.len());
        record.extend_from_slice(&entry.index.to_be_bytes());
        record.extend_from_slice(&entry.term.to_be_bytes());
        record.extend_from_slice(&crc32fast::hash(&entry.payload).to_be_bytes());
        record.extend_from_slice(&(entry.payload.len() as u32).to_be_bytes());
        record.extend_from_slice(&entry.payload);

        self.file.write_all(&record)?;
        self.file.sync_data()?;
        self.last_index = entry.index;
        Ok(())
    }

    /// Index of the last durable entry, 0 for an empty log
    pub fn last_index(&self) -> u64 {
        self.last_index
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(index: u64, payload: &[u8]) -> LogEntry {
        LogEntry {
            index,
            term: 1,
            payload: payload.to_vec(),
        }
    }

    #[test]
    fn append_and_recover() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.log");

        {
            let (mut log, entries) = LogFile::open(&path).unwrap();
            assert!(entries.is_empty());
            log.append(&entry(1, b"one")).unwrap();
            log.append(&entry(2, b"two")).unwrap();
        }

        let (log, entries) = LogFile::open(&path).unwrap();
        assert_eq!(log.last_index(), 2);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].payload, b"two");
    }

    #[test]
    fn rejects_non_consecutive_index() {
        let dir = tempfile::tempdir().unwrap();
        let (mut log, _) = LogFile::open(&dir.path().join("test.log")).unwrap();
        log.append(&entry(1, b"one")).unwrap();
        assert!(log.append(&entry(3, b"three")).is_err());
    }

    #[test]
    fn torn_tail_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.log");

        {
            let (mut log, _) = LogFile::open(&path).unwrap();
            log.append(&entry(1, b"one")).unwrap();
            log.append(&entry(2, b"two")).unwrap();
        }

        // Tear the last record mid-payload
        let len = std::fs::metadata(&path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len - 2).unwrap();

        let (log, entries) = LogFile::open(&path).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(log.last_index(), 1);

        // The log accepts new appends after truncation
        let (mut log, _) = LogFile::open(&path).unwrap();
        log.append(&entry(2, b"two again")).unwrap();
    }

    #[test]
    fn corrupt_payload_stops_recovery() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.log");

        {
            let (mut log, _) = LogFile::open(&path).unwrap();
            log.append(&entry(1, b"one")).unwrap();
            log.append(&entry(2, b"two")).unwrap();
        }

        // Flip a byte inside the second record's payload
        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();

        let (_, entries) = LogFile::open(&path).unwrap();
        assert_eq!(entries.len(), 1);
    }
}
