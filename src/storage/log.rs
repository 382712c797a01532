//! Persistent log store.
//!
//! The log is an append-only sequence of entries backed by a single file of
//! length-prefixed records. The first in-memory entry is always a sentinel
//! whose index and term mark the compaction frontier; it is never handed out
//! to callers. Mutations are fsynced before they are acknowledged, and
//! compaction and discard replace the file atomically via a temporary file
//! and rename. Not concurrency safe; the owning node serializes access.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, Seek, SeekFrom};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{StorageError, StorageResult};
use crate::storage::encoding::{read_record, write_record};

const LOG_FILE: &str = "log.bin";

/// The kind of a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogEntryType {
    /// An entry with no payload, appended by a newly elected leader so the
    /// commit rule can advance across entries from earlier terms.
    NoOp,
    /// An entry carrying a client operation.
    Operation,
}

/// A single entry in the replicated log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// The position of the entry in the log. Strictly increasing and
    /// contiguous.
    pub index: u64,

    /// The term in which the entry was created.
    pub term: u64,

    /// The file offset the entry was written at. Assigned by the log and
    /// meaningful only to the local reader.
    pub offset: i64,

    /// The opaque operation payload.
    pub data: Vec<u8>,

    /// The kind of the entry.
    pub entry_type: LogEntryType,
}

impl LogEntry {
    pub fn new(index: u64, term: u64, data: Vec<u8>, entry_type: LogEntryType) -> Self {
        Self {
            index,
            term,
            offset: 0,
            data,
            entry_type,
        }
    }

    /// Two entries conflict if they share an index but disagree on the term.
    pub fn is_conflict(&self, other: &LogEntry) -> bool {
        self.index == other.index && self.term != other.term
    }
}

/// Persistent storage for log entries.
pub struct LogStore {
    dir: PathBuf,
    file: Option<File>,
    entries: Vec<LogEntry>,
}

impl LogStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            file: None,
            entries: Vec::new(),
        }
    }

    /// Creates or opens the backing file. Does not read any entries; call
    /// `replay` to load them.
    pub fn open(&mut self) -> StorageResult<()> {
        std::fs::create_dir_all(&self.dir)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(self.dir.join(LOG_FILE))?;
        self.file = Some(file);
        self.entries = Vec::new();
        Ok(())
    }

    /// Reads all persisted entries into memory. An empty log gets a
    /// zero-valued sentinel so the log always contains at least one entry.
    pub fn replay(&mut self) -> StorageResult<()> {
        let file = self.file.as_mut().ok_or(StorageError::NotOpen("log"))?;

        let mut reader = BufReader::new(&mut *file);
        while let Some(entry) = read_record::<_, LogEntry>(&mut reader)? {
            self.entries.push(entry);
        }

        if self.entries.is_empty() {
            let sentinel = LogEntry::new(0, 0, Vec::new(), LogEntryType::NoOp);
            write_record(file, &sentinel)?;
            file.sync_all()?;
            self.entries.push(sentinel);
        }

        Ok(())
    }

    /// Flushes and closes the backing file and clears the in-memory entries.
    pub fn close(&mut self) -> StorageResult<()> {
        if let Some(file) = self.file.take() {
            file.sync_all()?;
        }
        self.entries.clear();
        Ok(())
    }

    /// Returns the entry at the given index. The sentinel and anything
    /// beyond the last entry do not exist.
    pub fn get_entry(&self, index: u64) -> StorageResult<&LogEntry> {
        if self.file.is_none() {
            return Err(StorageError::NotOpen("log"));
        }
        let first = self.first_index();
        if index <= first || index > self.last_index() {
            return Err(StorageError::IndexDoesNotExist);
        }
        Ok(&self.entries[(index - first) as usize])
    }

    /// Whether the log holds a retrievable entry at the given index.
    pub fn contains(&self, index: u64) -> bool {
        index > self.first_index() && index <= self.last_index()
    }

    pub fn append_entry(&mut self, entry: LogEntry) -> StorageResult<()> {
        self.append_entries(vec![entry])
    }

    /// Appends a batch of entries. Each entry is assigned the file offset it
    /// is written at; the batch is fsynced once before the in-memory vector
    /// is extended.
    pub fn append_entries(&mut self, mut entries: Vec<LogEntry>) -> StorageResult<()> {
        let file = self.file.as_mut().ok_or(StorageError::NotOpen("log"))?;

        for entry in &mut entries {
            entry.offset = file.stream_position()? as i64;
            write_record(file, entry)?;
        }
        file.sync_all()?;

        self.entries.append(&mut entries);
        Ok(())
    }

    /// Removes all entries with index greater than or equal to the given
    /// index by shrinking the file to that entry's offset. The sentinel may
    /// not be truncated.
    pub fn truncate(&mut self, index: u64) -> StorageResult<()> {
        if self.file.is_none() {
            return Err(StorageError::NotOpen("log"));
        }
        let first = self.first_index();
        if index <= first || index > self.last_index() {
            return Err(StorageError::IndexDoesNotExist);
        }

        let position = (index - first) as usize;
        let size = self.entries[position].offset as u64;

        let file = self.file.as_mut().ok_or(StorageError::NotOpen("log"))?;
        file.set_len(size)?;
        file.sync_all()?;
        file.seek(SeekFrom::Start(size))?;

        self.entries.truncate(position);
        Ok(())
    }

    /// Discards all entries with index less than or equal to the given
    /// index. The entry at the index survives as the new sentinel. The
    /// retained suffix is rewritten to a temporary file with recomputed
    /// offsets and atomically renamed over the live log.
    pub fn compact(&mut self, index: u64) -> StorageResult<()> {
        if self.file.is_none() {
            return Err(StorageError::NotOpen("log"));
        }
        let first = self.first_index();
        if index <= first || index > self.last_index() {
            return Err(StorageError::IndexDoesNotExist);
        }

        let position = (index - first) as usize;
        let retained: Vec<LogEntry> = self.entries[position..].to_vec();
        self.replace_file(retained)
    }

    /// Replaces the entire log with a single sentinel at the given index and
    /// term. Used when installing a snapshot whose log prefix cannot be
    /// reconciled.
    pub fn discard_entries(&mut self, index: u64, term: u64) -> StorageResult<()> {
        if self.file.is_none() {
            return Err(StorageError::NotOpen("log"));
        }
        let sentinel = LogEntry::new(index, term, Vec::new(), LogEntryType::NoOp);
        self.replace_file(vec![sentinel])
    }

    pub fn first_index(&self) -> u64 {
        self.entries.first().map(|entry| entry.index).unwrap_or(0)
    }

    pub fn last_index(&self) -> u64 {
        self.entries.last().map(|entry| entry.index).unwrap_or(0)
    }

    pub fn last_term(&self) -> u64 {
        self.entries.last().map(|entry| entry.term).unwrap_or(0)
    }

    /// The index the next appended entry will receive.
    pub fn next_index(&self) -> u64 {
        self.last_index() + 1
    }

    /// The number of entries in the log, sentinel included.
    pub fn size(&self) -> usize {
        self.entries.len()
    }

    /// Writes the given entries to a temporary file, fsyncs it, atomically
    /// renames it over the live log, and reopens the log for appends.
    fn replace_file(&mut self, mut entries: Vec<LogEntry>) -> StorageResult<()> {
        let mut tmp = tempfile::Builder::new()
            .prefix("tmp-")
            .tempfile_in(&self.dir)?;

        for entry in &mut entries {
            entry.offset = tmp.as_file_mut().stream_position()? as i64;
            write_record(tmp.as_file_mut(), entry)?;
        }
        tmp.as_file().sync_all()?;

        let path = self.dir.join(LOG_FILE);
        self.file = None;
        let persisted = tmp.persist(&path).map_err(|err| StorageError::Io(err.error))?;
        drop(persisted);

        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
        file.seek(SeekFrom::End(0))?;
        self.file = Some(file);
        self.entries = entries;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_log(dir: &TempDir) -> LogStore {
        let mut log = LogStore::new(dir.path());
        log.open().unwrap();
        log.replay().unwrap();
        log
    }

    fn entry(index: u64, term: u64, data: &[u8]) -> LogEntry {
        LogEntry::new(index, term, data.to_vec(), LogEntryType::Operation)
    }

    #[test]
    fn test_replay_creates_sentinel() {
        let dir = TempDir::new().unwrap();
        let log = open_log(&dir);

        assert_eq!(log.first_index(), 0);
        assert_eq!(log.last_index(), 0);
        assert_eq!(log.last_term(), 0);
        assert_eq!(log.next_index(), 1);
        assert_eq!(log.size(), 1);
        assert!(log.get_entry(0).is_err(), "sentinel is not retrievable");
    }

    #[test]
    fn test_append_and_get() {
        let dir = TempDir::new().unwrap();
        let mut log = open_log(&dir);

        log.append_entries(vec![entry(1, 1, b"a"), entry(2, 1, b"b")])
            .unwrap();

        assert_eq!(log.last_index(), 2);
        assert_eq!(log.last_term(), 1);
        assert_eq!(log.get_entry(1).unwrap().data, b"a");
        assert_eq!(log.get_entry(2).unwrap().data, b"b");
        assert!(log.contains(1) && log.contains(2));
        assert!(!log.contains(0) && !log.contains(3));
    }

    #[test]
    fn test_get_entry_out_of_range() {
        let dir = TempDir::new().unwrap();
        let mut log = open_log(&dir);
        log.append_entry(entry(1, 1, b"a")).unwrap();

        assert!(matches!(
            log.get_entry(0),
            Err(StorageError::IndexDoesNotExist)
        ));
        assert!(matches!(
            log.get_entry(2),
            Err(StorageError::IndexDoesNotExist)
        ));
    }

    #[test]
    fn test_round_trip_across_reopen() {
        let dir = TempDir::new().unwrap();
        let mut log = open_log(&dir);
        log.append_entries(vec![entry(1, 1, b"a"), entry(2, 2, b"b"), entry(3, 2, b"c")])
            .unwrap();
        let before: Vec<LogEntry> = (1..=3).map(|i| log.get_entry(i).unwrap().clone()).collect();
        log.close().unwrap();

        let mut log = LogStore::new(dir.path());
        log.open().unwrap();
        log.replay().unwrap();

        assert_eq!(log.size(), 4, "sentinel plus three entries");
        for original in &before {
            let replayed = log.get_entry(original.index).unwrap();
            assert_eq!(replayed, original);
        }
    }

    #[test]
    fn test_truncate_removes_suffix() {
        let dir = TempDir::new().unwrap();
        let mut log = open_log(&dir);
        log.append_entries((1..=5).map(|i| entry(i, 1, b"x")).collect())
            .unwrap();

        log.truncate(3).unwrap();
        assert_eq!(log.last_index(), 2);
        assert!(log.get_entry(3).is_err());

        // The truncation must be durable.
        log.close().unwrap();
        let mut log = LogStore::new(dir.path());
        log.open().unwrap();
        log.replay().unwrap();
        assert_eq!(log.last_index(), 2);
    }

    #[test]
    fn test_truncate_rejects_sentinel_and_out_of_range() {
        let dir = TempDir::new().unwrap();
        let mut log = open_log(&dir);
        log.append_entry(entry(1, 1, b"a")).unwrap();

        assert!(log.truncate(0).is_err());
        assert!(log.truncate(2).is_err());
    }

    #[test]
    fn test_append_after_truncate_overwrites() {
        let dir = TempDir::new().unwrap();
        let mut log = open_log(&dir);
        log.append_entries(vec![entry(1, 1, b"a"), entry(2, 1, b"b")])
            .unwrap();

        log.truncate(2).unwrap();
        log.append_entry(entry(2, 3, b"c")).unwrap();

        log.close().unwrap();
        let mut log = LogStore::new(dir.path());
        log.open().unwrap();
        log.replay().unwrap();

        assert_eq!(log.last_index(), 2);
        let replaced = log.get_entry(2).unwrap();
        assert_eq!(replaced.term, 3);
        assert_eq!(replaced.data, b"c");
    }

    #[test]
    fn test_compact_sets_new_sentinel() {
        let dir = TempDir::new().unwrap();
        let mut log = open_log(&dir);
        log.append_entries((1..=5).map(|i| entry(i, i, b"x")).collect())
            .unwrap();

        log.compact(3).unwrap();

        assert_eq!(log.first_index(), 3);
        assert_eq!(log.last_index(), 5);
        assert_eq!(log.size(), 3);
        assert!(log.get_entry(3).is_err(), "compaction frontier is the sentinel");
        assert_eq!(log.get_entry(4).unwrap().term, 4);
        assert_eq!(log.get_entry(5).unwrap().term, 5);

        // The compacted log must survive a reopen.
        log.close().unwrap();
        let mut log = LogStore::new(dir.path());
        log.open().unwrap();
        log.replay().unwrap();
        assert_eq!(log.first_index(), 3);
        assert_eq!(log.last_index(), 5);
        assert_eq!(log.get_entry(5).unwrap().data, b"x");
    }

    #[test]
    fn test_compact_bounds() {
        let dir = TempDir::new().unwrap();
        let mut log = open_log(&dir);
        log.append_entry(entry(1, 1, b"a")).unwrap();

        assert!(log.compact(0).is_err());
        assert!(log.compact(2).is_err());
    }

    #[test]
    fn test_appends_continue_after_compaction() {
        let dir = TempDir::new().unwrap();
        let mut log = open_log(&dir);
        log.append_entries((1..=3).map(|i| entry(i, 1, b"x")).collect())
            .unwrap();
        log.compact(2).unwrap();

        log.append_entry(entry(4, 2, b"y")).unwrap();
        assert_eq!(log.last_index(), 4);

        log.close().unwrap();
        let mut log = LogStore::new(dir.path());
        log.open().unwrap();
        log.replay().unwrap();
        assert_eq!(log.get_entry(4).unwrap().data, b"y");
    }

    #[test]
    fn test_discard_entries_resets_to_sentinel() {
        let dir = TempDir::new().unwrap();
        let mut log = open_log(&dir);
        log.append_entries((1..=4).map(|i| entry(i, 1, b"x")).collect())
            .unwrap();

        log.discard_entries(10, 4).unwrap();

        assert_eq!(log.first_index(), 10);
        assert_eq!(log.last_index(), 10);
        assert_eq!(log.last_term(), 4);
        assert_eq!(log.next_index(), 11);
        assert_eq!(log.size(), 1);

        log.close().unwrap();
        let mut log = LogStore::new(dir.path());
        log.open().unwrap();
        log.replay().unwrap();
        assert_eq!(log.first_index(), 10);
        assert_eq!(log.last_term(), 4);
    }

    #[test]
    fn test_operations_require_open() {
        let mut log = LogStore::new("unused");
        assert!(matches!(
            log.append_entry(entry(1, 1, b"a")),
            Err(StorageError::NotOpen(_))
        ));
        assert!(matches!(log.replay(), Err(StorageError::NotOpen(_))));
        assert!(matches!(log.get_entry(1), Err(StorageError::NotOpen(_))));
    }
}
