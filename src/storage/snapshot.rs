//! Persistent snapshot storage.
//!
//! Snapshots are appended to a single file as length-prefixed records; the
//! most recently written record is authoritative. Replay rebuilds the
//! in-memory list by decoding sequentially until EOF. A decode error short
//! of EOF is fatal for the store.

use std::fs::{File, OpenOptions};
use std::io::BufReader;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{StorageError, StorageResult};
use crate::storage::encoding::{read_record, write_record};

const SNAPSHOT_FILE: &str = "snapshots.bin";

/// A snapshot of the replicated state machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// The index of the last log entry the snapshot covers.
    pub last_included_index: u64,

    /// The term of the last log entry the snapshot covers.
    pub last_included_term: u64,

    /// The serialized state machine state.
    pub data: Vec<u8>,
}

impl Snapshot {
    pub fn new(last_included_index: u64, last_included_term: u64, data: Vec<u8>) -> Self {
        Self {
            last_included_index,
            last_included_term,
            data,
        }
    }
}

/// Durable, append-only storage for snapshots.
pub struct SnapshotStorage {
    dir: PathBuf,
    file: Option<File>,
    snapshots: Vec<Snapshot>,
}

impl SnapshotStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            file: None,
            snapshots: Vec::new(),
        }
    }

    pub fn open(&mut self) -> StorageResult<()> {
        std::fs::create_dir_all(&self.dir)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(self.dir.join(SNAPSHOT_FILE))?;
        self.file = Some(file);
        self.snapshots = Vec::new();
        Ok(())
    }

    /// Rebuilds the in-memory snapshot list from the backing file.
    pub fn replay(&mut self) -> StorageResult<()> {
        let file = self
            .file
            .as_mut()
            .ok_or(StorageError::NotOpen("snapshot storage"))?;
        let mut reader = BufReader::new(&mut *file);
        while let Some(snapshot) = read_record::<_, Snapshot>(&mut reader)? {
            self.snapshots.push(snapshot);
        }
        Ok(())
    }

    pub fn close(&mut self) -> StorageResult<()> {
        if let Some(file) = self.file.take() {
            file.sync_all()?;
        }
        self.snapshots.clear();
        Ok(())
    }

    /// Appends and fsyncs a snapshot record.
    pub fn save_snapshot(&mut self, snapshot: &Snapshot) -> StorageResult<()> {
        let file = self
            .file
            .as_mut()
            .ok_or(StorageError::NotOpen("snapshot storage"))?;
        write_record(file, snapshot)?;
        file.sync_all()?;
        self.snapshots.push(snapshot.clone());
        Ok(())
    }

    /// The most recently saved snapshot, if any.
    pub fn last_snapshot(&self) -> StorageResult<Option<&Snapshot>> {
        if self.file.is_none() {
            return Err(StorageError::NotOpen("snapshot storage"));
        }
        Ok(self.snapshots.last())
    }

    /// All persisted snapshots in insertion order.
    pub fn list_snapshots(&self) -> StorageResult<&[Snapshot]> {
        if self.file.is_none() {
            return Err(StorageError::NotOpen("snapshot storage"));
        }
        Ok(&self.snapshots)
    }
}
