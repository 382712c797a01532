//! Persistent term and vote storage.
//!
//! The pair (current term, voted for) must survive restarts for election
//! safety. Updates replace the backing file atomically: the new state is
//! written to a temporary file, fsynced, and renamed over the live file.
//! Truncating in place would leave a window where a crash loses both the old
//! and the new state.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, Seek, SeekFrom};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{StorageError, StorageResult};
use crate::storage::encoding::{read_record, write_record};

const STATE_FILE: &str = "state.bin";

/// The state that must be persisted for election safety.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistentState {
    /// The current term.
    pub term: u64,

    /// The candidate that received this node's vote in the current term,
    /// empty if none.
    pub voted_for: String,
}

/// Durable storage for the (term, voted for) pair.
pub struct StateStorage {
    dir: PathBuf,
    file: Option<File>,
    state: PersistentState,
}

impl StateStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            file: None,
            state: PersistentState::default(),
        }
    }

    pub fn open(&mut self) -> StorageResult<()> {
        std::fs::create_dir_all(&self.dir)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(self.dir.join(STATE_FILE))?;
        self.file = Some(file);
        Ok(())
    }

    /// Loads the most recently persisted state. An empty file yields the
    /// zero value.
    pub fn replay(&mut self) -> StorageResult<()> {
        let file = self.file.as_mut().ok_or(StorageError::NotOpen("state storage"))?;
        let mut reader = BufReader::new(&mut *file);
        if let Some(state) = read_record::<_, PersistentState>(&mut reader)? {
            self.state = state;
        }
        Ok(())
    }

    pub fn close(&mut self) -> StorageResult<()> {
        if let Some(file) = self.file.take() {
            file.sync_all()?;
        }
        self.state = PersistentState::default();
        Ok(())
    }

    /// Atomically persists a new (term, voted for) pair.
    pub fn set_state(&mut self, term: u64, voted_for: &str) -> StorageResult<()> {
        if self.file.is_none() {
            return Err(StorageError::NotOpen("state storage"));
        }

        self.state = PersistentState {
            term,
            voted_for: voted_for.to_string(),
        };

        let mut tmp = tempfile::Builder::new()
            .prefix("tmp-")
            .tempfile_in(&self.dir)?;
        write_record(tmp.as_file_mut(), &self.state)?;
        tmp.as_file().sync_all()?;

        let path = self.dir.join(STATE_FILE);
        self.file = None;
        let persisted = tmp.persist(&path).map_err(|err| StorageError::Io(err.error))?;
        drop(persisted);

        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
        file.seek(SeekFrom::End(0))?;
        self.file = Some(file);
        Ok(())
    }

    /// Returns the most recently persisted state.
    pub fn state(&self) -> StorageResult<PersistentState> {
        if self.file.is_none() {
            return Err(StorageError::NotOpen("state storage"));
        }
        Ok(self.state.clone())
    }
}
