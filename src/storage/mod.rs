mod encoding;
pub mod log;
pub mod snapshot;
pub mod state;

pub use log::{LogEntry, LogEntryType, LogStore};
pub use snapshot::{Snapshot, SnapshotStorage};
pub use state::{PersistentState, StateStorage};
