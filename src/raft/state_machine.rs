use crate::error::Result;
use crate::raft::operations::Operation;

/// The replicated state machine provided by the client of the engine.
///
/// Implementations must be internally synchronized: the node releases its
/// own lock around every call into the state machine, so `apply`, `snapshot`
/// and `restore` may race with the embedder's own reads.
pub trait StateMachine: Send + Sync {
    /// Applies an operation and returns its response. Must be deterministic
    /// given the sequence of applied operations.
    fn apply(&self, operation: &Operation) -> Vec<u8>;

    /// Serializes the current state. The bytes must be decodable by
    /// `restore`.
    fn snapshot(&self) -> Result<Vec<u8>>;

    /// Replaces the current state with one produced by `snapshot`.
    fn restore(&self, snapshot: &[u8]) -> Result<()>;

    /// Whether a snapshot should be taken now. The provided log size is the
    /// number of entries currently in the log.
    fn need_snapshot(&self, log_size: usize) -> bool;
}
