use thiserror::Error;

/// Errors surfaced to clients of the consensus engine.
#[derive(Error, Debug)]
pub enum RaftError {
    /// The operation was submitted to a server that is not the leader. Only
    /// the leader may accept operations. The known leader is a hint and may
    /// be stale.
    #[error("server {server_id} is not the leader: known leader = {}", .known_leader.as_deref().unwrap_or("none"))]
    NotLeader {
        server_id: String,
        known_leader: Option<String>,
    },

    /// A lease-based read-only operation reached the state machine after the
    /// leader's lease expired.
    #[error("server {server_id} does not have a valid lease")]
    InvalidLease { server_id: String },

    /// The submitted operation type cannot be serviced by this engine.
    /// Embedders bridging a wire protocol should map unknown type tags here.
    #[error("operation type is not a supported operation type")]
    InvalidOperationType,

    /// The node is shut down and cannot service requests.
    #[error("server is shutdown")]
    Shutdown,

    /// The client-side timeout on a response future elapsed before a
    /// response was delivered. The operation itself is never retracted.
    #[error("timed out waiting for an operation response")]
    Timeout,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("state machine error: {0}")]
    StateMachine(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Errors produced by the persistent stores.
#[derive(Error, Debug)]
pub enum StorageError {
    /// The store was used before `open` or after `close`.
    #[error("{0} is not open")]
    NotOpen(&'static str),

    /// The requested log index is outside the retrievable range.
    #[error("index does not exist")]
    IndexDoesNotExist,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("encoding error: {0}")]
    Encoding(#[from] bincode::Error),
}

pub type Result<T> = std::result::Result<T, RaftError>;

pub(crate) type StorageResult<T> = std::result::Result<T, StorageError>;
