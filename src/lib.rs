//! An embeddable Raft consensus engine.
//!
//! The engine drives a replicated state machine: it elects a leader,
//! replicates a durable log to the cluster, applies committed entries in
//! order, compacts the log through snapshots, and serves linearizable and
//! lease-based read-only operations. The embedder supplies the wire
//! transport and the state machine; everything else, including the three
//! persistent stores, lives here.

pub mod config;
pub mod error;
pub mod raft;
pub mod storage;

pub use config::RaftConfig;
pub use error::{RaftError, Result, StorageError};
pub use raft::node::{RaftNode, Role, Status};
pub use raft::operations::{
    Operation, OperationResponse, OperationResult, OperationType, ResponseFuture,
};
pub use raft::rpc::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    RequestVoteRequest, RequestVoteResponse,
};
pub use raft::state_machine::StateMachine;
pub use raft::transport::{Transport, TransportError};
pub use storage::log::{LogEntry, LogEntryType};
pub use storage::snapshot::Snapshot;
