use async_trait::async_trait;
use thiserror::Error;

use crate::raft::rpc::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    RequestVoteRequest, RequestVoteResponse,
};

/// Errors produced by a transport when an RPC cannot be delivered.
///
/// Transport failures are recoverable: the caller logs them and the next
/// replication or election round retries naturally.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("peer {0} is unreachable")]
    Unreachable(String),

    #[error("transport failure: {0}")]
    Other(String),
}

/// The wire transport between nodes, provided by the embedder.
///
/// Implementations must deliver each RPC to the remote node's handler and
/// return its response. The engine spawns a task per outbound call, so
/// implementations may block for as long as their own timeouts allow.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn append_entries(
        &self,
        peer_id: &str,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse, TransportError>;

    async fn request_vote(
        &self,
        peer_id: &str,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse, TransportError>;

    async fn install_snapshot(
        &self,
        peer_id: &str,
        request: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse, TransportError>;
}
