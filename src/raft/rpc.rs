//! RPC message types exchanged between nodes.
//!
//! The engine does not ship a wire transport; an embedding transport carries
//! these messages and delivers them to the node's handlers one at a time.
//! The node assumes nothing about delivery order and relies solely on terms
//! and log matching.

use serde::{Deserialize, Serialize};

use crate::storage::log::LogEntry;

/// A request for a vote during an election.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    /// The candidate requesting the vote.
    pub candidate_id: String,
    /// The candidate's term.
    pub term: u64,
    /// The index of the candidate's last log entry.
    pub last_log_index: u64,
    /// The term of the candidate's last log entry.
    pub last_log_term: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    /// The receiver's term, for the candidate to update itself.
    pub term: u64,
    /// Whether the vote was granted.
    pub vote_granted: bool,
}

/// A request to replicate log entries; with no entries it doubles as a
/// heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    /// The leader sending the request.
    pub leader_id: String,
    /// The leader's term.
    pub term: u64,
    /// The index of the entry immediately preceding the new ones.
    pub prev_log_index: u64,
    /// The term of the entry at `prev_log_index`.
    pub prev_log_term: u64,
    /// The entries to replicate, empty for a heartbeat.
    pub entries: Vec<LogEntry>,
    /// The leader's commit index.
    pub leader_commit: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    /// The receiver's term, for the leader to update itself.
    pub term: u64,
    /// Whether the entries were accepted.
    pub success: bool,
    /// On rejection, the earliest index the follower can safely accept
    /// from. Lets the leader skip over an entire conflicting term instead of
    /// probing one entry at a time.
    pub index: u64,
}

/// A request to install a snapshot on a follower that has fallen behind the
/// leader's compaction frontier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    /// The leader sending the request.
    pub leader_id: String,
    /// The leader's term.
    pub term: u64,
    /// The index of the last entry the snapshot covers.
    pub last_included_index: u64,
    /// The term of the last entry the snapshot covers.
    pub last_included_term: u64,
    /// The serialized state machine state.
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotResponse {
    /// The receiver's term, for the leader to update itself.
    pub term: u64,
}
