//! The Raft consensus node.
//!
//! A node owns the three persistent stores, the peer table, and the pending
//! operation bookkeeping, all guarded by a single mutex. Five long-lived
//! loops cooperate through three notification signals: the election loop
//! watches for a silent leader, the heartbeat loop drives replication, the
//! commit loop advances the commit index over quorum-matched entries, the
//! apply loop feeds committed entries to the state machine, and the
//! read-only loop serves reads once their read index has been applied.
//! Short-lived tasks are spawned per outbound RPC and reacquire the lock
//! when the response arrives, re-checking role and term before acting.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::{Mutex, MutexGuard, Notify};
use tokio::task::JoinHandle;

use crate::config::RaftConfig;
use crate::error::{RaftError, Result};
use crate::raft::operations::{
    Operation, OperationManager, OperationResponse, OperationType, ReadOnlyOperation,
    ResponseFuture,
};
use crate::raft::rpc::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    RequestVoteRequest, RequestVoteResponse,
};
use crate::raft::state_machine::StateMachine;
use crate::raft::transport::Transport;
use crate::storage::log::{LogEntry, LogEntryType, LogStore};
use crate::storage::snapshot::{Snapshot, SnapshotStorage};
use crate::storage::state::StateStorage;

/// The role of a node within the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Replicates and commits log entries. At most one leader exists per
    /// term, though transiently more than one node may believe it leads.
    Leader,
    /// Accepts entries replicated by the leader and votes in elections.
    Follower,
    /// Offline. The initial state, and the terminal state after `stop`.
    Shutdown,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Leader => write!(f, "leader"),
            Role::Follower => write!(f, "follower"),
            Role::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// A point-in-time view of a node's progress.
#[derive(Debug, Clone)]
pub struct Status {
    pub id: String,
    pub term: u64,
    pub commit_index: u64,
    pub last_applied: u64,
    pub role: Role,
}

/// Leader-side replication progress for one peer.
#[derive(Debug, Clone, Default)]
struct Peer {
    /// The index of the next entry to send.
    next_index: u64,
    /// The highest index known to be replicated on the peer.
    match_index: u64,
}

/// All mutable node state, guarded by the node mutex. The stores are not
/// concurrency safe and are only touched while this is held.
struct NodeInner {
    role: Role,
    current_term: u64,
    voted_for: Option<String>,
    leader_id: Option<String>,
    commit_index: u64,
    last_applied: u64,
    last_included_index: u64,
    last_included_term: u64,
    last_contact: Instant,
    peers: HashMap<String, Peer>,
    log: LogStore,
    state_storage: StateStorage,
    snapshot_storage: SnapshotStorage,
    operation_manager: OperationManager,
}

/// A single member of a Raft cluster.
pub struct RaftNode {
    id: String,
    config: RaftConfig,
    transport: Arc<dyn Transport>,
    fsm: Arc<dyn StateMachine>,
    inner: Mutex<NodeInner>,
    apply_notify: Notify,
    commit_notify: Notify,
    read_only_notify: Notify,
    loop_handles: Mutex<Vec<JoinHandle<()>>>,
    /// Self-handle for spawning RPC and loop tasks.
    weak_self: Weak<RaftNode>,
}

impl RaftNode {
    /// Creates a node in the shutdown state. `members` must contain the IDs
    /// of every node in the cluster; this node's own ID is added if absent.
    /// State is persisted under `data_dir`.
    pub fn new(
        id: impl Into<String>,
        members: Vec<String>,
        data_dir: impl AsRef<Path>,
        fsm: Arc<dyn StateMachine>,
        transport: Arc<dyn Transport>,
        config: RaftConfig,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let id = id.into();
        let data_dir = data_dir.as_ref();

        let mut peers: HashMap<String, Peer> = members
            .into_iter()
            .map(|member| (member, Peer::default()))
            .collect();
        peers.entry(id.clone()).or_default();

        let inner = NodeInner {
            role: Role::Shutdown,
            current_term: 0,
            voted_for: None,
            leader_id: None,
            commit_index: 0,
            last_applied: 0,
            last_included_index: 0,
            last_included_term: 0,
            last_contact: Instant::now(),
            peers,
            log: LogStore::new(data_dir),
            state_storage: StateStorage::new(data_dir.join("state")),
            snapshot_storage: SnapshotStorage::new(data_dir),
            operation_manager: OperationManager::new(config.lease_duration),
        };

        Ok(Arc::new_cyclic(|weak_self| Self {
            id,
            config,
            transport,
            fsm,
            inner: Mutex::new(inner),
            apply_notify: Notify::new(),
            commit_notify: Notify::new(),
            read_only_notify: Notify::new(),
            loop_handles: Mutex::new(Vec::new()),
            weak_self: weak_self.clone(),
        }))
    }

    /// Restores persisted state and launches the protocol loops. Does
    /// nothing if the node is already started.
    pub async fn start(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.role != Role::Shutdown {
            return Ok(());
        }

        inner.state_storage.open()?;
        inner.state_storage.replay()?;
        let state = inner.state_storage.state()?;
        inner.current_term = state.term;
        inner.voted_for = if state.voted_for.is_empty() {
            None
        } else {
            Some(state.voted_for)
        };

        inner.log.open()?;
        inner.log.replay()?;

        inner.snapshot_storage.open()?;
        inner.snapshot_storage.replay()?;

        // Restore the state machine from the most recent snapshot if there
        // is one.
        if let Some(snapshot) = inner.snapshot_storage.last_snapshot()?.cloned() {
            inner.last_included_index = snapshot.last_included_index;
            inner.last_included_term = snapshot.last_included_term;
            inner.commit_index = snapshot.last_included_index;
            inner.last_applied = snapshot.last_included_index;
            self.fsm.restore(&snapshot.data)?;
        }

        inner.last_contact = Instant::now();
        inner.role = Role::Follower;
        drop(inner);

        let Some(node) = self.weak_self.upgrade() else {
            return Ok(());
        };
        let mut handles = self.loop_handles.lock().await;
        handles.push(tokio::spawn(Arc::clone(&node).election_loop()));
        handles.push(tokio::spawn(Arc::clone(&node).heartbeat_loop()));
        handles.push(tokio::spawn(Arc::clone(&node).commit_loop()));
        handles.push(tokio::spawn(Arc::clone(&node).apply_loop()));
        handles.push(tokio::spawn(Arc::clone(&node).read_only_loop()));

        tracing::info!(
            id = %self.id,
            election_timeout = ?self.config.election_timeout,
            heartbeat_interval = ?self.config.heartbeat_interval,
            lease_duration = ?self.config.lease_duration,
            "node started"
        );
        Ok(())
    }

    /// Transitions to shutdown, wakes every loop, waits for them to finish,
    /// and closes the stores. Does nothing if the node is already stopped.
    pub async fn stop(&self) {
        {
            let mut inner = self.inner.lock().await;
            if inner.role == Role::Shutdown {
                return;
            }
            inner.role = Role::Shutdown;
        }

        // Every waiter must be woken or a loop would never observe the
        // shutdown.
        self.apply_notify.notify_waiters();
        self.commit_notify.notify_waiters();
        self.read_only_notify.notify_waiters();

        let handles: Vec<JoinHandle<()>> = self.loop_handles.lock().await.drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }

        let mut inner = self.inner.lock().await;
        if let Err(error) = inner.log.close() {
            tracing::error!(%error, "failed to close log");
        }
        if let Err(error) = inner.state_storage.close() {
            tracing::error!(%error, "failed to close state storage");
        }
        if let Err(error) = inner.snapshot_storage.close() {
            tracing::error!(%error, "failed to close snapshot storage");
        }

        tracing::info!(id = %self.id, "node stopped");
    }

    /// Accepts an operation from a client and returns a future for its
    /// response. Submission does not guarantee replication; once the
    /// operation has been applied, the future resolves with the state
    /// machine's response.
    pub async fn submit_operation(
        &self,
        operation: Vec<u8>,
        operation_type: OperationType,
        timeout: Duration,
    ) -> ResponseFuture {
        match operation_type {
            OperationType::Replicated => self.submit_replicated_operation(operation, timeout).await,
            OperationType::LeaseBasedReadOnly | OperationType::LinearizableReadOnly => {
                self.submit_read_only_operation(operation, operation_type, timeout)
                    .await
            }
        }
    }

    /// Returns the node's current status.
    pub async fn status(&self) -> Status {
        let inner = self.inner.lock().await;
        Status {
            id: self.id.clone(),
            term: inner.current_term,
            commit_index: inner.commit_index,
            last_applied: inner.last_applied,
            role: inner.role,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Handles a vote request from a candidate.
    pub async fn request_vote(&self, request: RequestVoteRequest) -> Result<RequestVoteResponse> {
        let mut inner = self.inner.lock().await;
        if inner.role == Role::Shutdown {
            return Err(RaftError::Shutdown);
        }

        tracing::debug!(
            candidate = %request.candidate_id,
            term = request.term,
            last_log_index = request.last_log_index,
            last_log_term = request.last_log_term,
            "request vote received"
        );

        let mut response = RequestVoteResponse {
            term: inner.current_term,
            vote_granted: false,
        };

        // Reject the request if the term is out of date.
        if request.term < inner.current_term {
            tracing::debug!(
                local_term = inner.current_term,
                remote_term = request.term,
                "vote rejected: out of date term"
            );
            return Ok(response);
        }

        if request.term > inner.current_term {
            self.become_follower(&mut inner, Some(request.candidate_id.clone()), request.term);
            response.term = inner.current_term;
        }

        // Reject the request if this node already voted for someone else.
        if let Some(voted_for) = &inner.voted_for {
            if voted_for != &request.candidate_id {
                tracing::debug!(voted_for = %voted_for, "vote rejected: already voted");
                return Ok(response);
            }
        }

        // Reject the request if the candidate's log is less up to date: a
        // greater last term wins, and at equal terms the longer log wins.
        if request.last_log_term < inner.log.last_term()
            || (request.last_log_term == inner.log.last_term()
                && inner.log.last_index() > request.last_log_index)
        {
            tracing::debug!(
                local_last_index = inner.log.last_index(),
                local_last_term = inner.log.last_term(),
                remote_last_index = request.last_log_index,
                remote_last_term = request.last_log_term,
                "vote rejected: out of date log"
            );
            return Ok(response);
        }

        inner.last_contact = Instant::now();
        inner.voted_for = Some(request.candidate_id.clone());
        self.persist_term_and_vote(&mut inner);
        response.vote_granted = true;

        tracing::info!(
            voted_for = %request.candidate_id,
            term = inner.current_term,
            "vote granted"
        );
        Ok(response)
    }

    /// Handles a log replication request from the leader.
    pub async fn append_entries(
        &self,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        let mut inner = self.inner.lock().await;
        if inner.role == Role::Shutdown {
            return Err(RaftError::Shutdown);
        }

        tracing::debug!(
            leader = %request.leader_id,
            term = request.term,
            prev_log_index = request.prev_log_index,
            prev_log_term = request.prev_log_term,
            leader_commit = request.leader_commit,
            entries = request.entries.len(),
            "append entries received"
        );

        let mut response = AppendEntriesResponse {
            term: inner.current_term,
            success: false,
            index: 0,
        };

        // Reject the request if the term is out of date.
        if request.term < inner.current_term {
            tracing::debug!(
                local_term = inner.current_term,
                remote_term = request.term,
                "append entries rejected: out of date term"
            );
            return Ok(response);
        }

        // The leader made contact; this holds even when the request is
        // rejected for a non-matching previous entry.
        inner.last_contact = Instant::now();
        inner.leader_id = Some(request.leader_id.clone());

        if request.term > inner.current_term {
            self.become_follower(&mut inner, Some(request.leader_id.clone()), request.term);
            response.term = inner.current_term;
        }

        // The requested prefix lies in the compacted region.
        if inner.last_included_index > request.prev_log_index {
            response.index = inner.last_included_index + 1;
            tracing::debug!(
                prev_log_index = request.prev_log_index,
                last_included_index = inner.last_included_index,
                "append entries rejected: previous entry compacted"
            );
            return Ok(response);
        }

        // The log is too short to contain the previous entry.
        if inner.log.next_index() <= request.prev_log_index {
            response.index = inner.log.next_index();
            tracing::debug!(
                prev_log_index = request.prev_log_index,
                last_log_index = inner.log.last_index(),
                "append entries rejected: log too short"
            );
            return Ok(response);
        }

        // The previous entry is the compaction frontier but its term does
        // not match.
        if inner.last_included_index == request.prev_log_index
            && inner.last_included_term != request.prev_log_term
        {
            response.index = inner.last_included_index;
            tracing::debug!(
                prev_log_index = request.prev_log_index,
                local_term = inner.last_included_term,
                remote_term = request.prev_log_term,
                "append entries rejected: conflicting term at compaction frontier"
            );
            return Ok(response);
        }

        if inner.last_included_index < request.prev_log_index {
            let prev_term = match inner.log.get_entry(request.prev_log_index) {
                Ok(entry) => entry.term,
                Err(error) => fatal("failed to get entry from log", error),
            };
            if prev_term != request.prev_log_term {
                // Walk back over the conflicting term so the leader can skip
                // it in one round trip.
                let mut index = request.prev_log_index - 1;
                while index > inner.last_included_index {
                    let term = match inner.log.get_entry(index) {
                        Ok(entry) => entry.term,
                        Err(error) => fatal("failed to get entry from log", error),
                    };
                    if term != prev_term {
                        break;
                    }
                    index -= 1;
                }
                response.index = index + 1;
                tracing::debug!(
                    prev_log_index = request.prev_log_index,
                    local_term = prev_term,
                    remote_term = request.prev_log_term,
                    hint = response.index,
                    "append entries rejected: conflicting previous entry"
                );
                return Ok(response);
            }
        }

        response.success = true;

        // Skip entries that are already present; on the first conflict,
        // truncate the log and append the remainder.
        let mut to_append: Vec<LogEntry> = Vec::new();
        for (position, entry) in request.entries.iter().enumerate() {
            if inner.log.last_index() < entry.index {
                to_append = request.entries[position..].to_vec();
                break;
            }

            let conflicts = match inner.log.get_entry(entry.index) {
                Ok(existing) => existing.is_conflict(entry),
                Err(error) => fatal("failed to get entry from log", error),
            };
            if !conflicts {
                continue;
            }

            tracing::warn!(index = entry.index, "truncating log");
            if let Err(error) = inner.log.truncate(entry.index) {
                fatal("failed to truncate log", error);
            }
            to_append = request.entries[position..].to_vec();
            break;
        }

        if let Err(error) = inner.log.append_entries(to_append) {
            fatal("failed to append entries to log", error);
        }

        if request.leader_commit > inner.commit_index {
            let commit_index = request.leader_commit.min(inner.log.last_index());
            tracing::debug!(
                current = inner.commit_index,
                new = commit_index,
                "updating commit index"
            );
            inner.commit_index = commit_index;
            self.apply_notify.notify_waiters();
        }

        Ok(response)
    }

    /// Handles a snapshot installation request from the leader.
    pub async fn install_snapshot(
        &self,
        request: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        let mut inner = self.inner.lock().await;
        if inner.role == Role::Shutdown {
            return Err(RaftError::Shutdown);
        }

        tracing::debug!(
            leader = %request.leader_id,
            term = request.term,
            last_included_index = request.last_included_index,
            last_included_term = request.last_included_term,
            "install snapshot received"
        );

        let mut response = InstallSnapshotResponse {
            term: inner.current_term,
        };

        if request.term < inner.current_term {
            tracing::debug!(
                local_term = inner.current_term,
                remote_term = request.term,
                "install snapshot rejected: out of date term"
            );
            return Ok(response);
        }

        if request.term > inner.current_term {
            self.become_follower(&mut inner, Some(request.leader_id.clone()), request.term);
            response.term = inner.current_term;
        }

        inner.last_contact = Instant::now();

        // The snapshot contains nothing new.
        if inner.last_included_index >= request.last_included_index
            || inner.commit_index >= request.last_included_index
        {
            return Ok(response);
        }

        let snapshot = Snapshot::new(
            request.last_included_index,
            request.last_included_term,
            request.data,
        );
        if let Err(error) = inner.snapshot_storage.save_snapshot(&snapshot) {
            fatal("failed to save snapshot", error);
        }

        inner.last_included_index = snapshot.last_included_index;
        inner.last_included_term = snapshot.last_included_term;
        inner.commit_index = snapshot.last_included_index;
        inner.last_applied = snapshot.last_included_index;

        // Restore without the lock; last_applied already covers the
        // snapshot, so the apply loop cannot double-apply meanwhile.
        drop(inner);
        tracing::warn!(
            last_included_index = snapshot.last_included_index,
            last_included_term = snapshot.last_included_term,
            "restoring state machine from snapshot"
        );
        if let Err(error) = self.fsm.restore(&snapshot.data) {
            fatal("failed to restore state machine from snapshot", error);
        }
        let mut inner = self.inner.lock().await;
        if inner.role == Role::Shutdown {
            return Err(RaftError::Shutdown);
        }

        // Keep the log when it already agrees with the snapshot boundary,
        // otherwise discard it entirely.
        let boundary_matches = inner.log.contains(snapshot.last_included_index)
            && match inner.log.get_entry(snapshot.last_included_index) {
                Ok(entry) => entry.term == snapshot.last_included_term,
                Err(error) => fatal("failed to get entry from log", error),
            };
        if boundary_matches {
            tracing::warn!(index = snapshot.last_included_index, "compacting log");
            if let Err(error) = inner.log.compact(snapshot.last_included_index) {
                fatal("failed to compact log", error);
            }
        } else {
            tracing::warn!(
                index = snapshot.last_included_index,
                term = snapshot.last_included_term,
                "discarding log"
            );
            if let Err(error) = inner
                .log
                .discard_entries(snapshot.last_included_index, snapshot.last_included_term)
            {
                fatal("failed to discard log entries", error);
            }
        }

        tracing::info!(
            last_included_index = snapshot.last_included_index,
            last_included_term = snapshot.last_included_term,
            "snapshot installed"
        );
        Ok(response)
    }

    async fn submit_replicated_operation(
        &self,
        operation: Vec<u8>,
        timeout: Duration,
    ) -> ResponseFuture {
        let mut inner = self.inner.lock().await;
        let (future, sink) = ResponseFuture::new(timeout);

        if inner.role != Role::Leader {
            let _ = sink.send(Err(RaftError::NotLeader {
                server_id: self.id.clone(),
                known_leader: inner.leader_id.clone(),
            }));
            return future;
        }

        let entry = LogEntry::new(
            inner.log.next_index(),
            inner.current_term,
            operation,
            LogEntryType::Operation,
        );
        let index = entry.index;
        let term = entry.term;
        if let Err(error) = inner.log.append_entry(entry) {
            fatal("failed to append entry to log", error);
        }

        inner.operation_manager.pending_replicated.insert(index, sink);
        self.replicate_to_peers(&inner);

        tracing::debug!(
            log_index = index,
            log_term = term,
            "replicated operation submitted"
        );
        future
    }

    async fn submit_read_only_operation(
        &self,
        operation: Vec<u8>,
        operation_type: OperationType,
        timeout: Duration,
    ) -> ResponseFuture {
        let mut inner = self.inner.lock().await;
        let (future, sink) = ResponseFuture::new(timeout);

        if inner.role != Role::Leader {
            let _ = sink.send(Err(RaftError::NotLeader {
                server_id: self.id.clone(),
                known_leader: inner.leader_id.clone(),
            }));
            return future;
        }

        let read_index = inner.commit_index;
        inner.operation_manager.pending_read_only.push(ReadOnlyOperation {
            bytes: operation,
            operation_type,
            read_index,
            quorum_verified: false,
            sink,
        });

        if operation_type == OperationType::LeaseBasedReadOnly && read_index <= inner.last_applied {
            self.read_only_notify.notify_waiters();
        }
        if operation_type == OperationType::LinearizableReadOnly
            && inner.operation_manager.should_verify_quorum
        {
            inner.operation_manager.should_verify_quorum = false;
            self.replicate_to_peers(&inner);
        }

        tracing::debug!(read_index, %operation_type, "read-only operation submitted");
        future
    }

    /// Kicks one replication round: a task per peer, sharing a response
    /// counter for lease verification.
    fn replicate_to_peers(&self, inner: &NodeInner) {
        let Some(node) = self.weak_self.upgrade() else {
            return;
        };
        let responses = Arc::new(AtomicUsize::new(1));
        for peer_id in inner.peers.keys() {
            let node = Arc::clone(&node);
            let peer_id = peer_id.clone();
            let responses = Arc::clone(&responses);
            tokio::spawn(async move { node.replicate_to_peer(peer_id, responses).await });
        }
    }

    async fn replicate_to_peer(self: Arc<Self>, peer_id: String, responses: Arc<AtomicUsize>) {
        let mut inner = self.inner.lock().await;
        if inner.role != Role::Leader {
            return;
        }

        if peer_id == self.id {
            // Replication to self is a no-op, but in a single-node cluster
            // it is what drives commit and read-only progress.
            if inner.peers.len() == 1 {
                if inner.log.last_index() > inner.commit_index {
                    self.commit_notify.notify_waiters();
                }
                self.try_apply_read_only_operations(&mut inner);
            }
            return;
        }

        let next_index = match inner.peers.get(&peer_id) {
            Some(peer) => peer.next_index,
            None => return,
        };

        // The follower is behind the compaction frontier; it needs a
        // snapshot instead.
        if next_index <= inner.last_included_index {
            drop(inner);
            self.install_snapshot_on_peer(&peer_id).await;
            return;
        }

        let prev_log_index = next_index.saturating_sub(1).max(inner.last_included_index);
        let mut prev_log_term = inner.last_included_term;
        if prev_log_index > inner.last_included_index && prev_log_index < inner.log.next_index() {
            prev_log_term = match inner.log.get_entry(prev_log_index) {
                Ok(entry) => entry.term,
                Err(error) => fatal("failed to get entry from log", error),
            };
        }

        let mut entries = Vec::new();
        for index in next_index..inner.log.next_index() {
            // The log may have been compacted since next_index was read.
            if index <= inner.last_included_index {
                break;
            }
            if entries.len() >= self.config.max_entries_per_rpc {
                break;
            }
            match inner.log.get_entry(index) {
                Ok(entry) => entries.push(entry.clone()),
                Err(error) => fatal("failed to get entry from log", error),
            }
        }

        let num_entries = entries.len() as u64;
        let request = AppendEntriesRequest {
            leader_id: self.id.clone(),
            term: inner.current_term,
            prev_log_index,
            prev_log_term,
            entries,
            leader_commit: inner.commit_index,
        };
        drop(inner);

        let response = match self.transport.append_entries(&peer_id, request).await {
            Ok(response) => response,
            Err(error) => {
                tracing::trace!(peer = %peer_id, %error, "append entries failed");
                return;
            }
        };

        let mut inner = self.inner.lock().await;
        if inner.role != Role::Leader {
            return;
        }

        if response.term > inner.current_term {
            self.become_follower(&mut inner, Some(peer_id), response.term);
            return;
        }

        // Any response proves contact with the peer; the first time the
        // round reaches quorum, the lease is renewed and waiting reads are
        // confirmed.
        let count = responses.fetch_add(1, Ordering::SeqCst) + 1;
        if count == inner.peers.len() / 2 + 1 {
            self.try_apply_read_only_operations(&mut inner);
        }

        if !response.success {
            let last_included_index = inner.last_included_index;
            let needs_snapshot = match inner.peers.get_mut(&peer_id) {
                Some(peer) => {
                    peer.next_index = response.index;
                    peer.next_index <= last_included_index
                }
                None => return,
            };
            if needs_snapshot {
                drop(inner);
                self.install_snapshot_on_peer(&peer_id).await;
            }
            return;
        }

        let match_index = prev_log_index + num_entries;
        let commit_index = inner.commit_index;
        if let Some(peer) = inner.peers.get_mut(&peer_id) {
            if match_index > peer.match_index {
                peer.next_index = peer.next_index.max(match_index + 1);
                peer.match_index = match_index;
                if match_index > commit_index {
                    self.commit_notify.notify_waiters();
                }
            }
        }
    }

    /// Sends the most recent snapshot to a peer that has fallen behind the
    /// compaction frontier.
    async fn install_snapshot_on_peer(&self, peer_id: &str) {
        let inner = self.inner.lock().await;
        if inner.role != Role::Leader || inner.last_included_index == 0 {
            return;
        }

        let snapshot = match inner.snapshot_storage.last_snapshot() {
            Ok(Some(snapshot)) => snapshot.clone(),
            Ok(None) => return,
            Err(error) => fatal("failed to get snapshot from storage", error),
        };
        let last_included_index = snapshot.last_included_index;

        let request = InstallSnapshotRequest {
            leader_id: self.id.clone(),
            term: inner.current_term,
            last_included_index: snapshot.last_included_index,
            last_included_term: snapshot.last_included_term,
            data: snapshot.data,
        };
        drop(inner);

        let response = match self.transport.install_snapshot(peer_id, request).await {
            Ok(response) => response,
            Err(error) => {
                tracing::trace!(peer = %peer_id, %error, "install snapshot failed");
                return;
            }
        };

        let mut inner = self.inner.lock().await;
        if inner.role != Role::Leader {
            return;
        }
        if response.term > inner.current_term {
            self.become_follower(&mut inner, Some(peer_id.to_string()), response.term);
            return;
        }

        if let Some(peer) = inner.peers.get_mut(peer_id) {
            if last_included_index > peer.match_index {
                peer.match_index = last_included_index;
                peer.next_index = last_included_index + 1;
            }
        }
        tracing::info!(peer = %peer_id, last_included_index, "snapshot sent to peer");
    }

    async fn request_vote_from_peer(self: Arc<Self>, peer_id: String, votes: Arc<AtomicUsize>) {
        let mut inner = self.inner.lock().await;

        // The candidate votes for itself. This also covers the single-node
        // cluster, where the self vote alone is a quorum.
        if peer_id == self.id {
            let count = votes.fetch_add(1, Ordering::SeqCst) + 1;
            if self.has_quorum(count, &inner) && inner.role == Role::Follower {
                self.become_leader(&mut inner);
            }
            return;
        }

        let request = RequestVoteRequest {
            candidate_id: self.id.clone(),
            term: inner.current_term,
            last_log_index: inner.log.last_index(),
            last_log_term: inner.log.last_term(),
        };
        let request_term = request.term;
        drop(inner);

        let response = match self.transport.request_vote(&peer_id, request).await {
            Ok(response) => response,
            Err(error) => {
                tracing::trace!(peer = %peer_id, %error, "request vote failed");
                return;
            }
        };

        let mut inner = self.inner.lock().await;
        if inner.role == Role::Shutdown {
            return;
        }

        // Drop stale responses; this node may have started another
        // election meanwhile.
        if inner.current_term != request_term {
            return;
        }

        if response.term > inner.current_term {
            self.become_follower(&mut inner, Some(peer_id), response.term);
            return;
        }

        if response.vote_granted {
            let count = votes.fetch_add(1, Ordering::SeqCst) + 1;
            if self.has_quorum(count, &inner) && inner.role == Role::Follower {
                self.become_leader(&mut inner);
            }
        }
    }

    /// Sleeps a random duration in [election timeout, 2x election timeout)
    /// and starts an election when the leader has been silent for too long.
    async fn election_loop(self: Arc<Self>) {
        loop {
            tokio::time::sleep(self.random_election_timeout()).await;

            let mut inner = self.inner.lock().await;
            match inner.role {
                Role::Shutdown => return,
                Role::Leader => continue,
                Role::Follower => {}
            }
            if inner.last_contact.elapsed() < self.config.election_timeout {
                continue;
            }

            self.become_candidate(&mut inner);

            let votes = Arc::new(AtomicUsize::new(0));
            for peer_id in inner.peers.keys() {
                let node = Arc::clone(&self);
                let peer_id = peer_id.clone();
                let votes = Arc::clone(&votes);
                tokio::spawn(async move { node.request_vote_from_peer(peer_id, votes).await });
            }
        }
    }

    /// Triggers a replication round every heartbeat interval while leader.
    async fn heartbeat_loop(self: Arc<Self>) {
        loop {
            tokio::time::sleep(self.config.heartbeat_interval).await;

            let inner = self.inner.lock().await;
            match inner.role {
                Role::Shutdown => return,
                Role::Follower => continue,
                Role::Leader => self.replicate_to_peers(&inner),
            }
        }
    }

    /// Advances the commit index over entries of the current term that a
    /// quorum has matched.
    async fn commit_loop(self: Arc<Self>) {
        loop {
            let notified = self.commit_notify.notified();
            tokio::pin!(notified);
            // Arm the waiter before checking state so a notification between
            // the check and the await is never lost.
            notified.as_mut().enable();

            {
                let mut inner = self.inner.lock().await;
                if inner.role == Role::Shutdown {
                    return;
                }
                // Followers may not commit log entries.
                if inner.role == Role::Leader {
                    self.advance_commit_index(&mut inner);
                }
            }

            notified.await;
        }
    }

    fn advance_commit_index(&self, inner: &mut NodeInner) {
        let mut committed = false;

        for index in (inner.commit_index + 1)..=inner.log.last_index() {
            // It is not safe to commit an entry from an earlier term by
            // counting replicas: such an entry can still be overwritten by
            // a future leader. The NoOp appended on election carries these
            // entries forward under the current term.
            match inner.log.get_entry(index) {
                Ok(entry) if entry.term != inner.current_term => continue,
                Ok(_) => {}
                Err(error) => fatal("failed to get entry from log", error),
            }

            let mut matches = 1;
            for (peer_id, peer) in &inner.peers {
                if peer_id == &self.id {
                    continue;
                }
                if peer.match_index >= index {
                    matches += 1;
                }
            }

            if self.has_quorum(matches, inner) {
                tracing::debug!(
                    current = inner.commit_index,
                    new = index,
                    "leader updating commit index"
                );
                inner.commit_index = index;
                committed = true;
            }
        }

        if committed {
            self.apply_notify.notify_waiters();
            self.replicate_to_peers(inner);
        }
    }

    /// Feeds committed entries to the state machine in index order and
    /// resolves pending replicated operations.
    async fn apply_loop(self: Arc<Self>) {
        loop {
            let notified = self.apply_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let mut inner = self.inner.lock().await;
            if inner.role == Role::Shutdown {
                return;
            }

            while inner.last_applied < inner.commit_index {
                let entry = match inner.log.get_entry(inner.last_applied + 1) {
                    Ok(entry) => entry.clone(),
                    Err(error) => fatal("failed to get entry from log", error),
                };

                // NoOp entries are observed only as progress.
                if entry.entry_type == LogEntryType::NoOp {
                    inner.last_applied += 1;
                    continue;
                }

                // The sink is absent when the operation was not submitted
                // locally.
                let sink = inner.operation_manager.pending_replicated.remove(&entry.index);

                let operation = Operation {
                    bytes: entry.data,
                    operation_type: OperationType::Replicated,
                    log_index: entry.index,
                    log_term: entry.term,
                    read_index: 0,
                };
                let last_applied = inner.last_applied;

                drop(inner);
                let response = self.fsm.apply(&operation);
                tracing::debug!(
                    log_index = operation.log_index,
                    log_term = operation.log_term,
                    "applied operation to state machine"
                );
                if let Some(sink) = sink {
                    let _ = sink.send(Ok(OperationResponse {
                        operation,
                        response,
                    }));
                }
                inner = self.inner.lock().await;

                // A snapshot installation may have advanced progress while
                // the lock was released; re-evaluate rather than increment.
                if inner.last_applied != last_applied {
                    continue;
                }
                inner.last_applied += 1;

                if self.fsm.need_snapshot(inner.log.size()) {
                    inner = self.take_snapshot(inner).await;
                }
            }

            if inner.role == Role::Leader {
                self.read_only_notify.notify_waiters();
            }
            drop(inner);

            notified.await;
        }
    }

    /// Serves read-only operations whose read index has been applied.
    async fn read_only_loop(self: Arc<Self>) {
        loop {
            let notified = self.read_only_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.inner.lock().await;
                if inner.role == Role::Shutdown {
                    return;
                }

                // Reads are only safe once the leader has committed an entry
                // of its own term.
                if inner.role == Role::Leader && inner.log.last_term() == inner.current_term {
                    let last_applied = inner.last_applied;
                    let appliable = inner
                        .operation_manager
                        .appliable_read_only_operations(last_applied);

                    for read in appliable {
                        if read.operation_type == OperationType::LeaseBasedReadOnly
                            && !inner.operation_manager.leader_lease.is_valid()
                        {
                            let _ = read.sink.send(Err(RaftError::InvalidLease {
                                server_id: self.id.clone(),
                            }));
                            continue;
                        }

                        let operation = Operation {
                            bytes: read.bytes,
                            operation_type: read.operation_type,
                            log_index: 0,
                            log_term: 0,
                            read_index: read.read_index,
                        };

                        drop(inner);
                        let response = self.fsm.apply(&operation);
                        tracing::debug!(
                            read_index = operation.read_index,
                            operation_type = %operation.operation_type,
                            "applied read-only operation to state machine"
                        );
                        let _ = read.sink.send(Ok(OperationResponse {
                            operation,
                            response,
                        }));
                        inner = self.inner.lock().await;

                        if inner.role != Role::Leader {
                            break;
                        }
                    }
                }
            }

            notified.await;
        }
    }

    /// Persists a snapshot at the last applied entry and compacts the log
    /// through it. Called by the apply loop with the lock held; the lock is
    /// released around the state machine call.
    async fn take_snapshot<'a>(
        &'a self,
        inner: MutexGuard<'a, NodeInner>,
    ) -> MutexGuard<'a, NodeInner> {
        if inner.last_applied <= inner.last_included_index {
            return inner;
        }

        let (boundary_index, boundary_term) = match inner.log.get_entry(inner.last_applied) {
            Ok(entry) => (entry.index, entry.term),
            Err(error) => fatal("failed to get entry from log", error),
        };
        tracing::info!(
            last_included_index = boundary_index,
            last_included_term = boundary_term,
            "taking snapshot"
        );

        drop(inner);
        let data = match self.fsm.snapshot() {
            Ok(data) => data,
            Err(error) => fatal("failed to take snapshot of state machine", error),
        };
        let mut inner = self.inner.lock().await;

        // A snapshot may have been installed and the log compacted while
        // the lock was released.
        if boundary_index <= inner.last_included_index {
            return inner;
        }

        let snapshot = Snapshot::new(boundary_index, boundary_term, data);
        if let Err(error) = inner.snapshot_storage.save_snapshot(&snapshot) {
            fatal("failed to save snapshot", error);
        }
        inner.last_included_index = boundary_index;
        inner.last_included_term = boundary_term;

        tracing::warn!(index = boundary_index, "compacting log");
        if let Err(error) = inner.log.compact(boundary_index) {
            fatal("failed to compact log", error);
        }

        tracing::info!(
            last_included_index = boundary_index,
            last_included_term = boundary_term,
            "snapshot taken"
        );
        inner
    }

    fn become_candidate(&self, inner: &mut NodeInner) {
        inner.current_term += 1;
        inner.voted_for = Some(self.id.clone());
        self.persist_term_and_vote(inner);
        tracing::info!(term = inner.current_term, "entered the candidate state");
    }

    fn become_leader(&self, inner: &mut NodeInner) {
        inner.role = Role::Leader;
        let next_index = inner.log.last_index() + 1;
        for peer in inner.peers.values_mut() {
            peer.next_index = next_index;
            peer.match_index = 0;
        }

        inner.operation_manager = OperationManager::new(self.config.lease_duration);

        // The NoOp brings entries from earlier terms under the current term
        // so the commit rule can advance across them immediately.
        let entry = LogEntry::new(
            inner.log.next_index(),
            inner.current_term,
            Vec::new(),
            LogEntryType::NoOp,
        );
        if let Err(error) = inner.log.append_entry(entry) {
            fatal("failed to append entry to log", error);
        }

        self.replicate_to_peers(inner);
        tracing::info!(term = inner.current_term, "entered the leader state");
    }

    fn become_follower(&self, inner: &mut NodeInner, leader_id: Option<String>, term: u64) {
        inner.role = Role::Follower;
        inner.current_term = term;
        inner.leader_id = leader_id;
        inner.voted_for = None;
        self.persist_term_and_vote(inner);
        tracing::info!(term = inner.current_term, "entered the follower state");

        // Cancel everything pending; clients are redirected to the leader
        // this node now recognizes.
        let known_leader = inner.leader_id.clone();
        inner
            .operation_manager
            .notify_lost_leadership(&self.id, known_leader);
        inner.operation_manager = OperationManager::new(self.config.lease_duration);
    }

    /// Marks waiting reads as quorum-verified, renews the lease, and wakes
    /// the read-only loop. Called when a heartbeat round reaches quorum.
    fn try_apply_read_only_operations(&self, inner: &mut NodeInner) {
        inner.operation_manager.mark_as_verified();
        inner.operation_manager.leader_lease.renew();
        inner.operation_manager.should_verify_quorum = true;
        self.read_only_notify.notify_waiters();
    }

    fn persist_term_and_vote(&self, inner: &mut NodeInner) {
        let term = inner.current_term;
        let voted_for = inner.voted_for.clone().unwrap_or_default();
        if let Err(error) = inner.state_storage.set_state(term, &voted_for) {
            fatal("failed to persist term and vote", error);
        }
    }

    fn has_quorum(&self, count: usize, inner: &NodeInner) -> bool {
        count > inner.peers.len() / 2
    }

    fn random_election_timeout(&self) -> Duration {
        let base = self.config.election_timeout.as_millis() as u64;
        let timeout_ms = rand::thread_rng().gen_range(base..base * 2);
        Duration::from_millis(timeout_ms)
    }
}

/// A storage or state machine failure in a correctness-critical path means
/// safety can no longer be upheld; continuing would risk divergence. A
/// panic would only kill the current task and leave the other loops running
/// against inconsistent state, so the whole process is terminated.
fn fatal<E: fmt::Display>(context: &str, error: E) -> ! {
    tracing::error!(%error, context, "unrecoverable failure, terminating");
    std::process::exit(1);
}
