//! Pending-operation bookkeeping for the leader.
//!
//! The operation manager owns the response sinks of every operation that has
//! been accepted but not yet answered: replicated operations keyed by their
//! log index, and read-only operations waiting for their read index to be
//! applied and (for linearizable reads) for a heartbeat quorum to confirm
//! leadership. Losing leadership drains every sink with `NotLeader`; that is
//! the only cancellation signal the engine emits.

use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

use tokio::sync::oneshot;

use crate::error::RaftError;

/// How a submitted operation is serviced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationType {
    /// Replicated through the log and applied on every node.
    Replicated,
    /// Read-only, served while the leader holds a valid lease. Cheap but
    /// may observe stale state if clocks misbehave.
    LeaseBasedReadOnly,
    /// Read-only, served only after a heartbeat quorum confirms this node
    /// is still the leader.
    LinearizableReadOnly,
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationType::Replicated => write!(f, "replicated"),
            OperationType::LeaseBasedReadOnly => write!(f, "lease-based read-only"),
            OperationType::LinearizableReadOnly => write!(f, "linearizable read-only"),
        }
    }
}

/// An operation as seen by the state machine and echoed back in responses.
#[derive(Debug, Clone)]
pub struct Operation {
    /// The opaque operation payload.
    pub bytes: Vec<u8>,

    /// How the operation was submitted.
    pub operation_type: OperationType,

    /// The log index of a replicated operation, zero otherwise.
    pub log_index: u64,

    /// The log term of a replicated operation, zero otherwise.
    pub log_term: u64,

    /// The commit index a read-only operation reads at, zero otherwise.
    pub read_index: u64,
}

/// A successfully applied operation together with the state machine's
/// response.
#[derive(Debug)]
pub struct OperationResponse {
    pub operation: Operation,
    pub response: Vec<u8>,
}

pub type OperationResult = std::result::Result<OperationResponse, RaftError>;

/// The receive end of a submitted operation.
///
/// Resolves exactly once: with the applied response, or with a terminal
/// error (`NotLeader`, `InvalidLease`, `InvalidOperationType`, `Shutdown`).
/// The timeout given at submission is observed here on the client side only;
/// the engine never retracts a submitted operation.
pub struct ResponseFuture {
    rx: oneshot::Receiver<OperationResult>,
    timeout: Duration,
}

impl ResponseFuture {
    pub(crate) fn new(timeout: Duration) -> (Self, oneshot::Sender<OperationResult>) {
        let (tx, rx) = oneshot::channel();
        (Self { rx, timeout }, tx)
    }

    /// Waits for the response, up to the submission timeout.
    pub async fn recv(self) -> OperationResult {
        match tokio::time::timeout(self.timeout, self.rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RaftError::Shutdown),
            Err(_) => Err(RaftError::Timeout),
        }
    }
}

/// A read-only operation waiting to be served.
pub(crate) struct ReadOnlyOperation {
    pub bytes: Vec<u8>,
    pub operation_type: OperationType,
    /// The commit index at submission time; the operation may be served
    /// once at least this much has been applied.
    pub read_index: u64,
    /// Set when a heartbeat quorum completed while the operation was
    /// pending.
    pub quorum_verified: bool,
    pub sink: oneshot::Sender<OperationResult>,
}

/// The window after a confirmed heartbeat quorum during which the leader may
/// serve lease-based reads without re-verifying leadership.
pub(crate) struct LeaderLease {
    valid_until: Instant,
    duration: Duration,
}

impl LeaderLease {
    /// A fresh lease starts expired; only a verified quorum renews it.
    pub(crate) fn new(duration: Duration) -> Self {
        Self {
            valid_until: Instant::now(),
            duration,
        }
    }

    pub(crate) fn renew(&mut self) {
        self.valid_until = Instant::now() + self.duration;
    }

    pub(crate) fn is_valid(&self) -> bool {
        Instant::now() < self.valid_until
    }
}

/// Tracks pending replicated and read-only operations for the current
/// leadership term. Replaced wholesale on every leadership change.
pub(crate) struct OperationManager {
    /// Log index to response sink for submitted replicated operations.
    pub pending_replicated: HashMap<u64, oneshot::Sender<OperationResult>>,

    /// In-flight read-only operations.
    pub pending_read_only: Vec<ReadOnlyOperation>,

    pub leader_lease: LeaderLease,

    /// Whether the next linearizable read-only submission should trigger a
    /// heartbeat round to confirm leadership.
    pub should_verify_quorum: bool,
}

impl OperationManager {
    pub(crate) fn new(lease_duration: Duration) -> Self {
        Self {
            pending_replicated: HashMap::new(),
            pending_read_only: Vec::new(),
            leader_lease: LeaderLease::new(lease_duration),
            should_verify_quorum: true,
        }
    }

    /// Removes and returns every pending read-only operation that can be
    /// served now: its read index has been applied, and it is either
    /// lease-based or was confirmed by a completed heartbeat quorum.
    pub(crate) fn appliable_read_only_operations(
        &mut self,
        last_applied: u64,
    ) -> Vec<ReadOnlyOperation> {
        let mut appliable = Vec::new();
        let mut retained = Vec::with_capacity(self.pending_read_only.len());
        for operation in self.pending_read_only.drain(..) {
            let verified = operation.quorum_verified
                || operation.operation_type == OperationType::LeaseBasedReadOnly;
            if operation.read_index <= last_applied && verified {
                appliable.push(operation);
            } else {
                retained.push(operation);
            }
        }
        self.pending_read_only = retained;
        appliable
    }

    /// Flags every currently pending read-only operation as confirmed by a
    /// heartbeat quorum.
    pub(crate) fn mark_as_verified(&mut self) {
        for operation in &mut self.pending_read_only {
            operation.quorum_verified = true;
        }
    }

    /// Resolves every pending sink with `NotLeader` and clears all state.
    pub(crate) fn notify_lost_leadership(&mut self, server_id: &str, known_leader: Option<String>) {
        for (_, sink) in self.pending_replicated.drain() {
            let _ = sink.send(Err(RaftError::NotLeader {
                server_id: server_id.to_string(),
                known_leader: known_leader.clone(),
            }));
        }
        for operation in self.pending_read_only.drain(..) {
            let _ = operation.sink.send(Err(RaftError::NotLeader {
                server_id: server_id.to_string(),
                known_leader: known_leader.clone(),
            }));
        }
    }
}
