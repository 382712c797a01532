use std::time::Duration;

use crate::error::RaftError;

const MIN_ELECTION_TIMEOUT: Duration = Duration::from_millis(100);
const MAX_ELECTION_TIMEOUT: Duration = Duration::from_millis(2000);
const DEFAULT_ELECTION_TIMEOUT: Duration = Duration::from_millis(300);

const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(25);
const MAX_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(300);
const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(50);

const MIN_ENTRIES_PER_RPC: usize = 50;
const MAX_ENTRIES_PER_RPC: usize = 500;
const DEFAULT_ENTRIES_PER_RPC: usize = 100;

const DEFAULT_LEASE_DURATION: Duration = Duration::from_millis(100);

/// Timing and batching configuration for a Raft node.
#[derive(Debug, Clone)]
pub struct RaftConfig {
    /// Minimum election timeout. A random duration between this value and
    /// twice this value is chosen before each election attempt so that
    /// multiple servers do not become candidates at the same time.
    pub election_timeout: Duration,

    /// Interval between AppendEntries rounds that the leader sends to the
    /// followers.
    pub heartbeat_interval: Duration,

    /// How long a confirmed heartbeat quorum allows the leader to serve
    /// lease-based reads without re-verifying leadership.
    pub lease_duration: Duration,

    /// Maximum number of log entries transmitted in a single AppendEntries
    /// RPC.
    pub max_entries_per_rpc: usize,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_timeout: DEFAULT_ELECTION_TIMEOUT,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            lease_duration: DEFAULT_LEASE_DURATION,
            max_entries_per_rpc: DEFAULT_ENTRIES_PER_RPC,
        }
    }
}

impl RaftConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_election_timeout(mut self, timeout: Duration) -> Self {
        self.election_timeout = timeout;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_lease_duration(mut self, duration: Duration) -> Self {
        self.lease_duration = duration;
        self
    }

    pub fn with_max_entries_per_rpc(mut self, max_entries: usize) -> Self {
        self.max_entries_per_rpc = max_entries;
        self
    }

    /// Checks that every knob is within its supported range.
    pub fn validate(&self) -> Result<(), RaftError> {
        if self.election_timeout < MIN_ELECTION_TIMEOUT
            || self.election_timeout > MAX_ELECTION_TIMEOUT
        {
            return Err(RaftError::InvalidConfig(format!(
                "election timeout must be between {:?} and {:?}",
                MIN_ELECTION_TIMEOUT, MAX_ELECTION_TIMEOUT
            )));
        }
        if self.heartbeat_interval < MIN_HEARTBEAT_INTERVAL
            || self.heartbeat_interval > MAX_HEARTBEAT_INTERVAL
        {
            return Err(RaftError::InvalidConfig(format!(
                "heartbeat interval must be between {:?} and {:?}",
                MIN_HEARTBEAT_INTERVAL, MAX_HEARTBEAT_INTERVAL
            )));
        }
        if self.lease_duration.is_zero() || self.lease_duration > self.election_timeout {
            return Err(RaftError::InvalidConfig(
                "lease duration must be positive and at most the election timeout".to_string(),
            ));
        }
        if self.max_entries_per_rpc < MIN_ENTRIES_PER_RPC
            || self.max_entries_per_rpc > MAX_ENTRIES_PER_RPC
        {
            return Err(RaftError::InvalidConfig(format!(
                "max entries per RPC must be between {} and {}",
                MIN_ENTRIES_PER_RPC, MAX_ENTRIES_PER_RPC
            )));
        }
        Ok(())
    }
}
