use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub mod log;
pub mod node;
pub mod storage;

pub use self::log::LogEntry;

// Constants
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(25); // Interval between leader heartbeats
pub const APPLY_INTERVAL: Duration = Duration::from_millis(10); // Interval for draining committed entries
pub const ELECTION_TIMEOUT_MIN_MS: u64 = 300; // Lower bound of the randomized election timeout
pub const ELECTION_TIMEOUT_MAX_MS: u64 = 500; // Upper bound of the randomized election timeout
pub const CONSENSUS_TIMEOUT: Duration = Duration::from_millis(500); // Bound on every outbound RPC

/// Errors surfaced by the consensus core and its collaborators.
#[derive(Debug, Error)]
pub enum RaftError {
    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("state encoding error: {0}")]
    Encoding(String),

    #[error("transport error: {0}")]
    Transport(String),
}

pub type RaftResult<T> = Result<T, RaftError>;

/// Role of a node in the current term.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

/// Whether the responder considers the network path healthy. Carried in
/// AppendEntries replies so callers can tell a live rejection from a peer
/// that never saw the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppState {
    Disconnected,
    Normal,
}

/// Message delivered to the application layer for every committed entry,
/// or once per installed snapshot.
#[derive(Debug, Clone)]
pub enum ApplyMsg {
    Command { index: u64, command: Vec<u8> },
    Snapshot { index: u64, term: u64, data: Vec<u8> },
}

pub trait StateMachine {
    fn apply(&mut self, index: u64, data: &[u8]);
    fn snapshot(&self) -> Vec<u8>;
    fn on_snapshot(&mut self, last_index: u64, last_term: u64, data: &[u8]);
}

#[derive(Debug, Clone)]
pub struct RequestVoteArgs {
    pub term: u64,
    pub candidate_id: u64,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

#[derive(Debug, Clone)]
pub struct RequestVoteReply {
    pub term: u64,
    pub vote_granted: bool,
}

#[derive(Debug, Clone)]
pub struct AppendEntriesArgs {
    pub term: u64,
    pub leader_id: u64,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry>,
    pub leader_commit: u64,
}

#[derive(Debug, Clone)]
pub struct AppendEntriesReply {
    pub term: u64,
    pub success: bool,
    pub update_next_index: u64,
    pub app_state: AppState,
}

#[derive(Debug, Clone)]
pub struct InstallSnapshotArgs {
    pub term: u64,
    pub leader_id: u64,
    pub last_included_index: u64,
    pub last_included_term: u64,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct InstallSnapshotReply {
    pub term: u64,
}

/// Per-peer RPC surface the core issues its outbound calls through.
///
/// Implementations own connection management and wire encoding; the core
/// bounds every call with [`CONSENSUS_TIMEOUT`] and treats any error as
/// "no reply this round".
#[async_trait]
pub trait RaftTransport: Send + Sync {
    async fn request_vote(&self, peer: u64, args: RequestVoteArgs) -> RaftResult<RequestVoteReply>;

    async fn append_entries(
        &self,
        peer: u64,
        args: AppendEntriesArgs,
    ) -> RaftResult<AppendEntriesReply>;

    async fn install_snapshot(
        &self,
        peer: u64,
        args: InstallSnapshotArgs,
    ) -> RaftResult<InstallSnapshotReply>;
}
