//! Raft RPC service implementation
//!
//! Receives the three consensus RPCs from peer nodes and forwards them into
//! the core handlers. The reply is computed (and persisted) synchronously
//! under the core's state lock before it goes back on the wire.

use pb::raft_service_server::RaftService;

use crate::raft;
use crate::raft::AppState;
use crate::server;

/// Protocol buffer definitions for the Raft service
#[allow(clippy::module_inception)]
pub mod pb {
    tonic::include_proto!("raft");
}

impl From<&pb::LogEntry> for raft::LogEntry {
    fn from(entry: &pb::LogEntry) -> Self {
        raft::LogEntry {
            index: entry.index,
            term: entry.term,
            command: entry.command.clone(),
        }
    }
}

impl From<&raft::LogEntry> for pb::LogEntry {
    fn from(entry: &raft::LogEntry) -> Self {
        pb::LogEntry {
            index: entry.index,
            term: entry.term,
            command: entry.command.clone(),
        }
    }
}

fn app_state_to_pb(state: AppState) -> i32 {
    match state {
        AppState::Disconnected => pb::AppState::Disconnected as i32,
        AppState::Normal => pb::AppState::Normal as i32,
    }
}

#[derive(Debug, Default)]
pub struct RaftServiceSVC {}

#[tonic::async_trait]
impl RaftService for RaftServiceSVC {
    async fn request_vote(
        &self,
        request: tonic::Request<pb::RequestVoteArgs>,
    ) -> Result<tonic::Response<pb::RequestVoteReply>, tonic::Status> {
        let raft = server::instance().lock().await.raft();
        let req = request.into_inner();
        let reply = raft.handle_request_vote(&raft::RequestVoteArgs {
            term: req.term,
            candidate_id: req.candidate_id,
            last_log_index: req.last_log_index,
            last_log_term: req.last_log_term,
        });
        Ok(tonic::Response::new(pb::RequestVoteReply {
            term: reply.term,
            vote_granted: reply.vote_granted,
        }))
    }

    async fn append_entries(
        &self,
        request: tonic::Request<pb::AppendEntriesArgs>,
    ) -> Result<tonic::Response<pb::AppendEntriesReply>, tonic::Status> {
        let raft = server::instance().lock().await.raft();
        let req = request.into_inner();
        let reply = raft.handle_append_entries(&raft::AppendEntriesArgs {
            term: req.term,
            leader_id: req.leader_id,
            prev_log_index: req.prev_log_index,
            prev_log_term: req.prev_log_term,
            entries: req.entries.iter().map(raft::LogEntry::from).collect(),
            leader_commit: req.leader_commit,
        });
        Ok(tonic::Response::new(pb::AppendEntriesReply {
            term: reply.term,
            success: reply.success,
            update_next_index: reply.update_next_index,
            app_state: app_state_to_pb(reply.app_state),
        }))
    }

    async fn install_snapshot(
        &self,
        request: tonic::Request<pb::InstallSnapshotArgs>,
    ) -> Result<tonic::Response<pb::InstallSnapshotReply>, tonic::Status> {
        let raft = server::instance().lock().await.raft();
        let req = request.into_inner();
        let reply = raft.handle_install_snapshot(&raft::InstallSnapshotArgs {
            term: req.term,
            leader_id: req.leader_id,
            last_included_index: req.last_included_index,
            last_included_term: req.last_included_term,
            data: req.data,
        });
        Ok(tonic::Response::new(pb::InstallSnapshotReply {
            term: reply.term,
        }))
    }
}
