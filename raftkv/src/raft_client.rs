//! Raft client implementation
//!
//! Maintains one gRPC client per peer node and exposes them behind the
//! core's transport trait. A failed call drops the cached client so the
//! next round reconnects from scratch; the core treats the error as
//! "no reply this round" and retries on its own schedule.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tonic::transport::Channel;

use crate::config;
use crate::raft::{
    AppState, AppendEntriesArgs, AppendEntriesReply, InstallSnapshotArgs, InstallSnapshotReply,
    RaftError, RaftResult, RaftTransport, RequestVoteArgs, RequestVoteReply,
};
use crate::raft_service::pb;
use pb::raft_service_client::RaftServiceClient;

/// gRPC-backed transport for the consensus core.
pub struct GrpcTransport {
    /// Map of peer IDs to their cached clients
    peers: Mutex<HashMap<u64, RaftServiceClient<Channel>>>,
}

impl GrpcTransport {
    pub fn new() -> Self {
        GrpcTransport {
            peers: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the cached client for `peer`, connecting on first use.
    async fn client(&self, peer: u64) -> RaftResult<RaftServiceClient<Channel>> {
        let mut peers = self.peers.lock().await;
        if let Some(client) = peers.get(&peer) {
            return Ok(client.clone());
        }
        let addr = config::instance()
            .lock()
            .unwrap()
            .peer_addr(peer)
            .ok_or_else(|| RaftError::Transport(format!("no address for peer {}", peer)))?;
        let client = RaftServiceClient::connect(addr)
            .await
            .map_err(|e| RaftError::Transport(e.to_string()))?;
        peers.insert(peer, client.clone());
        Ok(client)
    }

    async fn invalidate(&self, peer: u64) {
        self.peers.lock().await.remove(&peer);
    }
}

impl Default for GrpcTransport {
    fn default() -> Self {
        Self::new()
    }
}

fn app_state_from_pb(value: i32) -> AppState {
    match pb::AppState::from_i32(value) {
        Some(pb::AppState::Normal) => AppState::Normal,
        _ => AppState::Disconnected,
    }
}

#[async_trait]
impl RaftTransport for GrpcTransport {
    async fn request_vote(&self, peer: u64, args: RequestVoteArgs) -> RaftResult<RequestVoteReply> {
        let mut client = self.client(peer).await?;
        let request = tonic::Request::new(pb::RequestVoteArgs {
            term: args.term,
            candidate_id: args.candidate_id,
            last_log_index: args.last_log_index,
            last_log_term: args.last_log_term,
        });
        match client.request_vote(request).await {
            Ok(response) => {
                let reply = response.into_inner();
                Ok(RequestVoteReply {
                    term: reply.term,
                    vote_granted: reply.vote_granted,
                })
            }
            Err(e) => {
                self.invalidate(peer).await;
                Err(RaftError::Transport(e.to_string()))
            }
        }
    }

    async fn append_entries(
        &self,
        peer: u64,
        args: AppendEntriesArgs,
    ) -> RaftResult<AppendEntriesReply> {
        let mut client = self.client(peer).await?;
        let request = tonic::Request::new(pb::AppendEntriesArgs {
            term: args.term,
            leader_id: args.leader_id,
            prev_log_index: args.prev_log_index,
            prev_log_term: args.prev_log_term,
            entries: args.entries.iter().map(pb::LogEntry::from).collect(),
            leader_commit: args.leader_commit,
        });
        match client.append_entries(request).await {
            Ok(response) => {
                let reply = response.into_inner();
                Ok(AppendEntriesReply {
                    term: reply.term,
                    success: reply.success,
                    update_next_index: reply.update_next_index,
                    app_state: app_state_from_pb(reply.app_state),
                })
            }
            Err(e) => {
                self.invalidate(peer).await;
                Err(RaftError::Transport(e.to_string()))
            }
        }
    }

    async fn install_snapshot(
        &self,
        peer: u64,
        args: InstallSnapshotArgs,
    ) -> RaftResult<InstallSnapshotReply> {
        let mut client = self.client(peer).await?;
        let request = tonic::Request::new(pb::InstallSnapshotArgs {
            term: args.term,
            leader_id: args.leader_id,
            last_included_index: args.last_included_index,
            last_included_term: args.last_included_term,
            data: args.data,
        });
        match client.install_snapshot(request).await {
            Ok(response) => Ok(InstallSnapshotReply {
                term: response.into_inner().term,
            }),
            Err(e) => {
                self.invalidate(peer).await;
                Err(RaftError::Transport(e.to_string()))
            }
        }
    }
}
