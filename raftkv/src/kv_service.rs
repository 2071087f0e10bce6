//! Key-value service implementation
//!
//! This module implements the client-facing gRPC service. Writes are
//! replicated through the consensus log before they are acknowledged;
//! reads are served from the locally applied store.

use std::time::Duration;

use pb::kv_service_server::KvService;
use pb::{DeleteRequest, DeleteResponse, GetRequest, GetResponse, PutRequest, PutResponse};

use crate::metrics;
use crate::server;
use crate::state_kv::KvCmd;

/// Protocol buffer definitions for the key-value service
#[allow(clippy::module_inception)]
pub mod pb {
    tonic::include_proto!("kv");
}

/// How long a write may wait for its log slot to commit before the client
/// gets an error. The entry may still commit later; retrying a Put or
/// Delete is idempotent.
const COMMIT_TIMEOUT: Duration = Duration::from_secs(3);

/// Replicates `cmd` through the consensus log and waits for it to apply.
/// Returns the assigned log slot.
async fn replicate(cmd: &KvCmd) -> Result<(u64, u64), tonic::Status> {
    let data = bincode::serialize(cmd).map_err(|_| tonic::Status::internal("serialize error"))?;
    let proposed = {
        let server = server::instance().lock().await;
        server.propose(data)
    };
    let (index, term, rx) = match proposed {
        Some(proposed) => proposed,
        None => {
            metrics::record_raft_event("write_rejected_not_leader");
            return Err(tonic::Status::failed_precondition("not leader"));
        }
    };
    match tokio::time::timeout(COMMIT_TIMEOUT, rx).await {
        Ok(Ok(true)) => Ok((index, term)),
        // The slot went to another leader's entry.
        Ok(Ok(false)) | Ok(Err(_)) => Err(tonic::Status::aborted("lost leadership")),
        Err(_) => Err(tonic::Status::deadline_exceeded("commit timeout")),
    }
}

/// Key-value service implementation
#[derive(Debug, Default)]
pub struct KvServiceSVC {}

#[tonic::async_trait]
impl KvService for KvServiceSVC {
    /// Stores a value under a key
    ///
    /// This method:
    /// 1. Encodes the write as a replicated command
    /// 2. Proposes the command through Raft
    /// 3. Waits for consensus
    ///
    /// # Arguments
    ///
    /// * `request` - Put request
    ///
    /// # Returns
    ///
    /// Returns the assigned log slot or an error
    async fn put(
        &self,
        request: tonic::Request<PutRequest>,
    ) -> Result<tonic::Response<PutResponse>, tonic::Status> {
        metrics::record_metrics("put", || async {
            let req = request.into_inner();
            log::debug!("put {}", req.key);
            let cmd = KvCmd::Put {
                key: req.key,
                value: req.value,
            };
            let (log_index, term) = replicate(&cmd).await?;
            Ok(tonic::Response::new(PutResponse {
                ret: 0,
                message: "ok".to_string(),
                log_index,
                term,
            }))
        })
        .await
    }

    /// Removes a key
    ///
    /// # Arguments
    ///
    /// * `request` - Delete request
    ///
    /// # Returns
    ///
    /// Returns a response indicating success or failure
    async fn delete(
        &self,
        request: tonic::Request<DeleteRequest>,
    ) -> Result<tonic::Response<DeleteResponse>, tonic::Status> {
        metrics::record_metrics("delete", || async {
            let req = request.into_inner();
            log::debug!("delete {}", req.key);
            let cmd = KvCmd::Delete { key: req.key };
            replicate(&cmd).await?;
            Ok(tonic::Response::new(DeleteResponse {
                ret: 0,
                message: "ok".to_string(),
            }))
        })
        .await
    }

    /// Reads a key from the locally applied store
    ///
    /// # Arguments
    ///
    /// * `request` - Get request
    ///
    /// # Returns
    ///
    /// Returns the value if present
    async fn get(
        &self,
        request: tonic::Request<GetRequest>,
    ) -> Result<tonic::Response<GetResponse>, tonic::Status> {
        metrics::record_metrics("get", || async {
            let req = request.into_inner();
            let value = {
                let server = server::instance().lock().await;
                server.get(&req.key)
            };
            let response = match value {
                Some(value) => GetResponse {
                    ret: 0,
                    message: "ok".to_string(),
                    found: true,
                    value,
                },
                None => GetResponse {
                    ret: 0,
                    message: "ok".to_string(),
                    found: false,
                    value: Vec::new(),
                },
            };
            Ok(tonic::Response::new(response))
        })
        .await
    }
}
