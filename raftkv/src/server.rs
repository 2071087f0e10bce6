use crate::kv_service::pb::kv_service_server::KvServiceServer;
use crate::kv_service::KvServiceSVC;
use crate::metrics;
use crate::raft_service::pb::raft_service_server::RaftServiceServer;
use crate::raft_service::RaftServiceSVC;
use crate::{config, state_kv};

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response};
use prometheus::{Encoder, TextEncoder};
use std::collections::HashMap;
use std::sync::Arc;

use crate::raft::node::RaftCore;
use crate::raft::storage::Persister;
use crate::raft::{ApplyMsg, StateMachine};
use crate::raft_client::GrpcTransport;
use crate::state_kv::KvStore;
use once_cell::sync::OnceCell;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::oneshot;
use tokio::sync::Mutex;

static INSTANCE: OnceCell<Mutex<Server>> = OnceCell::new();
pub fn instance() -> &'static Mutex<Server> {
    INSTANCE.get_or_init(|| Mutex::new(Server::builder()))
}

/// A client write waiting for its log slot to be applied. Resolved with
/// `true` only if the committed command at that index is the one proposed;
/// a different command means another leader claimed the slot.
struct PendingWrite {
    command: Vec<u8>,
    tx: oneshot::Sender<bool>,
}

pub struct Server {
    raft: Arc<RaftCore>,
    store: Arc<std::sync::Mutex<KvStore>>,
    pending: Arc<std::sync::Mutex<HashMap<u64, PendingWrite>>>,
}

impl Server {
    fn builder() -> Self {
        let id = config::instance().lock().unwrap().id;
        let base_path = config::instance().lock().unwrap().base_path.clone();
        let peers: Vec<u64> = config::instance()
            .lock()
            .unwrap()
            .node_list
            .iter()
            .map(|n| n.id)
            .filter(|&peer| peer != id)
            .collect();

        let persister =
            Arc::new(Persister::new(&base_path, id).expect("cannot open raft storage"));
        let transport = Arc::new(GrpcTransport::new());
        let (apply_tx, apply_rx) = tokio::sync::mpsc::unbounded_channel();
        let raft = RaftCore::new(id, peers, transport, persister, apply_tx)
            .expect("cannot restore raft state");
        raft.run();

        let store = Arc::new(std::sync::Mutex::new(state_kv::KvStore::new()));
        let pending: Arc<std::sync::Mutex<HashMap<u64, PendingWrite>>> =
            Arc::new(std::sync::Mutex::new(HashMap::new()));
        Self::start_apply_loop(
            apply_rx,
            Arc::clone(&raft),
            Arc::clone(&store),
            Arc::clone(&pending),
        );

        Server {
            raft,
            store,
            pending,
        }
    }

    pub async fn start(&mut self) {
        self.start_grpc_server().await;
        self.start_metrics_server().await;
    }

    pub fn stop(&mut self) {
        log::info!("server stop");
    }

    pub fn raft(&self) -> Arc<RaftCore> {
        Arc::clone(&self.raft)
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.store.lock().unwrap().get(key)
    }

    /// Proposes a replicated write. Returns the assigned slot and a
    /// receiver resolving once that slot commits and applies, or `None`
    /// when this node does not lead.
    pub fn propose(&self, command: Vec<u8>) -> Option<(u64, u64, oneshot::Receiver<bool>)> {
        let (index, term) = self.raft.start(command.clone())?;
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap()
            .insert(index, PendingWrite { command, tx });
        Some((index, term, rx))
    }

    async fn start_grpc_server(&mut self) {
        let addr = config::instance()
            .lock()
            .unwrap()
            .addr
            .as_str()
            .parse()
            .unwrap();
        let mut server = tonic::transport::Server::builder();
        let raft_service = RaftServiceSVC::default();
        let kv_service = KvServiceSVC::default();
        let grpc_server = server
            .add_service(RaftServiceServer::new(raft_service))
            .add_service(KvServiceServer::new(kv_service))
            .serve(addr);
        tokio::spawn(async move {
            tokio::pin!(grpc_server);
            grpc_server.await.unwrap();
        });
        log::info!("grpc server started on {}", addr);
    }

    async fn start_metrics_server(&mut self) {
        let addr = config::instance()
            .lock()
            .unwrap()
            .metrics_addr
            .as_str()
            .parse()
            .unwrap();
        let make_svc = make_service_fn(move |_| {
            let registry = metrics::REGISTRY_INSTANCE.clone();
            async move {
                Ok::<_, hyper::Error>(service_fn(move |_: Request<Body>| {
                    let registry = registry.clone();
                    async move {
                        let encoder = TextEncoder::new();
                        let metric_families = registry.gather();
                        let mut buffer = Vec::new();
                        encoder.encode(&metric_families, &mut buffer).unwrap();
                        Ok::<_, hyper::Error>(Response::new(Body::from(buffer)))
                    }
                }))
            }
        });
        metrics::init_registry();
        let server = hyper::Server::bind(&addr).serve(make_svc);
        tokio::spawn(async move {
            tokio::pin!(server);
            server.await.unwrap()
        });
        log::info!("metrics server started on {}", addr);
    }

    /// Drains the consensus apply channel into the key-value store,
    /// resolves pending client writes, and compacts the log whenever the
    /// persisted raft state outgrows the configured threshold.
    fn start_apply_loop(
        mut apply_rx: UnboundedReceiver<ApplyMsg>,
        raft: Arc<RaftCore>,
        store: Arc<std::sync::Mutex<KvStore>>,
        pending: Arc<std::sync::Mutex<HashMap<u64, PendingWrite>>>,
    ) {
        let snapshot_threshold = config::instance().lock().unwrap().snapshot_threshold;
        tokio::spawn(async move {
            while let Some(msg) = apply_rx.recv().await {
                match msg {
                    ApplyMsg::Command { index, command } => {
                        let snapshot = {
                            let mut store = store.lock().unwrap();
                            store.apply(index, &command);
                            if snapshot_threshold > 0
                                && raft.raft_state_size() >= snapshot_threshold
                            {
                                Some(store.snapshot())
                            } else {
                                None
                            }
                        };
                        if let Some(waiter) = pending.lock().unwrap().remove(&index) {
                            let _ = waiter.tx.send(waiter.command == command);
                        }
                        if let Some(data) = snapshot {
                            raft.snapshot(index, data);
                            metrics::record_raft_event("snapshot_taken");
                        }
                    }
                    ApplyMsg::Snapshot { index, term, data } => {
                        if raft.cond_install_snapshot(term, index) {
                            store.lock().unwrap().on_snapshot(index, term, &data);
                            metrics::record_raft_event("snapshot_installed");
                        }
                        // Slots at or below the boundary can never apply
                        // under the proposed command now.
                        let mut pending = pending.lock().unwrap();
                        let stale: Vec<u64> = pending
                            .keys()
                            .copied()
                            .filter(|&slot| slot <= index)
                            .collect();
                        for slot in stale {
                            if let Some(waiter) = pending.remove(&slot) {
                                let _ = waiter.tx.send(false);
                            }
                        }
                    }
                }
            }
        });
    }
}
