//! Node supervisor: boots every component in order, decides between
//! bootstrapping a fresh cluster and joining a live one, and exposes the
//! public surface the HTTP front-end consumes.

use std::fs;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response};
use log::{error, info, warn};
use prometheus::{Encoder, TextEncoder};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::Duration;

use crate::cluster;
use crate::cluster::client;
use crate::cluster::pb::cluster_service_server::ClusterServiceServer;
use crate::cluster::pb::consensus_service_server::ConsensusServiceServer;
use crate::cluster::service::{ClusterSvc, ConsensusSvc};
use crate::config::{raft_ord, RuntimeConfig};
use crate::consensus::node::{self, ClusterStatus, ConsensusHandle, ConsensusParts};
use crate::consensus::observer::ObserverChannels;
use crate::consensus::storage::{LogStore, SnapshotStore};
use crate::consensus::{BootstrapOutcome, StateMachine};
use crate::discover::{self, Advertiser};
use crate::error::NodeError;
use crate::fsm::{DatabaseFsm, Payload};
use crate::metrics;
use crate::store::KvStore;

const JOIN_ATTEMPTS: usize = 5;
const JOIN_BACKOFF: Duration = Duration::from_secs(2);

pub struct Server {
    cfg: RuntimeConfig,
    fsm: DatabaseFsm,
    handle: ConsensusHandle,
    tasks: Vec<JoinHandle<()>>,
    _advertiser: Option<Advertiser>,
}

impl Server {
    /// Boot order: directories, local store, state machine, log store,
    /// snapshot store, consensus actor, observers, transport, discovery,
    /// RPC servers, metrics, then bootstrap-or-join.
    pub async fn start(cfg: RuntimeConfig) -> Result<Server, NodeError> {
        metrics::init_registry();
        let node_dir = cfg.node_dir();
        fs::create_dir_all(&node_dir)
            .map_err(|e| NodeError::fatal("couldn't create data dir", e))?;

        let kv = Arc::new(KvStore::open(&node_dir.join("localdb"))?);
        let mut fsm = DatabaseFsm::new(kv);

        let snapshots = SnapshotStore::open(
            node_dir.join("snapshots"),
            cfg.consensus.retained_snapshots,
        )?;
        let latest = snapshots.load_latest()?;
        let mut store = LogStore::open(&node_dir.join("consensus.db"), latest.clone())?;

        // A snapshot ahead of the local store means the log that produced
        // the store is gone; reset to the snapshot image.
        if let Some(snap) = &latest {
            let meta = snap.get_metadata().clone();
            if meta.index > fsm.applied_index()? {
                fsm.restore(meta.index, meta.term, snap.get_data())?;
                info!("restored state machine from snapshot at index {}", meta.index);
            }
        }
        store.align_commit(fsm.applied_index()?)?;

        let outcome = plan_bootstrap(&cfg, &mut store, &snapshots)?;

        let applied = fsm.applied_index()?;
        let ConsensusParts {
            handle,
            observers,
            outbound,
            inbound,
            actor,
        } = node::start(&cfg, store, snapshots, fsm.clone(), applied)?;

        let mut tasks = vec![actor];
        tasks.extend(spawn_observer_logs(observers));
        tasks.push(client::spawn_transport(
            outbound,
            handle.status_watch(),
            cfg.clone(),
        ));

        // Advertisement is best effort: a node that cannot advertise can
        // still serve and still be reached by address.
        let advertiser = match discover::advertise(&cfg) {
            Ok(a) => Some(a),
            Err(e) => {
                warn!("discovery advertisement disabled: {e}");
                None
            }
        };

        let consensus_bind = cfg.consensus_bind()?;
        let consensus_svc = ConsensusSvc::new(inbound);
        tasks.push(tokio::spawn(async move {
            let server = tonic::transport::Server::builder()
                .add_service(ConsensusServiceServer::new(consensus_svc))
                .serve(consensus_bind);
            if let Err(e) = server.await {
                error!("consensus transport server failed: {e}");
            }
        }));
        info!("consensus transport listening on {consensus_bind}");

        let rpc_bind = cfg.rpc_bind()?;
        let cluster_svc = ClusterSvc::new(handle.clone(), cfg.clone());
        tasks.push(tokio::spawn(async move {
            let server = tonic::transport::Server::builder()
                .add_service(ClusterServiceServer::new(cluster_svc))
                .serve(rpc_bind);
            if let Err(e) = server.await {
                error!("cluster rpc server failed: {e}");
            }
        }));
        info!("cluster rpc listening on {rpc_bind}");

        tasks.push(spawn_metrics_server(&cfg)?);

        match outcome {
            BootstrapOutcome::Bootstrapped => {
                info!("bootstrapped; consensus completes as the other peers come up");
            }
            BootstrapOutcome::AlreadyBootstrapped => {
                info!("resuming with the existing configuration");
            }
            BootstrapOutcome::NotAVoter => {
                info!("not part of the bootstrap set, joining the live cluster");
                if let Err(e) = join_cluster(&cfg).await {
                    for task in tasks.drain(..) {
                        task.abort();
                    }
                    return Err(e);
                }
            }
        }

        Ok(Server {
            cfg,
            fsm,
            handle,
            tasks,
            _advertiser: advertiser,
        })
    }

    /// Local read from this replica's state machine. Not linearizable: a
    /// lagging replica returns the value as of its last applied entry.
    pub fn get(&self, key: &str) -> Result<Value, NodeError> {
        self.fsm.get(key)
    }

    /// Every key whose last committed operation was a successful SET.
    pub fn keys(&self) -> Result<Vec<String>, NodeError> {
        self.fsm.keys()
    }

    /// Replicated write; forwarded to the leader when this node follows.
    pub async fn set(&self, key: &str, value: Value) -> Result<(), NodeError> {
        cluster::execute(&self.cfg, &self.handle, &Payload::set(key, value)).await
    }

    /// Replicated delete; `NotFound` when the key does not exist.
    pub async fn delete(&self, key: &str) -> Result<(), NodeError> {
        cluster::execute(&self.cfg, &self.handle, &Payload::delete(key)).await
    }

    /// Index of the last entry applied to this replica.
    pub fn applied_index(&self) -> Result<u64, NodeError> {
        self.fsm.applied_index()
    }

    pub fn is_leader(&self) -> bool {
        self.handle.is_leader()
    }

    pub fn leader_name(&self) -> Option<String> {
        self.handle.leader_name()
    }

    pub fn status(&self) -> ClusterStatus {
        self.handle.status()
    }

    pub fn shutdown(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        info!("server stopped");
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if !self.tasks.is_empty() {
            self.shutdown();
        }
    }
}

/// Classifies the bootstrap decision. Outcomes are typed; no error-string
/// inspection anywhere.
fn plan_bootstrap(
    cfg: &RuntimeConfig,
    store: &mut LogStore,
    snapshots: &SnapshotStore,
) -> Result<BootstrapOutcome, NodeError> {
    if store.voters().len() >= 2 {
        return Ok(BootstrapOutcome::AlreadyBootstrapped);
    }

    let mut servers = Vec::new();
    for id in &cfg.cluster.bootstrap_ids {
        servers.push((raft_ord(id)?, id.clone()));
    }
    if !cfg.cluster.bootstrap_ids.iter().any(|id| id == &cfg.id) {
        return Ok(BootstrapOutcome::NotAVoter);
    }

    match store.bootstrap(&servers)? {
        Some(snapshot) => {
            // Persisted so a restart recovers the same initial state.
            snapshots.save(&snapshot)?;
            Ok(BootstrapOutcome::Bootstrapped)
        }
        None => Ok(BootstrapOutcome::AlreadyBootstrapped),
    }
}

/// Finds the leader through discovery and asks it to add this node as a
/// voter. Retried with a short backoff while the cluster elects.
async fn join_cluster(cfg: &RuntimeConfig) -> Result<(), NodeError> {
    for attempt in 1..=JOIN_ATTEMPTS {
        match discover::search_leader(cfg).await {
            Ok(leader) => {
                info!("joining the cluster through leader {leader}");
                return client::join(
                    &cfg.rpc_url(&leader),
                    &cfg.id,
                    &cfg.consensus_addr(&cfg.id),
                    cfg.rpc_timeout(),
                )
                .await;
            }
            Err(NodeError::LeaderNotFound) => {
                warn!("no leader found yet (attempt {attempt}/{JOIN_ATTEMPTS})");
                tokio::time::sleep(JOIN_BACKOFF).await;
            }
            Err(e) => return Err(e),
        }
    }
    Err(NodeError::LeaderNotFound)
}

/// Long-lived drains for the engine's observation channels.
fn spawn_observer_logs(channels: ObserverChannels) -> Vec<JoinHandle<()>> {
    let ObserverChannels {
        mut roles,
        mut leaders,
    } = channels;
    let role_task = tokio::spawn(async move {
        while let Some(role) = roles.recv().await {
            info!("node changed to role: {role:?}");
        }
    });
    let leader_task = tokio::spawn(async move {
        while let Some(observation) = leaders.recv().await {
            match observation {
                Some(leader) => info!("new leader: {leader}"),
                None => info!("no leader available in the cluster"),
            }
        }
    });
    vec![role_task, leader_task]
}

fn spawn_metrics_server(cfg: &RuntimeConfig) -> Result<JoinHandle<()>, NodeError> {
    let addr: SocketAddr = cfg
        .metrics_addr
        .parse()
        .map_err(|e| NodeError::fatal("couldn't parse metrics address", e))?;
    let make_svc = make_service_fn(move |_| {
        let registry = metrics::REGISTRY_INSTANCE.clone();
        async move {
            Ok::<_, hyper::Error>(service_fn(move |_: Request<Body>| {
                let registry = registry.clone();
                async move {
                    let encoder = TextEncoder::new();
                    let metric_families = registry.gather();
                    let mut buffer = Vec::new();
                    encoder.encode(&metric_families, &mut buffer).unwrap_or_default();
                    Ok::<_, hyper::Error>(Response::new(Body::from(buffer)))
                }
            }))
        }
    });
    let server = hyper::Server::try_bind(&addr)
        .map_err(|e| NodeError::fatal("couldn't bind metrics address", e))?
        .serve(make_svc);
    info!("metrics server listening on {addr}");
    Ok(tokio::spawn(async move {
        if let Err(e) = server.await {
            error!("metrics server failed: {e}");
        }
    }))
}
