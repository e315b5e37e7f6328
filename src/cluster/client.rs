//! Client side of the inter-node RPC: unary control-plane calls and the
//! per-peer raft message streams.
//!
//! Each peer gets one cached streaming connection. A failed stream marks
//! itself invalid and is rebuilt on the next message; raft's own
//! retransmission covers whatever was in flight.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use protobuf::Message as PbMessage;
use raft::eraftpb::Message as RaftMessage;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tonic::transport::{Channel, Endpoint};
use tonic::Code;

use crate::cluster::pb;
use crate::cluster::pb::cluster_service_client::ClusterServiceClient;
use crate::cluster::pb::consensus_service_client::ConsensusServiceClient;
use crate::config::RuntimeConfig;
use crate::consensus::node::ClusterStatus;
use crate::error::NodeError;

const PEER_BUFFER: usize = 1000;

async fn connect_cluster(
    url: &str,
    timeout: Duration,
) -> Result<ClusterServiceClient<Channel>, NodeError> {
    let endpoint = Endpoint::from_shared(url.to_string())
        .map_err(|e| NodeError::transient("bad peer address", e))?
        .timeout(timeout)
        .connect_timeout(timeout);
    let channel = endpoint
        .connect()
        .await
        .map_err(|e| NodeError::transient("couldn't reach peer", e))?;
    Ok(ClusterServiceClient::new(channel))
}

fn status_to_error(status: tonic::Status) -> NodeError {
    match status.code() {
        Code::NotFound => NodeError::NotFound,
        Code::FailedPrecondition => NodeError::NotLeader,
        Code::InvalidArgument => NodeError::InvalidPayload(status.message().to_string()),
        _ => NodeError::transient("peer call failed", status),
    }
}

/// Asks a peer whether it currently holds leadership.
pub async fn is_leader(url: &str, timeout: Duration) -> Result<bool, NodeError> {
    let mut client = connect_cluster(url, timeout).await?;
    let response = client
        .is_leader(pb::Empty {})
        .await
        .map_err(status_to_error)?;
    Ok(response.into_inner().is_leader)
}

/// Forwards a client write to the leader, which applies it.
pub async fn execute_on_leader(
    url: &str,
    payload: Vec<u8>,
    timeout: Duration,
) -> Result<(), NodeError> {
    let mut client = connect_cluster(url, timeout).await?;
    client
        .execute_on_leader(pb::ExecuteOnLeaderRequest { payload })
        .await
        .map_err(status_to_error)?;
    Ok(())
}

/// Asks the leader to add this node as a voter.
pub async fn join(
    url: &str,
    node_id: &str,
    consensus_address: &str,
    timeout: Duration,
) -> Result<(), NodeError> {
    let mut client = connect_cluster(url, timeout).await?;
    client
        .join(pb::JoinRequest {
            node_id: node_id.to_string(),
            consensus_address: consensus_address.to_string(),
        })
        .await
        .map_err(status_to_error)?;
    Ok(())
}

struct PeerStream {
    sender: mpsc::Sender<pb::MessageFrame>,
    invalid: Arc<AtomicBool>,
}

impl PeerStream {
    /// Returns immediately; the connection and the client stream live in
    /// a background task so a dead peer never stalls the drain loop.
    fn spawn(url: String, connect_timeout: Duration, pool: usize) -> PeerStream {
        let (sender, receiver) = mpsc::channel(PEER_BUFFER);
        let invalid = Arc::new(AtomicBool::new(false));
        let flag = invalid.clone();
        tokio::spawn(async move {
            if let Err(e) = Self::stream(&url, connect_timeout, pool, receiver).await {
                warn!("raft stream to {url} ended: {e}");
            }
            flag.store(true, Ordering::SeqCst);
        });
        PeerStream { sender, invalid }
    }

    async fn stream(
        url: &str,
        connect_timeout: Duration,
        pool: usize,
        receiver: mpsc::Receiver<pb::MessageFrame>,
    ) -> Result<(), NodeError> {
        let endpoint = Endpoint::from_shared(url.to_string())
            .map_err(|e| NodeError::transient("bad peer address", e))?
            .connect_timeout(connect_timeout)
            .concurrency_limit(pool);
        let channel = endpoint
            .connect()
            .await
            .map_err(|e| NodeError::transient("couldn't reach peer", e))?;
        let mut client = ConsensusServiceClient::new(channel);
        let stream = tokio_stream::wrappers::ReceiverStream::new(receiver);
        client
            .post_messages(stream)
            .await
            .map_err(|e| NodeError::transient("message stream failed", e))?;
        Ok(())
    }
}

struct RaftTransport {
    peers: HashMap<u64, PeerStream>,
    status: watch::Receiver<ClusterStatus>,
    cfg: RuntimeConfig,
}

impl RaftTransport {
    fn resolve(&self, ord: u64) -> String {
        self.status
            .borrow()
            .servers
            .iter()
            .find(|(o, _)| *o == ord)
            .map(|(_, name)| name.clone())
            .unwrap_or_else(|| format!("node{ord}"))
    }

    fn post(&mut self, msg: RaftMessage) {
        let to = msg.to;
        if self
            .peers
            .get(&to)
            .map(|p| p.invalid.load(Ordering::SeqCst))
            .unwrap_or(false)
        {
            self.peers.remove(&to);
        }
        if !self.peers.contains_key(&to) {
            let name = self.resolve(to);
            let url = self.cfg.consensus_url(&name);
            let stream = PeerStream::spawn(
                url,
                self.cfg.rpc_timeout(),
                self.cfg.consensus.max_connections,
            );
            self.peers.insert(to, stream);
        }

        let data = match msg.write_to_bytes() {
            Ok(d) => d,
            Err(e) => {
                warn!("couldn't encode raft message: {e}");
                return;
            }
        };
        if let Some(peer) = self.peers.get(&to) {
            if peer.sender.try_send(pb::MessageFrame { data }).is_err() {
                debug!("raft message to {to} dropped, raft will retry");
            }
        }
    }
}

/// Drains the engine's outbound mailbox into per-peer streams.
pub fn spawn_transport(
    mut outbound: mpsc::Receiver<RaftMessage>,
    status: watch::Receiver<ClusterStatus>,
    cfg: RuntimeConfig,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut transport = RaftTransport {
            peers: HashMap::new(),
            status,
            cfg,
        };
        while let Some(msg) = outbound.recv().await {
            transport.post(msg);
        }
    })
}
