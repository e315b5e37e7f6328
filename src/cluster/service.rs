//! Server side of the inter-node RPC.
//!
//! `ConsensusSvc` is the raft message sink on the consensus address;
//! `ClusterSvc` is the control plane on the RPC address. Handlers hold
//! explicit handles onto the engine, nothing global.

use log::{info, warn};
use protobuf::Message as PbMessage;
use raft::eraftpb::Message as RaftMessage;
use tokio::sync::mpsc;
use tonic::{Request, Response, Status, Streaming};

use crate::cluster::pb::cluster_service_server::ClusterService;
use crate::cluster::pb::consensus_service_server::ConsensusService;
use crate::cluster::pb::{Empty, ExecuteOnLeaderRequest, IsLeaderResponse, JoinRequest, MessageFrame};
use crate::config::{raft_ord, RuntimeConfig};
use crate::consensus::node::ConsensusHandle;
use crate::error::NodeError;
use crate::fsm::Payload;
use crate::metrics;

fn error_to_status(err: NodeError) -> Status {
    match err {
        NodeError::NotFound => Status::not_found("key doesn't exist"),
        NodeError::NotLeader => Status::failed_precondition("node is not the leader"),
        NodeError::InvalidPayload(m) => Status::invalid_argument(m),
        NodeError::LeaderNotFound => Status::unavailable("couldn't find a leader"),
        NodeError::Transient(m) => Status::unavailable(m),
        NodeError::Fatal(m) => Status::internal(m),
    }
}

/// Raft message sink feeding the engine's inbound mailbox.
pub struct ConsensusSvc {
    inbound: mpsc::Sender<RaftMessage>,
}

impl ConsensusSvc {
    pub fn new(inbound: mpsc::Sender<RaftMessage>) -> ConsensusSvc {
        ConsensusSvc { inbound }
    }
}

#[tonic::async_trait]
impl ConsensusService for ConsensusSvc {
    async fn post_messages(
        &self,
        request: Request<Streaming<MessageFrame>>,
    ) -> Result<Response<Empty>, Status> {
        let mut stream = request.into_inner();
        while let Some(frame) = stream.message().await? {
            match RaftMessage::parse_from_bytes(&frame.data) {
                Ok(msg) => {
                    if let Err(e) = self.inbound.send(msg).await {
                        warn!("raft inbox closed: {e}");
                        break;
                    }
                }
                Err(e) => {
                    warn!("dropping unparseable raft message: {e}");
                    continue;
                }
            }
        }
        Ok(Response::new(Empty {}))
    }
}

/// Control plane: leadership probe, write forwarding, cluster join.
pub struct ClusterSvc {
    handle: ConsensusHandle,
    cfg: RuntimeConfig,
}

impl ClusterSvc {
    pub fn new(handle: ConsensusHandle, cfg: RuntimeConfig) -> ClusterSvc {
        ClusterSvc { handle, cfg }
    }
}

#[tonic::async_trait]
impl ClusterService for ClusterSvc {
    async fn is_leader(
        &self,
        _request: Request<Empty>,
    ) -> Result<Response<IsLeaderResponse>, Status> {
        Ok(Response::new(IsLeaderResponse {
            is_leader: self.handle.is_leader(),
        }))
    }

    async fn execute_on_leader(
        &self,
        request: Request<ExecuteOnLeaderRequest>,
    ) -> Result<Response<Empty>, Status> {
        let request = request.into_inner();
        let payload = Payload::decode(&request.payload)
            .map_err(|_| Status::invalid_argument("malformed payload"))?;
        payload
            .validate()
            .map_err(|e| Status::invalid_argument(e.to_string()))?;
        metrics::RPC_COUNTER_VEC
            .with_label_values(&["execute_on_leader"])
            .inc();
        info!(
            "handling forwarded {:?} for key '{}'",
            payload.operation, payload.key
        );

        self.handle
            .apply(request.payload)
            .await
            .map_err(error_to_status)?;
        Ok(Response::new(Empty {}))
    }

    async fn join(&self, request: Request<JoinRequest>) -> Result<Response<Empty>, Status> {
        let request = request.into_inner();
        let ord = raft_ord(&request.node_id)
            .map_err(|_| Status::invalid_argument("node id needs a decimal suffix"))?;
        let expected = self.cfg.consensus_addr(&request.node_id);
        if request.consensus_address != expected {
            return Err(Status::invalid_argument(format!(
                "consensus address must be {expected}"
            )));
        }
        metrics::RPC_COUNTER_VEC.with_label_values(&["join"]).inc();
        info!("adding voter {} to the configuration", request.node_id);

        self.handle
            .add_voter(ord, &request.node_id)
            .await
            .map_err(error_to_status)?;
        Ok(Response::new(Empty {}))
    }
}
