//! Inter-node control plane: leader lookup, write forwarding and cluster
//! join, plus the raft message transport between peers.

pub mod client;
pub mod service;

use crate::config::RuntimeConfig;
use crate::consensus::node::ConsensusHandle;
use crate::discover;
use crate::error::NodeError;
use crate::fsm::Payload;
use crate::metrics;

/// Generated gRPC types for both services.
pub mod pb {
    tonic::include_proto!("cluster");
}

/// Runs a command against the cluster: applied locally when this node
/// leads, otherwise forwarded to whichever peer currently does.
pub async fn execute(
    cfg: &RuntimeConfig,
    handle: &ConsensusHandle,
    payload: &Payload,
) -> Result<(), NodeError> {
    payload.validate()?;
    let bytes = payload.encode()?;
    if handle.is_leader() {
        return handle.apply(bytes).await;
    }

    // The engine usually already observed who leads; the discovery
    // search covers the window where it has not.
    let leader = match handle.leader_name() {
        Some(leader) => leader,
        None => discover::search_leader(cfg).await?,
    };
    metrics::RPC_COUNTER_VEC
        .with_label_values(&["forward"])
        .inc();
    client::execute_on_leader(&cfg.rpc_url(&leader), bytes, cfg.rpc_timeout()).await
}
