//! Peer discovery on the local segment.
//!
//! Every node advertises itself over multicast DNS under the
//! `_nubedb._tcp` service type, IPv4 only, with its RPC port and the
//! node name as the instance name. Searches run three query windows with
//! a 100 ms gap, de-duplicate the answers and never include the caller.

use std::collections::{HashMap, HashSet};

use log::warn;
use mdns_sd::{IfKind, ServiceDaemon, ServiceEvent, ServiceInfo};
use tokio::time::{Duration, Instant};

use crate::cluster::client;
use crate::config::RuntimeConfig;
use crate::error::NodeError;

const SERVICE_TYPE: &str = "_nubedb._tcp.local.";
const SERVICE_INFO: &str = "nubedb Discover";
const QUERY_ROUNDS: usize = 3;
const QUERY_GAP: Duration = Duration::from_millis(100);

/// Keeps this node's advertisement alive; dropped on shutdown.
pub struct Advertiser {
    daemon: ServiceDaemon,
}

impl Drop for Advertiser {
    fn drop(&mut self) {
        let _ = self.daemon.shutdown();
    }
}

/// Starts advertising this node under `_nubedb._tcp`.
pub fn advertise(cfg: &RuntimeConfig) -> Result<Advertiser, NodeError> {
    let daemon =
        ServiceDaemon::new().map_err(|e| NodeError::transient("couldn't start mdns daemon", e))?;
    daemon
        .disable_interface(IfKind::IPv6)
        .map_err(|e| NodeError::transient("couldn't restrict mdns to IPv4", e))?;

    let host = format!("{}.local.", cfg.id);
    let properties = HashMap::from([("info".to_string(), SERVICE_INFO.to_string())]);
    let info = ServiceInfo::new(
        SERVICE_TYPE,
        &cfg.id,
        &host,
        "",
        cfg.cluster.rpc_port,
        properties,
    )
    .map_err(|e| NodeError::transient("couldn't describe mdns service", e))?
    .enable_addr_auto();
    daemon
        .register(info)
        .map_err(|e| NodeError::transient("couldn't register mdns service", e))?;

    Ok(Advertiser { daemon })
}

/// Enumerates the peers currently advertising on the segment, excluding
/// this node. A configured node list replaces the multicast search.
pub async fn search_nodes(cfg: &RuntimeConfig) -> Result<Vec<String>, NodeError> {
    if !cfg.cluster.node_list.is_empty() {
        return Ok(cfg
            .cluster
            .node_list
            .iter()
            .map(|n| n.id.clone())
            .filter(|id| id != &cfg.id)
            .collect());
    }

    let daemon =
        ServiceDaemon::new().map_err(|e| NodeError::transient("couldn't start mdns daemon", e))?;
    daemon
        .disable_interface(IfKind::IPv6)
        .map_err(|e| NodeError::transient("couldn't restrict mdns to IPv4", e))?;
    let receiver = daemon
        .browse(SERVICE_TYPE)
        .map_err(|e| NodeError::transient("couldn't browse mdns", e))?;

    let mut hosts = HashSet::new();
    'rounds: for _ in 0..QUERY_ROUNDS {
        let deadline = Instant::now() + QUERY_GAP;
        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            match tokio::time::timeout(deadline - now, receiver.recv_async()).await {
                Ok(Ok(ServiceEvent::ServiceResolved(info))) => {
                    if let Some(name) = instance_name(info.get_fullname()) {
                        hosts.insert(name);
                    }
                }
                Ok(Ok(_)) => {}
                Ok(Err(_)) => break 'rounds,
                Err(_) => break,
            }
        }
    }
    let _ = daemon.stop_browse(SERVICE_TYPE);
    let _ = daemon.shutdown();

    Ok(hosts.into_iter().filter(|h| h != &cfg.id).collect())
}

/// Finds the current leader among the discovered peers.
///
/// The local node is never returned even if it leads; this path only
/// runs when the local node believes it is not the leader and needs
/// somewhere to forward.
pub async fn search_leader(cfg: &RuntimeConfig) -> Result<String, NodeError> {
    let nodes = search_nodes(cfg).await?;
    for node in nodes {
        match client::is_leader(&cfg.rpc_url(&node), cfg.rpc_timeout()).await {
            Ok(true) => return Ok(node),
            Ok(false) => {}
            Err(e) => warn!("couldn't contact {node} while searching for a leader: {e}"),
        }
    }
    Err(NodeError::LeaderNotFound)
}

/// Extracts the instance name from an mDNS fullname. Some platforms hand
/// back names with a trailing dot.
fn instance_name(fullname: &str) -> Option<String> {
    let (instance, _) = fullname.split_once("._nubedb._tcp")?;
    let instance = instance.trim_end_matches('.');
    if instance.is_empty() {
        None
    } else {
        Some(instance.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;

    #[tokio::test]
    async fn static_node_list_replaces_the_multicast_search() {
        let mut cfg = RuntimeConfig::default();
        cfg.id = "node2".to_string();
        cfg.cluster.node_list = (1..=3)
            .map(|i| NodeConfig {
                id: format!("node{i}"),
                consensus_addr: format!("127.0.0.1:930{i}"),
                rpc_addr: format!("127.0.0.1:940{i}"),
            })
            .collect();

        let mut nodes = search_nodes(&cfg).await.unwrap();
        nodes.sort();
        // The caller itself is never part of the answer.
        assert_eq!(nodes, vec!["node1", "node3"]);
    }

    #[test]
    fn instance_name_strips_the_service_suffix() {
        assert_eq!(
            instance_name("node2._nubedb._tcp.local.").as_deref(),
            Some("node2")
        );
    }

    #[test]
    fn instance_name_strips_trailing_dots() {
        assert_eq!(
            instance_name("node2.._nubedb._tcp.local.").as_deref(),
            Some("node2")
        );
    }

    #[test]
    fn foreign_names_are_ignored() {
        assert_eq!(instance_name("printer._ipp._tcp.local."), None);
        assert_eq!(instance_name("._nubedb._tcp.local."), None);
    }
}
