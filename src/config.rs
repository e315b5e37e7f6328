//! Runtime configuration for a nubedb node.
//!
//! Node names double as hostnames on the local segment; every name maps to
//! its consensus and RPC addresses through pure functions of the name, so
//! no address book is ever exchanged. A static node list can override the
//! derived addressing for segments without per-node hostnames.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use log::warn;
use serde_derive::Deserialize;

use crate::error::NodeError;

/// Runtime configuration for the node.
#[derive(Debug, Deserialize, Clone)]
pub struct RuntimeConfig {
    /// Stable node identifier. Drives addressing, discovery and the data
    /// directory layout. Must carry a decimal suffix (`node3`).
    #[serde(default = "default_id")]
    pub id: String,
    /// Root under which per-node state lives (`<data_dir>/<id>`).
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    /// Bind address of the metrics endpoint.
    #[serde(default = "default_metrics_addr")]
    pub metrics_addr: String,
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub consensus: ConsensusConfig,
}

/// Static address-book entry for a single node. An entry supersedes the
/// derived `<name>:<port>` addressing for that node.
#[derive(Debug, Deserialize, Clone)]
pub struct NodeConfig {
    /// Node name the addresses belong to.
    pub id: String,
    /// Address of the node's consensus transport.
    pub consensus_addr: String,
    /// Address of the node's cluster RPC endpoint.
    pub rpc_addr: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ClusterConfig {
    /// Fixed voter set used for the initial bootstrap.
    #[serde(default = "default_bootstrap_ids")]
    pub bootstrap_ids: Vec<String>,
    /// Port component of every node's consensus address.
    #[serde(default = "default_consensus_port")]
    pub consensus_port: u16,
    /// Port component of every node's RPC address.
    #[serde(default = "default_rpc_port")]
    pub rpc_port: u16,
    /// Optional static address book. When present for a node, it wins
    /// over the hostname-derived addresses, and a non-empty list also
    /// replaces the multicast peer search.
    #[serde(default)]
    pub node_list: Vec<NodeConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ConsensusConfig {
    /// Ticks without a heartbeat before a follower campaigns.
    #[serde(default = "default_election_tick")]
    pub election_tick: usize,
    /// Ticks between leader heartbeats.
    #[serde(default = "default_heartbeat_tick")]
    pub heartbeat_tick: usize,
    /// Timeout for outbound RPCs and for a replicated apply.
    #[serde(default = "default_rpc_timeout_secs")]
    pub rpc_timeout_secs: u64,
    /// Peer connection pool size.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Snapshot cadence. Deliberately aggressive by default so the
    /// snapshot paths are exercised constantly.
    #[serde(default = "default_snapshot_interval_secs")]
    pub snapshot_interval_secs: u64,
    /// Minimum entries applied since the last snapshot before a new one
    /// is taken.
    #[serde(default = "default_snapshot_threshold")]
    pub snapshot_threshold: u64,
    /// Snapshot files kept on disk.
    #[serde(default = "default_retained_snapshots")]
    pub retained_snapshots: usize,
}

fn default_id() -> String {
    "node1".to_string()
}

fn default_data_dir() -> String {
    "data".to_string()
}

fn default_metrics_addr() -> String {
    "0.0.0.0:4010".to_string()
}

fn default_bootstrap_ids() -> Vec<String> {
    (1..=3).map(|i| format!("node{i}")).collect()
}

fn default_consensus_port() -> u16 {
    3000
}

fn default_rpc_port() -> u16 {
    5001
}

fn default_election_tick() -> usize {
    10
}

fn default_heartbeat_tick() -> usize {
    3
}

fn default_rpc_timeout_secs() -> u64 {
    10
}

fn default_max_connections() -> usize {
    10
}

fn default_snapshot_interval_secs() -> u64 {
    10
}

fn default_snapshot_threshold() -> u64 {
    2
}

fn default_retained_snapshots() -> usize {
    3
}

impl Default for ClusterConfig {
    fn default() -> Self {
        ClusterConfig {
            bootstrap_ids: default_bootstrap_ids(),
            consensus_port: default_consensus_port(),
            rpc_port: default_rpc_port(),
            node_list: Vec::new(),
        }
    }
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        ConsensusConfig {
            election_tick: default_election_tick(),
            heartbeat_tick: default_heartbeat_tick(),
            rpc_timeout_secs: default_rpc_timeout_secs(),
            max_connections: default_max_connections(),
            snapshot_interval_secs: default_snapshot_interval_secs(),
            snapshot_threshold: default_snapshot_threshold(),
            retained_snapshots: default_retained_snapshots(),
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            id: default_id(),
            data_dir: default_data_dir(),
            metrics_addr: default_metrics_addr(),
            cluster: ClusterConfig::default(),
            consensus: ConsensusConfig::default(),
        }
    }
}

impl RuntimeConfig {
    /// Loads configuration from a TOML file, falling back to defaults when
    /// the file is missing or malformed.
    pub fn from_toml(path: &str) -> RuntimeConfig {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) => {
                warn!("couldn't read the runtime config file, using defaults: {e}");
                return RuntimeConfig::default();
            }
        };
        match toml::from_str(&contents) {
            Ok(c) => c,
            Err(e) => {
                warn!("couldn't parse the runtime config file, using defaults: {e}");
                RuntimeConfig::default()
            }
        }
    }

    /// Per-node state directory (`<data_dir>/<id>`).
    pub fn node_dir(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join(&self.id)
    }

    fn node_entry(&self, name: &str) -> Option<&NodeConfig> {
        self.cluster.node_list.iter().find(|n| n.id == name)
    }

    /// Consensus address of any node: the address book when it has an
    /// entry, otherwise derived purely from the name.
    pub fn consensus_addr(&self, name: &str) -> String {
        match self.node_entry(name) {
            Some(entry) => entry.consensus_addr.clone(),
            None => format!("{name}:{}", self.cluster.consensus_port),
        }
    }

    /// RPC address of any node: the address book when it has an entry,
    /// otherwise derived purely from the name.
    pub fn rpc_addr(&self, name: &str) -> String {
        match self.node_entry(name) {
            Some(entry) => entry.rpc_addr.clone(),
            None => format!("{name}:{}", self.cluster.rpc_port),
        }
    }

    pub fn consensus_url(&self, name: &str) -> String {
        format!("http://{}", self.consensus_addr(name))
    }

    pub fn rpc_url(&self, name: &str) -> String {
        format!("http://{}", self.rpc_addr(name))
    }

    pub fn consensus_bind(&self) -> Result<SocketAddr, NodeError> {
        match self.node_entry(&self.id) {
            Some(entry) => entry
                .consensus_addr
                .parse()
                .map_err(|e| NodeError::fatal("couldn't parse bind address", e)),
            None => parse_bind(self.cluster.consensus_port),
        }
    }

    pub fn rpc_bind(&self) -> Result<SocketAddr, NodeError> {
        match self.node_entry(&self.id) {
            Some(entry) => entry
                .rpc_addr
                .parse()
                .map_err(|e| NodeError::fatal("couldn't parse bind address", e)),
            None => parse_bind(self.cluster.rpc_port),
        }
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.consensus.rpc_timeout_secs)
    }

    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_secs(self.consensus.snapshot_interval_secs)
    }
}

fn parse_bind(port: u16) -> Result<SocketAddr, NodeError> {
    format!("0.0.0.0:{port}")
        .parse()
        .map_err(|e| NodeError::fatal("couldn't parse bind address", e))
}

/// Numeric raft id of a node: the decimal suffix of its name.
///
/// tikv raft identifies voters by `u64`; names and addresses are recovered
/// through the peer registry.
pub fn raft_ord(name: &str) -> Result<u64, NodeError> {
    let digits: String = name
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_digit())
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    if digits.is_empty() {
        return Err(NodeError::Fatal(format!(
            "node name '{name}' has no decimal suffix"
        )));
    }
    digits
        .parse()
        .map_err(|e| NodeError::fatal("couldn't parse node ordinal", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ord_is_the_decimal_suffix() {
        assert_eq!(raft_ord("node1").unwrap(), 1);
        assert_eq!(raft_ord("node42").unwrap(), 42);
        assert_eq!(raft_ord("kv-7").unwrap(), 7);
        assert!(raft_ord("leader").is_err());
        assert!(raft_ord("").is_err());
    }

    #[test]
    fn addresses_derive_from_the_name() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.consensus_addr("node2"), "node2:3000");
        assert_eq!(cfg.rpc_addr("node2"), "node2:5001");
        assert_eq!(cfg.rpc_url("node3"), "http://node3:5001");
    }

    #[test]
    fn defaults_enumerate_the_fixed_bootstrap_set() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.cluster.bootstrap_ids, vec!["node1", "node2", "node3"]);
        assert_eq!(cfg.consensus.snapshot_threshold, 2);
        assert_eq!(cfg.consensus.retained_snapshots, 3);
    }

    #[test]
    fn partial_toml_fills_in_defaults() {
        let cfg: RuntimeConfig = toml::from_str("id = \"node9\"").unwrap();
        assert_eq!(cfg.id, "node9");
        assert_eq!(cfg.cluster.rpc_port, 5001);
        assert_eq!(cfg.consensus.election_tick, 10);
        assert!(cfg.cluster.node_list.is_empty());
    }

    #[test]
    fn node_list_overrides_derived_addresses() {
        let mut cfg = RuntimeConfig::default();
        cfg.cluster.node_list = vec![NodeConfig {
            id: "node2".to_string(),
            consensus_addr: "127.0.0.1:9300".to_string(),
            rpc_addr: "127.0.0.1:9301".to_string(),
        }];
        assert_eq!(cfg.consensus_addr("node2"), "127.0.0.1:9300");
        assert_eq!(cfg.rpc_addr("node2"), "127.0.0.1:9301");
        // Nodes without an entry keep the derived addressing.
        assert_eq!(cfg.rpc_addr("node3"), "node3:5001");

        cfg.id = "node2".to_string();
        assert_eq!(cfg.consensus_bind().unwrap().to_string(), "127.0.0.1:9300");
        assert_eq!(cfg.rpc_bind().unwrap().to_string(), "127.0.0.1:9301");
    }
}
