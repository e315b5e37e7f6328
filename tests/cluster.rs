//! Multi-node scenarios, run in-process over a static loopback node
//! list: every node binds its own ports on 127.0.0.1 and the address
//! book replaces both hostname addressing and the multicast search.

use std::path::Path;
use std::time::Duration;

use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::time::sleep;

use nubedb::config::{NodeConfig, RuntimeConfig};
use nubedb::error::NodeError;
use nubedb::server::Server;

fn member_config(
    data_dir: &Path,
    id: &str,
    members: &[(&str, u16)],
    bootstrap: &[&str],
) -> RuntimeConfig {
    let base = members
        .iter()
        .find(|(name, _)| *name == id)
        .map(|(_, port)| *port)
        .expect("member port");
    let mut cfg = RuntimeConfig::default();
    cfg.id = id.to_string();
    cfg.data_dir = data_dir.to_string_lossy().into_owned();
    cfg.metrics_addr = format!("127.0.0.1:{}", base + 2);
    cfg.cluster.bootstrap_ids = bootstrap.iter().map(|s| s.to_string()).collect();
    cfg.cluster.node_list = members
        .iter()
        .map(|(name, port)| NodeConfig {
            id: name.to_string(),
            consensus_addr: format!("127.0.0.1:{port}"),
            rpc_addr: format!("127.0.0.1:{}", port + 1),
        })
        .collect();
    cfg
}

/// Waits until exactly one server reports leadership (a freshly deposed
/// leader may claim the role for a beat) and returns its index.
async fn wait_for_sole_leader(servers: &[Server]) -> usize {
    for _ in 0..300 {
        let leaders: Vec<usize> = servers
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_leader())
            .map(|(i, _)| i)
            .collect();
        if leaders.len() == 1 {
            return leaders[0];
        }
        sleep(Duration::from_millis(100)).await;
    }
    panic!("no sole leader emerged within 30s");
}

/// Waits out the replication lag until `key` holds `want` on `server`.
async fn wait_for_key(server: &Server, key: &str, want: &Value) {
    for _ in 0..300 {
        if let Ok(v) = server.get(key) {
            if &v == want {
                return;
            }
        }
        sleep(Duration::from_millis(100)).await;
    }
    panic!("key '{key}' did not replicate within 30s");
}

async fn wait_for_voter(server: &Server, name: &str) {
    for _ in 0..300 {
        if server
            .status()
            .servers
            .iter()
            .any(|(_, n)| n == name)
        {
            return;
        }
        sleep(Duration::from_millis(100)).await;
    }
    panic!("voter '{name}' never appeared in the configuration");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn follower_forwards_writes_to_the_leader() {
    let dir = TempDir::new().unwrap();
    let members = [("node1", 24100), ("node2", 24110)];
    let bootstrap = ["node1", "node2"];

    let mut servers = Vec::new();
    for (name, _) in &members {
        let cfg = member_config(dir.path(), name, &members, &bootstrap);
        servers.push(Server::start(cfg).await.unwrap());
    }

    let leader_idx = wait_for_sole_leader(&servers).await;
    let follower_idx = 1 - leader_idx;
    assert!(!servers[follower_idx].is_leader());

    // Writes submitted to the follower land on the leader.
    servers[follower_idx]
        .set("fwd", json!({"via": "follower"}))
        .await
        .unwrap();
    assert_eq!(
        servers[leader_idx].get("fwd").unwrap(),
        json!({"via": "follower"})
    );
    wait_for_key(&servers[follower_idx], "fwd", &json!({"via": "follower"})).await;

    // Deletes forward the same way, including the semantic error.
    servers[follower_idx].delete("fwd").await.unwrap();
    assert!(matches!(
        servers[leader_idx].get("fwd"),
        Err(NodeError::NotFound)
    ));
    assert!(matches!(
        servers[follower_idx].delete("missing").await,
        Err(NodeError::NotFound)
    ));
    assert!(servers[leader_idx].keys().unwrap().is_empty());

    for server in &mut servers {
        server.shutdown();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn outsider_joins_a_live_cluster() {
    let dir = TempDir::new().unwrap();
    let members = [("node1", 24200), ("node4", 24210)];
    let bootstrap = ["node1"];

    let mut leader = Server::start(member_config(dir.path(), "node1", &members, &bootstrap))
        .await
        .unwrap();
    wait_for_sole_leader(std::slice::from_ref(&leader)).await;
    leader.set("pre-join", json!(1)).await.unwrap();

    // node4 is outside the bootstrap set; startup goes through the
    // explicit join path against the discovered leader.
    let mut joiner = Server::start(member_config(dir.path(), "node4", &members, &bootstrap))
        .await
        .unwrap();
    wait_for_voter(&leader, "node4").await;
    assert!(!joiner.is_leader());

    // The joiner catches up on history and on new writes.
    wait_for_key(&joiner, "pre-join", &json!(1)).await;
    leader.set("post-join", json!(2)).await.unwrap();
    wait_for_key(&joiner, "post-join", &json!(2)).await;

    // And its own writes forward to the leader.
    joiner.set("via-joiner", json!(3)).await.unwrap();
    assert_eq!(leader.get("via-joiner").unwrap(), json!(3));

    leader.shutdown();
    joiner.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn leader_failover_elects_a_replacement() {
    let dir = TempDir::new().unwrap();
    let members = [("node1", 24300), ("node2", 24310), ("node3", 24320)];
    let bootstrap = ["node1", "node2", "node3"];

    let mut servers = Vec::new();
    let mut ids = Vec::new();
    for (name, _) in &members {
        let cfg = member_config(dir.path(), name, &members, &bootstrap);
        servers.push(Server::start(cfg).await.unwrap());
        ids.push(name.to_string());
    }

    // Concurrent bootstrap of three empty nodes: exactly one leader, and
    // the configuration lists all three voters.
    let leader_idx = wait_for_sole_leader(&servers).await;
    assert_eq!(servers[leader_idx].status().servers.len(), 3);

    servers[leader_idx].set("before", json!(1)).await.unwrap();
    for server in &servers {
        wait_for_key(server, "before", &json!(1)).await;
    }

    // Kill the leader; the survivors still hold a quorum.
    let old_leader_id = ids.remove(leader_idx);
    let mut old_leader = servers.remove(leader_idx);
    old_leader.shutdown();
    drop(old_leader);

    let new_leader_idx = wait_for_sole_leader(&servers).await;
    servers[new_leader_idx].set("after", json!(2)).await.unwrap();
    for server in &servers {
        wait_for_key(server, "after", &json!(2)).await;
    }

    // The old leader rejoins as a follower and converges.
    sleep(Duration::from_secs(1)).await;
    let cfg = member_config(dir.path(), &old_leader_id, &members, &bootstrap);
    let mut revived = Server::start(cfg).await.unwrap();
    wait_for_key(&revived, "after", &json!(2)).await;
    wait_for_key(&revived, "before", &json!(1)).await;

    revived.shutdown();
    for server in &mut servers {
        server.shutdown();
    }
}
