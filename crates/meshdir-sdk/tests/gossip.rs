//! Gossip integration tests over the in-memory network
//!
//! Every node owns a registry, serves it on the shared [`MemoryNetwork`]
//! and runs its own scheduler. Rounds are driven by hand so each test is
//! deterministic.

use meshdir_sdk::prelude::*;
use meshdir_sdk::{Fault, SdkError};
use std::sync::Arc;

const MESH: &str = "mesh-1";

struct TestNode {
    key: String,
    registry: Arc<MeshRegistry>,
    syncer: Syncer,
}

impl TestNode {
    fn mesh(&self) -> Arc<MeshDirectory> {
        self.registry.get(MESH).unwrap()
    }

    async fn round(&self) -> meshdir_sdk::RoundReport {
        self.syncer.sync_round(MESH).await.unwrap()
    }
}

fn key(i: usize) -> String {
    format!("node-{:02}", i)
}

fn endpoint(i: usize) -> String {
    format!("host-{:02}", i)
}

/// Node 0 founds the mesh; every other node joins from its snapshot.
fn spawn_mesh(network: &Arc<MemoryNetwork>, n: usize, config: SyncConfig) -> Vec<TestNode> {
    let mut nodes: Vec<TestNode> = Vec::with_capacity(n);
    for i in 0..n {
        let registry = Arc::new(MeshRegistry::new(key(i)));
        let node = MeshNode::new(key(i), endpoint(i));
        if i == 0 {
            registry.create_mesh(MESH, node);
        } else {
            let snapshot = nodes[0].mesh().save().unwrap();
            registry.join_mesh(MESH, &snapshot, node).unwrap();
        }
        network.register(endpoint(i), registry.clone());

        let syncer = Syncer::new(registry.clone(), network.clone(), config.clone())
            .unwrap()
            .with_seed(i as u64);
        nodes.push(TestNode {
            key: key(i),
            registry,
            syncer,
        });
    }
    nodes
}

fn is_converged(nodes: &[TestNode]) -> bool {
    let expected = nodes[0].mesh().get_nodes();
    expected.len() == nodes.len() && nodes.iter().all(|n| n.mesh().get_nodes() == expected)
}

async fn gossip_until_converged(nodes: &[TestNode], max_rounds: usize) -> Option<usize> {
    for round in 0..max_rounds {
        if is_converged(nodes) {
            return Some(round);
        }
        for node in nodes {
            node.round().await;
        }
    }
    is_converged(nodes).then_some(max_rounds)
}

fn drain(events: &mut tokio::sync::broadcast::Receiver<SyncEvent>) -> Vec<SyncEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}

#[tokio::test]
async fn test_joiner_reaches_founder() {
    let network = Arc::new(MemoryNetwork::new());
    let nodes = spawn_mesh(&network, 2, SyncConfig::default());

    assert!(!nodes[0].mesh().contains(&nodes[1].key));

    let report = nodes[1].round().await;

    assert_eq!(report.targets, vec![nodes[0].key.clone()]);
    assert_eq!(report.failures, 0);
    assert!(nodes[0].mesh().contains(&nodes[1].key));
    assert!(is_converged(&nodes));
}

#[tokio::test]
async fn test_mesh_converges() {
    let network = Arc::new(MemoryNetwork::new());
    let config = SyncConfigBuilder::new()
        .cluster_size(4)
        .branch_rate(3)
        .inter_cluster_chance(1.0)
        .build();
    let nodes = spawn_mesh(&network, 8, config);

    let rounds = gossip_until_converged(&nodes, 30).await;

    assert!(rounds.is_some(), "mesh did not converge");
    for node in &nodes {
        assert_eq!(node.mesh().get_peers().len(), 8);
    }
}

#[tokio::test]
async fn test_edits_propagate() {
    let network = Arc::new(MemoryNetwork::new());
    let nodes = spawn_mesh(&network, 3, SyncConfig::default());
    gossip_until_converged(&nodes, 10).await.unwrap();

    let mesh = nodes[2].mesh();
    mesh.set_alias(&nodes[2].key, "edge").unwrap();
    mesh.add_service(&nodes[2].key, "dns", "53").unwrap();
    mesh.add_routes(&nodes[2].key, vec![Route::new("fd00:2::/64", 1)]).unwrap();

    gossip_until_converged(&nodes, 10).await.unwrap();
    for node in &nodes {
        let record = node.mesh().get_node(&nodes[2].key).unwrap();
        assert_eq!(record.alias, "edge");
        assert_eq!(record.services.get("dns").map(String::as_str), Some("53"));
        assert!(record.routes.contains_key("fd00:2::/64"));
    }
}

#[tokio::test]
async fn test_removal_propagates() {
    let network = Arc::new(MemoryNetwork::new());
    let nodes = spawn_mesh(&network, 3, SyncConfig::default());
    gossip_until_converged(&nodes, 10).await.unwrap();

    nodes[0].mesh().remove_node(&nodes[2].key).unwrap();
    nodes[0].round().await;

    assert!(!nodes[1].mesh().contains(&nodes[2].key));
}

#[tokio::test]
async fn test_quiet_round_opens_no_sessions() {
    let network = Arc::new(MemoryNetwork::new());
    let config = SyncConfigBuilder::new().infection_count(1).build();
    let nodes = spawn_mesh(&network, 2, config);

    nodes[1].round().await;
    let busy = nodes[0].round().await;
    assert!(!busy.skipped);

    let mut events = nodes[0].syncer.subscribe();
    let quiet = nodes[0].round().await;

    assert!(quiet.skipped);
    assert_eq!(quiet.sessions(), 0);
    assert!(matches!(
        drain(&mut events).as_slice(),
        [SyncEvent::RoundSkipped { .. }]
    ));
}

#[tokio::test]
async fn test_clients_are_not_contacted() {
    let network = Arc::new(MemoryNetwork::new());
    let nodes = spawn_mesh(&network, 1, SyncConfig::default());
    nodes[0]
        .mesh()
        .add_node(MeshNode::new("phone", "host-phone").with_type(NodeType::Client));

    let report = nodes[0].round().await;

    assert!(report.targets.is_empty());
    assert!(nodes[0].mesh().contains("phone"));
}

#[tokio::test]
async fn test_unreachable_peer_is_marked_then_recovers() {
    let network = Arc::new(MemoryNetwork::new());
    let nodes = spawn_mesh(&network, 2, SyncConfig::default());
    gossip_until_converged(&nodes, 10).await.unwrap();
    let (a, b) = (&nodes[0], &nodes[1]);

    network.set_fault(&endpoint(1), Fault::Unreachable);
    a.mesh().set_description(&a.key, "changed").unwrap();
    let mut events = a.syncer.subscribe();

    let report = a.round().await;

    assert_eq!(report.failures, 1);
    assert!(a.mesh().is_marked(&b.key));
    assert!(drain(&mut events)
        .iter()
        .any(|e| matches!(e, SyncEvent::PeerMarked { peer, .. } if peer == &b.key)));

    // Marked peers drop out of fan-out
    assert_eq!(a.round().await.sessions(), 0);

    // b comes back and refreshes its record
    network.clear_fault(&endpoint(1));
    b.syncer.keep_alive();
    let report = b.round().await;

    assert_eq!(report.failures, 0);
    assert!(!a.mesh().is_marked(&b.key));
    assert!(a.mesh().get_peers().contains(&b.key));
}

#[tokio::test]
async fn test_inbound_session_clears_mark() {
    let network = Arc::new(MemoryNetwork::new());
    let nodes = spawn_mesh(&network, 2, SyncConfig::default());
    gossip_until_converged(&nodes, 10).await.unwrap();
    let (a, b) = (&nodes[0], &nodes[1]);

    network.set_fault(&endpoint(1), Fault::Unreachable);
    a.mesh().set_description(&a.key, "changed").unwrap();
    a.round().await;
    assert!(a.mesh().is_marked(&b.key));

    // b reaches a without refreshing its own record
    network.clear_fault(&endpoint(1));
    let merged = b.syncer.sync_mesh(&b.mesh(), &a.key).await.unwrap();
    assert_eq!(merged, 1);

    // a's side of the session finishes on its own task
    for _ in 0..50 {
        if !a.mesh().is_marked(&b.key) {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert!(!a.mesh().is_marked(&b.key));
    assert!(a.mesh().get_peers().contains(&b.key));
}

#[tokio::test]
async fn test_silent_peer_times_out() {
    let network = Arc::new(MemoryNetwork::new());
    let config = SyncConfigBuilder::new().sync_timeout(50).build();
    let nodes = spawn_mesh(&network, 2, config);
    gossip_until_converged(&nodes, 10).await.unwrap();

    network.set_fault(&endpoint(1), Fault::Silent);
    nodes[0].mesh().set_alias(&nodes[0].key, "a").unwrap();
    let mut events = nodes[0].syncer.subscribe();

    let report = nodes[0].round().await;

    assert_eq!(report.failures, 1);
    assert!(nodes[0].mesh().is_marked(&nodes[1].key));
    assert!(drain(&mut events)
        .iter()
        .any(|e| matches!(e, SyncEvent::SyncFailed { error, .. } if error.contains("timed out"))));
}

#[tokio::test]
async fn test_session_for_unknown_mesh_fails() {
    let network = Arc::new(MemoryNetwork::new());
    let nodes = spawn_mesh(&network, 2, SyncConfig::default());

    let other = MeshDirectory::new("mesh-2", nodes[1].key.clone());
    other.add_node(MeshNode::new(nodes[0].key.clone(), endpoint(0)));

    let result = nodes[1].syncer.sync_mesh(&other, &nodes[0].key).await;
    assert!(matches!(result, Err(SdkError::Network(_))));
}

#[tokio::test]
async fn test_session_for_unknown_node_fails() {
    let network = Arc::new(MemoryNetwork::new());
    let nodes = spawn_mesh(&network, 1, SyncConfig::default());

    let result = nodes[0].syncer.sync_mesh(&nodes[0].mesh(), "ghost").await;
    assert!(matches!(result, Err(SdkError::NodeNotFound(_))));
}
