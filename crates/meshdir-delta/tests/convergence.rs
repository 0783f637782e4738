//! Convergence tests for the delta handshake
//!
//! These tests verify that replicas converge under various network
//! conditions including message loss, duplication, and reordering, and
//! that removals and re-adds survive the trip.

use meshdir_core::hash::key_hash;
use meshdir_core::twophase::TwoPhaseMap;
use meshdir_delta::anti_entropy::{AntiEntropyCluster, NetworkConfig};
use meshdir_delta::syncer::{run_session, SyncPhase, TwoPhaseSyncer};
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::sync::Arc;

// ============================================================================
// Network Conditions
// ============================================================================

#[test]
fn test_convergence_perfect_network() {
    let mut cluster: AntiEntropyCluster<String> =
        AntiEntropyCluster::new(3, NetworkConfig::default());

    for i in 0..3 {
        cluster.put(i, &format!("node-{}", i), format!("10.0.0.{}", i));
    }

    cluster.full_sync_round();

    assert!(cluster.is_converged());
    assert_eq!(cluster.replica(0).len(), 3);
}

#[test]
fn test_convergence_with_loss() {
    let mut cluster: AntiEntropyCluster<u32> =
        AntiEntropyCluster::new(4, NetworkConfig::lossy(0.3));

    for i in 0..4 {
        cluster.put(i, &format!("node-{}", i), i as u32);
    }

    let rounds = cluster.sync_until_converged(100);

    assert!(rounds.is_some(), "Failed to converge under loss");
    assert_eq!(cluster.replica(0).len(), 4);
    assert!(cluster.network().lost_count() > 0);
}

#[test]
fn test_convergence_with_duplication() {
    let mut cluster: AntiEntropyCluster<u32> =
        AntiEntropyCluster::new(3, NetworkConfig::with_dups(0.8));

    for i in 0..3 {
        cluster.put(i, &format!("node-{}", i), i as u32 * 100);
    }

    // Duplicates carry identical payloads, so one round is enough
    let stats = cluster.full_sync_round();

    assert!(cluster.is_converged());
    assert_eq!(stats.failures, 0);
}

#[test]
fn test_convergence_chaotic_network() {
    let mut cluster: AntiEntropyCluster<String> =
        AntiEntropyCluster::new(5, NetworkConfig::chaotic());

    let names = ["alpha", "beta", "gamma", "delta", "epsilon"];
    for (i, name) in names.iter().enumerate() {
        cluster.put(i, name, name.to_uppercase());
    }

    assert!(cluster.sync_until_converged(100).is_some());
    assert_eq!(cluster.replica(0).len(), 5);
}

// ============================================================================
// Remove / Re-add
// ============================================================================

#[test]
fn test_remove_wins_over_older_add() {
    let mut cluster: AntiEntropyCluster<String> =
        AntiEntropyCluster::new(3, NetworkConfig::default());

    cluster.put(0, "peer", "v1".to_string());
    cluster.full_sync_round();

    cluster.remove(2, "peer");
    cluster.full_sync_round();

    assert!(cluster.is_converged());
    for i in 0..3 {
        assert!(!cluster.replica(i).contains(&"peer".to_string()));
    }
}

#[test]
fn test_readd_after_remote_remove() {
    let mut cluster: AntiEntropyCluster<String> =
        AntiEntropyCluster::new(2, NetworkConfig::default());

    cluster.put(0, "peer", "v1".to_string());
    cluster.sync_pair(0, 1);
    cluster.remove(1, "peer");
    cluster.sync_pair(0, 1);
    assert!(!cluster.replica(0).contains(&"peer".to_string()));

    // Replica 0 has learned the removal stamp, so its re-add is newer
    cluster.put(0, "peer", "v2".to_string());
    cluster.sync_pair(0, 1);

    assert!(cluster.is_converged());
    assert_eq!(
        cluster.replica(1).get(&"peer".to_string()),
        Some("v2".to_string())
    );
}

#[test]
fn test_later_write_wins_across_replicas() {
    let mut cluster: AntiEntropyCluster<String> =
        AntiEntropyCluster::new(2, NetworkConfig::default());

    cluster.put(1, "peer", "old".to_string());
    cluster.put(0, "other", "x".to_string());
    cluster.put(0, "peer", "new".to_string());

    cluster.sync_pair(0, 1);

    assert!(cluster.is_converged());
    assert_eq!(
        cluster.replica(1).get(&"peer".to_string()),
        Some("new".to_string())
    );
}

// ============================================================================
// Randomized Workloads
// ============================================================================

#[test]
fn test_random_gossip_converges() {
    let mut rng = rand::rngs::StdRng::seed_from_u64(12345);
    let mut cluster: AntiEntropyCluster<u32> =
        AntiEntropyCluster::new(6, NetworkConfig::lossy(0.1));
    let replicas: Vec<usize> = (0..6).collect();

    for step in 0..200u32 {
        let idx = *replicas.choose(&mut rng).unwrap();
        let key = format!("r{}-k{}", idx, rng.gen_range(0..8));
        if rng.gen_bool(0.2) {
            cluster.remove(idx, &key);
        } else {
            cluster.put(idx, &key, step);
        }

        if step % 10 == 0 {
            let pair: Vec<usize> = replicas.choose_multiple(&mut rng, 2).copied().collect();
            cluster.sync_pair(pair[0], pair[1]);
        }
    }

    assert!(cluster.sync_until_converged(100).is_some());

    let expected = cluster.replica(0).as_map();
    for i in 1..6 {
        assert_eq!(cluster.replica(i).as_map(), expected);
    }
}

#[test]
fn test_delta_sessions_ship_less_than_full_state() {
    let a = Arc::new(TwoPhaseMap::<String, String>::new(key_hash("a")));
    let b = Arc::new(TwoPhaseMap::<String, String>::new(key_hash("b")));

    for i in 0..100 {
        a.put(&format!("peer-{}", i), "endpoint".to_string());
    }
    run_session(&mut TwoPhaseSyncer::new(a.clone()), &mut TwoPhaseSyncer::new(b.clone()));

    a.put(&"peer-new".to_string(), "endpoint".to_string());
    let mut left = TwoPhaseSyncer::new(a.clone());
    let mut right = TwoPhaseSyncer::new(b.clone());
    run_session(&mut left, &mut right);

    assert_eq!(right.merged(), 1);
    assert_eq!(left.merged(), 0);
    assert_eq!(left.phase(), SyncPhase::Finished);
    assert_eq!(a.snapshot(), b.snapshot());
}
