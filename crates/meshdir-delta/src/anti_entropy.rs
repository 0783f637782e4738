//! Anti-entropy over the delta handshake
//!
//! A small in-process harness that runs [`TwoPhaseSyncer`] sessions between
//! replicas across a simulated network. Messages can be lost, duplicated or
//! reordered; the handshake tolerates all three because a missing or
//! unreadable message is treated as empty and the next session picks up
//! whatever was skipped.
//!
//! # Session flow
//!
//! ```text
//! for each step:
//!     a.generate_message() --net--> b.recv_message()
//!     b.generate_message() --net--> a.recv_message()
//! until neither side has more to send
//! ```

use crate::syncer::TwoPhaseSyncer;
use meshdir_core::hash::key_hash;
use meshdir_core::twophase::TwoPhaseMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::trace;

/// A handshake message in flight between two replicas.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionMessage {
    pub from: usize,
    pub to: usize,
    pub payload: Vec<u8>,
}

/// Network configuration for simulation
#[derive(Debug, Clone, Default)]
pub struct NetworkConfig {
    /// Probability of message loss (0.0 - 1.0)
    pub loss_rate: f64,
    /// Probability of message duplication (0.0 - 1.0)
    pub dup_rate: f64,
    /// Probability of message reordering (0.0 - 1.0)
    pub reorder_rate: f64,
}

impl NetworkConfig {
    pub fn lossy(loss_rate: f64) -> Self {
        Self {
            loss_rate,
            ..Default::default()
        }
    }

    pub fn with_dups(dup_rate: f64) -> Self {
        Self {
            dup_rate,
            ..Default::default()
        }
    }

    /// Loss, duplication and reordering all at once
    pub fn chaotic() -> Self {
        Self {
            loss_rate: 0.1,
            dup_rate: 0.2,
            reorder_rate: 0.3,
        }
    }
}

/// Deterministic lossy network
#[derive(Debug)]
pub struct NetworkSimulator {
    in_flight: VecDeque<SessionMessage>,
    lost: usize,
    delivered: usize,
    config: NetworkConfig,
    rng_state: u64,
}

impl NetworkSimulator {
    pub fn new(config: NetworkConfig) -> Self {
        Self::with_seed(config, 12345)
    }

    pub fn with_seed(config: NetworkConfig, seed: u64) -> Self {
        Self {
            in_flight: VecDeque::new(),
            lost: 0,
            delivered: 0,
            config,
            rng_state: seed,
        }
    }

    /// Simple LCG random number generator
    fn next_random(&mut self) -> f64 {
        self.rng_state = self.rng_state.wrapping_mul(1103515245).wrapping_add(12345);
        ((self.rng_state >> 16) & 0x7fff) as f64 / 32768.0
    }

    pub fn send(&mut self, msg: SessionMessage) {
        if self.next_random() < self.config.loss_rate {
            trace!(from = msg.from, to = msg.to, "message lost");
            self.lost += 1;
            return;
        }

        if self.next_random() < self.config.dup_rate {
            self.in_flight.push_back(msg.clone());
        }

        self.in_flight.push_back(msg);
        if self.in_flight.len() > 1 && self.next_random() < self.config.reorder_rate {
            let last = self.in_flight.len() - 1;
            let pos = ((self.next_random() * last as f64) as usize).min(last);
            self.in_flight.swap(pos, last);
        }
    }

    pub fn receive(&mut self) -> Option<SessionMessage> {
        let msg = self.in_flight.pop_front()?;
        self.delivered += 1;
        Some(msg)
    }

    pub fn is_empty(&self) -> bool {
        self.in_flight.is_empty()
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn lost_count(&self) -> usize {
        self.lost
    }

    pub fn delivered_count(&self) -> usize {
        self.delivered
    }
}

/// Outcome of one session between two replicas
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Buckets merged by either side
    pub merged: usize,
    /// Decode failures and missing messages on either side
    pub failures: usize,
}

/// A set of replicas that gossip through a [`NetworkSimulator`]
pub struct AntiEntropyCluster<D> {
    replicas: Vec<Arc<TwoPhaseMap<String, D>>>,
    network: NetworkSimulator,
}

impl<D> AntiEntropyCluster<D>
where
    D: Clone + Default + Serialize + DeserializeOwned + PartialEq,
{
    /// Create a cluster of `n` empty replicas
    pub fn new(n: usize, config: NetworkConfig) -> Self {
        let replicas = (0..n)
            .map(|i| Arc::new(TwoPhaseMap::new(key_hash(format!("replica_{}", i)))))
            .collect();
        Self {
            replicas,
            network: NetworkSimulator::new(config),
        }
    }

    pub fn replica(&self, idx: usize) -> &Arc<TwoPhaseMap<String, D>> {
        &self.replicas[idx]
    }

    pub fn network(&self) -> &NetworkSimulator {
        &self.network
    }

    pub fn put(&self, idx: usize, key: &str, value: D) -> u64 {
        self.replicas[idx].put(&key.to_string(), value)
    }

    pub fn remove(&self, idx: usize, key: &str) -> u64 {
        self.replicas[idx].remove(&key.to_string())
    }

    /// Run one handshake between replicas `a` and `b`.
    pub fn sync_pair(&mut self, a: usize, b: usize) -> SessionStats {
        let mut left = TwoPhaseSyncer::new(self.replicas[a].clone());
        let mut right = TwoPhaseSyncer::new(self.replicas[b].clone());

        loop {
            let (to_right, left_more) = left.generate_message();
            let (to_left, right_more) = right.generate_message();
            if !left_more && !right_more {
                break;
            }

            if left_more {
                self.network.send(SessionMessage { from: a, to: b, payload: to_right });
            }
            if right_more {
                self.network.send(SessionMessage { from: b, to: a, payload: to_left });
            }

            while let Some(msg) = self.network.receive() {
                let target = if msg.to == a { &mut left } else { &mut right };
                // A late duplicate after the target finished is dropped.
                let _ = target.recv_message(msg.payload);
            }
        }

        left.complete();
        right.complete();

        SessionStats {
            merged: left.merged() + right.merged(),
            failures: left.failures().len() + right.failures().len(),
        }
    }

    /// Every pair of replicas runs one session.
    pub fn full_sync_round(&mut self) -> SessionStats {
        let n = self.replicas.len();
        let mut total = SessionStats::default();
        for a in 0..n {
            for b in (a + 1)..n {
                let stats = self.sync_pair(a, b);
                total.merged += stats.merged;
                total.failures += stats.failures;
            }
        }
        total
    }

    /// Run rounds until converged, up to `max_rounds`. Returns the number
    /// of rounds used, or `None` if the cluster never converged.
    pub fn sync_until_converged(&mut self, max_rounds: usize) -> Option<usize> {
        for round in 0..max_rounds {
            if self.is_converged() {
                return Some(round);
            }
            self.full_sync_round();
        }
        self.is_converged().then_some(max_rounds)
    }

    pub fn is_converged(&self) -> bool {
        let Some(first) = self.replicas.first() else {
            return true;
        };
        let first = first.snapshot();
        self.replicas.iter().skip(1).all(|r| r.snapshot() == first)
    }

    pub fn len(&self) -> usize {
        self.replicas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.replicas.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_simulator_basic() {
        let mut net = NetworkSimulator::new(NetworkConfig::default());
        net.send(SessionMessage { from: 0, to: 1, payload: vec![42] });
        assert_eq!(net.in_flight_count(), 1);

        let msg = net.receive().unwrap();
        assert_eq!(msg.payload, vec![42]);
        assert!(net.is_empty());
        assert_eq!(net.delivered_count(), 1);
    }

    #[test]
    fn test_network_drops_everything_at_full_loss() {
        let mut net = NetworkSimulator::new(NetworkConfig::lossy(1.0));
        for i in 0..10 {
            net.send(SessionMessage { from: 0, to: 1, payload: vec![i] });
        }
        assert!(net.is_empty());
        assert_eq!(net.lost_count(), 10);
    }

    #[test]
    fn test_cluster_basic_convergence() {
        let mut cluster: AntiEntropyCluster<String> =
            AntiEntropyCluster::new(3, NetworkConfig::default());
        cluster.put(0, "a", "1".to_string());
        cluster.put(1, "b", "2".to_string());
        assert!(!cluster.is_converged());

        cluster.full_sync_round();

        assert!(cluster.is_converged());
        for i in 0..3 {
            assert!(cluster.replica(i).contains(&"a".to_string()));
            assert!(cluster.replica(i).contains(&"b".to_string()));
        }
    }

    #[test]
    fn test_removal_propagates() {
        let mut cluster: AntiEntropyCluster<String> =
            AntiEntropyCluster::new(2, NetworkConfig::default());
        cluster.put(0, "k", "v".to_string());
        cluster.sync_pair(0, 1);
        assert!(cluster.replica(1).contains(&"k".to_string()));

        cluster.remove(1, "k");
        cluster.sync_pair(0, 1);
        assert!(!cluster.replica(0).contains(&"k".to_string()));
        assert!(cluster.is_converged());
    }

    #[test]
    fn test_total_loss_records_failures_but_keeps_state() {
        let mut cluster: AntiEntropyCluster<String> =
            AntiEntropyCluster::new(2, NetworkConfig::lossy(1.0));
        cluster.put(0, "a", "1".to_string());

        let stats = cluster.sync_pair(0, 1);

        assert_eq!(stats.merged, 0);
        assert!(stats.failures > 0);
        assert!(cluster.replica(0).contains(&"a".to_string()));
        assert!(!cluster.replica(1).contains(&"a".to_string()));
    }

    #[test]
    fn test_convergence_under_loss() {
        let mut cluster: AntiEntropyCluster<u32> =
            AntiEntropyCluster::new(3, NetworkConfig::lossy(0.3));
        for i in 0..3 {
            cluster.put(i, &format!("key-{}", i), i as u32);
        }

        assert!(cluster.sync_until_converged(100).is_some());
    }

    #[test]
    fn test_sync_is_idempotent() {
        let mut cluster: AntiEntropyCluster<String> =
            AntiEntropyCluster::new(2, NetworkConfig::default());
        cluster.put(0, "a", "1".to_string());
        cluster.full_sync_round();
        let stats = cluster.full_sync_round();
        assert_eq!(stats.merged, 0);
        assert_eq!(stats.failures, 0);
    }
}
