//! Epidemic sync scheduling.
//!
//! Each round, per mesh:
//!
//! 1. skip if nothing changed and the infection countdown is spent
//! 2. apply the mesh's outgoing configuration
//! 3. pick `branch_rate` peers from the local band, plus sometimes one
//!    inter-cluster peer
//! 4. run one handshake per target concurrently, each under a deadline
//! 5. tick the infection countdown and record the converged hash
//!
//! Failed sessions go to a [`SyncErrorHandler`]; the default one marks
//! peers that could not be reached so they drop out of fan-out until their
//! record is refreshed.

use crate::directory::MeshDirectory;
use crate::error::{Result, SdkError};
use crate::network::{ConnectionManager, SyncStream};
use crate::node::MeshNode;
use crate::partition::ConnectionClusterer;
use crate::registry::MeshRegistry;
use futures::future::join_all;
use meshdir_delta::TwoPhaseSyncer;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Configuration for sync behavior.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// How often a round runs (in milliseconds).
    pub sync_interval_ms: u64,
    /// Deadline for one session (in milliseconds).
    pub sync_timeout_ms: u64,
    /// Peers contacted from the local band per round.
    pub branch_rate: usize,
    /// Rounds to keep gossiping after the last change.
    pub infection_count: u32,
    /// Band size; must be a power of two.
    pub cluster_size: usize,
    /// Chance of one extra inter-cluster contact per round.
    pub inter_cluster_chance: f64,
    /// How often the local node refreshes its own timestamp (in milliseconds).
    pub keep_alive_interval_ms: u64,
    /// How often stale records are pruned (in milliseconds).
    pub prune_interval_ms: u64,
    /// Standard deviations below the mean stamp at which a record is stale.
    pub stale_deviations: f64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sync_interval_ms: 1000,
            sync_timeout_ms: 1000,
            branch_rate: 3,
            infection_count: 3,
            cluster_size: 32,
            inter_cluster_chance: 0.15,
            keep_alive_interval_ms: 10_000,
            prune_interval_ms: 60_000,
            stale_deviations: 3.0,
        }
    }
}

impl SyncConfig {
    pub fn validate(&self) -> Result<()> {
        if self.infection_count == 0 {
            return Err(SdkError::InvalidConfig(
                "infection_count must be at least 1".to_string(),
            ));
        }
        if !self.cluster_size.is_power_of_two() {
            return Err(SdkError::InvalidConfig(format!(
                "cluster_size must be a power of two, got {}",
                self.cluster_size
            )));
        }
        if !(0.0..=1.0).contains(&self.inter_cluster_chance) {
            return Err(SdkError::InvalidConfig(format!(
                "inter_cluster_chance must be in [0, 1], got {}",
                self.inter_cluster_chance
            )));
        }
        if self.sync_interval_ms == 0 || self.keep_alive_interval_ms == 0 || self.prune_interval_ms == 0 {
            return Err(SdkError::InvalidConfig("intervals must be non-zero".to_string()));
        }
        Ok(())
    }

    /// Parse and validate a JSON config. Missing fields take defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: SyncConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_timeout_ms)
    }
}

/// Builder for sync configuration.
pub struct SyncConfigBuilder {
    config: SyncConfig,
}

impl SyncConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: SyncConfig::default(),
        }
    }

    pub fn sync_interval(mut self, ms: u64) -> Self {
        self.config.sync_interval_ms = ms;
        self
    }

    pub fn sync_timeout(mut self, ms: u64) -> Self {
        self.config.sync_timeout_ms = ms;
        self
    }

    pub fn branch_rate(mut self, rate: usize) -> Self {
        self.config.branch_rate = rate;
        self
    }

    pub fn infection_count(mut self, count: u32) -> Self {
        self.config.infection_count = count;
        self
    }

    pub fn cluster_size(mut self, size: usize) -> Self {
        self.config.cluster_size = size;
        self
    }

    pub fn inter_cluster_chance(mut self, chance: f64) -> Self {
        self.config.inter_cluster_chance = chance;
        self
    }

    pub fn keep_alive_interval(mut self, ms: u64) -> Self {
        self.config.keep_alive_interval_ms = ms;
        self
    }

    pub fn prune_interval(mut self, ms: u64) -> Self {
        self.config.prune_interval_ms = ms;
        self
    }

    pub fn stale_deviations(mut self, deviations: f64) -> Self {
        self.config.stale_deviations = deviations;
        self
    }

    pub fn build(self) -> SyncConfig {
        self.config
    }
}

impl Default for SyncConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Events emitted by the scheduler.
#[derive(Clone, Debug, PartialEq)]
pub enum SyncEvent {
    /// Nothing changed and the infection countdown is spent.
    RoundSkipped { mesh_id: String },
    /// The directory moved since the last round.
    ChangesDetected { mesh_id: String },
    RoundCompleted {
        mesh_id: String,
        sessions: usize,
        failures: usize,
    },
    SyncCompleted { mesh_id: String, peer: String, merged: usize },
    SyncFailed { mesh_id: String, peer: String, error: String },
    /// A peer was flagged unreachable after a failed session.
    PeerMarked { mesh_id: String, peer: String },
}

/// Outcome of one round for one mesh.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RoundReport {
    pub skipped: bool,
    pub targets: Vec<String>,
    pub failures: usize,
}

impl RoundReport {
    pub fn sessions(&self) -> usize {
        self.targets.len()
    }
}

/// Reacts to a failed session. Returns true if the peer was marked.
pub trait SyncErrorHandler: Send + Sync {
    fn handle(&self, mesh: &MeshDirectory, peer: &str, error: &SdkError) -> bool;
}

/// Marks peers whose session failed at the transport level or timed out.
#[derive(Clone, Copy, Debug, Default)]
pub struct MarkUnreachable;

impl SyncErrorHandler for MarkUnreachable {
    fn handle(&self, mesh: &MeshDirectory, peer: &str, error: &SdkError) -> bool {
        match error {
            SdkError::Network(_) | SdkError::Timeout { .. } => {
                mesh.mark(peer);
                true
            }
            _ => false,
        }
    }
}

/// Pushes a mesh's computed routes and peers to the host before fan-out.
pub trait MeshConfigApplier: Send + Sync {
    fn apply(&self, mesh: &MeshDirectory) -> Result<()>;
}

/// Applier for nodes with nothing to configure.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopApplier;

impl MeshConfigApplier for NoopApplier {
    fn apply(&self, _mesh: &MeshDirectory) -> Result<()> {
        Ok(())
    }
}

/// Run the handshake over `stream` until both sides are done.
///
/// Once the handshake is over each side sends an empty closing frame and
/// waits for the peer's, so a successful return means both sides merged.
/// Decode failures do not stop the exchange; the first one is returned
/// after the session completes so the caller can count it as failed.
pub async fn drive_session(
    syncer: &mut TwoPhaseSyncer<String, MeshNode>,
    stream: &mut dyn SyncStream,
) -> Result<usize> {
    loop {
        let (message, more) = syncer.generate_message();
        if !more {
            break;
        }
        stream.send(message).await?;
        let reply = stream.receive().await?;
        syncer.recv_message(reply)?;
    }
    syncer.complete();

    stream.send(Vec::new()).await?;
    stream.receive().await?;

    if let Some(failure) = syncer.take_failures().into_iter().next() {
        return Err(SdkError::Decode(failure));
    }
    Ok(syncer.merged())
}

/// Answer an inbound session for `mesh_id` opened by `initiator`.
///
/// A successful session proves the initiator is reachable again, so any
/// local mark on it is cleared.
pub async fn serve_session<S: SyncStream>(
    registry: Arc<MeshRegistry>,
    mesh_id: &str,
    initiator: &str,
    mut stream: S,
) -> Result<usize> {
    let mesh = registry.get(mesh_id)?;
    let mut syncer = mesh.syncer();
    let merged = drive_session(&mut syncer, &mut stream).await?;
    if mesh.is_marked(initiator) {
        info!(mesh = %mesh_id, peer = %initiator, "peer reachable again");
        mesh.unmark(initiator);
    }
    debug!(mesh = %mesh_id, merged, "served session");
    Ok(merged)
}

/// The epidemic scheduler for every mesh in a registry.
pub struct Syncer {
    registry: Arc<MeshRegistry>,
    connections: Arc<dyn ConnectionManager>,
    clusterer: ConnectionClusterer,
    config: SyncConfig,
    error_handler: Arc<dyn SyncErrorHandler>,
    applier: Arc<dyn MeshConfigApplier>,
    infection: Mutex<HashMap<String, u32>>,
    sync_count: AtomicU64,
    rng: Mutex<StdRng>,
    events: broadcast::Sender<SyncEvent>,
}

impl Syncer {
    pub fn new(
        registry: Arc<MeshRegistry>,
        connections: Arc<dyn ConnectionManager>,
        config: SyncConfig,
    ) -> Result<Self> {
        config.validate()?;
        let clusterer = ConnectionClusterer::new(config.cluster_size)?;
        let (events, _) = broadcast::channel(100);
        Ok(Self {
            registry,
            connections,
            clusterer,
            config,
            error_handler: Arc::new(MarkUnreachable),
            applier: Arc::new(NoopApplier),
            infection: Mutex::new(HashMap::new()),
            sync_count: AtomicU64::new(0),
            rng: Mutex::new(StdRng::from_entropy()),
            events,
        })
    }

    pub fn with_error_handler(mut self, handler: Arc<dyn SyncErrorHandler>) -> Self {
        self.error_handler = handler;
        self
    }

    pub fn with_applier(mut self, applier: Arc<dyn MeshConfigApplier>) -> Self {
        self.applier = applier;
        self
    }

    /// Make peer selection reproducible.
    pub fn with_seed(self, seed: u64) -> Self {
        *self.rng.lock() = StdRng::seed_from_u64(seed);
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<MeshRegistry> {
        &self.registry
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Rounds that did work, across all meshes.
    pub fn sync_count(&self) -> u64 {
        self.sync_count.load(Ordering::Relaxed)
    }

    /// Remaining infection rounds for a mesh.
    pub fn infection(&self, mesh_id: &str) -> u32 {
        self.infection.lock().get(mesh_id).copied().unwrap_or(0)
    }

    /// One round for one mesh.
    pub async fn sync_round(&self, mesh_id: &str) -> Result<RoundReport> {
        let mesh = self.registry.get(mesh_id)?;
        let infection = self.infection(mesh_id);
        let changed = mesh.has_changes();

        if !changed && infection == 0 {
            debug!(mesh = %mesh_id, "no changes, skipping round");
            self.emit(SyncEvent::RoundSkipped {
                mesh_id: mesh_id.to_string(),
            });
            return Ok(RoundReport {
                skipped: true,
                ..Default::default()
            });
        }

        if changed {
            self.emit(SyncEvent::ChangesDetected {
                mesh_id: mesh_id.to_string(),
            });
        }

        if let Err(e) = self.applier.apply(&mesh) {
            warn!(mesh = %mesh_id, error = %e, "failed to apply mesh configuration");
        }

        let targets = self.select_targets(&mesh.get_peers(), mesh.local_key());
        debug!(mesh = %mesh_id, ?targets, infection, "gossiping");

        let sessions = targets.iter().map(|peer| self.sync_peer(&mesh, peer));
        let failures = join_all(sessions)
            .await
            .into_iter()
            .filter(|r| r.is_err())
            .count();

        let ceiling = self.config.infection_count;
        self.infection
            .lock()
            .insert(mesh_id.to_string(), (infection + ceiling - 1) % ceiling);
        mesh.save_changes();
        self.sync_count.fetch_add(1, Ordering::Relaxed);

        self.emit(SyncEvent::RoundCompleted {
            mesh_id: mesh_id.to_string(),
            sessions: targets.len(),
            failures,
        });

        Ok(RoundReport {
            skipped: false,
            targets,
            failures,
        })
    }

    /// One round for every mesh, concurrently.
    pub async fn sync_all(&self) -> Vec<Result<RoundReport>> {
        let mesh_ids = self.registry.mesh_ids();
        join_all(mesh_ids.iter().map(|id| self.sync_round(id))).await
    }

    /// Run one handshake against the node stored under `peer`.
    pub async fn sync_mesh(&self, mesh: &MeshDirectory, peer: &str) -> Result<usize> {
        let endpoint = mesh.get_node(peer)?.host_endpoint;
        let mut stream = self
            .connections
            .open(&endpoint, mesh.mesh_id(), self.registry.local_key())
            .await?;
        let mut syncer = mesh.syncer();
        drive_session(&mut syncer, stream.as_mut()).await
    }

    /// Refresh the local node's timestamp in every mesh.
    pub fn keep_alive(&self) {
        for mesh in self.registry.meshes() {
            if let Err(e) = mesh.update_timestamp(self.registry.local_key()) {
                warn!(mesh = %mesh.mesh_id(), error = %e, "keep-alive failed");
            }
        }
    }

    /// Prune stale records in every mesh. Returns how many went away.
    pub fn prune(&self) -> usize {
        self.registry
            .meshes()
            .iter()
            .map(|mesh| mesh.prune(self.config.stale_deviations).len())
            .sum()
    }

    /// Drive rounds, keep-alives and pruning until `shutdown` flips.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut sync_tick = tokio::time::interval(self.config.sync_interval());
        let mut keep_alive_tick =
            tokio::time::interval(Duration::from_millis(self.config.keep_alive_interval_ms));
        let mut prune_tick = tokio::time::interval(Duration::from_millis(self.config.prune_interval_ms));
        sync_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        keep_alive_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        prune_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(node = %self.registry.local_key(), "sync scheduler started");
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!(node = %self.registry.local_key(), "sync scheduler shutting down");
                        break;
                    }
                }
                _ = sync_tick.tick() => {
                    for result in self.sync_all().await {
                        if let Err(e) = result {
                            warn!(error = %e, "sync round failed");
                        }
                    }
                }
                _ = keep_alive_tick.tick() => self.keep_alive(),
                _ = prune_tick.tick() => {
                    self.prune();
                }
            }
        }
    }

    fn select_targets(&self, peers: &[String], local: &str) -> Vec<String> {
        let neighbours: Vec<String> = self
            .clusterer
            .get_neighbours(peers, local)
            .into_iter()
            .filter(|peer| peer != local)
            .collect();

        let mut rng = self.rng.lock();
        let mut targets: Vec<String> = neighbours
            .choose_multiple(&mut *rng, self.config.branch_rate)
            .cloned()
            .collect();

        if peers.len() > self.clusterer.cluster_size() && rng.gen_bool(self.config.inter_cluster_chance) {
            if let Some(target) = self.clusterer.get_inter_cluster(peers, local, &mut *rng) {
                if target != local && !targets.contains(&target) {
                    targets.push(target);
                }
            }
        }
        targets
    }

    async fn sync_peer(&self, mesh: &MeshDirectory, peer: &str) -> Result<usize> {
        let timeout_ms = self.config.sync_timeout_ms;
        let result = match tokio::time::timeout(self.config.sync_timeout(), self.sync_mesh(mesh, peer)).await {
            Ok(result) => result,
            Err(_) => Err(SdkError::Timeout {
                peer: peer.to_string(),
                timeout_ms,
            }),
        };

        match &result {
            Ok(merged) => {
                if mesh.is_marked(peer) {
                    mesh.unmark(peer);
                }
                self.emit(SyncEvent::SyncCompleted {
                    mesh_id: mesh.mesh_id().to_string(),
                    peer: peer.to_string(),
                    merged: *merged,
                });
            }
            Err(e) => {
                warn!(mesh = %mesh.mesh_id(), %peer, error = %e, "sync failed");
                self.emit(SyncEvent::SyncFailed {
                    mesh_id: mesh.mesh_id().to_string(),
                    peer: peer.to_string(),
                    error: e.to_string(),
                });
                if self.error_handler.handle(mesh, peer, e) {
                    info!(mesh = %mesh.mesh_id(), %peer, "marked peer unreachable");
                    self.emit(SyncEvent::PeerMarked {
                        mesh_id: mesh.mesh_id().to_string(),
                        peer: peer.to_string(),
                    });
                }
            }
        }
        result
    }

    fn emit(&self, event: SyncEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::MemoryNetwork;

    fn syncer(config: SyncConfig) -> Syncer {
        let registry = Arc::new(MeshRegistry::new("a"));
        registry.create_mesh("m1", MeshNode::new("a", "host-a"));
        Syncer::new(registry, Arc::new(MemoryNetwork::new()), config)
            .unwrap()
            .with_seed(42)
    }

    #[test]
    fn test_sync_config_builder() {
        let config = SyncConfigBuilder::new()
            .sync_interval(500)
            .sync_timeout(250)
            .branch_rate(2)
            .infection_count(5)
            .cluster_size(8)
            .inter_cluster_chance(0.5)
            .keep_alive_interval(100)
            .prune_interval(200)
            .stale_deviations(2.0)
            .build();

        assert_eq!(config.sync_interval_ms, 500);
        assert_eq!(config.sync_timeout_ms, 250);
        assert_eq!(config.branch_rate, 2);
        assert_eq!(config.infection_count, 5);
        assert_eq!(config.cluster_size, 8);
        assert_eq!(config.keep_alive_interval_ms, 100);
        assert_eq!(config.prune_interval_ms, 200);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let bad = [
            SyncConfigBuilder::new().cluster_size(12).build(),
            SyncConfigBuilder::new().infection_count(0).build(),
            SyncConfigBuilder::new().inter_cluster_chance(1.5).build(),
            SyncConfigBuilder::new().sync_interval(0).build(),
        ];
        for config in bad {
            assert!(matches!(config.validate(), Err(SdkError::InvalidConfig(_))));
        }
    }

    #[test]
    fn test_config_from_json_uses_defaults() {
        let config = SyncConfig::from_json(r#"{ "branch_rate": 5 }"#).unwrap();
        assert_eq!(config.branch_rate, 5);
        assert_eq!(config.cluster_size, 32);

        assert!(matches!(
            SyncConfig::from_json(r#"{ "cluster_size": 3 }"#),
            Err(SdkError::InvalidConfig(_))
        ));
        assert!(matches!(
            SyncConfig::from_json("not json"),
            Err(SdkError::Serialization(_))
        ));
    }

    #[test]
    fn test_select_targets_excludes_self_and_respects_branch_rate() {
        let syncer = syncer(SyncConfigBuilder::new().branch_rate(2).cluster_size(4).build());
        let peers: Vec<String> = ["a", "b", "c", "d"].iter().map(|s| s.to_string()).collect();

        for _ in 0..20 {
            let targets = syncer.select_targets(&peers, "a");
            assert_eq!(targets.len(), 2);
            assert!(!targets.contains(&"a".to_string()));
        }
    }

    #[test]
    fn test_select_targets_adds_inter_cluster() {
        let syncer = syncer(
            SyncConfigBuilder::new()
                .branch_rate(1)
                .cluster_size(2)
                .inter_cluster_chance(1.0)
                .build(),
        );
        let peers: Vec<String> = (0..8).map(|i| format!("n{}", i)).collect();

        let targets = syncer.select_targets(&peers, "n0");
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0], "n1");
        assert!(!["n0", "n1"].contains(&targets[1].as_str()));
    }

    #[tokio::test]
    async fn test_round_skipped_without_changes() {
        let syncer = syncer(SyncConfig::default());
        syncer.registry().get("m1").unwrap().save_changes();

        let report = syncer.sync_round("m1").await.unwrap();
        assert!(report.skipped);
        assert_eq!(report.sessions(), 0);
        assert_eq!(syncer.sync_count(), 0);
    }

    #[tokio::test]
    async fn test_infection_counts_down() {
        let syncer = syncer(SyncConfigBuilder::new().infection_count(3).build());
        let mut events = syncer.subscribe();

        // The freshly created mesh has unsaved changes
        let report = syncer.sync_round("m1").await.unwrap();
        assert!(!report.skipped);
        assert_eq!(syncer.infection("m1"), 2);
        assert!(matches!(events.recv().await, Ok(SyncEvent::ChangesDetected { .. })));

        syncer.sync_round("m1").await.unwrap();
        assert_eq!(syncer.infection("m1"), 1);
        syncer.sync_round("m1").await.unwrap();
        assert_eq!(syncer.infection("m1"), 0);

        assert!(syncer.sync_round("m1").await.unwrap().skipped);
        assert_eq!(syncer.sync_count(), 3);
    }

    #[tokio::test]
    async fn test_unknown_mesh() {
        let syncer = syncer(SyncConfig::default());
        assert!(matches!(
            syncer.sync_round("nope").await,
            Err(SdkError::MeshNotFound(_))
        ));
    }

    #[test]
    fn test_mark_unreachable_only_on_transport_errors() {
        let mesh = MeshDirectory::new("m1", "a");
        mesh.add_node(MeshNode::new("b", "host-b"));

        assert!(!MarkUnreachable.handle(&mesh, "b", &SdkError::NodeNotFound("b".into())));
        assert!(!mesh.is_marked("b"));

        let timeout = SdkError::Timeout {
            peer: "b".into(),
            timeout_ms: 10,
        };
        assert!(MarkUnreachable.handle(&mesh, "b", &timeout));
        assert!(mesh.is_marked("b"));
    }
}
