use async_stream::stream;
use futures::future::join_all;
use futures::stream::{Stream, StreamExt};
use meshdir_sdk::prelude::*;
use meshdir_sdk::{Fault, RoundReport};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

const MESH: &str = "sim-mesh";

/// Statistics collected during a simulation
#[derive(Clone, Debug)]
pub struct SimulationStats {
    pub num_nodes: usize,
    pub mutations: usize,
    pub rounds: usize,
    pub sessions: usize,
    pub failures: usize,
    pub total_time: Duration,
    pub avg_round_time: Duration,
    pub converged: bool,
}

impl SimulationStats {
    pub fn print(&self) {
        println!("\n╔════════════════════════════════════════════════════════════╗");
        println!("║              Gossip Simulation Statistics                  ║");
        println!("╠════════════════════════════════════════════════════════════╣");
        println!("║  Number of Nodes:           {:>30} ║", self.num_nodes);
        println!("║  Directory Mutations:       {:>30} ║", self.mutations);
        println!("║  Gossip Rounds:             {:>30} ║", self.rounds);
        println!("║  Sync Sessions:             {:>30} ║", self.sessions);
        println!("║  Failed Sessions:           {:>30} ║", self.failures);
        println!("║  Total Time:                {:>29}s ║", format!("{:.3}", self.total_time.as_secs_f64()));
        println!("║  Average Round Time:        {:>28}µs ║", self.avg_round_time.as_micros());
        println!("║  Converged:                 {:>30} ║", if self.converged { "yes" } else { "NO" });
        println!("╚════════════════════════════════════════════════════════════╝");
    }
}

/// An edit a node makes to its own directory record
#[derive(Clone, Debug)]
enum Mutation {
    Describe { node: usize, text: String },
    Service { node: usize, name: String, port: u16 },
    Route { node: usize, destination: String, hops: u32 },
    KeepAlive { node: usize },
}

/// Generator of random self-edits
fn mutation_generator(num_nodes: usize, count: usize, seed: u64) -> impl Stream<Item = Mutation> {
    stream! {
        let mut rng = StdRng::seed_from_u64(seed);
        for i in 0..count {
            let node = rng.gen_range(0..num_nodes);
            yield match rng.gen_range(0..4) {
                0 => Mutation::Describe { node, text: format!("revision {}", i) },
                1 => Mutation::Service {
                    node,
                    name: format!("svc-{}", rng.gen_range(0..4)),
                    port: rng.gen_range(1024..u16::MAX),
                },
                2 => Mutation::Route {
                    node,
                    destination: format!("fd00:{:x}::/64", rng.gen_range(0..64)),
                    hops: rng.gen_range(1..4),
                },
                _ => Mutation::KeepAlive { node },
            };
        }
    }
}

struct SimNode {
    registry: Arc<MeshRegistry>,
    syncer: Arc<Syncer>,
}

impl SimNode {
    fn key(&self) -> &str {
        self.registry.local_key()
    }

    fn mesh(&self) -> Option<Arc<MeshDirectory>> {
        self.registry.get(MESH).ok()
    }

    fn apply(&self, mutation: &Mutation) -> meshdir_sdk::Result<()> {
        let mesh = self.registry.get(MESH)?;
        let key = self.key();
        match mutation {
            Mutation::Describe { text, .. } => mesh.set_description(key, text),
            Mutation::Service { name, port, .. } => mesh.add_service(key, name, &port.to_string()),
            Mutation::Route { destination, hops, .. } => {
                mesh.add_routes(key, vec![Route::new(destination.clone(), *hops).with_path(vec![MESH.to_string()])])
            }
            Mutation::KeepAlive { .. } => mesh.update_timestamp(key),
        }
    }
}

fn endpoint(i: usize) -> String {
    format!("10.0.{}.{}:7946", i / 256, i % 256)
}

/// Node 0 founds the mesh, the rest join from its snapshot.
fn build_mesh(network: &Arc<MemoryNetwork>, num_nodes: usize, config: &SyncConfig) -> meshdir_sdk::Result<Vec<SimNode>> {
    let mut nodes: Vec<SimNode> = Vec::with_capacity(num_nodes);
    for i in 0..num_nodes {
        let key = format!("pk-{:04}", i);
        let registry = Arc::new(MeshRegistry::new(key.clone()));
        let node = MeshNode::new(key, endpoint(i)).with_wg(format!("{}:51820", endpoint(i)), format!("fd00::{:x}", i + 1));

        match nodes.first().and_then(SimNode::mesh) {
            Some(founder) => {
                registry.join_mesh(MESH, &founder.save()?, node)?;
            }
            None => {
                registry.create_mesh(MESH, node);
            }
        }
        network.register(endpoint(i), registry.clone());

        let syncer = Syncer::new(registry.clone(), network.clone(), config.clone())?.with_seed(i as u64);
        nodes.push(SimNode {
            registry,
            syncer: Arc::new(syncer),
        });
    }
    Ok(nodes)
}

fn is_converged(nodes: &[SimNode]) -> bool {
    let views: Vec<Vec<MeshNode>> = nodes
        .iter()
        .map(|n| n.mesh().map(|m| m.get_nodes()).unwrap_or_default())
        .collect();
    views[0].len() == nodes.len() && views.iter().all(|v| v == &views[0])
}

/// Drive every node's round concurrently until the mesh converges.
async fn gossip(nodes: &[SimNode], max_rounds: usize, stats: &mut SimulationStats) {
    let mut round_times = Vec::new();
    while !is_converged(nodes) && stats.rounds < max_rounds {
        let round_start = Instant::now();
        let reports = join_all(nodes.iter().map(|n| n.syncer.sync_round(MESH))).await;
        round_times.push(round_start.elapsed());
        stats.rounds += 1;

        for report in reports.into_iter().flatten() {
            let RoundReport { targets, failures, .. } = report;
            stats.sessions += targets.len();
            stats.failures += failures;
        }

        if stats.rounds % 5 == 0 {
            println!("  Rounds completed: {}", stats.rounds);
        }
    }

    if !round_times.is_empty() {
        stats.avg_round_time = round_times.iter().sum::<Duration>() / round_times.len() as u32;
    }
    stats.converged = is_converged(nodes);
}

/// Gossip simulation: build a mesh, apply random edits, gossip to convergence
pub async fn simulate(num_nodes: usize, num_mutations: usize, config: SyncConfig) -> meshdir_sdk::Result<SimulationStats> {
    println!("\n╔════════════════════════════════════════════════════════════╗");
    println!("║        Gossip Simulation                                   ║");
    println!("║  Nodes: {} | Mutations: {} | Cluster: {} | Branch: {}", num_nodes, num_mutations, config.cluster_size, config.branch_rate);
    println!("╚════════════════════════════════════════════════════════════╝");

    let start = Instant::now();
    let network = Arc::new(MemoryNetwork::new());
    let nodes = build_mesh(&network, num_nodes, &config)?;

    let mut stats = SimulationStats {
        num_nodes,
        mutations: 0,
        rounds: 0,
        sessions: 0,
        failures: 0,
        total_time: Duration::ZERO,
        avg_round_time: Duration::ZERO,
        converged: false,
    };

    println!("\n[Phase 1/2] Applying directory mutations...");
    let mut mutations = Box::pin(mutation_generator(num_nodes, num_mutations, 7));
    while let Some(mutation) = mutations.next().await {
        let node = match &mutation {
            Mutation::Describe { node, .. }
            | Mutation::Service { node, .. }
            | Mutation::Route { node, .. }
            | Mutation::KeepAlive { node } => *node,
        };
        nodes[node].apply(&mutation)?;
        stats.mutations += 1;
    }
    println!("[Phase 1/2] ✓ Completed");

    println!("[Phase 2/2] Gossiping...");
    gossip(&nodes, 200, &mut stats).await;
    println!("[Phase 2/2] ✓ Completed");

    stats.total_time = start.elapsed();
    Ok(stats)
}

/// Some nodes drop off the network mid-run and come back later
pub async fn simulate_partition(num_nodes: usize, offline: usize, config: SyncConfig) -> meshdir_sdk::Result<SimulationStats> {
    println!("\n╔════════════════════════════════════════════════════════════╗");
    println!("║        Partition Recovery                                  ║");
    println!("║  Nodes: {} | Offline: {}", num_nodes, offline);
    println!("╚════════════════════════════════════════════════════════════╝");

    let start = Instant::now();
    let network = Arc::new(MemoryNetwork::new());
    let nodes = build_mesh(&network, num_nodes, &config)?;
    let mut stats = SimulationStats {
        num_nodes,
        mutations: 0,
        rounds: 0,
        sessions: 0,
        failures: 0,
        total_time: Duration::ZERO,
        avg_round_time: Duration::ZERO,
        converged: false,
    };

    gossip(&nodes, 100, &mut stats).await;
    println!("  Initial convergence after {} rounds", stats.rounds);

    let down: Vec<usize> = (num_nodes - offline..num_nodes).collect();
    for i in &down {
        network.set_fault(&endpoint(*i), Fault::Unreachable);
    }
    for node in nodes.iter().take(num_nodes - offline) {
        node.apply(&Mutation::KeepAlive { node: 0 })?;
        stats.mutations += 1;
    }

    // The live side gossips while the offline nodes are unreachable
    for _ in 0..5 {
        let reports = join_all(nodes[..num_nodes - offline].iter().map(|n| n.syncer.sync_round(MESH))).await;
        stats.rounds += 1;
        for report in reports.into_iter().flatten() {
            stats.sessions += report.sessions();
            stats.failures += report.failures;
        }
    }
    println!("  {} sessions failed while {} nodes were offline", stats.failures, offline);

    for i in &down {
        network.clear_fault(&endpoint(*i));
        nodes[*i].syncer.keep_alive();
    }
    gossip(&nodes, 200, &mut stats).await;

    stats.total_time = start.elapsed();
    Ok(stats)
}

/// Run each node's scheduler loop for `duration`, then shut down
pub async fn simulate_scheduled(num_nodes: usize, duration: Duration, config: SyncConfig) -> meshdir_sdk::Result<SimulationStats> {
    println!("\n╔════════════════════════════════════════════════════════════╗");
    println!("║        Scheduled Gossip                                    ║");
    println!("║  Nodes: {} | Interval: {}ms | Run: {}ms", num_nodes, config.sync_interval_ms, duration.as_millis());
    println!("╚════════════════════════════════════════════════════════════╝");

    let start = Instant::now();
    let network = Arc::new(MemoryNetwork::new());
    let nodes = build_mesh(&network, num_nodes, &config)?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let handles: Vec<_> = nodes
        .iter()
        .map(|n| tokio::spawn(n.syncer.clone().run(shutdown_rx.clone())))
        .collect();

    tokio::time::sleep(duration).await;
    let _ = shutdown_tx.send(true);
    for handle in handles {
        let _ = handle.await;
    }

    let rounds = nodes.iter().map(|n| n.syncer.sync_count() as usize).sum();
    let stats = SimulationStats {
        num_nodes,
        mutations: 0,
        rounds,
        sessions: 0,
        failures: 0,
        total_time: start.elapsed(),
        avg_round_time: Duration::ZERO,
        converged: is_converged(&nodes),
    };
    Ok(stats)
}
