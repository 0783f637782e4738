use meshdir_sdk::SyncConfigBuilder;
use simulation::{simulate, simulate_partition, simulate_scheduled};
use std::time::Duration;
use tracing_subscriber::EnvFilter;
pub mod simulation;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async_main())
}

async fn async_main() -> Result<(), Box<dyn std::error::Error>> {
    println!("\n\n╔════════════════════════════════════════════════════════════╗");
    println!("║            MESH GOSSIP SIMULATIONS                         ║");
    println!("╚════════════════════════════════════════════════════════════╝");

    // Test 1: one band, everyone talks to everyone
    let config = SyncConfigBuilder::new().cluster_size(8).branch_rate(3).build();
    simulate(8, 200, config).await?.print();

    // Test 2: several bands with inter-cluster jumps
    let config = SyncConfigBuilder::new()
        .cluster_size(8)
        .branch_rate(3)
        .inter_cluster_chance(0.3)
        .build();
    simulate(64, 1000, config).await?.print();

    // Test 3: larger mesh, small fan-out
    let config = SyncConfigBuilder::new()
        .cluster_size(16)
        .branch_rate(2)
        .inter_cluster_chance(0.15)
        .build();
    simulate(256, 2000, config).await?.print();

    // Test 4: nodes go offline and come back
    let config = SyncConfigBuilder::new().cluster_size(8).sync_timeout(100).build();
    simulate_partition(24, 4, config).await?.print();

    // Test 5: real scheduler loops
    let config = SyncConfigBuilder::new()
        .sync_interval(50)
        .sync_timeout(50)
        .keep_alive_interval(500)
        .prune_interval(1000)
        .cluster_size(4)
        .inter_cluster_chance(0.5)
        .build();
    simulate_scheduled(12, Duration::from_millis(1500), config).await?.print();

    println!("\n✓ All simulations completed successfully!");
    Ok(())
}
