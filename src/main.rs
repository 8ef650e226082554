//! # Tessera node binary
//!
//! Runs a single tessera peer: a block store, the authoritative storage
//! repository, and the consensus pipeline over the in-process reference
//! network (a one-peer cluster). The production peer transport and DHT
//! are external collaborators; this binary is the reference deployment
//! used for development and testing.
//!
//! ```bash
//! # Run with defaults (data/ next to the working directory)
//! tessera
//!
//! # Override data directory and peer id
//! tessera --data-dir /var/lib/tessera --peer-id peer-a
//!
//! # Run for a fixed duration (for testing)
//! tessera --duration 10
//! ```
//!
//! ## Graceful Shutdown
//!
//! SIGINT (Ctrl+C) or an elapsed `--duration` flushes the block store
//! before exit. The process force-exits afterward because sled's
//! background threads do not terminate on their own.

use clap::Parser;
use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use tessera::cluster::{ClusterCoordinator, ClusterMember, CoordinatedRepo, InProcessNetwork};
use tessera::config::load_config;
use tessera::engine::EngineRegistry;
use tessera::logging::init_logging;
use tessera::storage::{BlockStore, StorageRepo};
use tessera::transaction::TransactionCoordinator;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(long)]
    config: Option<String>,

    /// Override data directory path (defaults to config value)
    #[arg(long)]
    data_dir: Option<String>,

    /// Fixed peer id (defaults to config value or a generated id)
    #[arg(long)]
    peer_id: Option<String>,

    /// Run for a specific duration in seconds (for testing)
    #[arg(long)]
    duration: Option<u64>,
}

fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    let runtime = tokio::runtime::Runtime::new()
        .map_err(|e| Box::<dyn Error + Send + Sync>::from(format!("Failed to create runtime: {e}")))?;

    let result = runtime.block_on(async_main());

    runtime.shutdown_timeout(std::time::Duration::from_secs(2));
    result
}

async fn async_main() -> Result<(), Box<dyn Error + Send + Sync>> {
    let args = Args::parse();
    init_logging();

    let start_time = std::time::Instant::now();

    let mut config = load_config(args.config);
    if let Some(data_dir) = args.data_dir {
        info!("🗂️ Overriding data directory: {}", data_dir);
        config.node.data_dir = data_dir;
    }
    if let Some(peer_id) = args.peer_id {
        config.node.peer_id = Some(peer_id);
    }

    let peer_id = config
        .node
        .peer_id
        .clone()
        .unwrap_or_else(|| format!("peer-{}", uuid::Uuid::new_v4()));

    let data_dir = PathBuf::from(&config.node.data_dir);
    std::fs::create_dir_all(&data_dir)
        .map_err(|e| Box::<dyn Error + Send + Sync>::from(format!("Failed to create data directory: {e}")))?;

    // Assemble the peer: store → repo → member → consensus → coordinator
    let store = Arc::new(BlockStore::open(data_dir.join("blocks"))?);
    let repo = Arc::new(StorageRepo::new(store.clone()));
    let member = Arc::new(ClusterMember::new(peer_id.clone(), repo.clone()));

    let network = Arc::new(InProcessNetwork::new(config.cluster.cluster_size));
    network.register(member.clone()).await;

    let cluster_coordinator = Arc::new(
        ClusterCoordinator::new(
            peer_id.clone(),
            network.clone(),
            config.consensus(),
            config.retry_policy(),
        )
        .with_local_member(member),
    );
    let coordinated = Arc::new(
        CoordinatedRepo::new(peer_id.clone(), network.clone(), network.clone(), cluster_coordinator)
            .with_local(repo.clone()),
    );
    let _transactions = TransactionCoordinator::new(
        peer_id.clone(),
        coordinated.clone(),
        EngineRegistry::with_builtin(),
    )
    .with_nominator(coordinated);

    info!("🧱 Tessera node initialized");
    info!("📁 Data directory: {}", data_dir.display());
    info!("🆔 Peer id: {}", peer_id);

    // Surface pendings left over from a previous run
    repo.recover_pendings()?;

    if let Some(duration) = args.duration.or(config.development.default_duration) {
        tokio::time::sleep(std::time::Duration::from_secs(duration)).await;
        info!("⏱️ Duration limit reached");
    } else {
        info!("Running indefinitely. Press Ctrl+C to exit.");
        tokio::signal::ctrl_c().await?;
        info!("🛑 Received shutdown signal");
    }

    store.close().await?;
    info!("🧹 Node shutdown complete");

    let total_runtime = start_time.elapsed();
    info!("💫 Total runtime: {:.2}s", total_runtime.as_secs_f64());

    // Force exit because sled's background threads won't terminate
    std::process::exit(0)
}
