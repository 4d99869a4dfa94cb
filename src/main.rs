use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use block_tree::{BlockTree, BlockTreeStores, ChainBuilder};
use chain::{NodeConfig, SpecProvider};
use clap::Parser;
use containers::LookupOptions;
use metrics::server::{run_metrics_server, MetricsServerConfig};
use metrics::Metrics;
use synchronization::{PeerId, SyncService, TreeBackedSyncPeer};
use tokio::task;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Beacon-syncs a local chain towards a pivot served by in-process peers.
#[derive(Parser, Debug)]
struct Args {
    /// YAML node config with `chain` and `sync` sections.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Length of the chain served by the peers.
    #[arg(long, default_value_t = 512)]
    chain_length: usize,

    /// Length of the local chain before syncing.
    #[arg(long, default_value_t = 16)]
    local_length: usize,

    /// Pivot block number, the peers' head by default.
    #[arg(long)]
    pivot: Option<u64>,

    #[arg(long, default_value_t = 2)]
    peers: u64,

    #[arg(long)]
    metrics_port: Option<u16>,
}

fn build_tree(length: usize, spec: Arc<dyn SpecProvider>, config: &NodeConfig) -> Result<BlockTree> {
    ChainBuilder::new()
        .build_tree(length, BlockTreeStores::in_memory(), spec, &config.sync)
        .with_context(|| format!("failed to build a chain of {length} blocks"))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => NodeConfig::load_from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => NodeConfig::default(),
    };
    if args.local_length == 0 || args.local_length > args.chain_length {
        bail!(
            "local length {} must be within 1..={}",
            args.local_length,
            args.chain_length
        );
    }

    let spec: Arc<dyn SpecProvider> = Arc::new(config.chain.clone());
    let remote = Arc::new(build_tree(args.chain_length, spec.clone(), &config)?);
    let local = Arc::new(build_tree(args.local_length, spec, &config)?);

    let pivot_number = args.pivot.unwrap_or(args.chain_length as u64 - 1);
    let pivot = remote
        .find_block_by_number(pivot_number, LookupOptions::empty())?
        .with_context(|| format!("pivot {pivot_number} is beyond the served chain"))?;

    let metrics = Arc::new(Metrics::new()?);
    if let Some(port) = args.metrics_port {
        let metrics = metrics.clone();
        task::spawn(async move {
            if let Err(error) = run_metrics_server(MetricsServerConfig::localhost(port), metrics).await {
                warn!(%error, "Metrics server exited");
            }
        });
    }

    let service = SyncService::new(local.clone(), config.sync.clone())?.with_metrics(metrics);
    for id in 1..=args.peers {
        let peer = Arc::new(TreeBackedSyncPeer::new(remote.clone()));
        service.add_peer(peer.peer_info(PeerId(id)));
    }

    let cancel = CancellationToken::new();
    let shutdown = {
        let cancel = cancel.clone();
        task::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown requested");
                cancel.cancel();
            }
        })
    };

    info!(
        local = args.local_length,
        pivot = pivot_number,
        peers = args.peers,
        "Starting beacon sync"
    );
    let state = service.run_beacon_sync(&pivot, cancel).await?;
    shutdown.abort();

    let head = local.head();
    info!(
        state = ?state,
        head = head.as_ref().map(|head| head.number()),
        hash = ?head.as_ref().map(|head| head.hash()),
        "Beacon sync exited"
    );
    Ok(())
}
