use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use chain::{ChainAccessor, MemoryChain};
use clap::Parser;
use containers::{BlockInfo, BlockNo};
use libp2p_identity::PeerId;
use metrics::server::{MetricsServerConfig, run_metrics_server};
use metrics::Metrics;
use networking::loopback::LoopbackRequester;
use networking::requester::PeerRequester;
use networking::sync::{
    RunId, SyncError, SyncEvent, SyncManager, SyncManagerConfig, SyncStatistics, Syncer, SyncerConfig,
    SyncerHandle,
};
use networking::types::{NewBlockNotice, OutboundP2pRequest, P2pRequestSource};
use tokio::sync::{broadcast, mpsc};
use tokio::task;
use tracing::{debug, info, warn};

const TIP_POLL_INTERVAL: Duration = Duration::from_millis(50);

type Manager = SyncManager<MemoryChain, LoopbackRequester<MemoryChain>, mpsc::UnboundedSender<OutboundP2pRequest>>;

/// Syncs a local chain with a longer, forked peer chain served in-process.
#[derive(Parser, Debug)]
struct Args {
    #[arg(long, default_value_t = 100)]
    local_height: BlockNo,

    #[arg(long, default_value_t = 150)]
    peer_height: BlockNo,

    /// Last height both chains share.
    #[arg(long, default_value_t = 80)]
    fork_at: BlockNo,

    #[arg(long, default_value_t = networking::sync::DEFAULT_HASH_REQ_SIZE)]
    max_hash_req_size: u64,

    #[arg(long, default_value_t = networking::sync::DEFAULT_BLOCK_REQ_SIZE)]
    max_block_req_size: u64,

    #[arg(long, default_value_t = networking::sync::DEFAULT_PENDING_CONN)]
    max_pending_conn: usize,

    #[arg(long, default_value_t = networking::sync::DEFAULT_BLOCK_REQ_TASKS)]
    max_block_req_tasks: usize,

    #[arg(long, default_value_t = networking::sync::DEFAULT_BLOCK_FETCH_RETRY)]
    max_block_fetch_retry: usize,

    /// Peer request timeout in seconds.
    #[arg(long, default_value_t = 30)]
    fetch_timeout: u64,

    #[arg(long)]
    use_full_scan_only: bool,

    #[arg(long, default_value = "127.0.0.1")]
    metrics_address: IpAddr,

    /// Serve Prometheus metrics on this port while syncing.
    #[arg(long)]
    metrics_port: Option<u16>,
}

impl Args {
    fn syncer_config(&self) -> SyncerConfig {
        SyncerConfig {
            max_hash_req_size: self.max_hash_req_size,
            max_block_req_size: self.max_block_req_size,
            max_pending_conn: self.max_pending_conn,
            max_block_req_tasks: self.max_block_req_tasks,
            fetch_timeout: Duration::from_secs(self.fetch_timeout),
            max_block_fetch_retry: self.max_block_fetch_retry,
            use_full_scan_only: self.use_full_scan_only,
            ..SyncerConfig::default()
        }
    }

    fn manager_config(&self) -> SyncManagerConfig {
        SyncManagerConfig {
            fetch_timeout: Duration::from_secs(self.fetch_timeout),
            ..SyncManagerConfig::default()
        }
    }
}

/// How the local chain reached the peer's tip.
#[derive(Debug)]
enum Outcome {
    /// The peer was not ahead.
    UpToDate,
    /// The announced block attached to the local chain without a range sync.
    Extended,
    Synced { run: RunId, result: Result<(), SyncError> },
}

impl Outcome {
    fn result(&self) -> Result<(), SyncError> {
        match self {
            Self::UpToDate | Self::Extended => Ok(()),
            Self::Synced { result, .. } => result.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let summary = sync_with_peer(&args).await?;
    println!("{}", serde_json::to_string_pretty(&summary.json)?);

    summary.outcome.result().map_err(Into::into)
}

struct Summary {
    outcome: Outcome,
    json: serde_json::Value,
}

async fn sync_with_peer(args: &Args) -> Result<Summary> {
    if args.fork_at > args.local_height {
        bail!("fork point {} is above the local height {}", args.fork_at, args.local_height);
    }

    let local = Arc::new(MemoryChain::generate(args.local_height, 1));
    let peer_chain = Arc::new(local.fork(args.fork_at, args.peer_height, 2));
    let network = Arc::new(LoopbackRequester::new(peer_chain.clone()));
    let peer_id = PeerId::random();

    info!(
        local_height = args.local_height,
        peer_height = args.peer_height,
        fork_at = args.fork_at,
        peer = %peer_id,
        "Chains ready"
    );

    let syncer = Syncer::spawn(local.clone(), network.clone(), args.syncer_config());
    let (outbound_p2p_sender, outbound_p2p_receiver) = mpsc::unbounded_channel::<OutboundP2pRequest>();
    let manager = Arc::new(SyncManager::new(
        args.manager_config(),
        local.clone(),
        network.clone(),
        syncer.clone(),
        outbound_p2p_sender,
    ));

    task::spawn(serve_outbound_requests(outbound_p2p_receiver, network, manager.clone()));

    let metrics = match args.metrics_port {
        Some(metrics_port) => {
            let metrics = Arc::new(Metrics::new()?);
            let config = MetricsServerConfig {
                metrics_address: args.metrics_address,
                metrics_port,
            };
            let server_metrics = metrics.clone();
            task::spawn(async move {
                if let Err(err) = run_metrics_server(config, server_metrics).await {
                    warn!(error = %err, "Metrics server exited");
                }
            });
            task::spawn(report_progress(syncer.clone(), local.clone(), metrics.clone()));
            Some(metrics)
        }
        None => None,
    };

    let started = Instant::now();
    let tip = peer_chain.get_best_block()?;

    let outcome = if args.peer_height <= args.local_height {
        info!("Peer is not ahead, nothing to sync");
        Outcome::UpToDate
    } else {
        let mut events = syncer.subscribe();
        manager
            .handle_new_block_notice(
                peer_id,
                NewBlockNotice {
                    block_hash: tip.hash(),
                    block_no: tip.block_no(),
                },
            )
            .await?;

        wait_for_tip(&mut events, &manager, &local, tip.info()).await?
    };

    let elapsed = started.elapsed();
    if let Some(metrics) = &metrics {
        if let Outcome::Synced { result, .. } = &outcome {
            metrics.inc_sync_runs_finished(if result.is_ok() { "ok" } else { "error" });
            metrics.observe_sync_run_duration(elapsed.as_secs_f64());
        }
        metrics.set_chain_best_block(local.best_no() as i64);
    }

    let (run, result) = match &outcome {
        Outcome::Synced { run, result } => (Some(*run), result.clone()),
        other => (None, other.result()),
    };
    let json = serde_json::json!({
        "run": run,
        "result": match &result {
            Ok(()) => "ok".to_string(),
            Err(err) => err.to_string(),
        },
        "best_no": local.best_no(),
        "matches_peer": local.hash_at(args.peer_height) == peer_chain.hash_at(args.peer_height),
        "elapsed_ms": elapsed.as_millis() as u64,
    });

    Ok(Summary { outcome, json })
}

/// Wait until a sync run finishes, or until the announced tip is on the
/// local chain with no run holding the gate.
async fn wait_for_tip(
    events: &mut broadcast::Receiver<SyncEvent>,
    manager: &Manager,
    chain: &MemoryChain,
    tip: BlockInfo,
) -> Result<Outcome> {
    let mut poll = tokio::time::interval(TIP_POLL_INTERVAL);

    loop {
        tokio::select! {
            biased;

            event = events.recv() => match event.context("syncer closed")? {
                SyncEvent::Finished { run, result, .. } => return Ok(Outcome::Synced { run, result }),
                SyncEvent::FetcherClosed { run, name } => debug!(run = %run, name = %name, "Fetcher closed"),
            },
            _ = poll.tick() => {
                if manager.is_syncing() || chain.hash_at(tip.no) != Some(tip.hash) {
                    continue;
                }
                // A run may have finished between the two branches.
                while let Ok(event) = events.try_recv() {
                    if let SyncEvent::Finished { run, result, .. } = event {
                        return Ok(Outcome::Synced { run, result });
                    }
                }
                info!(tip = %tip, "Announced block extended the local chain");
                return Ok(Outcome::Extended);
            }
        }
    }
}

/// Answers the sync manager's outbound requests from the peer chain and
/// feeds the responses back, standing in for the P2P service.
async fn serve_outbound_requests(
    mut requests: impl P2pRequestSource<OutboundP2pRequest>,
    network: Arc<LoopbackRequester<MemoryChain>>,
    manager: Arc<Manager>,
) {
    while let Some(request) = requests.recv().await {
        match request {
            OutboundP2pRequest::GetBlocks { peer_id, hashes } => {
                let mut blocks = Vec::with_capacity(hashes.len());
                for hash in hashes {
                    match network.get_block_by_hash(peer_id, hash).await {
                        Ok(block) => blocks.push(block),
                        Err(err) => warn!(peer = %peer_id, error = %err, "Block request failed"),
                    }
                }
                if let Err(err) = manager.handle_get_block_response(peer_id, blocks) {
                    warn!(peer = %peer_id, error = %err, "Failed to handle block response");
                }
            }
            OutboundP2pRequest::GetTransactions { peer_id, hashes } => {
                debug!(peer = %peer_id, count = hashes.len(), "No mempool, dropping transaction request");
            }
        }
    }
}

async fn report_progress(syncer: SyncerHandle, chain: Arc<MemoryChain>, metrics: Arc<Metrics>) {
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    loop {
        interval.tick().await;

        let stats: SyncStatistics = syncer.statistics();
        metrics.set_chain_best_block(chain.best_no() as i64);
        metrics.set_sync_running(stats.running);
        metrics.set_sync_target_block(stats.end.unwrap_or_default() as i64);
        metrics.set_sync_ancestor_block(stats.start.unwrap_or_default() as i64);
        metrics.set_sync_last_added_block(stats.block_added.unwrap_or_default() as i64);
        metrics.set_sync_max_requested_block(stats.block_requested.unwrap_or_default() as i64);

        if stats.running {
            info!(
                state = ?stats.state,
                added = ?stats.block_added,
                requested = ?stats.block_requested,
                end = ?stats.end,
                "Sync progress"
            );
        }
    }
}
