//! rank-sim: runs the donation protocol over a synthetic all-pairs workload.
//!
//! Rank 0 builds a point table, carves it into fragments and queues every
//! (query, reference) pair. Idle ranks ask their peers for work; busy ranks
//! donate. Each visited pair counts the point pairs closer than `--radius`,
//! so the final total is independent of how work moved between ranks.
//!
//! Without `--cluster` the whole world runs in this process over channels.
//! With `--cluster`, this process runs the single rank named by
//! `CANOPY_RANK` over ZeroMQ, using the endpoints from the cluster file.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use serde::Serialize;
use tracing::{info, warn};

use canopy_core::config::load_dotenv;
use canopy_core::{Config, RankId};
use canopy_exchange::{PointTable, SubTreeFragment};
use canopy_rank::{Control, ExchangeError, ExchangeMetrics, RankExchange};
use canopy_transport::{
    channel_network, topics, ClusterConfig, RankReceiver, RankSender, ZmqRankReceiver,
    ZmqRankSender,
};

// ── CLI ─────────────────────────────────────────────────────────────

/// Simulated world of ranks sharing a dual-tree workload by donation.
#[derive(Parser, Debug, Clone)]
#[command(name = "rank-sim", version, about)]
struct Cli {
    /// Ranks in the in-process world. Ignored with `--cluster`.
    #[arg(long, env = "CANOPY_WORLD_SIZE", default_value_t = 4)]
    world_size: u32,

    /// Path to a cluster.toml; runs one rank over ZeroMQ.
    #[arg(long, env = "CANOPY_CLUSTER_CONFIG")]
    cluster: Option<String>,

    /// Points in the synthetic table.
    #[arg(long, default_value_t = 2048)]
    points: usize,

    #[arg(long, default_value_t = 3)]
    dims: usize,

    #[arg(long, default_value_t = 16)]
    leaf_size: usize,

    /// Largest fragment carved from the table.
    #[arg(long, default_value_t = 128)]
    fragment_points: usize,

    /// Pairs closer than this are counted.
    #[arg(long, default_value_t = 0.1)]
    radius: f64,

    /// Tasks visited between inbox polls.
    #[arg(long, default_value_t = 4)]
    batch: usize,

    /// Milliseconds an idle rank waits before asking again.
    #[arg(long, default_value_t = 20)]
    retry_ms: u64,

    #[arg(long, default_value_t = 42)]
    seed: u64,
}

#[derive(Debug, Serialize)]
struct RankReport {
    rank: RankId,
    close_pairs: u64,
    metrics: ExchangeMetrics,
}

// ── Workload ────────────────────────────────────────────────────────

/// Uniform points in the unit cube from a 64-bit LCG.
fn synthetic_points(n: usize, dims: usize, seed: u64) -> Vec<f64> {
    let mut state = seed.wrapping_mul(6364136223846793005).wrapping_add(1);
    (0..n * dims)
        .map(|_| {
            state = state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            (state >> 11) as f64 / (1u64 << 53) as f64
        })
        .collect()
}

/// Queue every pair of frontier fragments. Returns the total work queued.
fn seed_workload<S: RankSender>(
    exchange: &mut RankExchange<S>,
    cli: &Cli,
) -> anyhow::Result<u64> {
    let rank = exchange.rank();
    let points = synthetic_points(cli.points, cli.dims, cli.seed);
    let table = Arc::new(PointTable::build(rank, cli.dims, points, 0, vec![], cli.leaf_size)?);
    let fragments = table
        .frontier(cli.fragment_points)
        .into_iter()
        .map(|node| SubTreeFragment::borrowed(Arc::clone(&table), node))
        .collect::<Result<Vec<_>, _>>()?;

    let queue = exchange.queue_mut();
    for query in &fragments {
        let slot = queue.push_query(query.alias())?;
        for reference in &fragments {
            queue.push_pair(slot, reference.alias())?;
        }
    }
    info!(
        %rank,
        fragments = fragments.len(),
        work = queue.outstanding_work(),
        "workload seeded"
    );
    Ok(queue.outstanding_work())
}

fn count_close(query: &SubTreeFragment, reference: &SubTreeFragment, radius: f64) -> u64 {
    let (q, r) = (query.span(), reference.span());
    let limit = radius * radius;
    let mut close = 0;
    for i in q.begin..q.end() {
        let Some(a) = query.point(i) else { continue };
        for j in r.begin..r.end() {
            let Some(b) = reference.point(j) else { continue };
            let d2: f64 = a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum();
            if d2 < limit {
                close += 1;
            }
        }
    }
    close
}

// ── Rank loop ───────────────────────────────────────────────────────

async fn run_rank<S, R>(
    mut exchange: RankExchange<S>,
    receiver: R,
    world_size: u32,
    cli: Cli,
) -> Result<RankReport, ExchangeError>
where
    S: RankSender,
    R: RankReceiver,
{
    let rank = exchange.rank();
    let retry = Duration::from_millis(cli.retry_ms);
    let mut close_pairs = 0u64;
    let mut next_peer = rank.0;
    let mut asking = false;

    'run: loop {
        exchange.begin_round();

        if exchange.has_runnable_work() {
            exchange.visit_tasks(cli.batch, |q, r, _| {
                close_pairs += count_close(q, r, cli.radius);
            })?;
            exchange.drain_settlements().await?;
            while let Ok(message) = tokio::time::timeout(Duration::ZERO, receiver.recv()).await {
                if exchange.handle_message(message?).await? == Control::Shutdown {
                    break 'run;
                }
            }
            continue;
        }

        exchange.drain_settlements().await?;
        if rank == RankId(0) && exchange.is_quiescent() {
            exchange.broadcast_shutdown(world_size).await?;
            break;
        }

        if world_size > 1 && !asking {
            next_peer = (next_peer + 1) % world_size;
            if next_peer == rank.0 {
                next_peer = (next_peer + 1) % world_size;
            }
            // A peer may already have shut down; the next round asks someone else.
            if let Err(e) = exchange.request_work(RankId(next_peer), u64::MAX).await {
                warn!(%rank, peer = next_peer, error = %e, "work request not delivered");
            }
            asking = true;
        }

        match tokio::time::timeout(retry, receiver.recv()).await {
            Ok(message) => {
                let message = message?;
                if message.topic == topics::DONATION_BUNDLE {
                    asking = false;
                }
                if exchange.handle_message(message).await? == Control::Shutdown {
                    break;
                }
            }
            Err(_) => asking = false,
        }
    }

    info!(%rank, close_pairs, work = exchange.metrics().work_visited, "rank finished");
    Ok(RankReport {
        rank,
        close_pairs,
        metrics: exchange.metrics().clone(),
    })
}

// ── Main ────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    load_dotenv();
    let mut config = Config::from_env();

    match cli.cluster.clone() {
        Some(path) => {
            let cluster = ClusterConfig::from_file(&path)?;
            config.rank.world_size = cluster.world_size();
            config.validate()?;
            config.log_summary();
            run_cluster_rank(config, cluster, cli).await
        }
        None => {
            config.rank.world_size = cli.world_size;
            config.rank.rank = RankId(0);
            config.validate()?;
            config.log_summary();
            run_local_world(config, cli).await
        }
    }
}

async fn run_local_world(config: Config, cli: Cli) -> anyhow::Result<()> {
    let world_size = config.rank.world_size;
    let (sender, receivers) = channel_network(world_size);
    let mut expected_work = 0;

    let mut handles = Vec::with_capacity(receivers.len());
    for receiver in receivers {
        let mut rank_config = config.clone();
        rank_config.rank.rank = receiver.rank();
        let mut exchange = RankExchange::new(&rank_config, sender.clone());
        if receiver.rank() == RankId(0) {
            expected_work = seed_workload(&mut exchange, &cli)?;
        }
        handles.push(tokio::spawn(run_rank(exchange, receiver, world_size, cli.clone())));
    }

    let mut reports = Vec::with_capacity(handles.len());
    for handle in handles {
        reports.push(handle.await??);
    }

    let visited: u64 = reports.iter().map(|r| r.metrics.work_visited).sum();
    let close_pairs: u64 = reports.iter().map(|r| r.close_pairs).sum();
    if visited != expected_work {
        warn!(visited, expected_work, "visited work does not match the seeded workload");
    }
    info!(world_size, visited, expected_work, close_pairs, "simulation complete");
    println!("{}", serde_json::to_string_pretty(&reports)?);
    Ok(())
}

async fn run_cluster_rank(config: Config, cluster: ClusterConfig, cli: Cli) -> anyhow::Result<()> {
    let rank = config.rank.rank;
    let world_size = cluster.world_size();
    let receiver = ZmqRankReceiver::bind(&cluster.rank_transport(rank)?).await?;
    let sender = ZmqRankSender::connect(rank, &cluster.peers()?).await?;
    // PUSH sockets connect lazily; give the peers a moment to bind.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let mut exchange = RankExchange::new(&config, sender);
    if rank == RankId(0) {
        seed_workload(&mut exchange, &cli)?;
    }
    let report = run_rank(exchange, receiver, world_size, cli).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
