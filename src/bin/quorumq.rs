//! quorumq CLI: exercise a queue against an in-process cluster.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use quorumq::config::{QueueConfig, TelemetrySettings};
use quorumq::event::EventKind;
use quorumq::memory::{MemoryCoordinationService, MemoryReplica};
use quorumq::replica::Replica;
use quorumq::session::QueueState;
use quorumq::telemetry::init_telemetry;
use quorumq::{Error, Queue};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "quorumq", about = "Replicated work queue with session-scoped locks")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run producers and consumers against an in-memory cluster
    Soak {
        /// Number of replicas
        #[arg(long, default_value_t = 3)]
        replicas: usize,
        /// Replicas that must acknowledge a push
        #[arg(long, default_value_t = 2)]
        write_quorum: usize,
        /// Concurrent consumers
        #[arg(long, default_value_t = 4)]
        consumers: usize,
        /// Items to push
        #[arg(long, default_value_t = 200)]
        items: usize,
        /// Lock-conflict retries per pop
        #[arg(long, default_value_t = 3)]
        pop_tries: u32,
        /// Take a replica down and expire the session halfway through
        #[arg(long)]
        chaos: bool,
    },
    /// Print the resolved queue configuration
    Config {
        /// TOML file with a [queue] table; environment is used otherwise
        #[arg(long)]
        file: Option<PathBuf>,
    },
}

#[derive(Debug, Default, Serialize)]
struct SoakReport {
    pushed: usize,
    push_failures: usize,
    processed: usize,
    redelivered: usize,
    remaining: Option<u64>,
    elapsed_ms: u128,
    diagnostics: BTreeMap<String, usize>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let telemetry = TelemetrySettings::from_env();
    let _guard = init_telemetry(telemetry.telemetry_config("quorumq"))?;

    match cli.command {
        Command::Soak {
            replicas,
            write_quorum,
            consumers,
            items,
            pop_tries,
            chaos,
        } => {
            let config = QueueConfig::new("soak")
                .write_quorum(write_quorum)
                .pop_tries(pop_tries)
                .session_retry(Duration::from_millis(100));
            let report = cmd_soak(config, replicas, consumers, items, chaos).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::Config { file } => cmd_config(file, telemetry),
    }
}

async fn cmd_soak(
    config: QueueConfig,
    replica_count: usize,
    consumers: usize,
    items: usize,
    chaos: bool,
) -> anyhow::Result<SoakReport> {
    let replicas: Vec<Arc<MemoryReplica>> = (0..replica_count)
        .map(|i| Arc::new(MemoryReplica::new(format!("replica-{i}"))))
        .collect();
    let service = MemoryCoordinationService::new();
    let coordinator = Arc::new(service.connect());

    let queue = Queue::new(
        replicas
            .iter()
            .map(|r| Arc::clone(r) as Arc<dyn Replica>)
            .collect(),
        coordinator.clone(),
        config,
    )?;

    let diagnostics = Arc::new(Mutex::new(BTreeMap::<String, usize>::new()));
    let collector = {
        let mut events = queue.subscribe();
        let diagnostics = Arc::clone(&diagnostics);
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                *diagnostics
                    .lock()
                    .await
                    .entry(event_name(&event.kind).to_string())
                    .or_default() += 1;
            }
        })
    };

    if queue.ready().await != QueueState::Ready {
        anyhow::bail!("queue closed before becoming ready");
    }

    let started = Instant::now();
    let mut report = SoakReport::default();

    for i in 0..items {
        match queue.push(format!("item-{i}")).await {
            Ok(_) => report.pushed += 1,
            Err(e) => {
                warn!("push item-{i}: {e}");
                report.push_failures += 1;
            }
        }
    }
    info!(pushed = report.pushed, "producer finished");

    let seen = Arc::new(Mutex::new(HashMap::<Vec<u8>, usize>::new()));
    let workers: Vec<_> = (0..consumers)
        .map(|worker| {
            let queue = queue.clone();
            let seen = Arc::clone(&seen);
            tokio::spawn(async move { consume(worker, queue, seen).await })
        })
        .collect();

    if chaos {
        while seen.lock().await.len() < report.pushed / 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        warn!("chaos: taking replica-0 down and expiring the session");
        replicas[0].set_available(false);
        coordinator.expire_session();
    }

    for worker in workers {
        worker.await??;
    }

    let seen = seen.lock().await;
    report.processed = seen.len();
    report.redelivered = seen.values().map(|n| n - 1).sum();
    report.remaining = queue.size().await.ok();
    report.elapsed_ms = started.elapsed().as_millis();

    queue.close().await;
    tokio::time::sleep(Duration::from_millis(10)).await;
    collector.abort();
    report.diagnostics = diagnostics.lock().await.clone();

    Ok(report)
}

/// Pop and complete until the queue looks empty.
async fn consume(
    worker: usize,
    queue: Queue,
    seen: Arc<Mutex<HashMap<Vec<u8>, usize>>>,
) -> anyhow::Result<()> {
    let mut idle_rounds = 0;
    loop {
        match queue.pop().await {
            Ok(Some(claim)) => {
                idle_rounds = 0;
                *seen
                    .lock()
                    .await
                    .entry(claim.item().as_bytes().to_vec())
                    .or_default() += 1;
                // The lock may already be gone with an expired session.
                if let Err(e) = claim.complete().await {
                    warn!(worker, "completing claim: {e}");
                }
            }
            Ok(None) => {
                if queue.size().await.unwrap_or(1) == 0 {
                    return Ok(());
                }
                idle_rounds += 1;
                if idle_rounds > 1000 {
                    anyhow::bail!("worker {worker} starved");
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            Err(Error::NotReady(_)) | Err(Error::Lock(_)) => {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

fn cmd_config(file: Option<PathBuf>, telemetry: TelemetrySettings) -> anyhow::Result<()> {
    let queue = match file {
        Some(path) => QueueConfig::load(&path)?,
        None => QueueConfig::from_env()?,
    };
    println!("key:                        {}", queue.key);
    println!("write_quorum:               {}", queue.write_quorum);
    println!("pop_tries:                  {}", queue.pop_tries);
    println!("session_retry_ms:           {}", queue.session_retry_ms);
    println!("max_replica_retry_delay_ms: {}", queue.max_replica_retry_delay_ms);
    println!("diagnostic_capacity:        {}", queue.diagnostic_capacity);
    println!(
        "otel_endpoint:              {}",
        telemetry.otel_endpoint.as_deref().unwrap_or("(none)")
    );
    println!("log_level:                  {}", telemetry.log_level);
    Ok(())
}

fn event_name(kind: &EventKind) -> &'static str {
    match kind {
        EventKind::Ready { .. } => "ready",
        EventKind::ReplicaError { .. } => "replica_error",
        EventKind::SessionError { .. } => "session_error",
        EventKind::SessionExpired => "session_expired",
        EventKind::ConfigWarning { .. } => "config_warning",
        EventKind::LockReleaseError { .. } => "lock_release_error",
        EventKind::CoordinatorCloseError { .. } => "coordinator_close_error",
        EventKind::Closed => "closed",
    }
}
