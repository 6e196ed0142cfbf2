//! `mailsiftd`: the mailsift verification worker.
//!
//! Binary entrypoint that wires the queue consumer, the placement ring and
//! the store pool together into a running worker, plus a few operator
//! commands that reuse the same pieces offline.
//!
//! # Usage
//!
//! ```text
//! mailsiftd start                              # consume jobs until stopped
//! mailsiftd start -c mailsift.toml            # start with a config file
//! mailsiftd route a@x.com b@y.com              # show the owning store node
//! mailsiftd route a@x.com --against r1,r2,r3   # compare with another node set
//! mailsiftd check upload.csv --records         # classify a file locally
//! mailsiftd enqueue /shared/upload.csv -u 42   # publish a job descriptor
//! ```

mod config;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use mailsift_engine::{Classifier, JobStatus, LogSink, RecordPipeline, Router, Worker, WorkerExit};
use mailsift_placement::Ring;
use mailsift_queue::{AmqpBroker, Broker};
use mailsift_store::{
    MembershipSet, MemoryStore, RedisConnector, SetKeys, StaticConnector, StoreConnector,
    StorePool,
};
use mailsift_types::{JobDescriptor, JobId, NodeId, UserId};
use tokio::sync::watch;
use tracing::{info, warn};

use config::{CliConfig, StoreBackend};

// -----------------------------------------------------------------------
// CLI definition
// -----------------------------------------------------------------------

#[derive(Parser)]
#[command(
    name = "mailsiftd",
    version,
    about = "Sharded e-mail verification worker"
)]
struct Cli {
    /// Path to TOML config file.
    #[arg(short, long, global = true, env = "MAILSIFT_CONFIG")]
    config: Option<PathBuf>,

    #[command(flatten)]
    overrides: Overrides,

    #[command(subcommand)]
    command: Commands,
}

/// Values that take precedence over the config file.
#[derive(Args)]
struct Overrides {
    /// Broker AMQP URI.
    #[arg(long, global = true, env = "MAILSIFT_QUEUE_URL")]
    queue_url: Option<String>,

    /// Comma-separated store node ids, replacing `[store] nodes`.
    #[arg(long, global = true, env = "MAILSIFT_STORE_NODES")]
    nodes: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Consume verification jobs until interrupted.
    Start,

    /// Print the store node owning each address.
    Route {
        /// Addresses to place.
        #[arg(required = true)]
        emails: Vec<String>,

        /// Comma-separated node list to compare against; prints the owner
        /// under both node sets and how many addresses would move.
        #[arg(long)]
        against: Option<String>,
    },

    /// Classify a record file against the store tier without the queue.
    Check {
        /// CSV file with an `email` column.
        path: PathBuf,

        /// Print every record's outcome, not only the tallies.
        #[arg(short, long)]
        records: bool,
    },

    /// Publish a job descriptor for a record file.
    Enqueue {
        /// CSV file on storage shared with the workers.
        path: PathBuf,

        /// Submitting user id.
        #[arg(short, long)]
        user_id: Option<String>,
    },
}

// -----------------------------------------------------------------------
// Entrypoint
// -----------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = CliConfig::load(cli.config.as_deref()).context("failed to load config")?;

    // CLI args and environment override config file values.
    if let Some(url) = cli.overrides.queue_url {
        config.queue.url = url;
    }
    if let Some(nodes) = cli.overrides.nodes {
        config.set_nodes(&nodes);
    }

    setup_tracing(&config.log.level);

    match cli.command {
        Commands::Start => cmd_start(&config).await,
        Commands::Route { emails, against } => cmd_route(&config, &emails, against.as_deref()),
        Commands::Check { path, records } => cmd_check(&config, &path, records).await,
        Commands::Enqueue { path, user_id } => cmd_enqueue(&config, &path, user_id).await,
    }
}

/// Initialize the `tracing` subscriber with the given level filter.
///
/// Respects `RUST_LOG` env var if set, otherwise uses the config value.
fn setup_tracing(level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Build the store connector for the configured backend.
///
/// The memory backend gets one store per node, with the seed addresses
/// placed on the node the ring assigns them to.
fn store_connector(config: &CliConfig) -> Result<Arc<dyn StoreConnector>> {
    let settings = config.store_settings();
    match config.store.backend {
        StoreBackend::Redis => Ok(Arc::new(RedisConnector::new(SetKeys::from(&settings)))),
        StoreBackend::Memory => {
            let nodes = config.node_ids();
            let ring = Ring::with_nodes(nodes.iter().cloned(), settings.replicas)
                .context("invalid store node list")?;

            let stores: Vec<Arc<MemoryStore>> =
                nodes.iter().map(|_| Arc::new(MemoryStore::new())).collect();
            let seeds = config
                .store
                .seed_bounced
                .iter()
                .map(|e| (MembershipSet::Bounced, e))
                .chain(
                    config
                        .store
                        .seed_subscribed
                        .iter()
                        .map(|e| (MembershipSet::Subscribed, e)),
                );
            for (set, email) in seeds {
                let Some(owner) = ring.route(email) else {
                    warn!(%email, "no store nodes configured, seed address dropped");
                    continue;
                };
                if let Some(i) = nodes.iter().position(|n| n == owner) {
                    stores[i].insert(set, email.clone());
                }
            }

            let mut connector = StaticConnector::new();
            for (node, store) in nodes.into_iter().zip(stores) {
                connector.insert(node, store);
            }
            Ok(Arc::new(connector))
        }
    }
}

/// Resolve on Ctrl-C or, on unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

// -----------------------------------------------------------------------
// mailsiftd start
// -----------------------------------------------------------------------

async fn cmd_start(config: &CliConfig) -> Result<()> {
    let worker_config = config.worker_config();
    info!("starting mailsiftd");
    info!(
        queue = %worker_config.queue.queue,
        prefetch = worker_config.queue.prefetch,
        ack_policy = ?worker_config.queue.ack_policy,
        backend = ?config.store.backend,
        nodes = worker_config.nodes.len(),
        replicas = worker_config.store.replicas,
        lookup_timeout_ms = worker_config.store.lookup_timeout_ms,
        "worker configuration"
    );
    if worker_config.nodes.is_empty() {
        warn!("no store nodes configured, every record will be UNKNOWN");
    }

    let connector = store_connector(config)?;
    let worker = Worker::from_config(
        &worker_config,
        Arc::new(AmqpBroker::new()),
        connector,
        Arc::new(LogSink),
    )
    .await
    .context("failed to build worker")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown requested, finishing in-flight job");
        let _ = shutdown_tx.send(true);
    });

    let exit = worker.run(shutdown_rx).await;
    worker.router().pool().close_all().await;

    match exit {
        WorkerExit::Shutdown => {
            info!(stats = ?worker.stats(), "mailsiftd stopped");
            Ok(())
        }
        WorkerExit::ConnectionLost(Some(e)) => Err(e).context("broker connection lost"),
        WorkerExit::ConnectionLost(None) => bail!("broker cancelled the consumer"),
    }
}

// -----------------------------------------------------------------------
// mailsiftd route
// -----------------------------------------------------------------------

fn cmd_route(config: &CliConfig, emails: &[String], against: Option<&str>) -> Result<()> {
    let ring = Ring::with_nodes(config.node_ids(), config.store.replicas)
        .context("invalid store node list")?;
    let owner = |ring: &Ring, email: &str| {
        ring.route(email)
            .map(|n| n.to_string())
            .unwrap_or_else(|| "-".to_string())
    };

    let Some(against) = against else {
        for email in emails {
            println!("{email}\t{}", owner(&ring, email));
        }
        return Ok(());
    };

    let nodes = config::parse_node_list(against)
        .into_iter()
        .map(NodeId::from)
        .collect::<Vec<_>>();
    let other = Ring::with_nodes(nodes, config.store.replicas)
        .context("invalid comparison node list")?;

    for email in emails {
        println!(
            "{email}\t{}\t{}",
            owner(&ring, email),
            owner(&other, email)
        );
    }
    let moved = Ring::reassignments(&ring, &other, emails.iter().map(String::as_str));
    println!("{} of {} addresses move", moved.len(), emails.len());
    Ok(())
}

// -----------------------------------------------------------------------
// mailsiftd check
// -----------------------------------------------------------------------

async fn cmd_check(config: &CliConfig, path: &Path, records: bool) -> Result<()> {
    let settings = config.store_settings();
    let pool = Arc::new(StorePool::new(store_connector(config)?, settings.connect));
    let (router, _) = Router::new(&config.node_ids(), settings.replicas, pool.clone())
        .await
        .context("failed to build router")?;
    let classifier = Classifier::new(Arc::new(router), settings.lookup_timeout());
    let pipeline = RecordPipeline::new(classifier);

    let job = JobDescriptor {
        job_id: JobId::random(),
        file_path: path.to_path_buf(),
        user_id: None,
        original_filename: None,
    };
    let report = pipeline.process(&job).await;
    pool.close_all().await;

    if report.status != JobStatus::Completed {
        bail!(
            "{}: {}",
            report.status,
            report.error.as_deref().unwrap_or("source could not be read")
        );
    }

    if records {
        for record in &report.outcomes {
            println!("{}\t{}", record.email, record.outcome);
        }
    }
    for (outcome, count) in report.counts.iter() {
        println!("{outcome:<10} {count}");
    }
    println!("{:<10} {}", "skipped", report.skipped);
    Ok(())
}

// -----------------------------------------------------------------------
// mailsiftd enqueue
// -----------------------------------------------------------------------

async fn cmd_enqueue(config: &CliConfig, path: &Path, user_id: Option<String>) -> Result<()> {
    let file_path = path
        .canonicalize()
        .with_context(|| format!("cannot resolve {}", path.display()))?;
    let original_filename = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned());
    let user_id = user_id.map(|id| match id.parse::<u64>() {
        Ok(n) => UserId::Numeric(n),
        Err(_) => UserId::Named(id),
    });

    let job = JobDescriptor {
        job_id: JobId::random(),
        file_path,
        user_id,
        original_filename,
    };
    let body = job.to_vec().context("failed to encode job descriptor")?;

    AmqpBroker::new()
        .publish(&config.queue_settings(), body)
        .await
        .context("failed to publish job")?;

    info!(job_id = %job.job_id, file = %job.file_path.display(), "job enqueued");
    println!("{}", job.job_id);
    Ok(())
}
