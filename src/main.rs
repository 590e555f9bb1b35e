use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use fleetcrawl::cluster::LocalCluster;
use fleetcrawl::config::Config;
use fleetcrawl::coordinator::api;
use fleetcrawl::coordinator::client::{ClientConfig, ControlClient};
use fleetcrawl::coordinator::Coordinator;
use fleetcrawl::fetcher::{PoliteFetcher, SharedVisitor};
use fleetcrawl::frontier::{run_local, QueueFrontier, Seed, TraversalSettings, TraversalStrategy};
use fleetcrawl::models::NodeRole;
use fleetcrawl::queue::build_queue;
use fleetcrawl::registry::build_registry;
use fleetcrawl::transport::build_transport;
use fleetcrawl::worker::WorkerNode;

#[derive(Parser)]
#[command(
    name = "fleetcrawl",
    version,
    about = "Distributed web-crawl coordinator",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// TOML configuration file (defaults to FLEET_* environment variables)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log format (text, json)
    #[arg(long, global = true)]
    log_format: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a coordinator and N workers in this process until the crawl drains
    Run {
        /// Seed URLs
        #[arg(short, long = "seed", required = true)]
        seeds: Vec<String>,

        /// Number of workers
        #[arg(short, long, default_value = "4")]
        workers: usize,

        /// Traversal strategy (bfs, dfs, priority, adaptive)
        #[arg(long)]
        strategy: Option<TraversalStrategy>,

        /// Give up after this many seconds
        #[arg(long, default_value = "3600")]
        timeout_secs: u64,
    },

    /// Crawl from seeds with a single-process traversal
    Crawl {
        /// Seed URLs
        #[arg(short, long = "seed", required = true)]
        seeds: Vec<String>,

        /// Traversal strategy (bfs, dfs, priority, adaptive)
        #[arg(long)]
        strategy: Option<TraversalStrategy>,

        /// Maximum pages to crawl
        #[arg(long)]
        max_pages: Option<usize>,

        /// Maximum link depth
        #[arg(long)]
        max_depth: Option<u32>,
    },

    /// Run the coordinator loops and the control API
    Coordinator {
        /// Override the API bind address
        #[arg(long)]
        bind: Option<String>,
    },

    /// Run a worker node
    Worker {
        /// Override the node id
        #[arg(long)]
        node_id: Option<String>,

        /// Override the task slot count
        #[arg(long)]
        max_tasks: Option<u32>,
    },

    /// Submit URLs to a running coordinator
    Submit {
        /// URLs to submit
        #[arg(required = true)]
        urls: Vec<String>,

        #[arg(short, long, default_value = "0")]
        priority: i64,

        /// Coordinator base URL
        #[arg(long, default_value = "http://127.0.0.1:8080")]
        server: String,
    },

    /// Show queue and registry statistics of a running coordinator
    Stats {
        #[arg(long, default_value = "http://127.0.0.1:8080")]
        server: String,
    },

    /// List active nodes of a running coordinator
    Nodes {
        /// Filter by role (coordinator, crawler, parser, storage)
        #[arg(long)]
        role: Option<NodeRole>,

        #[arg(long, default_value = "http://127.0.0.1:8080")]
        server: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => Config::from_env().context("Failed to load config from environment")?,
    };

    let log_format = cli
        .log_format
        .clone()
        .unwrap_or_else(|| config.logging.format.clone());
    setup_tracing(&log_format, &config.logging.level, cli.verbose)?;

    match cli.command {
        Commands::Run {
            seeds,
            workers,
            strategy,
            timeout_secs,
        } => {
            tracing::info!(seeds = seeds.len(), workers, "Starting local cluster");
            run_cluster(config, seeds, workers, strategy, timeout_secs).await?;
        }

        Commands::Crawl {
            seeds,
            strategy,
            max_pages,
            max_depth,
        } => {
            tracing::info!(seeds = seeds.len(), strategy = ?strategy, "Starting crawl command");
            crawl(config, seeds, strategy, max_pages, max_depth).await?;
        }

        Commands::Coordinator { bind } => {
            run_coordinator(config, bind).await?;
        }

        Commands::Worker { node_id, max_tasks } => {
            run_worker(config, node_id, max_tasks).await?;
        }

        Commands::Submit {
            urls,
            priority,
            server,
        } => {
            let response = control_client(&server)?.submit(urls, priority).await?;
            println!("Submitted {} task(s)", response.submitted);
            for id in response.task_ids {
                println!("  {id}");
            }
        }

        Commands::Stats { server } => {
            let stats = control_client(&server)?.stats().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }

        Commands::Nodes { role, server } => {
            let nodes = control_client(&server)?.nodes(role).await?;
            println!("{}", serde_json::to_string_pretty(&nodes)?);
        }
    }

    Ok(())
}

fn setup_tracing(format: &str, level: &str, verbose: bool) -> Result<()> {
    let env_filter = if verbose {
        tracing_subscriber::EnvFilter::new("fleetcrawl=debug,info")
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(format!("fleetcrawl={level},warn")))
    };

    match format {
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
        }
    }

    Ok(())
}

fn control_client(server: &str) -> Result<ControlClient> {
    Ok(ControlClient::new(ClientConfig::new(server))?)
}

fn http_visitor(config: &Config) -> Result<SharedVisitor> {
    Ok(Arc::new(PoliteFetcher::from_config(&config.crawler)?))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }
    tracing::info!("Shutdown signal received");
}

async fn run_cluster(
    mut config: Config,
    seeds: Vec<String>,
    workers: usize,
    strategy: Option<TraversalStrategy>,
    timeout_secs: u64,
) -> Result<()> {
    if let Some(strategy) = strategy {
        config.crawler.strategy = strategy;
    }
    config.validate()?;
    fleetcrawl::metrics::init_metrics().map_err(|e| anyhow::anyhow!("{e}"))?;

    let visitor = http_visitor(&config)?;
    let cluster = LocalCluster::start(&config, workers, visitor).await?;
    let seeds: Vec<Seed> = seeds.into_iter().map(Seed::new).collect();
    cluster.seed(&seeds).await?;

    let drained = tokio::select! {
        result = cluster.wait_until_drained(
            Duration::from_millis(200),
            Duration::from_secs(timeout_secs),
        ) => Some(result),
        _ = shutdown_signal() => None,
    };

    for (node, stats) in cluster.worker_stats().await {
        tracing::info!(
            node = %node,
            completed = stats.tasks_completed,
            failed = stats.tasks_failed,
            refused = stats.tasks_refused,
            avg_task_secs = stats.avg_task_time(),
            "Worker summary"
        );
    }
    cluster.shutdown().await;

    match drained {
        Some(result) => {
            let stats = result?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        None => println!("Interrupted"),
    }
    Ok(())
}

async fn crawl(
    config: Config,
    seeds: Vec<String>,
    strategy: Option<TraversalStrategy>,
    max_pages: Option<usize>,
    max_depth: Option<u32>,
) -> Result<()> {
    let mut settings = TraversalSettings::from_config(&config.crawler);
    if let Some(max_pages) = max_pages {
        settings.max_pages = max_pages;
    }
    if let Some(max_depth) = max_depth {
        settings.max_depth = max_depth;
    }
    let strategy = strategy.unwrap_or(config.crawler.strategy);

    let visitor = http_visitor(&config)?;
    let seeds: Vec<Seed> = seeds.into_iter().map(Seed::new).collect();
    let report = run_local(strategy, seeds, visitor, settings).await?;

    tracing::info!(
        strategy = %report.strategy,
        pages = report.pages_crawled(),
        failures = report.failures.len(),
        elapsed_ms = report.elapsed.as_millis() as u64,
        "Crawl finished"
    );
    for page in &report.pages {
        println!("{}\t{}\t{}", page.status_code, page.depth, page.url);
    }
    for failure in &report.failures {
        println!("ERR\t{}\t{}\t{}", failure.depth, failure.url, failure.error);
    }
    Ok(())
}

async fn run_coordinator(mut config: Config, bind: Option<String>) -> Result<()> {
    if let Some(bind) = bind {
        config.api.bind_address = bind;
    }
    config.cluster.node_role = NodeRole::Coordinator;
    config.validate()?;
    fleetcrawl::metrics::init_metrics().map_err(|e| anyhow::anyhow!("{e}"))?;

    let queue = build_queue(&config.storage).await?;
    let registry = build_registry(&config.storage, config.cluster.heartbeat_interval()).await?;
    let transport = build_transport(&config.storage).await?;

    let frontier = Arc::new(QueueFrontier::new(
        Arc::clone(&queue),
        config.crawler.strategy,
        &TraversalSettings::from_config(&config.crawler),
        config.crawler.max_retries,
    ));
    let coordinator =
        Arc::new(Coordinator::new(&config, queue, registry, transport).with_frontier(frontier));
    let handle = Arc::clone(&coordinator).run().await?;

    api::serve(Arc::clone(&coordinator), &config.api, shutdown_signal()).await?;

    handle.shutdown().await;
    tracing::info!("Coordinator stopped");
    Ok(())
}

async fn run_worker(mut config: Config, node_id: Option<String>, max_tasks: Option<u32>) -> Result<()> {
    if let Some(node_id) = node_id {
        config.cluster.node_id = node_id;
    }
    if let Some(max_tasks) = max_tasks {
        config.cluster.max_concurrent_tasks = max_tasks;
    }
    config.cluster.node_role = NodeRole::Crawler;
    config.validate()?;
    fleetcrawl::metrics::init_metrics().map_err(|e| anyhow::anyhow!("{e}"))?;

    let queue = build_queue(&config.storage).await?;
    let registry = build_registry(&config.storage, config.cluster.heartbeat_interval()).await?;
    let transport = build_transport(&config.storage).await?;
    let visitor = http_visitor(&config)?;

    let worker = Arc::new(WorkerNode::new(&config, queue, registry, transport, visitor));
    let handle = worker.run().await?;

    shutdown_signal().await;
    handle.shutdown().await;
    tracing::info!("Worker stopped");
    Ok(())
}
