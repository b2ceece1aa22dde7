//! infra-nodes CLI
//!
//! Command-line interface for the nodes query pipeline:
//! - Query nodes, optionally grouped, with their metrics
//! - Print the multi-search request a query would send
//! - Generate a default config file

use anyhow::{anyhow, bail, Context};
use chrono::Duration;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use infra_nodes::config::{generate_default_config, Config};
use infra_nodes::nodes::{
    CancellationScope, DropEmptyBuckets, Filter, GroupByRule, MetricType, MultiSearchRequest,
    NodeRequestOptions, NodeType, NodesAdapter, NodesError, Timerange,
};

#[derive(Parser)]
#[command(name = "infra-nodes")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Query hosts, pods, containers and services from a search backend")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file (default: standard locations, then environment)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Query nodes
    Nodes {
        /// Node type (host, pod, container, service)
        node_type: String,
        /// Metrics to return (count, cpu, load, memory, tx, rx, logRate)
        #[arg(short, long, default_value = "count")]
        metric: Vec<String>,
        /// Time range ending now (e.g., 15m, 1h, 2d)
        #[arg(short, long, default_value = "15m")]
        last: String,
        /// Group by a field; repeat to nest, outermost first
        #[arg(short, long)]
        group_by: Vec<String>,
        /// Query string filter; repeat to combine
        #[arg(short, long)]
        filter: Vec<String>,
        /// Number of partitions (default: estimated from the node count)
        #[arg(short, long)]
        partitions: Option<u32>,
        /// Print the multi-search request instead of executing it
        #[arg(long)]
        dry_run: bool,
        /// Remove groups and nodes without documents
        #[arg(long)]
        drop_empty: bool,
    },

    /// Generate default config file
    Config {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Config { output } => {
            let config = generate_default_config();

            match output {
                Some(path) => {
                    if let Some(parent) = path.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    std::fs::write(&path, &config)?;
                    println!("Config written to {:?}", path);
                }
                None => {
                    print!("{}", config);
                }
            }
        }

        Commands::Nodes {
            node_type,
            metric,
            last,
            group_by,
            filter,
            partitions,
            dry_run,
            drop_empty,
        } => {
            // Load errors are returned, not logged: no subscriber exists yet
            let config = Config::resolve(cli.config.as_deref())
                .context("Failed to load configuration")?;
            init_logging(&config);

            let node_type = NodeType::from_str(&node_type)
                .ok_or_else(|| anyhow!("Unknown node type: {}", node_type))?;

            let mut builder = NodeRequestOptions::builder(node_type)
                .source(config.source.clone())
                .timerange(Timerange::last(parse_duration(&last)?));
            for name in &metric {
                let metric = MetricType::from_str(name)
                    .ok_or_else(|| anyhow!("Unknown metric: {}", name))?;
                builder = builder.metric(metric);
            }
            for (i, field) in group_by.iter().enumerate() {
                builder = builder.group_by(GroupByRule::terms(format!("g{}", i), field));
            }
            for query in &filter {
                builder = builder.filter(Filter::query_string(query));
            }
            let options = builder.build();

            let mut adapter = NodesAdapter::from_config(&config)
                .context("Failed to create search backend client")?;
            if drop_empty {
                adapter = adapter.with_post(DropEmptyBuckets);
            }

            if dry_run {
                let queries = adapter.prepare(&options, partitions.unwrap_or(1))?;
                print!("{}", MultiSearchRequest::from_queries(&queries).to_ndjson()?);
                return Ok(());
            }

            let scope = CancellationScope::new();
            let interrupt = {
                let scope = scope.clone();
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        tracing::warn!("Interrupt received, cancelling request");
                        scope.cancel();
                    }
                })
            };

            let result = adapter.get_nodes_with(&options, partitions, &scope).await;
            interrupt.abort();

            match result {
                Ok(response) => println!("{}", serde_json::to_string_pretty(&response)?),
                Err(NodesError::Cancelled) => bail!("Request cancelled"),
                Err(e) => return Err(e.into()),
            }
        }
    }

    Ok(())
}

fn init_logging(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    let registry = tracing_subscriber::registry().with(filter);

    match config.logging.format.as_str() {
        "json" => registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init(),
        _ => registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init(),
    }
}

fn parse_duration(s: &str) -> anyhow::Result<Duration> {
    let s = s.trim().to_lowercase();

    if let Some(seconds) = s.strip_suffix('s') {
        Ok(Duration::seconds(seconds.parse()?))
    } else if let Some(minutes) = s.strip_suffix('m') {
        Ok(Duration::minutes(minutes.parse()?))
    } else if let Some(hours) = s.strip_suffix('h') {
        Ok(Duration::hours(hours.parse()?))
    } else if let Some(days) = s.strip_suffix('d') {
        Ok(Duration::days(days.parse()?))
    } else {
        bail!("Invalid duration format: {}. Use: 30s, 15m, 1h, 2d", s)
    }
}
