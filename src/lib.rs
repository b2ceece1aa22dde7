//! # infra-nodes
//!
//! Infrastructure nodes query pipeline: turns a request for hosts, pods,
//! containers or services into partitioned aggregation queries against a
//! search backend, and assembles the answers into typed nodes and groups.
//!
//! ## Modules
//!
//! - [`nodes`]: request model, query builder, partitioning, processor chains,
//!   result assembly and the concurrent adapter
//! - [`config`]: TOML configuration with environment overrides
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use infra_nodes::config::Config;
//! use infra_nodes::nodes::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::load_default();
//!     let adapter = NodesAdapter::from_config(&config)?;
//!
//!     // Pods per namespace, with CPU and memory
//!     let options = NodeRequestOptions::builder(NodeType::Pod)
//!         .source(config.source.clone())
//!         .last_minutes(15)
//!         .group_by(GroupByRule::terms("namespace", "kubernetes.namespace"))
//!         .metrics(&[MetricType::Cpu, MetricType::Memory])
//!         .build();
//!
//!     let response = adapter.get_nodes(&options).await?;
//!     println!("{} namespaces", response.total());
//!
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod nodes;

// Re-export top-level types for convenience
pub use nodes::{
    CancellationScope, GroupByRule, MetricType, Node, NodeGroup, NodeRequestOptions, NodeType,
    NodesAdapter, NodesError, NodesResponse, NodesResult,
};

pub use config::{BackendConfig, Config, ConfigError, LoggingConfig, QueryConfig};
