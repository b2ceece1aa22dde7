//! Infrastructure Nodes Query Pipeline
//!
//! Answers "show me the hosts, pods, containers or services matching these
//! filters, grouped this way, with these metrics" against a search backend:
//!
//! - **Model**: request options, group-by rules, metrics and source fields
//! - **Builder**: compiles a request into a multi-search header/body pair
//! - **Partition**: splits a request into N disjoint queries and merges results
//! - **Processor**: ordered middleware over request and response documents
//! - **Assembler**: turns merged buckets into nodes and nested groups
//! - **Adapter**: runs partitions concurrently with retries and cancellation
//!
//! # Request
//!
//! ```text
//! nodeType: host
//! groupBy:  [terms(cloud.availability_zone), filters(env:prod, env:dev)]
//! metrics:  [count, cpu]
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use infra_nodes::nodes::{GroupByRule, MetricType, NodeRequestOptions, NodeType, NodesAdapter};
//!
//! let adapter = NodesAdapter::from_config(&config)?;
//!
//! let options = NodeRequestOptions::builder(NodeType::Host)
//!     .last_minutes(15)
//!     .group_by(GroupByRule::terms("zone", "cloud.availability_zone"))
//!     .metrics(&[MetricType::Count, MetricType::Cpu])
//!     .build();
//!
//! let response = adapter.get_nodes(&options).await?;
//! println!("{}", serde_json::to_string_pretty(&response)?);
//! ```

mod adapter;
mod assembler;
mod backend;
mod builder;
mod error;
mod model;
mod node;
mod partition;
mod processor;
mod query;
mod response;

pub use adapter::{CancellationScope, NodesAdapter, RetryPolicy};
pub use assembler::assemble;
pub use backend::{BackendError, ElasticsearchClient, SearchBackend};
pub use builder::{
    BuilderSettings, NodesQuery, Partition, QueryBuilder, NODES_AGGREGATION,
    NODE_COUNT_AGGREGATION, TIMESTAMP_FORMAT,
};
pub use error::{AssemblyError, NodesError, NodesResult, PartitionError};
pub use model::{
    Filter, GroupByFilter, GroupByRule, MetricAggregation, MetricFields, MetricType,
    NodeRequestBuilder, NodeRequestOptions, NodeType, NodesKey, SourceConfiguration,
    SourceFields, Timerange,
};
pub use node::{Node, NodeDetails, NodeGroup, NodeMetrics, NodesResponse};
pub use partition::{PartitionPlanner, PartitionSettings};
pub use processor::{
    DropEmptyBuckets, ExtraFilter, Next, Processor, ProcessorChain, ProcessorOptions, ScaleMetric,
    ZeroHits,
};
pub use query::{
    Aggregation, AggregationKind, BoolQuery, MultiSearchHeader, MultiSearchRequest,
    QueryExpression, SearchBody, SearchRequest, TermsAggregation, TermsPartition,
};
pub use response::{AggregationResult, Bucket, MultiSearchResponse, SearchResponse};
