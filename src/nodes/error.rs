//! Nodes error types
//!
//! Defines all error conditions that can occur while building, executing and
//! assembling a nodes request.

use thiserror::Error;

use super::backend::BackendError;
use super::model::{NodeRequestOptions, NodeType};

/// Errors surfaced to the caller of a nodes request
#[derive(Error, Debug)]
pub enum NodesError {
    /// Malformed request options, detected before any backend call
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// A backend call outside partition execution failed
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    /// Partition planning or execution failed
    #[error("Partition error for {node_type} nodes (group by [{}]): {source}", .group_by.join(", "))]
    Partition {
        node_type: NodeType,
        group_by: Vec<String>,
        #[source]
        source: PartitionError,
    },

    /// Response buckets do not match the aggregations that were requested
    #[error("Assembly error for {node_type} nodes (group by [{}]): {source}", .group_by.join(", "))]
    Assembly {
        node_type: NodeType,
        group_by: Vec<String>,
        #[source]
        source: AssemblyError,
    },

    /// The request's cancellation scope fired
    #[error("Request cancelled")]
    Cancelled,
}

impl NodesError {
    pub fn partition(options: &NodeRequestOptions, source: PartitionError) -> Self {
        Self::Partition {
            node_type: options.node_type,
            group_by: options.group_by_ids(),
            source,
        }
    }

    pub fn assembly(options: &NodeRequestOptions, source: AssemblyError) -> Self {
        Self::Assembly {
            node_type: options.node_type,
            group_by: options.group_by_ids(),
            source,
        }
    }
}

/// Failures of partitioned execution
#[derive(Error, Debug)]
pub enum PartitionError {
    #[error("number of partitions must be at least 1, got {0}")]
    InvalidCount(u32),

    #[error("partition {partition} failed after {attempts} attempt(s): {source}")]
    Exhausted {
        partition: u32,
        attempts: u32,
        #[source]
        source: BackendError,
    },

    #[error("expected {expected} partition results, received {received}")]
    Incomplete { expected: u32, received: u32 },
}

/// A bucket lacks the sub-aggregation its group-by rule should have produced
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("bucket '{bucket_key}' at depth {depth} has no aggregation '{rule_id}'")]
pub struct AssemblyError {
    pub depth: usize,
    pub rule_id: String,
    pub bucket_key: String,
}

/// Result type for nodes operations
pub type NodesResult<T> = Result<T, NodesError>;
