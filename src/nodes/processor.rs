//! Processor Chain
//!
//! Ordered middleware over a document. Each stage receives the document and a
//! continuation for the rest of the chain; it may change the document before
//! calling the continuation, after it returns, or both. The first stage is
//! the outermost wrapper, so a chain `[A, B, C]` applied to `d` computes
//! `A(B(C(d)))` with A seeing the input first and the output last.
//!
//! Requests run through a `ProcessorChain<SearchBody>` before they are sent,
//! and every partition response through a `ProcessorChain<SearchResponse>`
//! before it is merged. Stages see the request they serve through
//! [`ProcessorOptions`]: the node options and the partition being processed.

use std::fmt;

use super::builder::Partition;
use super::model::{MetricType, NodeRequestOptions};
use super::query::{BoolQuery, QueryExpression, SearchBody};
use super::response::{AggregationResult, Bucket, SearchResponse};

/// Request context handed to every stage
#[derive(Debug, Clone, Copy)]
pub struct ProcessorOptions<'a> {
    pub node_options: &'a NodeRequestOptions,
    pub partition: Partition,
}

impl<'a> ProcessorOptions<'a> {
    pub fn new(node_options: &'a NodeRequestOptions, partition: Partition) -> Self {
        Self {
            node_options,
            partition,
        }
    }

    /// Field holding the node key for this request's node type
    pub fn node_field(&self) -> &'a str {
        self.node_options.node_field()
    }
}

/// One stage of a processor chain
pub trait Processor<T>: Send + Sync {
    /// Stage name used in logs
    fn name(&self) -> &str;

    /// Transform `doc`, delegating to the remaining stages through `next`
    fn process(&self, options: &ProcessorOptions<'_>, doc: T, next: Next<'_, T>) -> T;
}

/// Continuation over the stages after the current one
pub struct Next<'a, T> {
    options: &'a ProcessorOptions<'a>,
    stages: &'a [Box<dyn Processor<T>>],
}

impl<'a, T> Next<'a, T> {
    /// Run the remaining stages; identity once the chain is exhausted
    pub fn run(self, doc: T) -> T {
        match self.stages.split_first() {
            Some((stage, rest)) => {
                tracing::trace!(
                    stage = stage.name(),
                    partition = self.options.partition.id,
                    "Running processor"
                );
                stage.process(
                    self.options,
                    doc,
                    Next {
                        options: self.options,
                        stages: rest,
                    },
                )
            }
            None => doc,
        }
    }
}

/// An ordered list of processors
pub struct ProcessorChain<T> {
    stages: Vec<Box<dyn Processor<T>>>,
}

impl<T> ProcessorChain<T> {
    pub fn new() -> Self {
        Self { stages: Vec::new() }
    }

    /// Append a stage, builder style
    pub fn with(mut self, stage: impl Processor<T> + 'static) -> Self {
        self.push(stage);
        self
    }

    /// Append a stage; it runs inside every stage already present
    pub fn push(&mut self, stage: impl Processor<T> + 'static) {
        self.stages.push(Box::new(stage));
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.stages.iter().map(|stage| stage.name()).collect()
    }

    /// Run `doc` through every stage for the given request
    pub fn apply(&self, options: &ProcessorOptions<'_>, doc: T) -> T {
        Next {
            options,
            stages: &self.stages,
        }
        .run(doc)
    }
}

impl<T> Default for ProcessorChain<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for ProcessorChain<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

// ============================================================================
// Request stages
// ============================================================================

/// Suppresses hits in the response; only aggregations are read
#[derive(Debug, Clone, Copy, Default)]
pub struct ZeroHits;

impl Processor<SearchBody> for ZeroHits {
    fn name(&self) -> &str {
        "zero_hits"
    }

    fn process(
        &self,
        _options: &ProcessorOptions<'_>,
        body: SearchBody,
        next: Next<'_, SearchBody>,
    ) -> SearchBody {
        let mut body = next.run(body);
        body.size = Some(0);
        body
    }
}

/// Adds a filter clause to every request
#[derive(Debug, Clone)]
pub struct ExtraFilter {
    pub expression: QueryExpression,
}

impl ExtraFilter {
    pub fn new(expression: QueryExpression) -> Self {
        Self { expression }
    }
}

impl Processor<SearchBody> for ExtraFilter {
    fn name(&self) -> &str {
        "extra_filter"
    }

    fn process(
        &self,
        _options: &ProcessorOptions<'_>,
        mut body: SearchBody,
        next: Next<'_, SearchBody>,
    ) -> SearchBody {
        let query = match body.query.take() {
            Some(QueryExpression::Bool(mut query)) => {
                query.filter.push(self.expression.clone());
                query
            }
            Some(other) => BoolQuery {
                must: vec![other],
                should: Vec::new(),
                filter: vec![self.expression.clone()],
            },
            None => BoolQuery {
                filter: vec![self.expression.clone()],
                ..BoolQuery::default()
            },
        };
        body.query = Some(QueryExpression::Bool(query));
        next.run(body)
    }
}

// ============================================================================
// Response stages
// ============================================================================

/// Removes buckets without documents at every level
#[derive(Debug, Clone, Copy, Default)]
pub struct DropEmptyBuckets;

impl DropEmptyBuckets {
    fn prune(buckets: &mut Vec<Bucket>) {
        buckets.retain(|bucket| bucket.doc_count > 0);
        for bucket in buckets.iter_mut() {
            for result in bucket.aggregations.values_mut() {
                if let AggregationResult::Buckets(children) = result {
                    Self::prune(children);
                }
            }
        }
    }
}

impl Processor<SearchResponse> for DropEmptyBuckets {
    fn name(&self) -> &str {
        "drop_empty_buckets"
    }

    fn process(
        &self,
        _options: &ProcessorOptions<'_>,
        response: SearchResponse,
        next: Next<'_, SearchResponse>,
    ) -> SearchResponse {
        let mut response = next.run(response);
        for result in response.aggregations.values_mut() {
            if let AggregationResult::Buckets(buckets) = result {
                Self::prune(buckets);
            }
        }
        response
    }
}

/// Multiplies one metric's values, e.g. to turn bytes into bits
#[derive(Debug, Clone, Copy)]
pub struct ScaleMetric {
    pub metric: MetricType,
    pub factor: f64,
}

impl ScaleMetric {
    pub fn new(metric: MetricType, factor: f64) -> Self {
        Self { metric, factor }
    }

    fn scale(&self, buckets: &mut [Bucket]) {
        let name = self.metric.as_str();
        for bucket in buckets {
            for (key, result) in bucket.aggregations.iter_mut() {
                match result {
                    AggregationResult::Value(Some(value)) if key == name => {
                        *value *= self.factor;
                    }
                    AggregationResult::Buckets(children) => self.scale(children),
                    AggregationResult::Value(_) => {}
                }
            }
        }
    }
}

impl Processor<SearchResponse> for ScaleMetric {
    fn name(&self) -> &str {
        "scale_metric"
    }

    fn process(
        &self,
        _options: &ProcessorOptions<'_>,
        response: SearchResponse,
        next: Next<'_, SearchResponse>,
    ) -> SearchResponse {
        let mut response = next.run(response);
        for result in response.aggregations.values_mut() {
            if let AggregationResult::Buckets(buckets) = result {
                self.scale(buckets);
            }
        }
        response
    }
}
