//! Query Builder
//!
//! Compiles a [`NodeRequestOptions`] into a search header and body:
//!
//! ```text
//! query:  bool { must: [filters...], filter: [exists(node field), range(timestamp)] }
//! aggs:   waffle = <rule 0>
//!           <rule 0 id> = <rule 1>
//!             ...
//!               <rule k-1 id> = terms(node field)
//!                 <metric> = avg/max/value_count(metric field)
//! ```
//!
//! The children of a bucket produced by a group-by rule live under a
//! sub-aggregation named after that rule's id. With no grouping, `waffle` is
//! the node terms aggregation itself.

use std::collections::{BTreeMap, HashSet};

use super::error::{NodesError, NodesResult};
use super::model::{Filter, GroupByRule, MetricType, NodeRequestOptions};
use super::query::{
    Aggregation, BoolQuery, MultiSearchHeader, MultiSearchRequest, QueryExpression, SearchBody,
    TermsPartition,
};

/// Name of the outermost aggregation in every nodes query
pub const NODES_AGGREGATION: &str = "waffle";

/// Name of the cardinality aggregation used to size partitions
pub const NODE_COUNT_AGGREGATION: &str = "nodeCount";

/// Date format of the time range bounds
pub const TIMESTAMP_FORMAT: &str = "epoch_millis";

/// Identifies one slice of a partitioned request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Partition {
    pub id: u32,
    pub count: u32,
}

impl Partition {
    pub fn new(id: u32, count: u32) -> Self {
        Self { id, count }
    }

    /// The whole document space as one partition
    pub fn single() -> Self {
        Self { id: 0, count: 1 }
    }

    pub fn is_partitioned(&self) -> bool {
        self.count > 1
    }
}

/// Bucket caps applied by the builder
#[derive(Debug, Clone)]
pub struct BuilderSettings {
    /// Maximum buckets per terms group-by level
    pub group_bucket_limit: u32,
    /// Maximum node buckets per group (per partition)
    pub node_bucket_limit: u32,
}

impl Default for BuilderSettings {
    fn default() -> Self {
        Self {
            group_bucket_limit: 20,
            node_bucket_limit: 1000,
        }
    }
}

/// A built query for one partition
#[derive(Debug, Clone, PartialEq)]
pub struct NodesQuery {
    pub partition: Partition,
    pub header: MultiSearchHeader,
    pub body: SearchBody,
}

impl NodesQuery {
    /// Single-pair multi-search request for this query
    pub fn to_request(&self) -> MultiSearchRequest {
        MultiSearchRequest::new().with(self.header.clone(), self.body.clone())
    }
}

impl MultiSearchRequest {
    /// Interleave several queries into one request, in the given order
    pub fn from_queries(queries: &[NodesQuery]) -> Self {
        let mut request = MultiSearchRequest::new();
        for query in queries {
            request.push(query.header.clone(), query.body.clone());
        }
        request
    }
}

/// Translates request options into backend query documents
#[derive(Debug, Clone, Default)]
pub struct QueryBuilder {
    settings: BuilderSettings,
}

impl QueryBuilder {
    pub fn new(settings: BuilderSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &BuilderSettings {
        &self.settings
    }

    /// Build the unpartitioned query
    pub fn build(&self, options: &NodeRequestOptions) -> NodesResult<NodesQuery> {
        self.build_partition(options, Partition::single())
    }

    /// Build the query restricted to one partition of the node keys
    pub fn build_partition(
        &self,
        options: &NodeRequestOptions,
        partition: Partition,
    ) -> NodesResult<NodesQuery> {
        self.validate(options)?;

        let mut aggregations = BTreeMap::new();
        aggregations.insert(
            NODES_AGGREGATION.to_string(),
            self.aggregations(options, partition),
        );

        Ok(NodesQuery {
            partition,
            header: Self::header(options),
            body: SearchBody {
                query: Some(Self::query(options)),
                aggregations,
                size: None,
            },
        })
    }

    /// Build a query counting distinct nodes matching the request
    pub fn build_cardinality(&self, options: &NodeRequestOptions) -> NodesResult<NodesQuery> {
        self.validate(options)?;

        let mut aggregations = BTreeMap::new();
        aggregations.insert(
            NODE_COUNT_AGGREGATION.to_string(),
            Aggregation::cardinality(options.node_field()),
        );

        Ok(NodesQuery {
            partition: Partition::single(),
            header: Self::header(options),
            body: SearchBody {
                query: Some(Self::query(options)),
                aggregations,
                size: Some(0),
            },
        })
    }

    /// Check required fields and the request's structural invariants
    pub fn validate(&self, options: &NodeRequestOptions) -> NodesResult<()> {
        if options.metrics.is_empty() {
            return Err(NodesError::InvalidRequest(
                "at least one metric is required".to_string(),
            ));
        }

        if options.nodes_key != options.node_type.nodes_key() {
            return Err(NodesError::InvalidRequest(format!(
                "nodes key '{}' does not match node type '{}'",
                options.nodes_key, options.node_type
            )));
        }

        if options.timerange.from > options.timerange.to {
            return Err(NodesError::InvalidRequest(format!(
                "time range starts after it ends ({} > {})",
                options.timerange.from, options.timerange.to
            )));
        }

        if options.node_field().is_empty() {
            return Err(NodesError::InvalidRequest(format!(
                "no field configured for {} nodes",
                options.node_type
            )));
        }

        let mut seen = HashSet::new();
        for rule in &options.group_by {
            if rule.id().is_empty() {
                return Err(NodesError::InvalidRequest(
                    "group by rule has an empty id".to_string(),
                ));
            }
            if !seen.insert(rule.id()) {
                return Err(NodesError::InvalidRequest(format!(
                    "duplicate group by id '{}'",
                    rule.id()
                )));
            }
            match rule {
                GroupByRule::Terms { id, field, .. } => {
                    if field.trim().is_empty() {
                        return Err(NodesError::InvalidRequest(format!(
                            "terms group by '{}' has an empty field",
                            id
                        )));
                    }
                }
                GroupByRule::Filters { id, filters, .. } => {
                    if filters.is_empty() {
                        return Err(NodesError::InvalidRequest(format!(
                            "filters group by '{}' has no filters",
                            id
                        )));
                    }
                    if let Some(filter) = filters.iter().find(|f| f.query.trim().is_empty()) {
                        return Err(NodesError::InvalidRequest(format!(
                            "filter '{}' of group by '{}' has an empty query",
                            filter.id, id
                        )));
                    }
                    // Buckets are keyed by label, or id when unlabelled
                    let mut keys = HashSet::new();
                    if let Some(filter) = filters.iter().find(|f| !keys.insert(f.key())) {
                        return Err(NodesError::InvalidRequest(format!(
                            "filters group by '{}' has duplicate filter key '{}'",
                            id,
                            filter.key()
                        )));
                    }
                }
            }
        }

        for filter in &options.filters {
            let missing = match filter {
                Filter::Match { field, .. } | Filter::Exists { field } => field.is_empty(),
                Filter::QueryString { query } => query.is_empty(),
            };
            if missing {
                return Err(NodesError::InvalidRequest(format!(
                    "filter is missing its field or query: {:?}",
                    filter
                )));
            }
        }

        Ok(())
    }

    fn header(options: &NodeRequestOptions) -> MultiSearchHeader {
        let source = &options.source_configuration;
        let mut index = vec![source.metric_alias.clone()];
        if options.metrics.contains(&MetricType::LogRate) && source.log_alias != source.metric_alias {
            index.push(source.log_alias.clone());
        }
        MultiSearchHeader { index }
    }

    fn query(options: &NodeRequestOptions) -> QueryExpression {
        let timerange = &options.timerange;
        let must = options.filters.iter().map(Self::filter_expression).collect();

        QueryExpression::Bool(BoolQuery {
            must,
            should: Vec::new(),
            filter: vec![
                QueryExpression::exists(options.node_field()),
                QueryExpression::range(
                    &options.source_configuration.fields.timestamp,
                    timerange.from,
                    timerange.to,
                    TIMESTAMP_FORMAT,
                ),
            ],
        })
    }

    fn filter_expression(filter: &Filter) -> QueryExpression {
        match filter {
            Filter::Match { field, value } => QueryExpression::matches(field, value),
            Filter::Exists { field } => QueryExpression::exists(field),
            Filter::QueryString { query } => QueryExpression::query_string(query),
        }
    }

    fn aggregations(&self, options: &NodeRequestOptions, partition: Partition) -> Aggregation {
        let mut current = self.node_aggregation(options, partition);
        for rule in options.group_by.iter().rev() {
            current = self.group_aggregation(rule).with_sub(rule.id(), current);
        }
        current
    }

    fn node_aggregation(&self, options: &NodeRequestOptions, partition: Partition) -> Aggregation {
        let mut aggregation = Aggregation::terms(options.node_field(), self.settings.node_bucket_limit);
        if partition.is_partitioned() {
            aggregation = aggregation.with_partition(TermsPartition {
                partition: partition.id,
                num_partitions: partition.count,
            });
        }

        let metric_fields = &options.source_configuration.fields.metrics;
        for metric in &options.metrics {
            if let (Some(kind), Some(field)) = (metric.aggregation(), metric.field(metric_fields)) {
                aggregation = aggregation.with_sub(metric.as_str(), Aggregation::metric(kind, field));
            }
        }
        aggregation
    }

    fn group_aggregation(&self, rule: &GroupByRule) -> Aggregation {
        match rule {
            GroupByRule::Terms { field, .. } => {
                Aggregation::terms(field, self.settings.group_bucket_limit)
            }
            GroupByRule::Filters { filters, .. } => Aggregation::filters(
                filters
                    .iter()
                    .map(|f| (f.key().to_string(), QueryExpression::query_string(&f.query)))
                    .collect(),
            ),
        }
    }
}
