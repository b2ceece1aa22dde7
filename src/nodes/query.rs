//! Backend Query Documents
//!
//! Query expressions, aggregation clauses and the multi-search request
//! format. Everything here serializes to the backend's JSON shape as-is.
//!
//! ```text
//! {"index": ["metricbeat-*"]}
//! {"query": {"bool": {...}}, "aggs": {"waffle": {"terms": {...}, "aggs": {...}}}, "size": 0}
//! ```

use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use std::collections::BTreeMap;

use super::model::MetricAggregation;

/// A backend query expression
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryExpression {
    Bool(BoolQuery),
    Range(BTreeMap<String, RangeBounds>),
    Exists { field: String },
    QueryString { query: String, analyze_wildcard: bool },
    Match(BTreeMap<String, MatchQuery>),
}

impl QueryExpression {
    /// Inclusive range over a field
    pub fn range(field: impl Into<String>, gte: i64, lte: i64, format: impl Into<String>) -> Self {
        let mut bounds = BTreeMap::new();
        bounds.insert(
            field.into(),
            RangeBounds {
                gte,
                lte,
                format: format.into(),
            },
        );
        Self::Range(bounds)
    }

    pub fn exists(field: impl Into<String>) -> Self {
        Self::Exists {
            field: field.into(),
        }
    }

    /// Query string with wildcard analysis enabled
    pub fn query_string(query: impl Into<String>) -> Self {
        Self::QueryString {
            query: query.into(),
            analyze_wildcard: true,
        }
    }

    pub fn matches(field: impl Into<String>, query: impl Into<String>) -> Self {
        let mut fields = BTreeMap::new();
        fields.insert(
            field.into(),
            MatchQuery {
                query: query.into(),
            },
        );
        Self::Match(fields)
    }
}

/// Boolean combination of expressions
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BoolQuery {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub must: Vec<QueryExpression>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub should: Vec<QueryExpression>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub filter: Vec<QueryExpression>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RangeBounds {
    pub gte: i64,
    pub lte: i64,
    pub format: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchQuery {
    pub query: String,
}

/// An aggregation clause with its named sub-aggregations
#[derive(Debug, Clone, PartialEq)]
pub struct Aggregation {
    pub kind: AggregationKind,
    pub aggs: BTreeMap<String, Aggregation>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AggregationKind {
    Terms(TermsAggregation),
    Filters {
        filters: BTreeMap<String, QueryExpression>,
    },
    Metric {
        aggregation: MetricAggregation,
        field: String,
    },
    Cardinality {
        field: String,
    },
}

/// Terms aggregation ordered by key, optionally restricted to one partition
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TermsAggregation {
    pub field: String,
    pub size: u32,
    pub order: KeyOrder,
    #[serde(rename = "include", skip_serializing_if = "Option::is_none")]
    pub partition: Option<TermsPartition>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct KeyOrder {
    #[serde(rename = "_key")]
    pub key: SortDirection,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

/// Backend-native partitioning of a terms aggregation's keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TermsPartition {
    pub partition: u32,
    pub num_partitions: u32,
}

impl Aggregation {
    fn new(kind: AggregationKind) -> Self {
        Self {
            kind,
            aggs: BTreeMap::new(),
        }
    }

    pub fn terms(field: impl Into<String>, size: u32) -> Self {
        Self::new(AggregationKind::Terms(TermsAggregation {
            field: field.into(),
            size,
            order: KeyOrder::default(),
            partition: None,
        }))
    }

    pub fn filters(filters: BTreeMap<String, QueryExpression>) -> Self {
        Self::new(AggregationKind::Filters { filters })
    }

    pub fn metric(aggregation: MetricAggregation, field: impl Into<String>) -> Self {
        Self::new(AggregationKind::Metric {
            aggregation,
            field: field.into(),
        })
    }

    pub fn cardinality(field: impl Into<String>) -> Self {
        Self::new(AggregationKind::Cardinality {
            field: field.into(),
        })
    }

    /// Restrict a terms aggregation to one partition; no-op for other kinds
    pub fn with_partition(mut self, partition: TermsPartition) -> Self {
        if let AggregationKind::Terms(terms) = &mut self.kind {
            terms.partition = Some(partition);
        }
        self
    }

    pub fn with_sub(mut self, name: impl Into<String>, aggregation: Aggregation) -> Self {
        self.aggs.insert(name.into(), aggregation);
        self
    }

    pub fn sub(&self, name: &str) -> Option<&Aggregation> {
        self.aggs.get(name)
    }
}

#[derive(Serialize)]
struct FieldBody<'a> {
    field: &'a str,
}

impl Serialize for Aggregation {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        match &self.kind {
            AggregationKind::Terms(terms) => map.serialize_entry("terms", terms)?,
            AggregationKind::Filters { filters } => {
                let mut body = BTreeMap::new();
                body.insert("filters", filters);
                map.serialize_entry("filters", &body)?;
            }
            AggregationKind::Metric { aggregation, field } => {
                map.serialize_entry(aggregation.as_str(), &FieldBody { field })?
            }
            AggregationKind::Cardinality { field } => {
                map.serialize_entry("cardinality", &FieldBody { field })?
            }
        }
        if !self.aggs.is_empty() {
            map.serialize_entry("aggs", &self.aggs)?;
        }
        map.end()
    }
}

/// Query/aggregation body of a search
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SearchBody {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<QueryExpression>,
    #[serde(rename = "aggs", skip_serializing_if = "BTreeMap::is_empty")]
    pub aggregations: BTreeMap<String, Aggregation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u32>,
}

/// Routing header selecting the target indices of the following body
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MultiSearchHeader {
    pub index: Vec<String>,
}

/// One line of a multi-search request
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SearchRequest {
    Header(MultiSearchHeader),
    Body(SearchBody),
}

/// Interleaved header/body pairs sent in a single round trip
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MultiSearchRequest {
    lines: Vec<SearchRequest>,
}

impl MultiSearchRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, header: MultiSearchHeader, body: SearchBody) {
        self.lines.push(SearchRequest::Header(header));
        self.lines.push(SearchRequest::Body(body));
    }

    pub fn with(mut self, header: MultiSearchHeader, body: SearchBody) -> Self {
        self.push(header, body);
        self
    }

    /// Number of header/body pairs
    pub fn len(&self) -> usize {
        self.lines.len() / 2
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn lines(&self) -> &[SearchRequest] {
        &self.lines
    }

    /// Bodies in pair order
    pub fn bodies(&self) -> impl Iterator<Item = &SearchBody> {
        self.lines.iter().filter_map(|line| match line {
            SearchRequest::Body(body) => Some(body),
            SearchRequest::Header(_) => None,
        })
    }

    /// Newline-delimited JSON, one line per header or body
    pub fn to_ndjson(&self) -> Result<String, serde_json::Error> {
        let mut out = String::new();
        for line in &self.lines {
            out.push_str(&serde_json::to_string(line)?);
            out.push('\n');
        }
        Ok(out)
    }
}
