//! Request Model
//!
//! Typed vocabulary for a nodes request: which kind of node to fetch, where
//! the data lives, the time window, how to group, which metrics to compute
//! and which filters to apply.
//!
//! # Example
//!
//! ```rust,ignore
//! use infra_nodes::nodes::{GroupByRule, MetricType, NodeRequestOptions, NodeType};
//!
//! let options = NodeRequestOptions::builder(NodeType::Host)
//!     .last_minutes(15)
//!     .metrics(&[MetricType::Cpu, MetricType::Memory])
//!     .group_by(GroupByRule::terms("zone", "cloud.availability_zone"))
//!     .build();
//! ```

use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};

/// Kind of monitored entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    Host,
    Pod,
    Container,
    Service,
}

impl NodeType {
    /// Get all node types for iteration
    pub fn all() -> &'static [NodeType] {
        &[
            NodeType::Host,
            NodeType::Pod,
            NodeType::Container,
            NodeType::Service,
        ]
    }

    /// The response envelope key paired with this node type
    pub fn nodes_key(&self) -> NodesKey {
        match self {
            Self::Host => NodesKey::Hosts,
            Self::Pod => NodesKey::Pods,
            Self::Container => NodesKey::Containers,
            Self::Service => NodesKey::Services,
        }
    }

    /// Parse from string
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "host" | "hosts" => Some(Self::Host),
            "pod" | "pods" => Some(Self::Pod),
            "container" | "containers" => Some(Self::Container),
            "service" | "services" => Some(Self::Service),
            _ => None,
        }
    }
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Host => write!(f, "host"),
            Self::Pod => write!(f, "pod"),
            Self::Container => write!(f, "container"),
            Self::Service => write!(f, "service"),
        }
    }
}

/// Key under which nodes are returned in a flat response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodesKey {
    Hosts,
    Pods,
    Containers,
    Services,
}

impl NodesKey {
    /// The node type paired with this key
    pub fn node_type(&self) -> NodeType {
        match self {
            Self::Hosts => NodeType::Host,
            Self::Pods => NodeType::Pod,
            Self::Containers => NodeType::Container,
            Self::Services => NodeType::Service,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hosts => "hosts",
            Self::Pods => "pods",
            Self::Containers => "containers",
            Self::Services => "services",
        }
    }
}

impl std::fmt::Display for NodesKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where node telemetry is stored and how its fields are named
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfiguration {
    /// Index pattern holding metric documents
    #[serde(default = "default_metric_alias")]
    pub metric_alias: String,

    /// Index pattern holding log documents
    #[serde(default = "default_log_alias")]
    pub log_alias: String,

    #[serde(default)]
    pub fields: SourceFields,
}

fn default_metric_alias() -> String {
    "metricbeat-*".to_string()
}

fn default_log_alias() -> String {
    "filebeat-*".to_string()
}

impl Default for SourceConfiguration {
    fn default() -> Self {
        Self {
            metric_alias: default_metric_alias(),
            log_alias: default_log_alias(),
            fields: SourceFields::default(),
        }
    }
}

/// Field names for identity, time and metric values
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceFields {
    #[serde(default = "default_timestamp_field")]
    pub timestamp: String,

    #[serde(default = "default_host_field")]
    pub host: String,

    #[serde(default = "default_pod_field")]
    pub pod: String,

    #[serde(default = "default_container_field")]
    pub container: String,

    #[serde(default = "default_service_field")]
    pub service: String,

    #[serde(default)]
    pub metrics: MetricFields,
}

fn default_timestamp_field() -> String {
    "@timestamp".to_string()
}

fn default_host_field() -> String {
    "host.name".to_string()
}

fn default_pod_field() -> String {
    "kubernetes.pod.uid".to_string()
}

fn default_container_field() -> String {
    "container.id".to_string()
}

fn default_service_field() -> String {
    "service.name".to_string()
}

impl SourceFields {
    /// The field identifying a node of the given type
    pub fn node_field(&self, node_type: NodeType) -> &str {
        match node_type {
            NodeType::Host => &self.host,
            NodeType::Pod => &self.pod,
            NodeType::Container => &self.container,
            NodeType::Service => &self.service,
        }
    }
}

impl Default for SourceFields {
    fn default() -> Self {
        Self {
            timestamp: default_timestamp_field(),
            host: default_host_field(),
            pod: default_pod_field(),
            container: default_container_field(),
            service: default_service_field(),
            metrics: MetricFields::default(),
        }
    }
}

/// Field each metric aggregation reads from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricFields {
    #[serde(default = "default_cpu_field")]
    pub cpu: String,

    #[serde(default = "default_load_field")]
    pub load: String,

    #[serde(default = "default_memory_field")]
    pub memory: String,

    #[serde(default = "default_tx_field")]
    pub tx: String,

    #[serde(default = "default_rx_field")]
    pub rx: String,

    #[serde(default = "default_log_rate_field")]
    pub log_rate: String,
}

fn default_cpu_field() -> String {
    "system.cpu.total.norm.pct".to_string()
}

fn default_load_field() -> String {
    "system.load.5".to_string()
}

fn default_memory_field() -> String {
    "system.memory.actual.used.pct".to_string()
}

fn default_tx_field() -> String {
    "system.network.out.bytes".to_string()
}

fn default_rx_field() -> String {
    "system.network.in.bytes".to_string()
}

fn default_log_rate_field() -> String {
    "message".to_string()
}

impl Default for MetricFields {
    fn default() -> Self {
        Self {
            cpu: default_cpu_field(),
            load: default_load_field(),
            memory: default_memory_field(),
            tx: default_tx_field(),
            rx: default_rx_field(),
            log_rate: default_log_rate_field(),
        }
    }
}

/// Metrics that can be requested for each node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MetricType {
    /// Number of documents seen for the node
    Count,
    /// Average normalized CPU usage
    Cpu,
    /// Average 5 minute load
    Load,
    /// Average memory usage
    Memory,
    /// Peak outbound network counter
    Tx,
    /// Peak inbound network counter
    Rx,
    /// Number of log lines in the window
    LogRate,
}

impl MetricType {
    /// Get all metric types for iteration
    pub fn all() -> &'static [MetricType] {
        &[
            MetricType::Count,
            MetricType::Cpu,
            MetricType::Load,
            MetricType::Memory,
            MetricType::Tx,
            MetricType::Rx,
            MetricType::LogRate,
        ]
    }

    /// Name used for the metric's aggregation and in responses
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Count => "count",
            Self::Cpu => "cpu",
            Self::Load => "load",
            Self::Memory => "memory",
            Self::Tx => "tx",
            Self::Rx => "rx",
            Self::LogRate => "logRate",
        }
    }

    /// Backend aggregation computing this metric, `None` for the document count
    pub fn aggregation(&self) -> Option<MetricAggregation> {
        match self {
            Self::Count => None,
            Self::Cpu | Self::Load | Self::Memory => Some(MetricAggregation::Avg),
            Self::Tx | Self::Rx => Some(MetricAggregation::Max),
            Self::LogRate => Some(MetricAggregation::ValueCount),
        }
    }

    /// Source field the metric aggregation reads
    pub fn field<'a>(&self, fields: &'a MetricFields) -> Option<&'a str> {
        match self {
            Self::Count => None,
            Self::Cpu => Some(&fields.cpu),
            Self::Load => Some(&fields.load),
            Self::Memory => Some(&fields.memory),
            Self::Tx => Some(&fields.tx),
            Self::Rx => Some(&fields.rx),
            Self::LogRate => Some(&fields.log_rate),
        }
    }

    /// Parse from string
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "count" => Some(Self::Count),
            "cpu" => Some(Self::Cpu),
            "load" => Some(Self::Load),
            "memory" | "mem" => Some(Self::Memory),
            "tx" => Some(Self::Tx),
            "rx" => Some(Self::Rx),
            "lograte" | "log_rate" => Some(Self::LogRate),
            _ => None,
        }
    }
}

impl std::fmt::Display for MetricType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Single-value aggregation used for a metric
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricAggregation {
    Avg,
    Max,
    ValueCount,
}

impl MetricAggregation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Avg => "avg",
            Self::Max => "max",
            Self::ValueCount => "value_count",
        }
    }
}

/// Time window of a request, bounds in epoch milliseconds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timerange {
    pub from: i64,
    pub to: i64,
    /// Bucket interval hint, e.g. "1m"
    #[serde(default = "default_interval")]
    pub interval: String,
}

fn default_interval() -> String {
    "1m".to_string()
}

impl Timerange {
    pub fn new(from: i64, to: i64, interval: impl Into<String>) -> Self {
        Self {
            from,
            to,
            interval: interval.into(),
        }
    }

    /// Window ending now
    pub fn last(duration: Duration) -> Self {
        let to = Utc::now();
        let from = to - duration;
        Self::new(from.timestamp_millis(), to.timestamp_millis(), default_interval())
    }

    pub fn last_minutes(minutes: i64) -> Self {
        Self::last(Duration::minutes(minutes))
    }
}

/// A caller-supplied filter, translated into a query leaf unchanged
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Filter {
    /// Field must match the value
    Match { field: String, value: String },
    /// Field must be present
    Exists { field: String },
    /// Free-form query string
    QueryString { query: String },
}

impl Filter {
    pub fn matches(field: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Match {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn exists(field: impl Into<String>) -> Self {
        Self::Exists {
            field: field.into(),
        }
    }

    pub fn query_string(query: impl Into<String>) -> Self {
        Self::QueryString {
            query: query.into(),
        }
    }
}

/// A named filter used as one bucket of a filters group-by
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupByFilter {
    pub id: String,
    #[serde(default)]
    pub label: Option<String>,
    pub query: String,
}

impl GroupByFilter {
    pub fn new(id: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: None,
            query: query.into(),
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Bucket key produced for this filter (label, falling back to id)
    pub fn key(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.id)
    }
}

/// One level of grouping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum GroupByRule {
    /// Bucket by the distinct values of a field
    Terms {
        id: String,
        #[serde(default)]
        label: Option<String>,
        field: String,
    },
    /// Bucket by named filter predicates
    Filters {
        id: String,
        #[serde(default)]
        label: Option<String>,
        filters: Vec<GroupByFilter>,
    },
}

impl GroupByRule {
    pub fn terms(id: impl Into<String>, field: impl Into<String>) -> Self {
        Self::Terms {
            id: id.into(),
            label: None,
            field: field.into(),
        }
    }

    pub fn filters(id: impl Into<String>, filters: Vec<GroupByFilter>) -> Self {
        Self::Filters {
            id: id.into(),
            label: None,
            filters,
        }
    }

    pub fn with_label(mut self, value: impl Into<String>) -> Self {
        match &mut self {
            Self::Terms { label, .. } | Self::Filters { label, .. } => {
                *label = Some(value.into());
            }
        }
        self
    }

    /// Stable identifier correlating output groups with this rule
    pub fn id(&self) -> &str {
        match self {
            Self::Terms { id, .. } | Self::Filters { id, .. } => id,
        }
    }

    pub fn label(&self) -> Option<&str> {
        match self {
            Self::Terms { label, .. } | Self::Filters { label, .. } => label.as_deref(),
        }
    }
}

/// A complete nodes request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeRequestOptions {
    pub node_type: NodeType,
    pub nodes_key: NodesKey,
    #[serde(default)]
    pub source_configuration: SourceConfiguration,
    pub timerange: Timerange,
    /// Outermost rule first; empty means no grouping
    #[serde(default)]
    pub group_by: Vec<GroupByRule>,
    pub metrics: Vec<MetricType>,
    #[serde(default)]
    pub filters: Vec<Filter>,
}

impl NodeRequestOptions {
    /// Start building a request for the given node type
    pub fn builder(node_type: NodeType) -> NodeRequestBuilder {
        NodeRequestBuilder::new(node_type)
    }

    /// Field identifying nodes of the requested type
    pub fn node_field(&self) -> &str {
        self.source_configuration.fields.node_field(self.node_type)
    }

    /// Ids of the group-by rules, outermost first
    pub fn group_by_ids(&self) -> Vec<String> {
        self.group_by.iter().map(|rule| rule.id().to_string()).collect()
    }
}

/// Builder for constructing requests programmatically
#[derive(Debug, Clone)]
pub struct NodeRequestBuilder {
    node_type: NodeType,
    source_configuration: SourceConfiguration,
    timerange: Option<Timerange>,
    group_by: Vec<GroupByRule>,
    metrics: Vec<MetricType>,
    filters: Vec<Filter>,
}

impl NodeRequestBuilder {
    pub fn new(node_type: NodeType) -> Self {
        Self {
            node_type,
            source_configuration: SourceConfiguration::default(),
            timerange: None,
            group_by: Vec::new(),
            metrics: Vec::new(),
            filters: Vec::new(),
        }
    }

    pub fn source(mut self, source: SourceConfiguration) -> Self {
        self.source_configuration = source;
        self
    }

    pub fn timerange(mut self, timerange: Timerange) -> Self {
        self.timerange = Some(timerange);
        self
    }

    pub fn last_minutes(self, minutes: i64) -> Self {
        self.timerange(Timerange::last_minutes(minutes))
    }

    /// Add a group-by level nested inside the previous ones
    pub fn group_by(mut self, rule: GroupByRule) -> Self {
        self.group_by.push(rule);
        self
    }

    pub fn metric(mut self, metric: MetricType) -> Self {
        self.metrics.push(metric);
        self
    }

    pub fn metrics(mut self, metrics: &[MetricType]) -> Self {
        self.metrics.extend_from_slice(metrics);
        self
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn build(self) -> NodeRequestOptions {
        NodeRequestOptions {
            node_type: self.node_type,
            nodes_key: self.node_type.nodes_key(),
            source_configuration: self.source_configuration,
            timerange: self.timerange.unwrap_or_else(|| Timerange::last_minutes(15)),
            group_by: self.group_by,
            metrics: self.metrics,
            filters: self.filters,
        }
    }
}
