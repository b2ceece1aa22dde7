//! Entities and Groups
//!
//! Typed output of a nodes request: individual nodes with their metric
//! values, the recursive group tree, and the response envelope.

use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};

use super::model::{MetricType, NodeType, NodesKey};

/// Metric values of one node, one slot per metric identifier
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeMetrics {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub load: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rx: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_rate: Option<f64>,
}

impl NodeMetrics {
    pub fn get(&self, metric: MetricType) -> Option<f64> {
        match metric {
            MetricType::Count => self.count,
            MetricType::Cpu => self.cpu,
            MetricType::Load => self.load,
            MetricType::Memory => self.memory,
            MetricType::Tx => self.tx,
            MetricType::Rx => self.rx,
            MetricType::LogRate => self.log_rate,
        }
    }

    pub fn set(&mut self, metric: MetricType, value: Option<f64>) {
        let slot = match metric {
            MetricType::Count => &mut self.count,
            MetricType::Cpu => &mut self.cpu,
            MetricType::Load => &mut self.load,
            MetricType::Memory => &mut self.memory,
            MetricType::Tx => &mut self.tx,
            MetricType::Rx => &mut self.rx,
            MetricType::LogRate => &mut self.log_rate,
        };
        *slot = value;
    }
}

/// Identity and metrics shared by every node variant
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeDetails {
    pub name: String,
    pub metrics: NodeMetrics,
}

impl NodeDetails {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            metrics: NodeMetrics::default(),
        }
    }
}

/// A monitored entity
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Node {
    Host(NodeDetails),
    Pod(NodeDetails),
    Container(NodeDetails),
    Service(NodeDetails),
}

impl Node {
    pub fn new(node_type: NodeType, details: NodeDetails) -> Self {
        match node_type {
            NodeType::Host => Self::Host(details),
            NodeType::Pod => Self::Pod(details),
            NodeType::Container => Self::Container(details),
            NodeType::Service => Self::Service(details),
        }
    }

    pub fn node_type(&self) -> NodeType {
        match self {
            Self::Host(_) => NodeType::Host,
            Self::Pod(_) => NodeType::Pod,
            Self::Container(_) => NodeType::Container,
            Self::Service(_) => NodeType::Service,
        }
    }

    pub fn details(&self) -> &NodeDetails {
        match self {
            Self::Host(details)
            | Self::Pod(details)
            | Self::Container(details)
            | Self::Service(details) => details,
        }
    }

    pub fn name(&self) -> &str {
        &self.details().name
    }

    pub fn metric(&self, metric: MetricType) -> Option<f64> {
        self.details().metrics.get(metric)
    }
}

/// A group in the result tree; only the innermost level holds nodes
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum NodeGroup {
    WithNodes { name: String, nodes: Vec<Node> },
    WithSubGroups { name: String, groups: Vec<NodeGroup> },
}

impl NodeGroup {
    pub fn name(&self) -> &str {
        match self {
            Self::WithNodes { name, .. } | Self::WithSubGroups { name, .. } => name,
        }
    }

    /// Number of group levels from here down to the nodes
    pub fn depth(&self) -> usize {
        match self {
            Self::WithNodes { .. } => 1,
            Self::WithSubGroups { groups, .. } => {
                1 + groups.iter().map(NodeGroup::depth).max().unwrap_or(0)
            }
        }
    }

    /// All nodes below this group, depth first
    pub fn nodes(&self) -> Vec<&Node> {
        match self {
            Self::WithNodes { nodes, .. } => nodes.iter().collect(),
            Self::WithSubGroups { groups, .. } => {
                groups.iter().flat_map(NodeGroup::nodes).collect()
            }
        }
    }
}

/// Result of a nodes request
#[derive(Debug, Clone, PartialEq)]
pub enum NodesResponse {
    /// No grouping requested
    Nodes {
        total: usize,
        nodes_key: NodesKey,
        nodes: Vec<Node>,
    },
    Groups {
        total: usize,
        groups: Vec<NodeGroup>,
    },
}

impl NodesResponse {
    /// Count of outermost entries (nodes or top-level groups)
    pub fn total(&self) -> usize {
        match self {
            Self::Nodes { total, .. } | Self::Groups { total, .. } => *total,
        }
    }

    pub fn nodes(&self) -> Option<&[Node]> {
        match self {
            Self::Nodes { nodes, .. } => Some(nodes),
            Self::Groups { .. } => None,
        }
    }

    pub fn groups(&self) -> Option<&[NodeGroup]> {
        match self {
            Self::Groups { groups, .. } => Some(groups),
            Self::Nodes { .. } => None,
        }
    }
}

impl Serialize for NodesResponse {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(2))?;
        match self {
            Self::Nodes {
                total,
                nodes_key,
                nodes,
            } => {
                map.serialize_entry("total", total)?;
                map.serialize_entry(nodes_key.as_str(), nodes)?;
            }
            Self::Groups { total, groups } => {
                map.serialize_entry("total", total)?;
                map.serialize_entry("groups", groups)?;
            }
        }
        map.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn host(name: &str, cpu: f64) -> Node {
        let mut details = NodeDetails::new(name);
        details.metrics.set(MetricType::Cpu, Some(cpu));
        Node::new(NodeType::Host, details)
    }

    #[test]
    fn test_node_serialization() {
        assert_eq!(
            serde_json::to_value(host("host-1", 0.5)).unwrap(),
            json!({"type": "host", "name": "host-1", "metrics": {"cpu": 0.5}})
        );
    }

    #[test]
    fn test_flat_response_uses_nodes_key() {
        let response = NodesResponse::Nodes {
            total: 1,
            nodes_key: NodesKey::Hosts,
            nodes: vec![host("host-1", 0.5)],
        };

        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["total"], 1);
        assert_eq!(value["hosts"][0]["name"], "host-1");
    }

    #[test]
    fn test_group_depth_and_nodes() {
        let tree = NodeGroup::WithSubGroups {
            name: "us-east-1".to_string(),
            groups: vec![
                NodeGroup::WithNodes {
                    name: "a".to_string(),
                    nodes: vec![host("host-1", 0.1)],
                },
                NodeGroup::WithNodes {
                    name: "b".to_string(),
                    nodes: vec![host("host-2", 0.2), host("host-3", 0.3)],
                },
            ],
        };

        assert_eq!(tree.depth(), 2);
        assert_eq!(tree.nodes().len(), 3);

        let value = serde_json::to_value(&tree).unwrap();
        assert_eq!(value["name"], "us-east-1");
        assert_eq!(value["groups"][1]["nodes"][0]["name"], "host-2");
    }

    #[test]
    fn test_metric_slots() {
        let mut metrics = NodeMetrics::default();
        for metric in MetricType::all() {
            assert_eq!(metrics.get(*metric), None);
            metrics.set(*metric, Some(1.0));
            assert_eq!(metrics.get(*metric), Some(1.0));
        }
    }
}
