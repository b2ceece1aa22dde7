//! Result Assembler
//!
//! Turns merged `waffle` buckets into the typed response. Bucket keys become
//! group names; terms and filters buckets assemble the same way.

use super::error::{AssemblyError, NodesError, NodesResult};
use super::model::{MetricType, NodeRequestOptions};
use super::node::{Node, NodeDetails, NodeGroup, NodesResponse};
use super::response::Bucket;

/// Build the response for `options` from the top-level buckets
pub fn assemble(options: &NodeRequestOptions, buckets: &[Bucket]) -> NodesResult<NodesResponse> {
    if options.group_by.is_empty() {
        let nodes: Vec<Node> = buckets.iter().map(|b| to_node(options, b)).collect();
        return Ok(NodesResponse::Nodes {
            total: nodes.len(),
            nodes_key: options.nodes_key,
            nodes,
        });
    }

    let groups = buckets
        .iter()
        .map(|bucket| assemble_group(options, bucket, 0))
        .collect::<NodesResult<Vec<_>>>()?;

    Ok(NodesResponse::Groups {
        total: groups.len(),
        groups,
    })
}

fn assemble_group(
    options: &NodeRequestOptions,
    bucket: &Bucket,
    depth: usize,
) -> NodesResult<NodeGroup> {
    let rule_id = options
        .group_by
        .get(depth)
        .map(|rule| rule.id())
        .unwrap_or_default();

    let Some(children) = bucket.buckets(rule_id) else {
        tracing::error!(
            node_type = %options.node_type,
            depth,
            rule_id,
            bucket = bucket.key.as_str(),
            "Bucket is missing its group by aggregation"
        );
        return Err(NodesError::assembly(
            options,
            AssemblyError {
                depth,
                rule_id: rule_id.to_string(),
                bucket_key: bucket.key.clone(),
            },
        ));
    };

    let name = bucket.key.clone();
    if depth + 1 >= options.group_by.len() {
        Ok(NodeGroup::WithNodes {
            name,
            nodes: children.iter().map(|b| to_node(options, b)).collect(),
        })
    } else {
        let groups = children
            .iter()
            .map(|child| assemble_group(options, child, depth + 1))
            .collect::<NodesResult<Vec<_>>>()?;
        Ok(NodeGroup::WithSubGroups { name, groups })
    }
}

fn to_node(options: &NodeRequestOptions, bucket: &Bucket) -> Node {
    let mut details = NodeDetails::new(bucket.key.clone());
    for metric in &options.metrics {
        let value = match metric {
            MetricType::Count => Some(bucket.doc_count as f64),
            other => bucket.value(other.as_str()),
        };
        details.metrics.set(*metric, value);
    }
    Node::new(options.node_type, details)
}
