//! Partition Planner
//!
//! Splits a request into N independent queries and merges their buckets.
//!
//! Node keys are assigned to partitions by the backend's terms partitioning
//! (`include: {partition, num_partitions}`), a hash-modulo of the node key.
//! Every node therefore lands in exactly one partition, while group buckets
//! (zones, namespaces, ...) show up in several and are merged by key.

use std::collections::HashMap;

use super::builder::{NodesQuery, Partition, QueryBuilder};
use super::error::{NodesError, NodesResult, PartitionError};
use super::model::NodeRequestOptions;
use super::response::{AggregationResult, Bucket};

/// How many partitions to use when the caller does not say
#[derive(Debug, Clone)]
pub struct PartitionSettings {
    /// Target number of nodes per partition
    pub partition_size: u32,
    /// Headroom multiplier applied to the node count
    pub partition_factor: f64,
    /// Upper bound on partitions for one request
    pub max_partitions: u32,
}

impl Default for PartitionSettings {
    fn default() -> Self {
        Self {
            partition_size: 75,
            partition_factor: 1.2,
            max_partitions: 32,
        }
    }
}

/// Plans partitioned queries and merges their results
#[derive(Debug, Clone, Default)]
pub struct PartitionPlanner {
    builder: QueryBuilder,
    settings: PartitionSettings,
}

impl PartitionPlanner {
    pub fn new(builder: QueryBuilder, settings: PartitionSettings) -> Self {
        Self { builder, settings }
    }

    pub fn builder(&self) -> &QueryBuilder {
        &self.builder
    }

    pub fn settings(&self) -> &PartitionSettings {
        &self.settings
    }

    /// Build one query per partition, ordered by partition id
    pub fn plan(
        &self,
        options: &NodeRequestOptions,
        number_of_partitions: u32,
    ) -> NodesResult<Vec<NodesQuery>> {
        if number_of_partitions < 1 {
            return Err(NodesError::partition(
                options,
                PartitionError::InvalidCount(number_of_partitions),
            ));
        }

        (0..number_of_partitions)
            .map(|id| {
                self.builder
                    .build_partition(options, Partition::new(id, number_of_partitions))
            })
            .collect()
    }

    /// Partition count for the given number of distinct nodes
    pub fn estimate_partitions(&self, node_count: u64) -> u32 {
        let size = f64::from(self.settings.partition_size.max(1));
        let wanted = (node_count as f64 * self.settings.partition_factor / size).ceil();
        let max = self.settings.max_partitions.max(1);

        if wanted < 1.0 {
            1
        } else if wanted >= f64::from(max) {
            max
        } else {
            wanted as u32
        }
    }

    /// Merge per-partition bucket lists.
    ///
    /// Buckets sharing a key are combined at every level: doc counts are
    /// summed, nested bucket lists merged recursively, and single values keep
    /// the larger one. A single list comes back unchanged. Otherwise buckets
    /// keep the order in which their key first appears, scanning `partials`
    /// in order; the merged contents do not depend on the order of `partials`.
    ///
    /// The partition clause only restricts the innermost node terms, so every
    /// partition reports a group bucket with the whole group's doc count.
    /// Summed group-level doc counts are therefore up to N times too large.
    /// Node doc counts are exact, and group doc counts never reach a
    /// `NodesResponse`.
    pub fn merge(partials: Vec<Vec<Bucket>>) -> Vec<Bucket> {
        if partials.len() == 1 {
            return partials.into_iter().flatten().collect();
        }
        combine(partials)
    }
}

fn combine(partials: Vec<Vec<Bucket>>) -> Vec<Bucket> {
    let mut merged: Vec<Bucket> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for bucket in partials.into_iter().flatten() {
        match index.get(&bucket.key).copied() {
            Some(position) => absorb(&mut merged[position], bucket),
            None => {
                index.insert(bucket.key.clone(), merged.len());
                merged.push(bucket);
            }
        }
    }

    merged
}

fn absorb(existing: &mut Bucket, incoming: Bucket) {
    existing.doc_count += incoming.doc_count;

    for (name, result) in incoming.aggregations {
        let Some(current) = existing.aggregations.get_mut(&name) else {
            existing.aggregations.insert(name, result);
            continue;
        };

        match (current, result) {
            (AggregationResult::Buckets(current), AggregationResult::Buckets(more)) => {
                *current = combine(vec![std::mem::take(current), more]);
            }
            (AggregationResult::Value(current), AggregationResult::Value(more)) => {
                *current = match (*current, more) {
                    (Some(a), Some(b)) => Some(a.max(b)),
                    (a, b) => a.or(b),
                };
            }
            (_, _) => {
                tracing::debug!(
                    aggregation = name.as_str(),
                    bucket = existing.key.as_str(),
                    "Aggregation shape differs between partitions, keeping first"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::builder::NODES_AGGREGATION;
    use crate::nodes::model::{GroupByRule, MetricType, NodeType};
    use crate::nodes::query::AggregationKind;

    fn options() -> NodeRequestOptions {
        NodeRequestOptions::builder(NodeType::Host)
            .metric(MetricType::Cpu)
            .group_by(GroupByRule::terms("g1", "cloud.availability_zone"))
            .build()
    }

    #[test]
    fn test_plan_builds_one_query_per_partition() {
        let planner = PartitionPlanner::default();
        let queries = planner.plan(&options(), 3).unwrap();

        assert_eq!(queries.len(), 3);
        for (i, query) in queries.iter().enumerate() {
            assert_eq!(query.partition, Partition::new(i as u32, 3));

            let nodes = query.body.aggregations[NODES_AGGREGATION].sub("g1").unwrap();
            match &nodes.kind {
                AggregationKind::Terms(terms) => {
                    let include = terms.partition.unwrap();
                    assert_eq!(include.partition, i as u32);
                    assert_eq!(include.num_partitions, 3);
                }
                other => panic!("expected terms aggregation, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_plan_rejects_zero_partitions() {
        let result = PartitionPlanner::default().plan(&options(), 0);
        assert!(matches!(
            result,
            Err(NodesError::Partition {
                source: PartitionError::InvalidCount(0),
                ..
            })
        ));
    }

    #[test]
    fn test_plan_validates_before_building() {
        let invalid = NodeRequestOptions {
            metrics: vec![],
            ..options()
        };
        let result = PartitionPlanner::default().plan(&invalid, 2);
        assert!(matches!(result, Err(NodesError::InvalidRequest(_))));
    }

    #[test]
    fn test_estimate_partitions() {
        let planner = PartitionPlanner::default();
        assert_eq!(planner.estimate_partitions(0), 1);
        assert_eq!(planner.estimate_partitions(50), 1);
        // 100 * 1.2 / 75 = 1.6
        assert_eq!(planner.estimate_partitions(100), 2);
        // 1100 * 1.2 / 75 = 17.6
        assert_eq!(planner.estimate_partitions(1100), 18);
        assert_eq!(planner.estimate_partitions(1_000_000), 32);
    }

    #[test]
    fn test_merge_sums_doc_counts() {
        let merged = PartitionPlanner::merge(vec![
            vec![Bucket::new("a", 3)],
            vec![Bucket::new("a", 2)],
        ]);

        assert_eq!(merged, vec![Bucket::new("a", 5)]);
    }

    #[test]
    fn test_merge_combines_nested_groups() {
        let partition_0 = vec![
            Bucket::new("zone-a", 4).with_buckets(
                "g1",
                vec![Bucket::new("host-1", 4).with_value("cpu", 0.5)],
            ),
            Bucket::new("zone-b", 1).with_buckets("g1", vec![Bucket::new("host-3", 1)]),
        ];
        let partition_1 = vec![Bucket::new("zone-a", 2).with_buckets(
            "g1",
            vec![Bucket::new("host-2", 2).with_value("cpu", 0.25)],
        )];

        let merged = PartitionPlanner::merge(vec![partition_0, partition_1]);

        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].key, "zone-a");
        assert_eq!(merged[0].doc_count, 6);
        let hosts: Vec<_> = merged[0]
            .buckets("g1")
            .unwrap()
            .iter()
            .map(|b| b.key.as_str())
            .collect();
        assert_eq!(hosts, vec!["host-1", "host-2"]);
        assert_eq!(merged[1].doc_count, 1);
    }

    fn sorted(mut buckets: Vec<Bucket>) -> Vec<Bucket> {
        buckets.sort_by(|a, b| a.key.cmp(&b.key));
        for bucket in buckets.iter_mut() {
            for result in bucket.aggregations.values_mut() {
                if let AggregationResult::Buckets(children) = result {
                    *children = sorted(std::mem::take(children));
                }
            }
        }
        buckets
    }

    #[test]
    fn test_merge_is_order_independent() {
        let p0 = vec![
            Bucket::new("b", 1).with_buckets("g", vec![Bucket::new("y", 1)]),
            Bucket::new("a", 2).with_buckets("g", vec![Bucket::new("x", 2)]),
        ];
        let p1 = vec![Bucket::new("a", 5).with_buckets(
            "g",
            vec![Bucket::new("z", 4), Bucket::new("x", 1)],
        )];
        let p2 = vec![Bucket::new("c", 7).with_value("cpu", 0.1)];

        let forward = PartitionPlanner::merge(vec![p0.clone(), p1.clone(), p2.clone()]);
        let backward = PartitionPlanner::merge(vec![p2.clone(), p1.clone(), p0.clone()]);
        let shuffled = PartitionPlanner::merge(vec![p1, p2, p0]);

        let keys: Vec<_> = forward.iter().map(|b| b.key.as_str()).collect();
        assert_eq!(keys, vec!["b", "a", "c"]);
        assert_eq!(forward[1].doc_count, 7);
        assert_eq!(forward[1].buckets("g").unwrap()[0].doc_count, 3);

        assert_eq!(sorted(forward.clone()), sorted(backward));
        assert_eq!(sorted(forward), sorted(shuffled));
    }

    #[test]
    fn test_merge_keeps_backend_order() {
        // Numeric keys come back in numeric order, not byte order
        let single =
            PartitionPlanner::merge(vec![vec![Bucket::new("2", 1), Bucket::new("10", 1)]]);
        let keys: Vec<_> = single.iter().map(|b| b.key.as_str()).collect();
        assert_eq!(keys, vec!["2", "10"]);

        let merged = PartitionPlanner::merge(vec![
            vec![Bucket::new("zone-b", 1).with_buckets("g", vec![Bucket::new("9", 1)])],
            vec![Bucket::new("zone-b", 1).with_buckets(
                "g",
                vec![Bucket::new("100", 1), Bucket::new("20", 1)],
            )],
            vec![Bucket::new("zone-a", 1)],
        ]);
        let keys: Vec<_> = merged.iter().map(|b| b.key.as_str()).collect();
        assert_eq!(keys, vec!["zone-b", "zone-a"]);
        let hosts: Vec<_> = merged[0]
            .buckets("g")
            .unwrap()
            .iter()
            .map(|b| b.key.as_str())
            .collect();
        assert_eq!(hosts, vec!["9", "100", "20"]);
    }

    #[test]
    fn test_merge_sums_group_counts_per_partition() {
        // Each partition reports the whole zone; only node counts stay exact
        let merged = PartitionPlanner::merge(vec![
            vec![Bucket::new("zone-a", 5).with_buckets("g", vec![Bucket::new("host-1", 2)])],
            vec![Bucket::new("zone-a", 5).with_buckets("g", vec![Bucket::new("host-2", 3)])],
        ]);

        assert_eq!(merged[0].doc_count, 10);
        let nodes = merged[0].buckets("g").unwrap();
        assert_eq!(nodes.iter().map(|b| b.doc_count).sum::<u64>(), 5);
    }

    #[test]
    fn test_merge_values_keep_larger() {
        let merged = PartitionPlanner::merge(vec![
            vec![Bucket::new("a", 1).with_value("cpu", 0.2)],
            vec![Bucket::new("a", 1).with_value("cpu", 0.7)],
        ]);
        assert_eq!(merged[0].value("cpu"), Some(0.7));
    }
}
