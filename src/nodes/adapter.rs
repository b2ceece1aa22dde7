//! Nodes Adapter
//!
//! Runs a nodes request end to end:
//!
//! 1. validate the options
//! 2. pick the partition count (given, or from a cardinality query)
//! 3. build one query per partition and run the request chain over each
//! 4. execute partitions concurrently, each attempt under a timeout, retrying
//!    transient backend failures with quadratic backoff
//! 5. run the response chain over each result, merge, assemble
//!
//! A request succeeds only if every partition does. Cancelling the request's
//! [`CancellationScope`] aborts the partitions still in flight.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::Instrument;
use uuid::Uuid;

use super::assembler::assemble;
use super::backend::{BackendError, ElasticsearchClient, SearchBackend};
use super::builder::{
    NodesQuery, Partition, QueryBuilder, NODES_AGGREGATION, NODE_COUNT_AGGREGATION,
};
use super::error::{AssemblyError, NodesError, NodesResult, PartitionError};
use super::model::NodeRequestOptions;
use super::node::NodesResponse;
use super::partition::PartitionPlanner;
use super::processor::{Processor, ProcessorChain, ProcessorOptions, ZeroHits};
use super::query::SearchBody;
use super::response::SearchResponse;
use crate::config::Config;

/// Bounded retries for one partition
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts including the first one
    pub max_attempts: u32,
    pub backoff_base: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff_base: Duration) -> Self {
        Self {
            max_attempts,
            backoff_base,
        }
    }

    /// A single attempt, no retries
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO)
    }

    /// Delay after the given failed attempt (1-based): base, 4 x base, 9 x base...
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.backoff_base.saturating_mul(attempt.saturating_mul(attempt))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(500))
    }
}

/// Cancellation signal shared by everything working on one request
#[derive(Debug, Clone)]
pub struct CancellationScope {
    sender: Arc<watch::Sender<bool>>,
}

impl CancellationScope {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.sender.borrow()
    }

    /// Resolves once the scope is cancelled
    pub async fn cancelled(&self) {
        let mut receiver = self.sender.subscribe();
        loop {
            if *receiver.borrow_and_update() {
                return;
            }
            if receiver.changed().await.is_err() {
                // The sender lives as long as `self`; this cannot fire
                std::future::pending::<()>().await;
            }
        }
    }
}

impl Default for CancellationScope {
    fn default() -> Self {
        Self::new()
    }
}

/// Executes nodes requests against a search backend
pub struct NodesAdapter<B: SearchBackend + 'static> {
    backend: Arc<B>,
    planner: PartitionPlanner,
    pre: ProcessorChain<SearchBody>,
    post: ProcessorChain<SearchResponse>,
    retry: RetryPolicy,
    partition_timeout: Duration,
}

impl NodesAdapter<ElasticsearchClient> {
    /// Adapter talking HTTP to the configured backend
    pub fn from_config(config: &Config) -> Result<Self, BackendError> {
        let client = ElasticsearchClient::new(&config.backend)?;
        let planner = PartitionPlanner::new(
            QueryBuilder::new(config.query.builder_settings()),
            config.query.partition_settings(),
        );

        Ok(Self::new(Arc::new(client))
            .with_planner(planner)
            .with_retry(config.backend.retry_policy())
            .with_partition_timeout(config.query.partition_timeout()))
    }
}

impl<B: SearchBackend + 'static> NodesAdapter<B> {
    /// Adapter with default settings; requests always ask for zero hits
    pub fn new(backend: Arc<B>) -> Self {
        Self {
            backend,
            planner: PartitionPlanner::default(),
            pre: ProcessorChain::new().with(ZeroHits),
            post: ProcessorChain::new(),
            retry: RetryPolicy::default(),
            partition_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_planner(mut self, planner: PartitionPlanner) -> Self {
        self.planner = planner;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_partition_timeout(mut self, timeout: Duration) -> Self {
        self.partition_timeout = timeout;
        self
    }

    /// Append a stage to the request chain
    pub fn with_pre(mut self, stage: impl Processor<SearchBody> + 'static) -> Self {
        self.pre.push(stage);
        self
    }

    /// Append a stage to the response chain
    pub fn with_post(mut self, stage: impl Processor<SearchResponse> + 'static) -> Self {
        self.post.push(stage);
        self
    }

    pub fn planner(&self) -> &PartitionPlanner {
        &self.planner
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    /// Run a request with an estimated partition count and no external cancellation
    pub async fn get_nodes(&self, options: &NodeRequestOptions) -> NodesResult<NodesResponse> {
        self.get_nodes_with(options, None, &CancellationScope::new())
            .await
    }

    /// Run a request; `partitions` overrides the estimate
    pub async fn get_nodes_with(
        &self,
        options: &NodeRequestOptions,
        partitions: Option<u32>,
        cancel: &CancellationScope,
    ) -> NodesResult<NodesResponse> {
        let request_id = Uuid::new_v4();
        let span = tracing::info_span!(
            "nodes_request",
            %request_id,
            node_type = %options.node_type
        );

        self.execute(options, partitions, cancel)
            .instrument(span)
            .await
    }

    /// Partition queries with the request chain applied, ready to send
    pub fn prepare(
        &self,
        options: &NodeRequestOptions,
        partitions: u32,
    ) -> NodesResult<Vec<NodesQuery>> {
        let mut queries = self.planner.plan(options, partitions)?;
        for query in &mut queries {
            let context = ProcessorOptions::new(options, query.partition);
            query.body = self.pre.apply(&context, std::mem::take(&mut query.body));
        }
        Ok(queries)
    }

    async fn execute(
        &self,
        options: &NodeRequestOptions,
        partitions: Option<u32>,
        cancel: &CancellationScope,
    ) -> NodesResult<NodesResponse> {
        let started = Instant::now();
        self.planner.builder().validate(options)?;

        tracing::info!(
            metrics = ?options.metrics,
            group_by = ?options.group_by_ids(),
            "Starting nodes request"
        );

        let partitions = match partitions {
            Some(n) => n,
            None => self.estimate_partitions(options, cancel).await?,
        };

        let queries = self.prepare(options, partitions)?;
        let responses = self.dispatch(options, queries, cancel).await?;

        let mut partials = Vec::with_capacity(responses.len());
        for (partition, response) in responses.into_iter().enumerate() {
            let context =
                ProcessorOptions::new(options, Partition::new(partition as u32, partitions));
            let mut response = self.post.apply(&context, response);
            let buckets = response.take_buckets(NODES_AGGREGATION).ok_or_else(|| {
                tracing::error!(partition, "Response is missing the nodes aggregation");
                NodesError::assembly(
                    options,
                    AssemblyError {
                        depth: 0,
                        rule_id: NODES_AGGREGATION.to_string(),
                        bucket_key: format!("partition-{}", partition),
                    },
                )
            })?;
            partials.push(buckets);
        }

        let merged = PartitionPlanner::merge(partials);
        let response = assemble(options, &merged)?;

        tracing::info!(
            partitions,
            total = response.total(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Nodes request complete"
        );

        Ok(response)
    }

    /// Count distinct nodes and derive the partition count from it
    async fn estimate_partitions(
        &self,
        options: &NodeRequestOptions,
        cancel: &CancellationScope,
    ) -> NodesResult<u32> {
        let mut cardinality = self.planner.builder().build_cardinality(options)?;
        let context = ProcessorOptions::new(options, cardinality.partition);
        cardinality.body = self.pre.apply(&context, cardinality.body);
        let request = cardinality.to_request();

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = tokio::time::timeout(self.partition_timeout, self.backend.msearch(&request)) => Some(result),
        };
        let Some(outcome) = outcome else {
            return Err(NodesError::Cancelled);
        };

        let responses = outcome.map_err(|_| BackendError::Timeout)??;
        let node_count = responses
            .first()
            .and_then(|response| response.value(NODE_COUNT_AGGREGATION))
            .unwrap_or(0.0);

        let partitions = self.planner.estimate_partitions(node_count.max(0.0) as u64);
        tracing::debug!(node_count, partitions, "Estimated partition count");
        Ok(partitions)
    }

    /// Run every partition concurrently; results come back in partition order
    async fn dispatch(
        &self,
        options: &NodeRequestOptions,
        queries: Vec<NodesQuery>,
        cancel: &CancellationScope,
    ) -> NodesResult<Vec<SearchResponse>> {
        let expected = queries.len();
        let mut tasks = JoinSet::new();

        for query in queries {
            let partition = query.partition.id;
            let backend = Arc::clone(&self.backend);
            let retry = self.retry.clone();
            let timeout = self.partition_timeout;

            tasks.spawn(
                async move {
                    let result = run_partition(backend.as_ref(), &query, &retry, timeout).await;
                    (partition, result)
                }
                .instrument(tracing::debug_span!("partition", partition)),
            );
        }

        let mut results: Vec<Option<SearchResponse>> = (0..expected).map(|_| None).collect();

        loop {
            let joined = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                next = tasks.join_next() => Some(next),
            };

            let Some(next) = joined else {
                tasks.abort_all();
                tracing::warn!(in_flight = tasks.len(), "Nodes request cancelled");
                return Err(NodesError::Cancelled);
            };

            match next {
                None => break,
                Some(Ok((partition, Ok(response)))) => {
                    if let Some(slot) = results.get_mut(partition as usize) {
                        *slot = Some(response);
                    }
                }
                Some(Ok((partition, Err(source)))) => {
                    tasks.abort_all();
                    tracing::error!(partition, error = %source, "Partition failed");
                    return Err(NodesError::partition(options, source));
                }
                Some(Err(join_error)) => {
                    tracing::error!(error = %join_error, "Partition task did not complete");
                }
            }
        }

        let received = results.iter().filter(|result| result.is_some()).count();
        if received != expected {
            return Err(NodesError::partition(
                options,
                PartitionError::Incomplete {
                    expected: expected as u32,
                    received: received as u32,
                },
            ));
        }

        Ok(results.into_iter().flatten().collect())
    }
}

/// Execute one partition query with retries
async fn run_partition<B: SearchBackend + ?Sized>(
    backend: &B,
    query: &NodesQuery,
    retry: &RetryPolicy,
    timeout: Duration,
) -> Result<SearchResponse, PartitionError> {
    let partition = query.partition.id;
    let request = query.to_request();
    let max_attempts = retry.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        let started = Instant::now();

        let outcome = match tokio::time::timeout(timeout, backend.msearch(&request)).await {
            Ok(result) => result.and_then(single_response),
            Err(_) => Err(BackendError::Timeout),
        };

        let error = match outcome {
            Ok(response) => {
                tracing::debug!(
                    attempt,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Partition complete"
                );
                return Ok(response);
            }
            Err(error) => error,
        };

        if !error.is_retryable() || attempt >= max_attempts {
            return Err(PartitionError::Exhausted {
                partition,
                attempts: attempt,
                source: error,
            });
        }

        let delay = retry.backoff(attempt);
        tracing::warn!(
            attempt,
            error = %error,
            delay_ms = delay.as_millis() as u64,
            "Partition attempt failed, retrying"
        );
        tokio::time::sleep(delay).await;
    }
}

fn single_response(mut responses: Vec<SearchResponse>) -> Result<SearchResponse, BackendError> {
    if responses.len() != 1 {
        return Err(BackendError::MalformedResponse(format!(
            "expected 1 response, got {}",
            responses.len()
        )));
    }
    responses
        .pop()
        .ok_or_else(|| BackendError::MalformedResponse("empty response".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::builder::BuilderSettings;
    use crate::nodes::model::{GroupByRule, MetricType, NodeType};
    use crate::nodes::partition::PartitionSettings;
    use crate::nodes::processor::{ExtraFilter, Next};
    use crate::nodes::query::{
        Aggregation, AggregationKind, MultiSearchRequest, QueryExpression, TermsPartition,
    };
    use crate::nodes::response::Bucket;
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct FakeHost {
        name: &'static str,
        zone: &'static str,
        docs: u64,
        cpu: f64,
    }

    /// In-memory backend answering from a fixed host list.
    ///
    /// Host `i` belongs to partition `i % num_partitions`. Like the real
    /// backend, zone buckets count the whole zone in every partition.
    struct FakeBackend {
        hosts: Vec<FakeHost>,
        calls: AtomicUsize,
        requests: Mutex<Vec<MultiSearchRequest>>,
        failures: Mutex<Vec<BackendError>>,
        delay: Option<Duration>,
        crash_partition: Option<u32>,
    }

    impl FakeBackend {
        fn new(hosts: Vec<FakeHost>) -> Self {
            Self {
                hosts,
                calls: AtomicUsize::new(0),
                requests: Mutex::new(Vec::new()),
                failures: Mutex::new(Vec::new()),
                delay: None,
                crash_partition: None,
            }
        }

        /// Panic while answering the given partition
        fn crashing_on(mut self, partition: u32) -> Self {
            self.crash_partition = Some(partition);
            self
        }

        fn failing_with(self, failures: Vec<BackendError>) -> Self {
            *self.failures.lock().unwrap() = failures;
            self
        }

        fn delayed(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn find_partition(aggregation: &Aggregation) -> Option<TermsPartition> {
            if let AggregationKind::Terms(terms) = &aggregation.kind {
                if terms.partition.is_some() {
                    return terms.partition;
                }
            }
            aggregation.aggs.values().find_map(Self::find_partition)
        }

        fn respond(&self, body: &SearchBody) -> SearchResponse {
            if body.aggregations.contains_key(NODE_COUNT_AGGREGATION) {
                return SearchResponse::default()
                    .with_value(NODE_COUNT_AGGREGATION, self.hosts.len() as f64);
            }

            let waffle = &body.aggregations[NODES_AGGREGATION];
            let partition = Self::find_partition(waffle);
            if let (Some(p), Some(crash)) = (partition, self.crash_partition) {
                if p.partition == crash {
                    panic!("backend crashed on partition {}", crash);
                }
            }

            let hosts: Vec<&FakeHost> = self
                .hosts
                .iter()
                .enumerate()
                .filter(|(i, _)| {
                    partition.map_or(true, |p| *i as u32 % p.num_partitions == p.partition)
                })
                .map(|(_, host)| host)
                .collect();

            let host_bucket =
                |host: &FakeHost| Bucket::new(host.name, host.docs).with_value("cpu", host.cpu);

            let buckets = if waffle.sub("zone").is_some() {
                let mut zones: BTreeMap<&str, (u64, Vec<&FakeHost>)> = BTreeMap::new();
                for host in &self.hosts {
                    zones.entry(host.zone).or_default().0 += host.docs;
                }
                for host in hosts {
                    if let Some((_, members)) = zones.get_mut(host.zone) {
                        members.push(host);
                    }
                }
                zones
                    .into_iter()
                    .map(|(zone, (docs, hosts))| {
                        Bucket::new(zone, docs)
                            .with_buckets("zone", hosts.into_iter().map(&host_bucket).collect())
                    })
                    .collect()
            } else {
                hosts.into_iter().map(&host_bucket).collect()
            };

            SearchResponse::default().with_buckets(NODES_AGGREGATION, buckets)
        }
    }

    #[async_trait]
    impl SearchBackend for FakeBackend {
        async fn msearch(
            &self,
            request: &MultiSearchRequest,
        ) -> Result<Vec<SearchResponse>, BackendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.requests.lock().unwrap().push(request.clone());

            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }

            {
                let mut failures = self.failures.lock().unwrap();
                if !failures.is_empty() {
                    return Err(failures.remove(0));
                }
            }

            Ok(request.bodies().map(|body| self.respond(body)).collect())
        }
    }

    fn host(name: &'static str, zone: &'static str, docs: u64) -> FakeHost {
        FakeHost {
            name,
            zone,
            docs,
            cpu: 0.5,
        }
    }

    fn four_hosts() -> Vec<FakeHost> {
        vec![
            host("host-1", "zone-a", 1),
            host("host-2", "zone-a", 2),
            host("host-3", "zone-b", 3),
            host("host-4", "zone-b", 4),
        ]
    }

    fn options() -> NodeRequestOptions {
        NodeRequestOptions::builder(NodeType::Host)
            .metrics(&[MetricType::Count, MetricType::Cpu])
            .build()
    }

    fn adapter(backend: &Arc<FakeBackend>) -> NodesAdapter<FakeBackend> {
        NodesAdapter::new(Arc::clone(backend))
            .with_retry(RetryPolicy::new(3, Duration::from_millis(1)))
    }

    #[tokio::test]
    async fn test_flat_request_returns_every_host() {
        let backend = Arc::new(FakeBackend::new(vec![
            host("host-1", "zone-a", 1),
            host("host-2", "zone-a", 1),
            host("host-3", "zone-b", 1),
        ]));

        let response = adapter(&backend)
            .get_nodes_with(&options(), Some(1), &CancellationScope::new())
            .await
            .unwrap();

        assert_eq!(response.total(), 3);
        let names: Vec<_> = response.nodes().unwrap().iter().map(|n| n.name()).collect();
        assert_eq!(names, vec!["host-1", "host-2", "host-3"]);
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test]
    async fn test_partitions_merge_into_groups() {
        let backend = Arc::new(FakeBackend::new(four_hosts()));
        let options = NodeRequestOptions {
            group_by: vec![GroupByRule::terms("zone", "cloud.availability_zone")],
            ..options()
        };

        let response = adapter(&backend)
            .get_nodes_with(&options, Some(2), &CancellationScope::new())
            .await
            .unwrap();

        assert_eq!(backend.calls(), 2);
        assert_eq!(response.total(), 2);
        let groups = response.groups().unwrap();
        assert_eq!(groups[0].name(), "zone-a");
        let names: Vec<_> = groups[0].nodes().iter().map(|n| n.name()).collect();
        assert_eq!(names, vec!["host-1", "host-2"]);
        assert_eq!(groups[1].nodes().len(), 2);
        assert_eq!(groups[1].nodes()[1].metric(MetricType::Count), Some(4.0));
    }

    #[tokio::test]
    async fn test_partition_count_is_estimated() {
        let backend = Arc::new(FakeBackend::new(four_hosts()));
        let planner = PartitionPlanner::new(
            QueryBuilder::new(BuilderSettings::default()),
            PartitionSettings {
                partition_size: 1,
                partition_factor: 1.0,
                max_partitions: 3,
            },
        );

        let response = adapter(&backend)
            .with_planner(planner)
            .get_nodes(&options())
            .await
            .unwrap();

        // one cardinality request, then 3 partitions (4 hosts capped at 3)
        assert_eq!(backend.calls(), 4);
        assert_eq!(response.total(), 4);
    }

    #[tokio::test]
    async fn test_empty_metrics_never_reach_backend() {
        let backend = Arc::new(FakeBackend::new(four_hosts()));
        let options = NodeRequestOptions {
            metrics: vec![],
            ..options()
        };

        let result = adapter(&backend).get_nodes(&options).await;

        assert!(matches!(result, Err(NodesError::InvalidRequest(_))));
        assert_eq!(backend.calls(), 0);
    }

    #[tokio::test]
    async fn test_zero_partitions_rejected() {
        let backend = Arc::new(FakeBackend::new(four_hosts()));
        let result = adapter(&backend)
            .get_nodes_with(&options(), Some(0), &CancellationScope::new())
            .await;

        assert!(matches!(
            result,
            Err(NodesError::Partition {
                source: PartitionError::InvalidCount(0),
                ..
            })
        ));
        assert_eq!(backend.calls(), 0);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let backend = Arc::new(
            FakeBackend::new(four_hosts())
                .failing_with(vec![BackendError::Unavailable, BackendError::RateLimited]),
        );

        let response = adapter(&backend)
            .get_nodes_with(&options(), Some(1), &CancellationScope::new())
            .await
            .unwrap();

        assert_eq!(response.total(), 4);
        assert_eq!(backend.calls(), 3);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let backend = Arc::new(FakeBackend::new(four_hosts()).failing_with(vec![
            BackendError::Unavailable,
            BackendError::Unavailable,
            BackendError::Unavailable,
        ]));

        let result = adapter(&backend)
            .get_nodes_with(&options(), Some(1), &CancellationScope::new())
            .await;

        match result {
            Err(NodesError::Partition {
                source: PartitionError::Exhausted { partition, attempts, .. },
                ..
            }) => {
                assert_eq!(partition, 0);
                assert_eq!(attempts, 3);
            }
            other => panic!("expected exhausted partition, got {:?}", other),
        }
        assert_eq!(backend.calls(), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_failure_fails_fast() {
        let backend = Arc::new(FakeBackend::new(four_hosts()).failing_with(vec![
            BackendError::ApiError {
                status: 400,
                message: "parsing_exception".to_string(),
            },
        ]));

        let result = adapter(&backend)
            .get_nodes_with(&options(), Some(1), &CancellationScope::new())
            .await;

        assert!(matches!(
            result,
            Err(NodesError::Partition {
                source: PartitionError::Exhausted { attempts: 1, .. },
                ..
            })
        ));
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test]
    async fn test_partition_timeout_fails_request() {
        let backend =
            Arc::new(FakeBackend::new(four_hosts()).delayed(Duration::from_secs(5)));

        let result = adapter(&backend)
            .with_retry(RetryPolicy::none())
            .with_partition_timeout(Duration::from_millis(50))
            .get_nodes_with(&options(), Some(2), &CancellationScope::new())
            .await;

        assert!(matches!(
            result,
            Err(NodesError::Partition {
                source: PartitionError::Exhausted {
                    source: BackendError::Timeout,
                    ..
                },
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_cancellation_aborts_request() {
        let backend =
            Arc::new(FakeBackend::new(four_hosts()).delayed(Duration::from_secs(5)));
        let adapter = adapter(&backend);
        let scope = CancellationScope::new();

        let canceller = {
            let scope = scope.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                scope.cancel();
            })
        };

        let started = Instant::now();
        let result = adapter.get_nodes_with(&options(), Some(2), &scope).await;
        canceller.await.unwrap();

        assert!(matches!(result, Err(NodesError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(scope.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_scope_skips_estimation() {
        let backend = Arc::new(FakeBackend::new(four_hosts()));
        let scope = CancellationScope::new();
        scope.cancel();

        let result = adapter(&backend).get_nodes_with(&options(), None, &scope).await;

        assert!(matches!(result, Err(NodesError::Cancelled)));
    }

    #[tokio::test]
    async fn test_request_chain_applies_to_every_partition() {
        let backend = Arc::new(FakeBackend::new(four_hosts()));

        adapter(&backend)
            .with_pre(ExtraFilter::new(QueryExpression::exists("cloud.provider")))
            .get_nodes_with(&options(), Some(2), &CancellationScope::new())
            .await
            .unwrap();

        let requests = backend.requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        for request in requests.iter() {
            let body = request.bodies().next().unwrap();
            assert_eq!(body.size, Some(0));
            match &body.query {
                Some(QueryExpression::Bool(query)) => assert!(query
                    .filter
                    .contains(&QueryExpression::exists("cloud.provider"))),
                other => panic!("expected bool query, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_backoff_is_quadratic() {
        let retry = RetryPolicy::new(4, Duration::from_millis(100));
        assert_eq!(retry.backoff(1), Duration::from_millis(100));
        assert_eq!(retry.backoff(2), Duration::from_millis(400));
        assert_eq!(retry.backoff(3), Duration::from_millis(900));
    }

    #[test]
    fn test_prepare_applies_request_chain() {
        let backend = Arc::new(FakeBackend::new(vec![]));
        let queries = adapter(&backend).prepare(&options(), 3).unwrap();

        assert_eq!(queries.len(), 3);
        assert!(queries.iter().all(|q| q.body.size == Some(0)));
        assert_eq!(MultiSearchRequest::from_queries(&queries).len(), 3);
    }

    #[tokio::test]
    async fn test_single_partition_keeps_backend_order() {
        let backend = Arc::new(FakeBackend::new(vec![
            host("host-2", "zone-a", 1),
            host("host-10", "zone-a", 1),
            host("host-1", "zone-b", 1),
        ]));

        let response = adapter(&backend)
            .get_nodes_with(&options(), Some(1), &CancellationScope::new())
            .await
            .unwrap();

        let names: Vec<_> = response.nodes().unwrap().iter().map(|n| n.name()).collect();
        assert_eq!(names, vec!["host-2", "host-10", "host-1"]);
    }

    #[tokio::test]
    async fn test_node_counts_exact_across_partitions() {
        let backend = Arc::new(FakeBackend::new(four_hosts()));
        let options = NodeRequestOptions {
            group_by: vec![GroupByRule::terms("zone", "cloud.availability_zone")],
            ..options()
        };

        let response = adapter(&backend)
            .get_nodes_with(&options, Some(3), &CancellationScope::new())
            .await
            .unwrap();

        let counts: Vec<Vec<Option<f64>>> = response
            .groups()
            .unwrap()
            .iter()
            .map(|g| g.nodes().iter().map(|n| n.metric(MetricType::Count)).collect())
            .collect();
        let mut zone_a = counts[0].clone();
        zone_a.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_eq!(zone_a, vec![Some(1.0), Some(2.0)]);
        assert_eq!(counts[1].len(), 2);
    }

    /// Tags each request with the partition it serves
    struct PartitionTag;

    impl Processor<SearchBody> for PartitionTag {
        fn name(&self) -> &str {
            "partition_tag"
        }

        fn process(
            &self,
            options: &ProcessorOptions<'_>,
            body: SearchBody,
            next: Next<'_, SearchBody>,
        ) -> SearchBody {
            let clause = QueryExpression::matches(
                "partition.id",
                format!("{}/{}", options.partition.id, options.partition.count),
            );
            ExtraFilter::new(clause).process(options, body, next)
        }
    }

    #[tokio::test]
    async fn test_request_chain_sees_each_partition() {
        let backend = Arc::new(FakeBackend::new(four_hosts()));

        adapter(&backend)
            .with_pre(PartitionTag)
            .get_nodes_with(&options(), Some(3), &CancellationScope::new())
            .await
            .unwrap();

        let requests = backend.requests.lock().unwrap();
        assert_eq!(requests.len(), 3);
        for request in requests.iter() {
            let body = request.bodies().next().unwrap();
            let partition =
                FakeBackend::find_partition(&body.aggregations[NODES_AGGREGATION]).unwrap();
            let expected = QueryExpression::matches(
                "partition.id",
                format!("{}/3", partition.partition),
            );
            match &body.query {
                Some(QueryExpression::Bool(query)) => assert!(query.filter.contains(&expected)),
                other => panic!("expected bool query, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_prepare_passes_partition_to_stages() {
        let backend = Arc::new(FakeBackend::new(vec![]));
        let queries = adapter(&backend)
            .with_pre(PartitionTag)
            .prepare(&options(), 2)
            .unwrap();

        for (id, query) in queries.iter().enumerate() {
            let expected = QueryExpression::matches("partition.id", format!("{}/2", id));
            match &query.body.query {
                Some(QueryExpression::Bool(query)) => {
                    assert_eq!(query.filter.last(), Some(&expected))
                }
                other => panic!("expected bool query, got {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_lost_partition_is_incomplete() {
        let backend = Arc::new(FakeBackend::new(four_hosts()).crashing_on(1));

        let result = adapter(&backend)
            .get_nodes_with(&options(), Some(2), &CancellationScope::new())
            .await;

        assert!(matches!(
            result,
            Err(NodesError::Partition {
                source: PartitionError::Incomplete {
                    expected: 2,
                    received: 1
                },
                ..
            })
        ));
    }
}
