//! End-to-end usage pipeline tests
//!
//! Reports go through the collector, the queue and the consumer workers into
//! the store; schema checks then read that usage back through the inspector.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use usage_registry::error::{RegistryError, Result};
use usage_registry::ingest::{ConsumerHandle, IngestionConsumer};
use usage_registry::retry::RetryPolicy;
use usage_registry::store::PurgeReport;
use usage_registry::usage::{OperationRecord, UsageEvent};
use usage_registry::{
    Criticality, Inspector, MemoryQueue, MemorySettingsStore, MemoryTokenStore, MemoryUsageStore,
    OperationNormalizer, OperationReport, PublishInput, SchemaCheckResult, SchemaRegistry, Scope,
    SettingsResolver, TargetId, UsageCollector, UsageReader, UsageWriter,
};

const SCHEMA: &str = "type Query { ping: String me: String }";
const WITHOUT_PING: &str = "type Query { me: String }";

struct Pipeline {
    collector: UsageCollector,
    queue: Arc<MemoryQueue>,
    consumer: Arc<IngestionConsumer>,
    workers: ConsumerHandle,
}

impl Pipeline {
    fn new(writer: Arc<dyn UsageWriter>, retry: RetryPolicy) -> Self {
        let tokens = MemoryTokenStore::new();
        for target in ["prod", "staging"] {
            tokens.insert(target, TargetId::from(target), vec![Scope::UsageWrite]);
        }

        let (queue, partitions) = MemoryQueue::new(2, 64);
        let consumer = Arc::new(IngestionConsumer::new(writer).with_retry_policy(retry));
        let workers = consumer.clone().spawn(partitions);
        let collector =
            UsageCollector::new(Arc::new(tokens), queue.clone(), OperationNormalizer::default());

        Self {
            collector,
            queue,
            consumer,
            workers,
        }
    }

    fn with_store(store: Arc<MemoryUsageStore>) -> Self {
        Self::new(store, RetryPolicy::default())
    }

    async fn send(&self, target: &str, reports: Vec<OperationReport>) {
        let report = self.collector.collect(target, reports).await.unwrap();
        assert_eq!(report.rejected, 0);
    }

    /// Close the queue and wait until every batch is written
    async fn drain(self) -> Arc<IngestionConsumer> {
        self.queue.close();
        self.workers.join().await;
        self.consumer
    }
}

fn ping() -> OperationReport {
    OperationReport::new("query ping { ping }", Some("ping"), &["Query", "Query.ping"])
}

fn me() -> OperationReport {
    OperationReport::new("query me { me }", Some("me"), &["Query", "Query.me"])
}

fn times(report: OperationReport, n: usize) -> Vec<OperationReport> {
    vec![report; n]
}

async fn registry_with_schema(
    store: Arc<MemoryUsageStore>,
    settings: SettingsResolver,
) -> SchemaRegistry {
    let registry = SchemaRegistry::new(Inspector::new(store, settings));
    let published = registry
        .publish_schema(
            &TargetId::from("prod"),
            PublishInput {
                sdl: SCHEMA.to_string(),
                author: "alice".to_string(),
                commit: "c0ffee".to_string(),
                force: false,
            },
        )
        .await;
    assert!(published.is_success());
    registry
}

fn resolver() -> SettingsResolver {
    SettingsResolver::new(Arc::new(MemorySettingsStore::new()))
}

async fn check_without_ping(registry: &SchemaRegistry) -> SchemaCheckResult {
    registry
        .check_schema(&TargetId::from("prod"), WITHOUT_PING, None)
        .await
}

#[tokio::test]
async fn test_single_operation_creates_record_and_coordinates() {
    let store = Arc::new(MemoryUsageStore::new());
    let pipeline = Pipeline::with_store(store.clone());

    pipeline.send("prod", vec![ping()]).await;
    pipeline.drain().await;

    let prod = TargetId::from("prod");
    assert_eq!(store.count_operation_records(&prod).await.unwrap(), 1);
    assert_eq!(store.operation_total(&prod), 1);
    assert_eq!(store.coordinate_row_count(&prod), 2);
}

#[tokio::test]
async fn test_ten_thousand_operations_in_batches() {
    let store = Arc::new(MemoryUsageStore::new());
    let pipeline = Pipeline::with_store(store.clone());

    for _ in 0..10 {
        pipeline.send("prod", times(ping(), 1_000)).await;
    }
    let consumer = pipeline.drain().await;

    let prod = TargetId::from("prod");
    assert_eq!(store.operation_total(&prod), 10_000);
    assert_eq!(store.count_operation_records(&prod).await.unwrap(), 1);
    assert_eq!(consumer.stats().batches_processed, 10);
    assert_eq!(consumer.stats().events_written, 10_000);
}

#[tokio::test]
async fn test_same_body_different_coordinates_are_distinct_records() {
    let store = Arc::new(MemoryUsageStore::new());
    let pipeline = Pipeline::with_store(store.clone());

    pipeline
        .send(
            "prod",
            vec![
                OperationReport::new("query ping { ping }", Some("ping"), &["Query", "Query.ping"]),
                OperationReport::new(
                    "query ping { ping }",
                    Some("ping"),
                    &["RootQuery", "RootQuery.ping"],
                ),
            ],
        )
        .await;
    pipeline.drain().await;

    let prod = TargetId::from("prod");
    assert_eq!(store.count_operation_records(&prod).await.unwrap(), 2);
    assert_eq!(store.coordinate_row_count(&prod), 4);
}

#[tokio::test]
async fn test_excluded_client_usage_does_not_block_removal() {
    let store = Arc::new(MemoryUsageStore::new());
    let pipeline = Pipeline::with_store(store.clone());
    pipeline
        .send("prod", times(ping().with_client("app", "1.0.0"), 5))
        .await;
    pipeline
        .send("prod", times(me().with_client("web", "2.0.0"), 5))
        .await;
    pipeline.drain().await;

    let settings = resolver();
    let registry = registry_with_schema(store, settings.clone()).await;
    let prod = TargetId::from("prod");

    settings
        .update_target_validation_settings(&prod, 0.0, 30, vec![prod.clone()], vec![])
        .await
        .unwrap();
    assert!(!check_without_ping(&registry).await.is_success());

    settings
        .update_target_validation_settings(&prod, 0.0, 30, vec![prod.clone()], vec!["app".into()])
        .await
        .unwrap();
    let result = check_without_ping(&registry).await;
    match result {
        SchemaCheckResult::SchemaCheckSuccess(success) => {
            assert!(success.valid);
            assert!(!success.initial);
            assert_eq!(success.changes.len(), 1);
            assert_eq!(success.changes[0].criticality, Criticality::Safe);
        }
        other => panic!("expected success, got {:?}", other),
    }
}

#[tokio::test]
async fn test_usage_at_threshold_is_not_breaking() {
    let store = Arc::new(MemoryUsageStore::new());
    let pipeline = Pipeline::with_store(store.clone());
    // ping is 1 of 4 executions: 25%
    let mut reports = vec![ping()];
    reports.extend(times(me(), 3));
    pipeline.send("prod", reports).await;
    pipeline.drain().await;

    let settings = resolver();
    let registry = registry_with_schema(store, settings.clone()).await;
    let prod = TargetId::from("prod");

    settings
        .update_target_validation_settings(&prod, 25.0, 30, vec![prod.clone()], vec![])
        .await
        .unwrap();
    assert!(check_without_ping(&registry).await.is_success());

    settings
        .update_target_validation_settings(&prod, 24.9, 30, vec![prod.clone()], vec![])
        .await
        .unwrap();
    assert!(!check_without_ping(&registry).await.is_success());
}

#[tokio::test]
async fn test_fan_out_pools_usage_across_targets() {
    let store = Arc::new(MemoryUsageStore::new());
    let pipeline = Pipeline::with_store(store.clone());
    pipeline.send("prod", times(me(), 10)).await;
    pipeline.send("staging", times(ping(), 10)).await;
    pipeline.drain().await;

    let settings = resolver();
    let registry = registry_with_schema(store, settings.clone()).await;
    let prod = TargetId::from("prod");
    let staging = TargetId::from("staging");

    settings
        .update_target_validation_settings(&prod, 0.0, 30, vec![prod.clone()], vec![])
        .await
        .unwrap();
    assert!(check_without_ping(&registry).await.is_success());

    settings
        .update_target_validation_settings(&prod, 0.0, 30, vec![prod.clone(), staging], vec![])
        .await
        .unwrap();
    assert!(!check_without_ping(&registry).await.is_success());
}

#[tokio::test]
async fn test_disabled_validation_or_empty_fan_out_keeps_removal_breaking() {
    let store = Arc::new(MemoryUsageStore::new());
    let pipeline = Pipeline::with_store(store.clone());
    pipeline.send("prod", times(me(), 10)).await;
    pipeline.drain().await;

    let settings = resolver();
    let registry = registry_with_schema(store, settings.clone()).await;
    let prod = TargetId::from("prod");

    // never configured
    assert!(!check_without_ping(&registry).await.is_success());

    settings.set_target_validation(&prod, true).await.unwrap();
    assert!(check_without_ping(&registry).await.is_success());

    settings.set_target_validation(&prod, false).await.unwrap();
    assert!(!check_without_ping(&registry).await.is_success());

    settings
        .update_target_validation_settings(&prod, 0.0, 30, vec![], vec![])
        .await
        .unwrap();
    assert!(!check_without_ping(&registry).await.is_success());
}

/// Writes events, then reports a transient failure once, as if the
/// acknowledgement was lost
struct LostAckWriter {
    inner: Arc<MemoryUsageStore>,
    failed: AtomicBool,
}

#[async_trait]
impl UsageWriter for LostAckWriter {
    async fn insert_operations(&self, records: &[OperationRecord]) -> Result<usize> {
        self.inner.insert_operations(records).await
    }

    async fn insert_events(&self, events: &[UsageEvent]) -> Result<usize> {
        let written = self.inner.insert_events(events).await?;
        if !self.failed.swap(true, Ordering::SeqCst) {
            return Err(RegistryError::TransientStore("ack lost".into()));
        }
        Ok(written)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<PurgeReport> {
        self.inner.purge_expired(now).await
    }
}

#[tokio::test]
async fn test_retried_batches_are_not_double_counted() {
    let store = Arc::new(MemoryUsageStore::new());
    let writer = Arc::new(LostAckWriter {
        inner: store.clone(),
        failed: AtomicBool::new(false),
    });
    let pipeline = Pipeline::new(writer, RetryPolicy::exponential(3, 1, 2));

    pipeline.send("prod", times(ping(), 50)).await;
    let consumer = pipeline.drain().await;

    assert_eq!(consumer.stats().retries, 1);
    assert_eq!(store.operation_total(&TargetId::from("prod")), 50);
    assert_eq!(store.event_count(), 50);
}

/// Always fails transiently for one target
struct BrokenTargetWriter {
    inner: Arc<MemoryUsageStore>,
    broken: TargetId,
}

#[async_trait]
impl UsageWriter for BrokenTargetWriter {
    async fn insert_operations(&self, records: &[OperationRecord]) -> Result<usize> {
        self.inner.insert_operations(records).await
    }

    async fn insert_events(&self, events: &[UsageEvent]) -> Result<usize> {
        if events.iter().any(|e| e.target == self.broken) {
            return Err(RegistryError::TransientStore("partition offline".into()));
        }
        self.inner.insert_events(events).await
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<PurgeReport> {
        self.inner.purge_expired(now).await
    }
}

#[tokio::test]
async fn test_dead_lettered_batch_does_not_stop_workers() {
    let store = Arc::new(MemoryUsageStore::new());
    let writer = Arc::new(BrokenTargetWriter {
        inner: store.clone(),
        broken: TargetId::from("staging"),
    });
    let pipeline = Pipeline::new(writer, RetryPolicy::exponential(2, 1, 2));

    pipeline.send("staging", times(ping(), 3)).await;
    pipeline.send("prod", times(ping(), 3)).await;
    pipeline.send("staging", times(me(), 1)).await;
    pipeline.send("prod", times(me(), 2)).await;
    let consumer = pipeline.drain().await;

    let stats = consumer.stats();
    assert_eq!(stats.dead_letters, 2);
    assert_eq!(stats.batches_processed, 2);
    assert_eq!(store.operation_total(&TargetId::from("prod")), 5);
    assert_eq!(store.operation_total(&TargetId::from("staging")), 0);
    assert!(consumer
        .dead_letters()
        .iter()
        .all(|d| d.target == TargetId::from("staging") && d.attempts == 3));
}
