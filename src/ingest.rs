//! Ingestion consumer
//!
//! One worker per queue partition pulls whole batches and writes them to the
//! store: operation records first (insert-if-absent), then the events, which
//! the store deduplicates by id. That makes a retried batch idempotent, so a
//! transient store failure is retried with backoff. A batch that keeps
//! failing, or fails permanently, is dead-lettered and the worker moves on.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::metrics;
use crate::queue::QueuePartition;
use crate::retry::RetryPolicy;
use crate::store::UsageWriter;
use crate::usage::{OperationRecord, TargetId, UsageBatch, UsageEvent};

pub const DEFAULT_DEAD_LETTER_CAPACITY: usize = 1000;

/// A batch the consumer gave up on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub batch_id: Uuid,
    pub target: TargetId,
    pub operations: usize,
    pub attempts: u32,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

/// Running counters, shared by all workers
#[derive(Debug, Default)]
pub struct IngestionStats {
    batches_processed: AtomicU64,
    records_inserted: AtomicU64,
    events_written: AtomicU64,
    retries: AtomicU64,
    dead_letters: AtomicU64,
}

/// Point-in-time copy of [`IngestionStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestionStatsSnapshot {
    pub batches_processed: u64,
    pub records_inserted: u64,
    pub events_written: u64,
    pub retries: u64,
    pub dead_letters: u64,
}

impl IngestionStats {
    pub fn snapshot(&self) -> IngestionStatsSnapshot {
        IngestionStatsSnapshot {
            batches_processed: self.batches_processed.load(Ordering::Relaxed),
            records_inserted: self.records_inserted.load(Ordering::Relaxed),
            events_written: self.events_written.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            dead_letters: self.dead_letters.load(Ordering::Relaxed),
        }
    }
}

/// Result of handling one batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    Written { records: usize, events: usize },
    DeadLettered,
}

pub struct IngestionConsumer {
    writer: Arc<dyn UsageWriter>,
    retry: RetryPolicy,
    stats: IngestionStats,
    dead_letters: Mutex<VecDeque<DeadLetter>>,
    dead_letter_capacity: usize,
}

impl IngestionConsumer {
    pub fn new(writer: Arc<dyn UsageWriter>) -> Self {
        Self {
            writer,
            retry: RetryPolicy::default(),
            stats: IngestionStats::default(),
            dead_letters: Mutex::new(VecDeque::new()),
            dead_letter_capacity: DEFAULT_DEAD_LETTER_CAPACITY,
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_dead_letter_capacity(mut self, capacity: usize) -> Self {
        self.dead_letter_capacity = capacity.max(1);
        self
    }

    pub fn stats(&self) -> IngestionStatsSnapshot {
        self.stats.snapshot()
    }

    /// Most recent dead letters, oldest first
    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.dead_letters.lock().iter().cloned().collect()
    }

    /// Write one batch, retrying transient failures
    pub async fn process_batch(&self, batch: &UsageBatch) -> BatchOutcome {
        let mut attempt = 0;
        let mut written = WriteProgress::default();
        loop {
            match self.write(batch, &mut written).await {
                Ok(()) => {
                    let WriteProgress { records, events } = written;
                    self.stats.batches_processed.fetch_add(1, Ordering::Relaxed);
                    self.stats
                        .records_inserted
                        .fetch_add(records as u64, Ordering::Relaxed);
                    self.stats
                        .events_written
                        .fetch_add(events as u64, Ordering::Relaxed);
                    metrics::record_batch_processed(events);
                    debug!(batch = %batch.id, target_id = %batch.target, records, events, "usage batch written");
                    return BatchOutcome::Written { records, events };
                }
                Err(e) if e.is_retryable() => {
                    attempt += 1;
                    let Some(delay) = self.retry.next_delay(attempt) else {
                        self.dead_letter(batch, attempt, e.to_string());
                        return BatchOutcome::DeadLettered;
                    };
                    self.stats.retries.fetch_add(1, Ordering::Relaxed);
                    metrics::record_store_retry();
                    warn!(
                        batch = %batch.id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "usage store write failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    self.dead_letter(batch, attempt + 1, e.to_string());
                    return BatchOutcome::DeadLettered;
                }
            }
        }
    }

    /// Counts accumulate in `written` across attempts, so rows inserted by
    /// a failed attempt are still reported once the batch succeeds.
    async fn write(&self, batch: &UsageBatch, written: &mut WriteProgress) -> Result<()> {
        let mut seen = HashSet::new();
        let records: Vec<OperationRecord> = batch
            .operations
            .iter()
            .filter(|op| seen.insert(op.record.hash.clone()))
            .map(|op| op.record.clone())
            .collect();
        let events: Vec<UsageEvent> = batch.operations.iter().map(|op| op.event.clone()).collect();

        written.records += self.writer.insert_operations(&records).await?;
        written.events += self.writer.insert_events(&events).await?;
        Ok(())
    }

    fn dead_letter(&self, batch: &UsageBatch, attempts: u32, error: String) {
        error!(
            batch = %batch.id,
            target_id = %batch.target,
            operations = batch.len(),
            attempts,
            error = %error,
            "dead-lettering usage batch"
        );
        self.stats.dead_letters.fetch_add(1, Ordering::Relaxed);
        metrics::record_dead_letter();

        let mut dead_letters = self.dead_letters.lock();
        if dead_letters.len() >= self.dead_letter_capacity {
            dead_letters.pop_front();
        }
        dead_letters.push_back(DeadLetter {
            batch_id: batch.id,
            target: batch.target.clone(),
            operations: batch.len(),
            attempts,
            error,
            failed_at: Utc::now(),
        });
    }

    /// Start one worker per partition
    pub fn spawn(self: Arc<Self>, partitions: Vec<QueuePartition>) -> ConsumerHandle {
        let workers = partitions
            .into_iter()
            .map(|mut partition| {
                let consumer = Arc::clone(&self);
                tokio::spawn(async move {
                    info!(partition = partition.index, "ingestion worker started");
                    while let Some(batch) = partition.recv().await {
                        consumer.process_batch(&batch).await;
                    }
                    info!(partition = partition.index, "ingestion worker stopped");
                })
            })
            .collect();

        ConsumerHandle { workers }
    }
}

/// Running workers; they stop once the queue is closed and drained
pub struct ConsumerHandle {
    workers: Vec<JoinHandle<()>>,
}

impl ConsumerHandle {
    pub fn workers(&self) -> usize {
        self.workers.len()
    }

    /// Wait for every worker to finish draining
    pub async fn join(self) {
        for worker in self.workers {
            if let Err(e) = worker.await {
                error!(error = %e, "ingestion worker panicked");
            }
        }
    }

    pub fn abort(&self) {
        for worker in &self.workers {
            worker.abort();
        }
    }
}

/// Rows newly inserted for one batch
#[derive(Debug, Default, Clone, Copy)]
struct WriteProgress {
    records: usize,
    events: usize,
}
