//! Usage queue
//!
//! The collector hands accepted batches to a durable queue and acknowledges
//! the caller without waiting for aggregation. Batches are partitioned by
//! target so one target's batches are always consumed in order by the same
//! worker; there is no ordering across targets.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::debug;
use xxhash_rust::xxh3::xxh3_64;

use crate::error::{RegistryError, Result};
use crate::usage::{TargetId, UsageBatch};

/// Producer side of the usage queue
#[async_trait]
pub trait UsageQueue: Send + Sync {
    /// Enqueue without blocking; a full or closed queue is a retryable error
    async fn enqueue(&self, batch: UsageBatch) -> Result<()>;
}

/// Stable partition of a target among `partitions`
pub fn partition_of(target: &TargetId, partitions: usize) -> usize {
    if partitions <= 1 {
        return 0;
    }
    (xxh3_64(target.as_str().as_bytes()) % partitions as u64) as usize
}

/// Bounded, partitioned in-process queue
pub struct MemoryQueue {
    senders: RwLock<Vec<mpsc::Sender<UsageBatch>>>,
    partitions: usize,
}

/// Consumer side of one partition
pub struct QueuePartition {
    pub index: usize,
    receiver: mpsc::Receiver<UsageBatch>,
}

impl QueuePartition {
    /// Next batch, or `None` once the queue is closed and drained
    pub async fn recv(&mut self) -> Option<UsageBatch> {
        self.receiver.recv().await
    }
}

impl MemoryQueue {
    /// Create a queue with `partitions` partitions of `capacity` batches each
    pub fn new(partitions: usize, capacity: usize) -> (Arc<Self>, Vec<QueuePartition>) {
        let partitions = partitions.max(1);
        let mut senders = Vec::with_capacity(partitions);
        let mut receivers = Vec::with_capacity(partitions);

        for index in 0..partitions {
            let (tx, rx) = mpsc::channel(capacity.max(1));
            senders.push(tx);
            receivers.push(QueuePartition { index, receiver: rx });
        }

        let queue = Arc::new(Self {
            senders: RwLock::new(senders),
            partitions,
        });
        (queue, receivers)
    }

    pub fn partitions(&self) -> usize {
        self.partitions
    }

    /// Stop accepting batches; consumers drain what is queued and stop
    pub fn close(&self) {
        self.senders.write().clear();
    }

    pub fn is_closed(&self) -> bool {
        self.senders.read().is_empty()
    }
}

#[async_trait]
impl UsageQueue for MemoryQueue {
    async fn enqueue(&self, batch: UsageBatch) -> Result<()> {
        let partition = partition_of(&batch.target, self.partitions);
        let sender = {
            let senders = self.senders.read();
            senders
                .get(partition)
                .cloned()
                .ok_or_else(|| RegistryError::QueueUnavailable("queue is closed".to_string()))?
        };

        debug!(batch = %batch.id, target_id = %batch.target, partition, size = batch.len(), "enqueue usage batch");

        sender.try_send(batch).map_err(|e| match e {
            TrySendError::Full(_) => {
                RegistryError::QueueUnavailable(format!("partition {} is full", partition))
            }
            TrySendError::Closed(_) => {
                RegistryError::QueueUnavailable("queue is closed".to_string())
            }
        })
    }
}
