//! Usage collector
//!
//! Ingress for client usage reports. A request is authenticated as a whole,
//! then each report is normalized on its own: a bad report is dropped and
//! counted, its siblings still go through. Accepted reports of one request
//! are enqueued as a single [`UsageBatch`]; the caller is acknowledged as
//! soon as the queue takes it, never after aggregation.

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::{RequestContext, Scope, TokenVerifier};
use crate::error::{RegistryError, Result};
use crate::metrics;
use crate::normalize::OperationNormalizer;
use crate::queue::UsageQueue;
use crate::usage::{OperationRecord, OperationReport, ProcessedOperation, UsageBatch, UsageEvent};

/// `Type`, `Type.field` or `Type.field.argument`
static COORDINATE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[_A-Za-z][_0-9A-Za-z]*(\.[_A-Za-z][_0-9A-Za-z]*){0,2}$")
        .expect("Invalid coordinate regex")
});

pub const DEFAULT_MAX_BATCH_SIZE: usize = 1000;
pub const DEFAULT_EVENT_TTL_DAYS: i64 = 90;

/// Outcome of one ingress request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectReport {
    /// Id of the enqueued batch; `None` when nothing was accepted
    pub batch_id: Option<Uuid>,
    pub accepted: usize,
    pub rejected: usize,
}

/// Stateless apart from its shared queue handle; safe to clone per worker
#[derive(Clone)]
pub struct UsageCollector {
    verifier: Arc<dyn TokenVerifier>,
    queue: Arc<dyn UsageQueue>,
    normalizer: OperationNormalizer,
    max_batch_size: usize,
    event_ttl: Duration,
}

impl UsageCollector {
    pub fn new(
        verifier: Arc<dyn TokenVerifier>,
        queue: Arc<dyn UsageQueue>,
        normalizer: OperationNormalizer,
    ) -> Self {
        Self {
            verifier,
            queue,
            normalizer,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            event_ttl: Duration::days(DEFAULT_EVENT_TTL_DAYS),
        }
    }

    pub fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = max_batch_size.max(1);
        self
    }

    pub fn with_event_ttl_days(mut self, days: i64) -> Self {
        self.event_ttl = Duration::days(days.max(1));
        self
    }

    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    pub fn verifier(&self) -> &dyn TokenVerifier {
        self.verifier.as_ref()
    }

    /// Authenticate `token` and collect `reports` for its target
    pub async fn collect(&self, token: &str, reports: Vec<OperationReport>) -> Result<CollectReport> {
        let ctx = RequestContext::authenticate(self.verifier.as_ref(), token).await?;
        self.collect_for(&ctx, reports).await
    }

    /// Collect `reports` for an already authenticated request
    pub async fn collect_for(
        &self,
        ctx: &RequestContext,
        reports: Vec<OperationReport>,
    ) -> Result<CollectReport> {
        ctx.require(Scope::UsageWrite)?;

        if reports.len() > self.max_batch_size {
            return Err(RegistryError::InvalidEnvelope(format!(
                "batch of {} reports exceeds the limit of {}",
                reports.len(),
                self.max_batch_size
            )));
        }

        let received_at = Utc::now();
        let mut operations = Vec::with_capacity(reports.len());
        let mut rejected = 0;

        for (index, report) in reports.into_iter().enumerate() {
            match self.process(ctx, report, received_at) {
                Ok(operation) => operations.push(operation),
                Err(e) => {
                    rejected += 1;
                    debug!(request = %ctx.request_id, index, error = %e, "dropping usage report");
                }
            }
        }

        let accepted = operations.len();
        let batch_id = if operations.is_empty() {
            None
        } else {
            let batch = UsageBatch {
                id: Uuid::new_v4(),
                target: ctx.target.clone(),
                received_at,
                operations,
            };
            let id = batch.id;
            self.queue.enqueue(batch).await.map_err(|e| {
                warn!(request = %ctx.request_id, target_id = %ctx.target, error = %e, "usage batch not enqueued");
                e
            })?;
            Some(id)
        };

        metrics::record_reports(accepted, rejected);
        if rejected > 0 {
            info!(target_id = %ctx.target, accepted, rejected, "collected usage with rejections");
        } else {
            debug!(target_id = %ctx.target, accepted, "collected usage");
        }

        Ok(CollectReport {
            batch_id,
            accepted,
            rejected,
        })
    }

    fn process(
        &self,
        ctx: &RequestContext,
        report: OperationReport,
        received_at: DateTime<Utc>,
    ) -> Result<ProcessedOperation> {
        if let Some(bad) = report.fields.iter().find(|f| !COORDINATE_RE.is_match(f)) {
            return Err(RegistryError::InvalidOperation(format!(
                "invalid schema coordinate '{}'",
                bad
            )));
        }

        let normalized = self.normalizer.normalize(
            &report.operation,
            report.operation_name.as_deref(),
            &report.fields,
        )?;

        let timestamp = report
            .timestamp
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .unwrap_or(received_at);
        let expires_at = timestamp.checked_add_signed(self.event_ttl).ok_or_else(|| {
            RegistryError::InvalidOperation(format!("timestamp {} is out of range", timestamp))
        })?;
        let client = report.client();

        let event = UsageEvent {
            id: Uuid::new_v4(),
            target: ctx.target.clone(),
            hash: normalized.hash.clone(),
            timestamp,
            expires_at,
            ok: report.execution.ok,
            duration_nanos: report.execution.duration,
            errors_total: report.execution.errors_total,
            client,
        };
        let record = OperationRecord {
            target: ctx.target.clone(),
            hash: normalized.hash,
            name: normalized.name,
            kind: normalized.kind,
            body: normalized.body,
            coordinates: normalized.coordinates,
        };

        Ok(ProcessedOperation { record, event })
    }
}
