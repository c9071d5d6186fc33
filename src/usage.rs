//! Usage telemetry types
//!
//! What instrumented clients submit ([`OperationReport`]), what the collector
//! puts on the queue ([`UsageBatch`]) and the fact rows the consumer writes
//! ([`OperationRecord`], [`UsageEvent`]).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::fingerprint::OperationHash;

/// Identifier of a target (one deployed graph, e.g. "production")
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TargetId(String);

impl TargetId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TargetId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TargetId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Kind of a GraphQL operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Query,
    Mutation,
    Subscription,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Query => "query",
            OperationKind::Mutation => "mutation",
            OperationKind::Subscription => "subscription",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Execution outcome of one operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Execution {
    pub ok: bool,
    /// Duration in nanoseconds
    #[serde(alias = "durationNanos")]
    pub duration: u64,
    #[serde(default)]
    pub errors_total: u64,
}

/// Client that executed an operation
///
/// Reports without client metadata are attributed to the empty name/version.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientInfo {
    pub name: String,
    #[serde(default)]
    pub version: String,
}

impl ClientInfo {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

/// Optional report metadata
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportMetadata {
    #[serde(default)]
    pub client: Option<ClientInfo>,
}

/// One client-submitted execution, as received on the ingress
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationReport {
    /// Epoch milliseconds; the collector's clock is used when absent
    #[serde(default)]
    pub timestamp: Option<i64>,
    /// Raw operation document
    pub operation: String,
    #[serde(default)]
    pub operation_name: Option<String>,
    /// Schema coordinates touched by the operation (e.g. `Query.ping`)
    #[serde(default)]
    pub fields: Vec<String>,
    pub execution: Execution,
    #[serde(default)]
    pub metadata: Option<ReportMetadata>,
}

impl OperationReport {
    /// Convenience constructor used by tests and the CLI
    pub fn new(operation: impl Into<String>, operation_name: Option<&str>, fields: &[&str]) -> Self {
        Self {
            timestamp: None,
            operation: operation.into(),
            operation_name: operation_name.map(String::from),
            fields: fields.iter().map(|f| f.to_string()).collect(),
            execution: Execution {
                ok: true,
                duration: 0,
                errors_total: 0,
            },
            metadata: None,
        }
    }

    pub fn with_client(mut self, name: &str, version: &str) -> Self {
        self.metadata = Some(ReportMetadata {
            client: Some(ClientInfo::new(name, version)),
        });
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp.timestamp_millis());
        self
    }

    pub fn with_execution(mut self, ok: bool, duration_nanos: u64, errors_total: u64) -> Self {
        self.execution = Execution {
            ok,
            duration: duration_nanos,
            errors_total,
        };
        self
    }

    /// Client that sent the report, or the anonymous client
    pub fn client(&self) -> ClientInfo {
        self.metadata
            .as_ref()
            .and_then(|m| m.client.clone())
            .unwrap_or_default()
    }
}

/// A distinct operation shape, stored at most once per (target, hash)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationRecord {
    pub target: TargetId,
    pub hash: OperationHash,
    pub name: Option<String>,
    pub kind: OperationKind,
    /// Canonical (normalized) body
    pub body: String,
    /// Sorted, deduplicated schema coordinates
    pub coordinates: Vec<String>,
}

/// One execution instance; append-only
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageEvent {
    /// Identity used to deduplicate retried writes
    pub id: Uuid,
    pub target: TargetId,
    pub hash: OperationHash,
    pub timestamp: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub ok: bool,
    pub duration_nanos: u64,
    pub errors_total: u64,
    pub client: ClientInfo,
}

/// Normalized report ready for ingestion
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessedOperation {
    pub record: OperationRecord,
    pub event: UsageEvent,
}

/// Unit of work on the usage queue: the accepted items of one ingress request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageBatch {
    pub id: Uuid,
    pub target: TargetId,
    pub received_at: DateTime<Utc>,
    pub operations: Vec<ProcessedOperation>,
}

impl UsageBatch {
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}
