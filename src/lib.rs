//! Usage Registry
//!
//! A GraphQL schema registry that uses production traffic as evidence when
//! deciding whether a schema change is safe to ship.
//!
//! ## Features
//!
//! - **Operation Fingerprints**: Executed operations are canonicalized and hashed so
//!   the same shape always lands on the same record
//! - **Usage Ingestion**: Reports are accepted on an HTTP ingress, queued per target
//!   and aggregated by a pool of consumer workers
//! - **Rollups**: Hourly and daily counters, per field and per client, with mergeable
//!   duration sketches
//! - **Usage-Aware Checks**: Removing a field nobody uses is safe, not breaking
//! - **Semantic Versioning**: Published schemas are versioned by the check verdict
//!
//! ## Architecture
//!
//! ```text
//! POST /usage ─► UsageCollector ─► OperationNormalizer
//!                      │
//!                      ▼
//!                 MemoryQueue (partitioned by target)
//!                      │
//!                      ▼
//!              IngestionConsumer ─► UsageWriter ─► rollups
//!
//! POST /schema/check ─► SchemaRegistry ─► Inspector ─► diff
//!                                            │
//!                          SettingsResolver ─┴─► UsageReader
//! ```

pub mod auth;
pub mod checksum;
pub mod collector;
pub mod config;
pub mod diff;
pub mod error;
pub mod fingerprint;
pub mod ingest;
pub mod inspector;
pub mod metrics;
pub mod normalize;
pub mod queue;
pub mod registry;
pub mod retry;
pub mod schema;
pub mod server;
pub mod settings;
pub mod store;
pub mod usage;
pub mod version;

pub use auth::{MemoryTokenStore, RequestContext, Scope, TokenVerifier};
pub use collector::{CollectReport, UsageCollector};
pub use config::RegistryConfig;
pub use diff::{ChangeKind, Criticality, SchemaChange};
pub use error::{RegistryError, Result};
pub use fingerprint::OperationHash;
pub use ingest::{BatchOutcome, IngestionConsumer};
pub use inspector::{Inspection, Inspector};
pub use normalize::{NormalizeOptions, NormalizedOperation, OperationNormalizer};
pub use queue::{MemoryQueue, UsageQueue};
pub use registry::{PublishInput, SchemaCheckResult, SchemaPublishResult, SchemaRegistry};
pub use schema::SchemaModel;
pub use server::App;
pub use settings::{MemorySettingsStore, SettingsResolver, ValidationSettings};
pub use store::{MemoryUsageStore, UsageReader, UsageWriter};
pub use usage::{OperationReport, TargetId, UsageBatch};
pub use version::SchemaVersion;
