//! Configuration management for the usage registry
//!
//! Supports loading configuration from:
//! - Default values
//! - Config file (usage.toml)
//! - Environment variables (USAGE__*)
//!
//! ## Example config file (usage.toml):
//! ```toml
//! [server]
//! listen_addr = "0.0.0.0:8080"
//!
//! [ingestion]
//! workers = 4
//! max_retries = 5
//!
//! [inspector]
//! usage_timeout_ms = 5000
//!
//! [[tokens]]
//! token = "dev-token"
//! target = "production"
//! scopes = ["usage:write", "registry:read", "registry:write", "target:settings"]
//! ```

use config_crate::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

use crate::auth::Scope;
use crate::collector::{DEFAULT_EVENT_TTL_DAYS, DEFAULT_MAX_BATCH_SIZE};
use crate::inspector::DEFAULT_USAGE_TIMEOUT_MS;
use crate::metrics::MetricsConfig;
use crate::normalize::NormalizeOptions;
use crate::retry::RetryPolicy;
use crate::usage::TargetId;

/// Main configuration for the usage registry
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub collector: CollectorConfig,

    #[serde(default)]
    pub ingestion: IngestionConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub inspector: InspectorConfig,

    /// Operation normalization flags
    #[serde(default)]
    pub normalizer: NormalizeOptions,

    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Static tokens seeded into the in-memory verifier
    #[serde(default)]
    pub tokens: Vec<TokenConfig>,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Largest accepted request body
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

/// Ingress configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorConfig {
    /// Most reports accepted in one request
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
}

/// Queue and consumer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionConfig {
    /// Queue partitions, one consumer worker each
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Batches buffered per partition before ingress answers 503
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Lifetime of raw usage events
    #[serde(default = "default_event_ttl_days")]
    pub event_ttl_days: i64,

    #[serde(default = "default_dead_letter_capacity")]
    pub dead_letter_capacity: usize,
}

/// Aggregation store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// How long hourly and daily rollups are kept
    #[serde(default = "default_rollup_retention_days")]
    pub rollup_retention_days: i64,

    /// How often expired events and rollups are purged
    #[serde(default = "default_purge_interval_secs")]
    pub purge_interval_secs: u64,
}

/// Schema check configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InspectorConfig {
    /// Deadline of the usage lookup during a schema check
    #[serde(default = "default_usage_timeout_ms")]
    pub usage_timeout_ms: u64,
}

/// A token granted to one target
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenConfig {
    pub token: String,
    pub target: TargetId,
    #[serde(default)]
    pub scopes: Vec<Scope>,
}

// Default value functions
fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_max_body_bytes() -> usize {
    10 * 1024 * 1024
}

fn default_max_batch_size() -> usize {
    DEFAULT_MAX_BATCH_SIZE
}

fn default_workers() -> usize {
    4
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_max_retries() -> u32 {
    5
}

fn default_initial_backoff_ms() -> u64 {
    100
}

fn default_max_backoff_ms() -> u64 {
    5000
}

fn default_event_ttl_days() -> i64 {
    DEFAULT_EVENT_TTL_DAYS
}

fn default_dead_letter_capacity() -> usize {
    1000
}

fn default_rollup_retention_days() -> i64 {
    365
}

fn default_purge_interval_secs() -> u64 {
    3600
}

fn default_usage_timeout_ms() -> u64 {
    DEFAULT_USAGE_TIMEOUT_MS
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            max_batch_size: default_max_batch_size(),
        }
    }
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            event_ttl_days: default_event_ttl_days(),
            dead_letter_capacity: default_dead_letter_capacity(),
        }
    }
}

impl IngestionConfig {
    /// Retry policy of the consumer's store writes
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(self.max_retries, self.initial_backoff_ms, self.max_backoff_ms)
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            rollup_retention_days: default_rollup_retention_days(),
            purge_interval_secs: default_purge_interval_secs(),
        }
    }
}

impl Default for InspectorConfig {
    fn default() -> Self {
        Self {
            usage_timeout_ms: default_usage_timeout_ms(),
        }
    }
}

impl RegistryConfig {
    /// Load configuration from default locations
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(None)
    }

    /// Load configuration from a specific file
    pub fn load_from(config_path: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();

        let config_locations = ["usage.toml", ".usage.toml", "config/usage.toml"];

        for location in config_locations {
            builder = builder.add_source(File::with_name(location).required(false));
        }

        if let Some(config_dir) = directories::ProjectDirs::from("dev", "usage-registry", "usage") {
            let xdg_config = config_dir.config_dir().join("usage.toml");
            if xdg_config.exists() {
                builder = builder.add_source(File::from(xdg_config).required(false));
            }
        }

        if let Some(path) = config_path {
            builder = builder.add_source(File::with_name(path).required(true));
        }

        // USAGE__SECTION__KEY
        builder = builder.add_source(
            Environment::with_prefix("USAGE")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Save configuration to a file
    pub fn save(&self, path: &str) -> std::io::Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_default_config() {
        let config = RegistryConfig::default();
        assert_eq!(config.ingestion.workers, 4);
        assert_eq!(config.ingestion.max_retries, 5);
        assert_eq!(config.inspector.usage_timeout_ms, 5000);
        assert_eq!(config.store.rollup_retention_days, 365);
        assert!(config.normalizer.hide_literals);
        assert!(!config.metrics.enabled);
        assert!(config.tokens.is_empty());
    }

    #[test]
    fn test_serialize_config() {
        let config = RegistryConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        assert!(toml_str.contains("[server]"));
        assert!(toml_str.contains("[ingestion]"));
        assert!(toml_str.contains("[inspector]"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("usage.toml");
        std::fs::write(
            &path,
            r#"
[ingestion]
workers = 2
max_retries = 1

[[tokens]]
token = "t1"
target = "staging"
scopes = ["usage:write", "registry:read"]
"#,
        )
        .unwrap();

        let config = RegistryConfig::load_from(path.to_str()).unwrap();
        assert_eq!(config.ingestion.workers, 2);
        assert_eq!(config.ingestion.queue_capacity, 1024);
        assert_eq!(config.tokens.len(), 1);
        assert_eq!(config.tokens[0].target, TargetId::from("staging"));
        assert_eq!(config.tokens[0].scopes, vec![Scope::UsageWrite, Scope::RegistryRead]);
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("saved.toml");
        let mut config = RegistryConfig::default();
        config.inspector.usage_timeout_ms = 250;
        config.save(path.to_str().unwrap()).unwrap();

        let loaded = RegistryConfig::load_from(path.to_str()).unwrap();
        assert_eq!(loaded.inspector.usage_timeout_ms, 250);
    }

    #[test]
    fn test_retry_policy_from_config() {
        let ingestion = IngestionConfig::default();
        let policy = ingestion.retry_policy();
        assert_eq!(policy.max_retries, 5);
        assert_eq!(policy.next_delay(1), Some(Duration::from_millis(100)));
        assert_eq!(policy.next_delay(6), None);
    }
}
