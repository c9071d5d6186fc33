//! Schema Registry
//!
//! Per-target, append-only schema history. Every incoming schema is checked
//! against the latest published one through the [`Inspector`]; publishing
//! only stores a new version when the check passes or the caller forces it.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::diff::SchemaChange;
use crate::error::{RegistryError, Result};
use crate::inspector::Inspector;
use crate::metrics;
use crate::schema::SchemaModel;
use crate::usage::TargetId;
use crate::version::SchemaVersion;

/// Error attached to a failed check or publish
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaError {
    pub message: String,
}

impl SchemaError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaCheckSuccess {
    pub is_composable: bool,
    pub valid: bool,
    /// No schema was published for the target yet
    pub initial: bool,
    pub changes: Vec<SchemaChange>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaCheckError {
    pub is_composable: bool,
    pub valid: bool,
    pub changes: Vec<SchemaChange>,
    pub errors: Vec<SchemaError>,
}

/// Outcome of `checkSchema`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "__typename")]
pub enum SchemaCheckResult {
    SchemaCheckSuccess(SchemaCheckSuccess),
    SchemaCheckError(SchemaCheckError),
}

impl SchemaCheckResult {
    pub fn is_success(&self) -> bool {
        matches!(self, SchemaCheckResult::SchemaCheckSuccess(_))
    }

    pub fn changes(&self) -> &[SchemaChange] {
        match self {
            SchemaCheckResult::SchemaCheckSuccess(s) => &s.changes,
            SchemaCheckResult::SchemaCheckError(e) => &e.changes,
        }
    }

    fn invalid(errors: Vec<String>) -> Self {
        SchemaCheckResult::SchemaCheckError(SchemaCheckError {
            is_composable: false,
            valid: false,
            changes: Vec::new(),
            errors: errors.into_iter().map(SchemaError::new).collect(),
        })
    }
}

/// Input of `publishSchema`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishInput {
    pub sdl: String,
    pub author: String,
    pub commit: String,
    /// Store the schema even when the check fails on breaking changes
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaPublishSuccess {
    pub initial: bool,
    pub valid: bool,
    /// Version now latest for the target
    pub version: String,
    pub changes: Vec<SchemaChange>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaPublishError {
    pub valid: bool,
    pub changes: Vec<SchemaChange>,
    pub errors: Vec<SchemaError>,
}

/// Outcome of `publishSchema`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "__typename")]
pub enum SchemaPublishResult {
    SchemaPublishSuccess(SchemaPublishSuccess),
    SchemaPublishError(SchemaPublishError),
}

impl SchemaPublishResult {
    pub fn is_success(&self) -> bool {
        matches!(self, SchemaPublishResult::SchemaPublishSuccess(_))
    }
}

/// The main schema registry
pub struct SchemaRegistry {
    inspector: Inspector,
    versions: RwLock<HashMap<TargetId, Vec<SchemaVersion>>>,
}

impl SchemaRegistry {
    pub fn new(inspector: Inspector) -> Self {
        Self {
            inspector,
            versions: RwLock::new(HashMap::new()),
        }
    }

    /// All versions of a target, oldest first
    pub fn versions(&self, target: &TargetId) -> Vec<SchemaVersion> {
        self.versions.read().get(target).cloned().unwrap_or_default()
    }

    /// Latest published version of a target
    pub fn latest(&self, target: &TargetId) -> Option<SchemaVersion> {
        self.versions
            .read()
            .get(target)
            .and_then(|v| v.last().cloned())
    }

    /// Get a version by its number (a leading `v` is accepted)
    pub fn get_version(&self, target: &TargetId, version: &str) -> Result<SchemaVersion> {
        let version = semver::Version::parse(version.strip_prefix('v').unwrap_or(version))?;
        self.versions
            .read()
            .get(target)
            .and_then(|v| v.iter().find(|s| s.version == version).cloned())
            .ok_or_else(|| RegistryError::NotFound(format!("{} v{}", target, version)))
    }

    /// Check `sdl` against the latest schema of `target`
    pub async fn check_schema(
        &self,
        target: &TargetId,
        sdl: &str,
        service: Option<&str>,
    ) -> SchemaCheckResult {
        debug!(target_id = %target, service = service.unwrap_or(""), "checking schema");
        let result = self.check(target, sdl).await;
        metrics::record_schema_check(result.is_success());
        result
    }

    async fn check(&self, target: &TargetId, sdl: &str) -> SchemaCheckResult {
        let incoming = match SchemaModel::parse(sdl) {
            Ok(model) => model,
            Err(e) => return SchemaCheckResult::invalid(vec![e.to_string()]),
        };
        let errors = incoming.validate();
        if !errors.is_empty() {
            return SchemaCheckResult::invalid(errors);
        }

        let Some(latest) = self.latest(target) else {
            return SchemaCheckResult::SchemaCheckSuccess(SchemaCheckSuccess {
                is_composable: true,
                valid: true,
                initial: true,
                changes: Vec::new(),
            });
        };

        let existing = match SchemaModel::parse(&latest.sdl) {
            Ok(model) => model,
            Err(e) => {
                warn!(target_id = %target, version = %latest, error = %e, "stored schema no longer parses");
                return SchemaCheckResult::invalid(vec![e.to_string()]);
            }
        };

        let inspection = self.inspector.diff(&existing, &incoming, Some(target)).await;
        if inspection.valid {
            SchemaCheckResult::SchemaCheckSuccess(SchemaCheckSuccess {
                is_composable: true,
                valid: true,
                initial: false,
                changes: inspection.changes,
            })
        } else {
            let errors = inspection
                .breaking()
                .map(|c| SchemaError::new(c.message.clone()))
                .collect();
            SchemaCheckResult::SchemaCheckError(SchemaCheckError {
                is_composable: true,
                valid: false,
                changes: inspection.changes,
                errors,
            })
        }
    }

    /// Check and, when valid or forced, store a new version
    pub async fn publish_schema(
        &self,
        target: &TargetId,
        input: PublishInput,
    ) -> SchemaPublishResult {
        let check = self.check_schema(target, &input.sdl, None).await;

        let (initial, valid, changes) = match check {
            SchemaCheckResult::SchemaCheckSuccess(s) => (s.initial, true, s.changes),
            SchemaCheckResult::SchemaCheckError(e) if e.is_composable && input.force => {
                warn!(target_id = %target, author = %input.author, "force-publishing schema with breaking changes");
                (false, false, e.changes)
            }
            SchemaCheckResult::SchemaCheckError(e) => {
                return SchemaPublishResult::SchemaPublishError(SchemaPublishError {
                    valid: false,
                    changes: e.changes,
                    errors: e.errors,
                });
            }
        };

        let mut versions = self.versions.write();
        let history = versions.entry(target.clone()).or_default();

        let version = match history.last() {
            Some(latest) if latest.checksum.matches(&input.sdl) => {
                return SchemaPublishResult::SchemaPublishSuccess(SchemaPublishSuccess {
                    initial: false,
                    valid: true,
                    version: latest.version.to_string(),
                    changes: Vec::new(),
                    message: Some("No changes. Skipping.".to_string()),
                });
            }
            Some(latest) => {
                let mut next = latest.next(&input.sdl, &input.author, &input.commit, changes.clone());
                next.forced = !valid;
                next
            }
            None => SchemaVersion::initial(&input.sdl, &input.author, &input.commit),
        };

        info!(
            target_id = %target,
            version = %version,
            author = %input.author,
            commit = %input.commit,
            changes = changes.len(),
            "schema published"
        );
        let published = version.version.to_string();
        history.push(version);

        SchemaPublishResult::SchemaPublishSuccess(SchemaPublishSuccess {
            initial,
            valid,
            version: published,
            changes,
            message: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::{MemorySettingsStore, SettingsResolver};
    use crate::store::MemoryUsageStore;
    use std::sync::Arc;

    fn registry() -> SchemaRegistry {
        let inspector = Inspector::new(
            Arc::new(MemoryUsageStore::new()),
            SettingsResolver::new(Arc::new(MemorySettingsStore::new())),
        );
        SchemaRegistry::new(inspector)
    }

    fn publish(sdl: &str, force: bool) -> PublishInput {
        PublishInput {
            sdl: sdl.to_string(),
            author: "alice".to_string(),
            commit: "abc123".to_string(),
            force,
        }
    }

    #[tokio::test]
    async fn test_initial_check_and_publish() {
        let registry = registry();
        let prod = TargetId::from("prod");

        let check = registry.check_schema(&prod, "type Query { ping: String }", None).await;
        assert_eq!(
            check,
            SchemaCheckResult::SchemaCheckSuccess(SchemaCheckSuccess {
                is_composable: true,
                valid: true,
                initial: true,
                changes: vec![],
            })
        );

        let result = registry
            .publish_schema(&prod, publish("type Query { ping: String }", false))
            .await;
        assert!(result.is_success());
        assert_eq!(registry.latest(&prod).unwrap().tag_string(), "v1.0.0");
    }

    #[tokio::test]
    async fn test_unparsable_schema_is_not_composable() {
        let registry = registry();
        let check = registry
            .check_schema(&TargetId::from("prod"), "type Query {", None)
            .await;
        match check {
            SchemaCheckResult::SchemaCheckError(e) => {
                assert!(!e.is_composable);
                assert_eq!(e.errors.len(), 1);
            }
            other => panic!("expected error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_breaking_publish_is_rejected_unless_forced() {
        let registry = registry();
        let prod = TargetId::from("prod");
        registry
            .publish_schema(&prod, publish("type Query { ping: String me: String }", false))
            .await;

        let rejected = registry
            .publish_schema(&prod, publish("type Query { me: String }", false))
            .await;
        match &rejected {
            SchemaPublishResult::SchemaPublishError(e) => {
                assert_eq!(e.errors[0].message, "Field 'ping' was removed from object type 'Query'");
            }
            other => panic!("expected error, got {:?}", other),
        }
        assert_eq!(registry.versions(&prod).len(), 1);

        let forced = registry
            .publish_schema(&prod, publish("type Query { me: String }", true))
            .await;
        assert!(forced.is_success());
        let latest = registry.latest(&prod).unwrap();
        assert_eq!(latest.tag_string(), "v2.0.0");
        assert!(latest.forced);
    }

    #[tokio::test]
    async fn test_republishing_same_sdl_is_a_no_op() {
        let registry = registry();
        let prod = TargetId::from("prod");
        let sdl = "type Query { ping: String }";

        registry.publish_schema(&prod, publish(sdl, false)).await;
        let again = registry.publish_schema(&prod, publish(sdl, false)).await;
        match again {
            SchemaPublishResult::SchemaPublishSuccess(s) => {
                assert_eq!(s.message.as_deref(), Some("No changes. Skipping."));
                assert_eq!(s.version, "1.0.0");
            }
            other => panic!("expected success, got {:?}", other),
        }
        assert_eq!(registry.versions(&prod).len(), 1);
    }

    #[tokio::test]
    async fn test_get_version() {
        let registry = registry();
        let prod = TargetId::from("prod");
        registry
            .publish_schema(&prod, publish("type Query { a: Int }", false))
            .await;
        registry
            .publish_schema(&prod, publish("type Query { a: Int b: Int }", false))
            .await;

        assert_eq!(registry.get_version(&prod, "v1.1.0").unwrap().commit, "abc123");
        assert!(matches!(
            registry.get_version(&prod, "3.0.0"),
            Err(RegistryError::NotFound(_))
        ));
        assert!(registry.get_version(&prod, "nope").is_err());
    }

    #[test]
    fn test_check_result_wire_format() {
        let result = SchemaCheckResult::invalid(vec!["boom".to_string()]);
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["__typename"], "SchemaCheckError");
        assert_eq!(json["isComposable"], false);
        assert_eq!(json["errors"][0]["message"], "boom");
    }
}
