//! Usage-aware schema inspector
//!
//! Diffs two schemas, then asks the usage store whether the coordinates
//! behind usage-aware breaking changes are still used. Coordinates at or
//! below the target's threshold are downgraded to safe; used ones stay
//! breaking. Any doubt (no settings, disabled validation, a failing or slow
//! store) leaves every change breaking.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::diff::{self, Criticality, SchemaChange};
use crate::metrics;
use crate::schema::SchemaModel;
use crate::settings::{ResolvedValidation, SettingsResolver};
use crate::store::{CoordinateUsage, FieldUsageQuery, Period, UsageReader};
use crate::usage::TargetId;

pub const DEFAULT_USAGE_TIMEOUT_MS: u64 = 5000;

/// Classified changes between two schemas
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inspection {
    /// Sorted by criticality, then message
    pub changes: Vec<SchemaChange>,
    /// No breaking change remains
    pub valid: bool,
}

impl Inspection {
    fn new(mut changes: Vec<SchemaChange>) -> Self {
        changes.sort_by(|a, b| {
            a.criticality
                .cmp(&b.criticality)
                .then_with(|| a.message.cmp(&b.message))
        });
        let valid = !changes.iter().any(SchemaChange::is_breaking);
        Self { changes, valid }
    }

    pub fn breaking(&self) -> impl Iterator<Item = &SchemaChange> {
        self.changes.iter().filter(|c| c.is_breaking())
    }
}

#[derive(Clone)]
pub struct Inspector {
    reader: Arc<dyn UsageReader>,
    settings: SettingsResolver,
    usage_timeout: Duration,
}

impl Inspector {
    pub fn new(reader: Arc<dyn UsageReader>, settings: SettingsResolver) -> Self {
        Self {
            reader,
            settings,
            usage_timeout: Duration::from_millis(DEFAULT_USAGE_TIMEOUT_MS),
        }
    }

    pub fn with_usage_timeout(mut self, timeout: Duration) -> Self {
        self.usage_timeout = timeout;
        self
    }

    /// Diff `existing` against `incoming`; with a `target`, usage data of
    /// that target's validation settings may downgrade breaking changes
    pub async fn diff(
        &self,
        existing: &SchemaModel,
        incoming: &SchemaModel,
        target: Option<&TargetId>,
    ) -> Inspection {
        debug!("comparing schemas");
        let mut changes = diff::diff(existing, incoming);

        if let Some(target) = target {
            self.apply_usage(target, &mut changes).await;
        }

        Inspection::new(changes)
    }

    async fn apply_usage(&self, target: &TargetId, changes: &mut [SchemaChange]) {
        let coordinates: BTreeSet<String> = changes
            .iter()
            .filter(|c| c.is_usage_aware())
            .filter_map(SchemaChange::coordinate)
            .collect();
        if coordinates.is_empty() {
            return;
        }

        let lookup = async {
            let Some(settings) = self.settings.resolve(target).await else {
                debug!(target_id = %target, "no usage validation, marking all as used");
                return None;
            };
            let Some(usage) = self.read_usage(target, &settings, coordinates).await else {
                return None;
            };
            Some((settings, usage))
        };

        let (settings, usage) = match tokio::time::timeout(self.usage_timeout, lookup).await {
            Ok(Some(found)) => found,
            Ok(None) => return,
            Err(_) => {
                metrics::record_usage_lookup_timeout();
                warn!(
                    target_id = %target,
                    timeout_ms = self.usage_timeout.as_millis() as u64,
                    "usage lookup timed out, marking all as used"
                );
                return;
            }
        };

        for change in changes.iter_mut().filter(|c| c.is_usage_aware()) {
            let Some(coordinate) = change.coordinate() else {
                continue;
            };
            let (percentage, used) = usage
                .get(&coordinate)
                .map(|u| (u.percentage, u.used))
                .unwrap_or((0.0, false));
            if used {
                continue;
            }

            change.criticality = Criticality::Safe;
            change.reason = Some(format!(
                "'{}' was used by {:.2}% of operations in the last {} days, not above the {}% threshold",
                coordinate, percentage, settings.period_days, settings.percentage
            ));
        }
    }

    /// Usage of `coordinates`; `None` when the store can't be read
    async fn read_usage(
        &self,
        target: &TargetId,
        settings: &ResolvedValidation,
        coordinates: BTreeSet<String>,
    ) -> Option<HashMap<String, CoordinateUsage>> {
        let query = FieldUsageQuery {
            targets: settings.targets.clone(),
            period: Period::last_days(settings.period_days, Utc::now()),
            excluded_clients: settings.excluded_clients.clone(),
            coordinates: coordinates.into_iter().collect(),
            threshold: settings.percentage,
        };
        debug!(target_id = %target, fields = query.coordinates.len(), "checking usage");

        match self.reader.read_field_usage(&query).await {
            Ok(usage) => Some(
                usage
                    .into_iter()
                    .map(|u| (u.coordinate.clone(), u))
                    .collect(),
            ),
            Err(e) => {
                warn!(target_id = %target, error = %e, "failed to read usage, marking all as used");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{RegistryError, Result};
    use crate::settings::{MemorySettingsStore, SettingsStore, ValidationSettings};
    use crate::fingerprint::OperationHash;
    use crate::store::{MemoryUsageStore, OperationStats, UsageWriter};
    use crate::usage::{ClientInfo, OperationKind, OperationRecord, UsageEvent};
    use async_trait::async_trait;
    use uuid::Uuid;

    const BEFORE: &str = "type Query { ping: String me: String }";
    const AFTER: &str = "type Query { me: String }";

    struct SlowReader;

    #[async_trait]
    impl UsageReader for SlowReader {
        async fn read_field_usage(&self, _query: &FieldUsageQuery) -> Result<Vec<CoordinateUsage>> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(vec![])
        }

        async fn read_operations_stats(&self, _t: &[TargetId], _p: &Period) -> Result<Vec<OperationStats>> {
            Ok(vec![])
        }

        async fn count_operation_records(&self, _t: &TargetId) -> Result<usize> {
            Ok(0)
        }
    }

    struct FailingReader;

    #[async_trait]
    impl UsageReader for FailingReader {
        async fn read_field_usage(&self, _query: &FieldUsageQuery) -> Result<Vec<CoordinateUsage>> {
            Err(RegistryError::TransientStore("connection refused".into()))
        }

        async fn read_operations_stats(&self, _t: &[TargetId], _p: &Period) -> Result<Vec<OperationStats>> {
            Ok(vec![])
        }

        async fn count_operation_records(&self, _t: &TargetId) -> Result<usize> {
            Ok(0)
        }
    }

    struct HangingSettings;

    #[async_trait]
    impl SettingsStore for HangingSettings {
        async fn get(&self, _target: &TargetId) -> Result<Option<ValidationSettings>> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(None)
        }

        async fn put(&self, _target: &TargetId, _settings: ValidationSettings) -> Result<()> {
            Ok(())
        }
    }

    fn models() -> (SchemaModel, SchemaModel) {
        (
            SchemaModel::parse(BEFORE).unwrap(),
            SchemaModel::parse(AFTER).unwrap(),
        )
    }

    async fn enabled_settings() -> SettingsResolver {
        let settings = SettingsResolver::new(Arc::new(MemorySettingsStore::new()));
        settings
            .set_target_validation(&TargetId::from("prod"), true)
            .await
            .unwrap();
        settings
    }

    async fn store_with_ping_usage() -> Arc<MemoryUsageStore> {
        let store = Arc::new(MemoryUsageStore::new());
        let target = TargetId::from("prod");
        let hash = OperationHash::from("ping");
        store
            .insert_operations(&[OperationRecord {
                target: target.clone(),
                hash: hash.clone(),
                name: Some("ping".into()),
                kind: OperationKind::Query,
                body: "query ping{ping}".into(),
                coordinates: vec!["Query".into(), "Query.ping".into()],
            }])
            .await
            .unwrap();
        let now = Utc::now();
        store
            .insert_events(&[UsageEvent {
                id: Uuid::new_v4(),
                target,
                hash,
                timestamp: now,
                expires_at: now + chrono::Duration::days(90),
                ok: true,
                duration_nanos: 1,
                errors_total: 0,
                client: ClientInfo::default(),
            }])
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_without_target_changes_stay_static() {
        let inspector = Inspector::new(
            store_with_ping_usage().await,
            enabled_settings().await,
        );
        let (before, after) = models();

        let inspection = inspector.diff(&before, &after, None).await;
        assert!(!inspection.valid);
        assert_eq!(inspection.changes[0].criticality, Criticality::Breaking);
    }

    #[tokio::test]
    async fn test_used_field_stays_breaking() {
        let inspector = Inspector::new(store_with_ping_usage().await, enabled_settings().await);
        let (before, after) = models();

        let inspection = inspector
            .diff(&before, &after, Some(&TargetId::from("prod")))
            .await;
        assert!(!inspection.valid);
        assert_eq!(inspection.breaking().count(), 1);
    }

    #[tokio::test]
    async fn test_unused_field_is_downgraded() {
        let inspector = Inspector::new(store_with_ping_usage().await, enabled_settings().await);
        let before = SchemaModel::parse(BEFORE).unwrap();
        let after = SchemaModel::parse("type Query { ping: String }").unwrap();

        let inspection = inspector
            .diff(&before, &after, Some(&TargetId::from("prod")))
            .await;
        assert!(inspection.valid);
        assert_eq!(inspection.changes[0].criticality, Criticality::Safe);
        assert!(inspection.changes[0].reason.is_some());
    }

    #[tokio::test]
    async fn test_disabled_validation_keeps_breaking() {
        let settings = SettingsResolver::new(Arc::new(MemorySettingsStore::new()));
        let inspector = Inspector::new(Arc::new(MemoryUsageStore::new()), settings);
        let (before, after) = models();

        let inspection = inspector
            .diff(&before, &after, Some(&TargetId::from("prod")))
            .await;
        assert!(!inspection.valid);
    }

    #[tokio::test]
    async fn test_store_failure_keeps_breaking() {
        let inspector = Inspector::new(Arc::new(FailingReader), enabled_settings().await);
        let (before, after) = models();

        let inspection = inspector
            .diff(&before, &after, Some(&TargetId::from("prod")))
            .await;
        assert!(!inspection.valid);
    }

    #[tokio::test]
    async fn test_lookup_timeout_keeps_breaking() {
        let inspector = Inspector::new(Arc::new(SlowReader), enabled_settings().await)
            .with_usage_timeout(Duration::from_millis(50));
        let (before, after) = models();

        let inspection = inspector
            .diff(&before, &after, Some(&TargetId::from("prod")))
            .await;
        assert!(!inspection.valid);
        assert!(inspection.changes[0].reason.is_none());
    }

    #[tokio::test]
    async fn test_settings_lookup_shares_the_deadline() {
        let settings = SettingsResolver::new(Arc::new(HangingSettings));
        let inspector = Inspector::new(Arc::new(MemoryUsageStore::new()), settings)
            .with_usage_timeout(Duration::from_millis(50));
        let (before, after) = models();

        let inspection = tokio::time::timeout(
            Duration::from_secs(5),
            inspector.diff(&before, &after, Some(&TargetId::from("prod"))),
        )
        .await
        .unwrap();
        assert!(!inspection.valid);
        assert_eq!(inspection.changes[0].criticality, Criticality::Breaking);
    }

    #[test]
    fn test_sorted_by_criticality_then_message() {
        let before = SchemaModel::parse("type Query { a: Int b: Int } enum E { X }").unwrap();
        let after = SchemaModel::parse("type Query { c: Int } enum E { X Y }").unwrap();
        let inspection = Inspection::new(diff::diff(&before, &after));

        let order: Vec<Criticality> = inspection.changes.iter().map(|c| c.criticality).collect();
        assert_eq!(
            order,
            vec![
                Criticality::Breaking,
                Criticality::Breaking,
                Criticality::Dangerous,
                Criticality::Safe
            ]
        );
        assert!(inspection.changes[0].message < inspection.changes[1].message);
    }
}
