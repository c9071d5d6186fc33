//! In-memory usage store
//!
//! Each table is its own lock, held only for the duration of one map update,
//! so concurrent workers never serialize on a store-wide lock. Record upserts
//! are insert-if-absent and rollup merges are additive, so the order in
//! which workers apply batches does not change the result.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Duration, DurationRound, NaiveDate, Utc};
use parking_lot::RwLock;
use tracing::debug;
use uuid::Uuid;

use super::{
    exceeds_threshold, percentage, CoordinateUsage, DurationSketch, FieldUsageQuery, OperationStats, Period,
    PurgeReport, UsageReader, UsageWriter,
};
use crate::error::{RegistryError, Result};
use crate::fingerprint::OperationHash;
use crate::usage::{ClientInfo, OperationRecord, TargetId, UsageEvent};

pub const DEFAULT_ROLLUP_RETENTION_DAYS: i64 = 365;

type OperationKey = (TargetId, OperationHash);

/// Count, ok count and duration distribution of one bucket
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OperationRollup {
    pub total: u64,
    pub total_ok: u64,
    pub durations: DurationSketch,
}

impl OperationRollup {
    fn add(&mut self, event: &UsageEvent) {
        self.total += 1;
        if event.ok {
            self.total_ok += 1;
        }
        self.durations.insert(event.duration_nanos);
    }

    fn merge(&mut self, other: &OperationRollup) {
        self.total += other.total;
        self.total_ok += other.total_ok;
        self.durations.merge(&other.durations);
    }
}

pub struct MemoryUsageStore {
    records: RwLock<HashMap<OperationKey, OperationRecord>>,
    events: RwLock<HashMap<Uuid, UsageEvent>>,
    hourly: RwLock<HashMap<(TargetId, OperationHash, DateTime<Utc>), OperationRollup>>,
    daily: RwLock<HashMap<(TargetId, OperationHash, NaiveDate), OperationRollup>>,
    coordinates_daily: RwLock<HashMap<(TargetId, OperationHash, String, NaiveDate), u64>>,
    clients_daily: RwLock<HashMap<(TargetId, OperationHash, ClientInfo, NaiveDate), u64>>,
    rollup_retention: Duration,
}

impl Default for MemoryUsageStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryUsageStore {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            events: RwLock::new(HashMap::new()),
            hourly: RwLock::new(HashMap::new()),
            daily: RwLock::new(HashMap::new()),
            coordinates_daily: RwLock::new(HashMap::new()),
            clients_daily: RwLock::new(HashMap::new()),
            rollup_retention: Duration::days(DEFAULT_ROLLUP_RETENTION_DAYS),
        }
    }

    pub fn with_rollup_retention_days(mut self, days: i64) -> Self {
        self.rollup_retention = Duration::days(days.max(1));
        self
    }

    pub fn event_count(&self) -> usize {
        self.events.read().len()
    }

    /// Number of (target, hash, coordinate, day) rows
    pub fn coordinate_row_count(&self, target: &TargetId) -> usize {
        self.coordinates_daily
            .read()
            .keys()
            .filter(|(t, ..)| t == target)
            .count()
    }

    /// Total executions recorded for `target` across all days
    pub fn operation_total(&self, target: &TargetId) -> u64 {
        self.daily
            .read()
            .iter()
            .filter(|((t, ..), _)| t == target)
            .map(|(_, rollup)| rollup.total)
            .sum()
    }

    /// Hourly rollup of one operation
    pub fn hourly_rollup(
        &self,
        target: &TargetId,
        hash: &OperationHash,
        hour: DateTime<Utc>,
    ) -> Option<OperationRollup> {
        let hour = truncate_to_hour(hour);
        self.hourly
            .read()
            .get(&(target.clone(), hash.clone(), hour))
            .cloned()
    }

    /// Executions per client for `target` across all days
    pub fn client_totals(&self, target: &TargetId) -> BTreeMap<ClientInfo, u64> {
        let mut totals = BTreeMap::new();
        for ((t, _, client, _), n) in self.clients_daily.read().iter() {
            if t == target {
                *totals.entry(client.clone()).or_insert(0) += n;
            }
        }
        totals
    }

    fn merge_rollups(&self, event: &UsageEvent, coordinates: &[String]) {
        let day = event.timestamp.date_naive();
        let hour = truncate_to_hour(event.timestamp);

        self.hourly
            .write()
            .entry((event.target.clone(), event.hash.clone(), hour))
            .or_default()
            .add(event);

        self.daily
            .write()
            .entry((event.target.clone(), event.hash.clone(), day))
            .or_default()
            .add(event);

        {
            let mut coordinates_daily = self.coordinates_daily.write();
            for coordinate in coordinates {
                *coordinates_daily
                    .entry((event.target.clone(), event.hash.clone(), coordinate.clone(), day))
                    .or_insert(0) += 1;
            }
        }

        *self
            .clients_daily
            .write()
            .entry((event.target.clone(), event.hash.clone(), event.client.clone(), day))
            .or_insert(0) += 1;
    }

    /// Executions per (target, hash, day) in scope, excluded clients removed
    fn included_totals(
        &self,
        targets: &HashSet<&TargetId>,
        period: &Period,
        excluded: &HashSet<&str>,
    ) -> HashMap<(TargetId, OperationHash, NaiveDate), u64> {
        let mut totals = HashMap::new();
        for ((target, hash, client, day), n) in self.clients_daily.read().iter() {
            if !targets.contains(target)
                || !period.contains(*day)
                || excluded.contains(client.name.as_str())
            {
                continue;
            }
            *totals
                .entry((target.clone(), hash.clone(), *day))
                .or_insert(0) += n;
        }
        totals
    }
}

fn truncate_to_hour(at: DateTime<Utc>) -> DateTime<Utc> {
    at.duration_trunc(Duration::hours(1)).unwrap_or(at)
}

#[async_trait]
impl UsageWriter for MemoryUsageStore {
    async fn insert_operations(&self, records: &[OperationRecord]) -> Result<usize> {
        let mut stored = self.records.write();
        let mut inserted = 0;
        for record in records {
            let key = (record.target.clone(), record.hash.clone());
            if !stored.contains_key(&key) {
                stored.insert(key, record.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn insert_events(&self, events: &[UsageEvent]) -> Result<usize> {
        let mut applied = 0;
        for event in events {
            let coordinates = self
                .records
                .read()
                .get(&(event.target.clone(), event.hash.clone()))
                .map(|r| r.coordinates.clone())
                .ok_or_else(|| {
                    RegistryError::Store(format!(
                        "no operation record for {} in target {}",
                        event.hash, event.target
                    ))
                })?;

            let fresh = {
                let mut seen = self.events.write();
                if seen.contains_key(&event.id) {
                    false
                } else {
                    seen.insert(event.id, event.clone());
                    true
                }
            };
            if !fresh {
                debug!(event = %event.id, "skipping already written usage event");
                continue;
            }

            self.merge_rollups(event, &coordinates);
            applied += 1;
        }
        Ok(applied)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<PurgeReport> {
        let mut report = PurgeReport::default();

        {
            let mut events = self.events.write();
            let before = events.len();
            events.retain(|_, e| e.expires_at > now);
            report.events = before - events.len();
        }

        let cutoff = now - self.rollup_retention;
        let cutoff_day = cutoff.date_naive();
        {
            let mut hourly = self.hourly.write();
            let before = hourly.len();
            hourly.retain(|(_, _, hour), _| *hour >= cutoff);
            report.rollups += before - hourly.len();
        }
        {
            let mut daily = self.daily.write();
            let before = daily.len();
            daily.retain(|(_, _, day), _| *day >= cutoff_day);
            report.rollups += before - daily.len();
        }
        {
            let mut coordinates = self.coordinates_daily.write();
            let before = coordinates.len();
            coordinates.retain(|(_, _, _, day), _| *day >= cutoff_day);
            report.rollups += before - coordinates.len();
        }
        {
            let mut clients = self.clients_daily.write();
            let before = clients.len();
            clients.retain(|(_, _, _, day), _| *day >= cutoff_day);
            report.rollups += before - clients.len();
        }

        let live: HashSet<OperationKey> = self
            .daily
            .read()
            .keys()
            .map(|(t, h, _)| (t.clone(), h.clone()))
            .collect();
        {
            let mut records = self.records.write();
            let before = records.len();
            records.retain(|key, _| live.contains(key));
            report.records = before - records.len();
        }

        debug!(
            events = report.events,
            rollups = report.rollups,
            records = report.records,
            "purged expired usage"
        );
        Ok(report)
    }
}

#[async_trait]
impl UsageReader for MemoryUsageStore {
    async fn read_field_usage(&self, query: &FieldUsageQuery) -> Result<Vec<CoordinateUsage>> {
        let targets: HashSet<&TargetId> = query.targets.iter().collect();
        let excluded: HashSet<&str> = query.excluded_clients.iter().map(String::as_str).collect();
        let wanted: BTreeSet<&str> = query.coordinates.iter().map(String::as_str).collect();

        let totals = self.included_totals(&targets, &query.period, &excluded);
        let denominator: u64 = totals.values().sum();

        let mut numerators: HashMap<&str, u64> = HashMap::new();
        for ((target, hash, coordinate, day), _) in self.coordinates_daily.read().iter() {
            let Some(&coordinate) = wanted.get(coordinate.as_str()) else {
                continue;
            };
            if let Some(n) = totals.get(&(target.clone(), hash.clone(), *day)) {
                *numerators.entry(coordinate).or_insert(0) += n;
            }
        }

        Ok(wanted
            .into_iter()
            .map(|coordinate| {
                let total = numerators.get(coordinate).copied().unwrap_or(0);
                CoordinateUsage {
                    coordinate: coordinate.to_string(),
                    total,
                    percentage: percentage(total, denominator),
                    used: exceeds_threshold(total, denominator, query.threshold),
                }
            })
            .collect())
    }

    async fn read_operations_stats(
        &self,
        targets: &[TargetId],
        period: &Period,
    ) -> Result<Vec<OperationStats>> {
        let targets: HashSet<&TargetId> = targets.iter().collect();

        let mut by_hash: HashMap<OperationHash, (TargetId, OperationRollup)> = HashMap::new();
        for ((target, hash, day), rollup) in self.daily.read().iter() {
            if !targets.contains(target) || !period.contains(*day) {
                continue;
            }
            by_hash
                .entry(hash.clone())
                .or_insert_with(|| (target.clone(), OperationRollup::default()))
                .1
                .merge(rollup);
        }

        let grand_total: u64 = by_hash.values().map(|(_, r)| r.total).sum();
        let records = self.records.read();

        let mut stats: Vec<OperationStats> = by_hash
            .into_iter()
            .filter_map(|(hash, (target, rollup))| {
                let record = records.get(&(target, hash.clone()))?;
                Some(OperationStats {
                    hash,
                    name: record.name.clone(),
                    kind: record.kind,
                    body: record.body.clone(),
                    count: rollup.total,
                    count_ok: rollup.total_ok,
                    percentage: percentage(rollup.total, grand_total),
                    duration: rollup.durations.quantiles(),
                })
            })
            .collect();

        stats.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.hash.cmp(&b.hash)));
        Ok(stats)
    }

    async fn count_operation_records(&self, target: &TargetId) -> Result<usize> {
        Ok(self
            .records
            .read()
            .keys()
            .filter(|(t, _)| t == target)
            .count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usage::OperationKind;
    use chrono::TimeZone;

    fn record(target: &str, hash: &str, coordinates: &[&str]) -> OperationRecord {
        OperationRecord {
            target: TargetId::from(target),
            hash: OperationHash::from(hash),
            name: Some(hash.to_string()),
            kind: OperationKind::Query,
            body: format!("query {}{{ping}}", hash),
            coordinates: coordinates.iter().map(|c| c.to_string()).collect(),
        }
    }

    fn event(target: &str, hash: &str, client: &str, at: DateTime<Utc>) -> UsageEvent {
        UsageEvent {
            id: Uuid::new_v4(),
            target: TargetId::from(target),
            hash: OperationHash::from(hash),
            timestamp: at,
            expires_at: at + Duration::days(90),
            ok: true,
            duration_nanos: 1_000,
            errors_total: 0,
            client: ClientInfo::new(client, "1.0"),
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 10, 30, 0).unwrap()
    }

    fn query(targets: &[&str], excluded: &[&str], coordinates: &[&str], threshold: f64) -> FieldUsageQuery {
        FieldUsageQuery {
            targets: targets.iter().map(|t| TargetId::from(*t)).collect(),
            period: Period::last_days(30, now()),
            excluded_clients: excluded.iter().map(|c| c.to_string()).collect(),
            coordinates: coordinates.iter().map(|c| c.to_string()).collect(),
            threshold,
        }
    }

    #[tokio::test]
    async fn test_insert_operations_is_insert_if_absent() {
        let store = MemoryUsageStore::new();
        let first = record("prod", "a", &["Query", "Query.ping"]);
        assert_eq!(store.insert_operations(&[first.clone()]).await.unwrap(), 1);

        let mut changed = first.clone();
        changed.body = "query other{ping}".to_string();
        assert_eq!(store.insert_operations(&[changed]).await.unwrap(), 0);
        assert_eq!(store.count_operation_records(&TargetId::from("prod")).await.unwrap(), 1);
        assert_eq!(store.records.read().values().next().unwrap().body, first.body);
    }

    #[tokio::test]
    async fn test_duplicate_event_ids_count_once() {
        let store = MemoryUsageStore::new();
        store.insert_operations(&[record("prod", "a", &["Query"])]).await.unwrap();
        let e = event("prod", "a", "app", now());

        assert_eq!(store.insert_events(&[e.clone()]).await.unwrap(), 1);
        assert_eq!(store.insert_events(&[e.clone(), e]).await.unwrap(), 0);
        assert_eq!(store.operation_total(&TargetId::from("prod")), 1);
        assert_eq!(store.coordinate_row_count(&TargetId::from("prod")), 1);
    }

    #[tokio::test]
    async fn test_event_without_record_fails() {
        let store = MemoryUsageStore::new();
        let err = store
            .insert_events(&[event("prod", "missing", "app", now())])
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
        assert_eq!(store.event_count(), 0);
    }

    #[tokio::test]
    async fn test_field_usage_threshold_is_strict() {
        let store = MemoryUsageStore::new();
        store
            .insert_operations(&[
                record("prod", "a", &["Query", "Query.a"]),
                record("prod", "b", &["Query", "Query.b"]),
            ])
            .await
            .unwrap();
        store
            .insert_events(&[
                event("prod", "a", "app", now()),
                event("prod", "b", "app", now()),
            ])
            .await
            .unwrap();

        let usage = store
            .read_field_usage(&query(&["prod"], &[], &["Query.a", "Query.b", "Query.c"], 50.0))
            .await
            .unwrap();
        let a = usage.iter().find(|u| u.coordinate == "Query.a").unwrap();
        assert_eq!(a.total, 1);
        assert_eq!(a.percentage, 50.0);
        assert!(!a.used);

        let c = usage.iter().find(|u| u.coordinate == "Query.c").unwrap();
        assert_eq!(c.total, 0);
        assert!(!c.used);

        let usage = store
            .read_field_usage(&query(&["prod"], &[], &["Query.a"], 49.9))
            .await
            .unwrap();
        assert!(usage[0].used);
    }

    #[tokio::test]
    async fn test_field_usage_at_inexact_ratio_threshold() {
        let store = MemoryUsageStore::new();
        store
            .insert_operations(&[
                record("prod", "a", &["Query", "Query.ping"]),
                record("prod", "b", &["Query", "Query.other"]),
            ])
            .await
            .unwrap();
        let mut events: Vec<UsageEvent> = (0..7).map(|_| event("prod", "a", "app", now())).collect();
        events.extend((0..43).map(|_| event("prod", "b", "app", now())));
        store.insert_events(&events).await.unwrap();

        let usage = store
            .read_field_usage(&query(&["prod"], &[], &["Query.ping"], 14.0))
            .await
            .unwrap();
        assert_eq!(usage[0].total, 7);
        assert_eq!(usage[0].percentage, 14.0);
        assert!(!usage[0].used);

        let usage = store
            .read_field_usage(&query(&["prod"], &[], &["Query.ping"], 13.9))
            .await
            .unwrap();
        assert!(usage[0].used);
    }

    #[tokio::test]
    async fn test_excluded_clients_leave_both_sides_of_the_ratio() {
        let store = MemoryUsageStore::new();
        store
            .insert_operations(&[
                record("prod", "a", &["Query.a"]),
                record("prod", "b", &["Query.b"]),
            ])
            .await
            .unwrap();
        store
            .insert_events(&[
                event("prod", "a", "app", now()),
                event("prod", "a", "app", now()),
                event("prod", "a", "web", now()),
                event("prod", "b", "web", now()),
            ])
            .await
            .unwrap();

        let usage = store
            .read_field_usage(&query(&["prod"], &["app"], &["Query.a", "Query.b"], 0.0))
            .await
            .unwrap();
        assert_eq!(usage[0].total, 1);
        assert_eq!(usage[0].percentage, 50.0);
        assert_eq!(usage[1].total, 1);
        assert_eq!(usage[1].percentage, 50.0);
    }

    #[tokio::test]
    async fn test_fan_out_pools_targets_and_zero_denominator() {
        let store = MemoryUsageStore::new();
        store
            .insert_operations(&[
                record("a", "ping", &["Query.ping"]),
                record("b", "me", &["Query.me"]),
            ])
            .await
            .unwrap();
        store
            .insert_events(&[event("a", "ping", "", now()), event("b", "me", "", now())])
            .await
            .unwrap();

        let usage = store
            .read_field_usage(&query(&["a", "b"], &[], &["Query.ping"], 0.0))
            .await
            .unwrap();
        assert_eq!(usage[0].percentage, 50.0);

        let usage = store
            .read_field_usage(&query(&["c"], &[], &["Query.ping"], 0.0))
            .await
            .unwrap();
        assert_eq!(usage[0].percentage, 0.0);
        assert!(!usage[0].used);
    }

    #[tokio::test]
    async fn test_events_outside_period_are_ignored() {
        let store = MemoryUsageStore::new();
        store.insert_operations(&[record("prod", "a", &["Query.a"])]).await.unwrap();
        store
            .insert_events(&[event("prod", "a", "app", now() - Duration::days(45))])
            .await
            .unwrap();

        let usage = store
            .read_field_usage(&query(&["prod"], &[], &["Query.a"], 0.0))
            .await
            .unwrap();
        assert_eq!(usage[0].total, 0);
    }

    #[tokio::test]
    async fn test_operation_stats_and_hourly_rollup() {
        let store = MemoryUsageStore::new();
        store
            .insert_operations(&[record("prod", "a", &["Query.a"]), record("prod", "b", &["Query.b"])])
            .await
            .unwrap();

        let mut failed = event("prod", "a", "app", now());
        failed.ok = false;
        store
            .insert_events(&[
                event("prod", "a", "app", now()),
                event("prod", "a", "app", now()),
                failed,
                event("prod", "b", "app", now()),
            ])
            .await
            .unwrap();

        let stats = store
            .read_operations_stats(&[TargetId::from("prod")], &Period::last_days(7, now()))
            .await
            .unwrap();
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].hash, OperationHash::from("a"));
        assert_eq!(stats[0].count, 3);
        assert_eq!(stats[0].count_ok, 2);
        assert_eq!(stats[0].percentage, 75.0);
        assert_eq!(stats[0].duration.p99, 1_000);

        let hourly = store
            .hourly_rollup(&TargetId::from("prod"), &OperationHash::from("a"), now())
            .unwrap();
        assert_eq!(hourly.total, 3);
        assert_eq!(hourly.total_ok, 2);
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let store = MemoryUsageStore::new().with_rollup_retention_days(30);
        store
            .insert_operations(&[record("prod", "old", &["Query.a"]), record("prod", "new", &["Query.a"])])
            .await
            .unwrap();

        let mut old = event("prod", "old", "app", now() - Duration::days(60));
        old.expires_at = now() - Duration::days(1);
        store
            .insert_events(&[old, event("prod", "new", "app", now())])
            .await
            .unwrap();

        let report = store.purge_expired(now()).await.unwrap();
        assert_eq!(report.events, 1);
        assert_eq!(report.rollups, 4);
        assert_eq!(report.records, 1);
        assert_eq!(store.count_operation_records(&TargetId::from("prod")).await.unwrap(), 1);
        assert_eq!(store.event_count(), 1);
    }
}
