//! Usage aggregation store
//!
//! The analytical store behind two traits: [`UsageWriter`] for the ingestion
//! consumer and [`UsageReader`] for the inspector and stats queries.
//! [`MemoryUsageStore`] implements both in process.
//!
//! Field usage is a ratio over a window of days:
//!
//! ```text
//! percentage(c) = events touching c by non-excluded clients
//!               / all events by non-excluded clients * 100
//! used(c)       = percentage(c) > threshold
//! ```

pub mod memory;
pub mod sketch;

pub use memory::MemoryUsageStore;
pub use sketch::{DurationQuantiles, DurationSketch};

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::fingerprint::OperationHash;
use crate::usage::{OperationKind, OperationRecord, TargetId, UsageEvent};

/// Inclusive window of whole UTC days
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Period {
    pub from: NaiveDate,
    pub to: NaiveDate,
}

impl Period {
    /// The `days` days ending with the day of `now`, saturating at the
    /// earliest representable date
    pub fn last_days(days: u32, now: DateTime<Utc>) -> Self {
        let to = now.date_naive();
        let from = to
            .checked_sub_signed(Duration::days(i64::from(days.max(1)) - 1))
            .unwrap_or(NaiveDate::MIN);
        Self { from, to }
    }

    pub fn contains(&self, day: NaiveDate) -> bool {
        day >= self.from && day <= self.to
    }
}

/// Field usage read for one validation run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldUsageQuery {
    /// Targets whose usage is pooled
    pub targets: Vec<TargetId>,
    pub period: Period,
    /// Client names whose events are ignored (exact match)
    pub excluded_clients: Vec<String>,
    pub coordinates: Vec<String>,
    /// Percentage a coordinate must exceed to count as used
    pub threshold: f64,
}

/// Usage of one coordinate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinateUsage {
    pub coordinate: String,
    pub total: u64,
    pub percentage: f64,
    pub used: bool,
}

/// Aggregated stats of one operation shape
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationStats {
    pub hash: OperationHash,
    pub name: Option<String>,
    pub kind: OperationKind,
    pub body: String,
    pub count: u64,
    pub count_ok: u64,
    /// Share of all operations in the window
    pub percentage: f64,
    pub duration: DurationQuantiles,
}

/// What a purge removed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurgeReport {
    pub events: usize,
    pub rollups: usize,
    pub records: usize,
}

/// Ingest side of the store
#[async_trait]
pub trait UsageWriter: Send + Sync {
    /// Insert records that are not yet stored for their (target, hash);
    /// returns how many were new
    async fn insert_operations(&self, records: &[OperationRecord]) -> Result<usize>;

    /// Append events and merge them into the rollups; events whose id was
    /// already written are skipped. Returns how many were applied
    async fn insert_events(&self, events: &[UsageEvent]) -> Result<usize>;

    /// Drop expired events and rollups past retention
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<PurgeReport>;
}

/// Read side of the store
#[async_trait]
pub trait UsageReader: Send + Sync {
    async fn read_field_usage(&self, query: &FieldUsageQuery) -> Result<Vec<CoordinateUsage>>;

    /// Per-operation stats, most used first
    async fn read_operations_stats(
        &self,
        targets: &[TargetId],
        period: &Period,
    ) -> Result<Vec<OperationStats>>;

    async fn count_operation_records(&self, target: &TargetId) -> Result<usize>;
}

/// `part / whole` as a percentage; zero when `whole` is zero
pub fn percentage(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 * 100.0 / whole as f64
    }
}

/// Whether `part / whole` is strictly above `threshold` percent
///
/// Compares `part * 100` against `threshold * whole` so a ratio exactly at
/// the threshold never rounds above it.
pub fn exceeds_threshold(part: u64, whole: u64, threshold: f64) -> bool {
    if whole == 0 {
        0.0 > threshold
    } else {
        part as f64 * 100.0 > threshold * whole as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_period_last_days() {
        let now = Utc.with_ymd_and_hms(2024, 3, 10, 15, 0, 0).unwrap();
        let period = Period::last_days(30, now);
        assert_eq!(period.to, NaiveDate::from_ymd_opt(2024, 3, 10).unwrap());
        assert_eq!(period.from, NaiveDate::from_ymd_opt(2024, 2, 10).unwrap());
        assert!(period.contains(period.from));
        assert!(!period.contains(NaiveDate::from_ymd_opt(2024, 2, 9).unwrap()));

        let today = Period::last_days(1, now);
        assert_eq!(today.from, today.to);
    }

    #[test]
    fn test_period_last_days_saturates() {
        let now = Utc.with_ymd_and_hms(2024, 3, 10, 15, 0, 0).unwrap();
        let period = Period::last_days(u32::MAX, now);
        assert_eq!(period.from, NaiveDate::MIN);
        assert!(period.contains(NaiveDate::from_ymd_opt(1970, 1, 1).unwrap()));
    }

    #[test]
    fn test_percentage_zero_denominator() {
        assert_eq!(percentage(5, 0), 0.0);
        assert_eq!(percentage(1, 4), 25.0);
    }

    #[test]
    fn test_ratio_at_threshold_is_not_above_it() {
        for (part, whole, threshold) in [(7, 50, 14.0), (11, 20, 55.0), (14, 25, 56.0), (1, 4, 25.0)] {
            assert_eq!(percentage(part, whole), threshold, "{}/{}", part, whole);
            assert!(!exceeds_threshold(part, whole, threshold), "{}/{}", part, whole);
            assert!(exceeds_threshold(part + 1, whole, threshold), "{}/{}", part + 1, whole);
        }
        assert!(!exceeds_threshold(0, 0, 0.0));
    }
}
