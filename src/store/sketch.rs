//! Mergeable duration sketch
//!
//! Log-bucketed histogram: a value `v` lands in bucket `ceil(log_γ v)`, so
//! any reported quantile is within ~1% of a true sample. Sketches merge by
//! adding bucket counts, which keeps rollup merges associative and
//! commutative. Exact min/max are tracked and quantiles are clamped into
//! them, so a single-valued distribution reports its exact value.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

const GAMMA: f64 = 1.02;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DurationSketch {
    buckets: BTreeMap<i32, u64>,
    zeros: u64,
    count: u64,
    min: u64,
    max: u64,
}

/// Quantiles of a duration distribution, in nanoseconds
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DurationQuantiles {
    pub p75: u64,
    pub p90: u64,
    pub p95: u64,
    pub p99: u64,
}

impl DurationSketch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn min(&self) -> Option<u64> {
        (self.count > 0).then_some(self.min)
    }

    pub fn max(&self) -> Option<u64> {
        (self.count > 0).then_some(self.max)
    }

    pub fn insert(&mut self, nanos: u64) {
        if self.count == 0 {
            self.min = nanos;
            self.max = nanos;
        } else {
            self.min = self.min.min(nanos);
            self.max = self.max.max(nanos);
        }
        self.count += 1;

        if nanos == 0 {
            self.zeros += 1;
        } else {
            *self.buckets.entry(bucket_of(nanos)).or_insert(0) += 1;
        }
    }

    pub fn merge(&mut self, other: &DurationSketch) {
        if other.count == 0 {
            return;
        }
        if self.count == 0 {
            self.min = other.min;
            self.max = other.max;
        } else {
            self.min = self.min.min(other.min);
            self.max = self.max.max(other.max);
        }
        self.count += other.count;
        self.zeros += other.zeros;
        for (bucket, n) in &other.buckets {
            *self.buckets.entry(*bucket).or_insert(0) += n;
        }
    }

    /// Approximate `q`-quantile (`0.0..=1.0`); `None` for an empty sketch
    pub fn quantile(&self, q: f64) -> Option<u64> {
        if self.count == 0 {
            return None;
        }
        let q = q.clamp(0.0, 1.0);
        let rank = (q * (self.count - 1) as f64).floor() as u64;

        if rank == 0 {
            return Some(self.min);
        }
        if rank >= self.count - 1 {
            return Some(self.max);
        }
        if rank < self.zeros {
            return Some(self.min);
        }
        let mut seen = self.zeros;
        for (bucket, n) in &self.buckets {
            seen += n;
            if rank < seen {
                let estimate = bucket_value(*bucket).round() as u64;
                return Some(estimate.clamp(self.min, self.max));
            }
        }
        Some(self.max)
    }

    pub fn quantiles(&self) -> DurationQuantiles {
        DurationQuantiles {
            p75: self.quantile(0.75).unwrap_or(0),
            p90: self.quantile(0.90).unwrap_or(0),
            p95: self.quantile(0.95).unwrap_or(0),
            p99: self.quantile(0.99).unwrap_or(0),
        }
    }
}

fn bucket_of(nanos: u64) -> i32 {
    ((nanos as f64).ln() / GAMMA.ln()).ceil() as i32
}

/// Midpoint of bucket `(γ^(i-1), γ^i]` with equal relative error to both ends
fn bucket_value(bucket: i32) -> f64 {
    2.0 * GAMMA.powi(bucket) / (GAMMA + 1.0)
}
