use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use super::sample::AggregateRecord;

/// Rank used for the `p90` column.
pub const P90: f64 = 0.9;
/// Rank used for the `p80` column.
pub const P80: f64 = 0.8;

/// Statistics over one non-empty group of values.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Summary {
    pub avg: f64,
    pub min: f64,
    pub max: f64,
    pub p90: f64,
    pub p80: f64,
    pub count: u32,
}

/// Nearest-rank percentile over ascending `sorted` values.
///
/// Picks `sorted[floor(n * p)]`: zero-based, no interpolation, no `- 1`
/// correction. For `n = 10, p = 0.9` that is index 9, the maximum. The index is
/// clamped only so that `p = 1.0` stays in bounds.
pub fn nearest_rank(sorted: &[f64], p: f64) -> Option<f64> {
    let last = sorted.len().checked_sub(1)?;
    let idx = (sorted.len() as f64 * p).floor() as usize;
    sorted.get(idx.min(last)).copied()
}

/// Sorts `values` in place and summarizes them. Returns `None` for an empty
/// slice.
///
/// Values must already be validated as finite.
pub fn summarize(values: &mut [f64]) -> Option<Summary> {
    if values.is_empty() {
        return None;
    }

    values.sort_unstable_by(f64::total_cmp);

    let n = values.len();
    let sum: f64 = values.iter().sum();

    Some(Summary {
        avg: sum / n as f64,
        min: values[0],
        max: values[n - 1],
        p90: nearest_rank(values, P90)?,
        p80: nearest_rank(values, P80)?,
        count: u32::try_from(n).unwrap_or(u32::MAX),
    })
}

/// Identity of one aggregation group. Field order gives the output order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
struct GroupKey {
    bin_end: DateTime<Utc>,
    server_id: String,
    metric_type: String,
}

/// Collects classified sample values per `(server_id, metric_type, bin_end)`.
///
/// Groups are created on first use, so every group holds at least one value.
#[derive(Debug, Default)]
pub struct StatAggregator {
    groups: BTreeMap<GroupKey, Vec<f64>>,
}

impl StatAggregator {
    /// Creates an empty aggregator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one validated value for the group it belongs to.
    pub fn record(
        &mut self,
        server_id: &str,
        metric_type: &str,
        bin_end: DateTime<Utc>,
        value: f64,
    ) {
        let key = GroupKey {
            bin_end,
            server_id: server_id.to_string(),
            metric_type: metric_type.to_string(),
        };
        self.groups.entry(key).or_default().push(value);
    }

    /// Number of distinct groups seen so far.
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    /// Returns true if no value has been recorded.
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Consumes the aggregator and emits one record per group, ordered by
    /// `(bin_end, server_id, metric_type)`.
    pub fn finish(self) -> Vec<AggregateRecord> {
        let mut records = Vec::with_capacity(self.groups.len());

        for (key, mut values) in self.groups {
            let Some(summary) = summarize(&mut values) else {
                continue;
            };

            records.push(AggregateRecord {
                server_id: key.server_id,
                metric_type: key.metric_type,
                bin_end: key.bin_end,
                avg: summary.avg,
                min: summary.min,
                max: summary.max,
                p90: summary.p90,
                p80: summary.p80,
                sample_count: summary.count,
            });
        }

        records
    }
}
