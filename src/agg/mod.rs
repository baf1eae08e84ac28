//! Pure binning and aggregation of raw samples.
//!
//! Nothing in here touches persisted state. The run coordinator feeds fetched
//! samples through [`aggregate`] and persists what comes out.

pub mod bins;
pub mod sample;
pub mod stats;

use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::InvalidSamplePolicy;

pub use bins::{aligned_bin_start, find_bin, generate_bins, round_down, Bin, BinError, BinIndex};
pub use sample::{AggregateRecord, RawSample, SampleError};
pub use stats::{nearest_rank, summarize, StatAggregator, Summary};

/// Errors that abort an aggregation pass.
#[derive(Error, Debug)]
pub enum AggregateError {
    #[error("building bins: {0}")]
    Bins(#[from] BinError),

    #[error("invalid sample for {server_id}/{metric_type} at {ts}: {source}")]
    InvalidSample {
        server_id: String,
        metric_type: String,
        ts: DateTime<Utc>,
        #[source]
        source: SampleError,
    },
}

/// Result of one aggregation pass.
#[derive(Debug, Default)]
pub struct Aggregation {
    /// One record per non-empty group.
    pub records: Vec<AggregateRecord>,
    /// Samples that contributed to a record.
    pub processed: usize,
    /// Samples rejected by validation under the skip policy.
    pub skipped_invalid: usize,
    /// Samples outside the bin window.
    pub dropped_out_of_window: usize,
    /// Latest timestamp among samples that were aggregated or deliberately
    /// skipped. The watermark may advance to this point.
    pub high_water: Option<DateTime<Utc>>,
    /// Number of bins covering the window.
    pub bin_count: usize,
}

/// Bins, validates, and summarizes `samples` over the window `(since, until]`.
///
/// Samples outside the window are dropped and counted. Invalid samples are
/// skipped or abort the pass depending on `policy`.
pub fn aggregate(
    samples: &[RawSample],
    since: DateTime<Utc>,
    until: DateTime<Utc>,
    interval: Duration,
    policy: InvalidSamplePolicy,
) -> Result<Aggregation, AggregateError> {
    let bins = generate_bins(since, until, interval)?;
    let index = BinIndex::new(&bins);

    let mut aggregator = StatAggregator::new();
    let mut out = Aggregation {
        bin_count: bins.len(),
        ..Default::default()
    };

    for sample in samples {
        let slot = match &index {
            Some(index) => index.find(sample.ts),
            None => find_bin(sample.ts, &bins),
        };

        let Some(slot) = slot else {
            out.dropped_out_of_window += 1;
            continue;
        };

        if let Err(e) = sample.validate() {
            match policy {
                InvalidSamplePolicy::Fail => {
                    return Err(AggregateError::InvalidSample {
                        server_id: sample.server_id.clone(),
                        metric_type: sample.metric_type.clone(),
                        ts: sample.ts,
                        source: e,
                    });
                }
                InvalidSamplePolicy::Skip => {
                    warn!(
                        server_id = %sample.server_id,
                        metric_type = %sample.metric_type,
                        ts = %sample.ts,
                        error = %e,
                        "skipping invalid sample",
                    );
                    out.skipped_invalid += 1;
                    out.high_water = out.high_water.max(Some(sample.ts));
                    continue;
                }
            }
        }

        aggregator.record(
            &sample.server_id,
            &sample.metric_type,
            bins[slot].end,
            sample.value,
        );
        out.processed += 1;
        out.high_water = out.high_water.max(Some(sample.ts));
    }

    if out.dropped_out_of_window > 0 {
        debug!(
            dropped = out.dropped_out_of_window,
            "samples outside the bin window were dropped",
        );
    }

    out.records = aggregator.finish();

    Ok(out)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, h, m, s).unwrap()
    }

    const FIVE_MIN: Duration = Duration::from_secs(300);

    #[test]
    fn test_aggregate_assigns_samples_to_bin_end() {
        let samples = vec![
            RawSample::new("srv-1", "cpu", at(0, 7, 30), 10.0),
            RawSample::new("srv-1", "cpu", at(0, 10, 0), 20.0),
            RawSample::new("srv-1", "cpu", at(0, 10, 1), 30.0),
        ];

        let out = aggregate(
            &samples,
            at(0, 0, 0),
            at(0, 15, 0),
            FIVE_MIN,
            InvalidSamplePolicy::Skip,
        )
        .expect("aggregation succeeds");

        assert_eq!(out.bin_count, 3);
        assert_eq!(out.processed, 3);
        assert_eq!(out.records.len(), 2);
        assert_eq!(out.records[0].bin_end, at(0, 10, 0));
        assert_eq!(out.records[0].sample_count, 2);
        assert_eq!(out.records[0].avg, 15.0);
        assert_eq!(out.records[1].bin_end, at(0, 15, 0));
        assert_eq!(out.high_water, Some(at(0, 10, 1)));
    }

    #[test]
    fn test_aggregate_drops_out_of_window() {
        let samples = vec![
            RawSample::new("srv-1", "cpu", at(0, 0, 0), 1.0),
            RawSample::new("srv-1", "cpu", at(0, 3, 0), 2.0),
            RawSample::new("srv-1", "cpu", at(0, 20, 0), 3.0),
        ];

        let out = aggregate(
            &samples,
            at(0, 0, 0),
            at(0, 15, 0),
            FIVE_MIN,
            InvalidSamplePolicy::Skip,
        )
        .expect("aggregation succeeds");

        assert_eq!(out.dropped_out_of_window, 2);
        assert_eq!(out.processed, 1);
        assert_eq!(out.records.len(), 1);
        assert_eq!(out.high_water, Some(at(0, 3, 0)));
    }

    #[test]
    fn test_aggregate_skips_invalid_values() {
        let samples = vec![
            RawSample::new("srv-1", "cpu", at(0, 1, 0), 4.0),
            RawSample::new("srv-1", "cpu", at(0, 2, 0), f64::NAN),
            RawSample::new("srv-1", "cpu", at(0, 3, 0), f64::INFINITY),
        ];

        let out = aggregate(
            &samples,
            at(0, 0, 0),
            at(0, 5, 0),
            FIVE_MIN,
            InvalidSamplePolicy::Skip,
        )
        .expect("aggregation succeeds");

        assert_eq!(out.skipped_invalid, 2);
        assert_eq!(out.records.len(), 1);
        let r = &out.records[0];
        assert_eq!(r.sample_count, 1);
        assert!(r.avg.is_finite() && r.max.is_finite() && r.p90.is_finite());
        assert_eq!(r.max, 4.0);
        assert_eq!(out.high_water, Some(at(0, 3, 0)));
    }

    #[test]
    fn test_aggregate_fails_on_invalid_under_fail_policy() {
        let samples = vec![
            RawSample::new("srv-1", "cpu", at(0, 1, 0), 4.0),
            RawSample::new("srv-1", "cpu", at(0, 2, 0), f64::NAN),
        ];

        let err = aggregate(
            &samples,
            at(0, 0, 0),
            at(0, 5, 0),
            FIVE_MIN,
            InvalidSamplePolicy::Fail,
        )
        .expect_err("NaN must abort");

        assert!(matches!(err, AggregateError::InvalidSample { .. }));
        assert!(err.to_string().contains("srv-1/cpu"));
    }

    #[test]
    fn test_aggregate_rejects_bad_interval() {
        let err = aggregate(
            &[],
            at(0, 0, 0),
            at(0, 5, 0),
            Duration::ZERO,
            InvalidSamplePolicy::Skip,
        )
        .expect_err("zero interval");
        assert!(matches!(err, AggregateError::Bins(_)));
    }
}
