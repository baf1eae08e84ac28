use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use thiserror::Error;

/// Errors raised while building or aligning bins.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BinError {
    #[error("bin interval must be a positive whole number of seconds, got {interval:?}")]
    InvalidInterval { interval: Duration },

    #[error("window start {since} is after window end {until}")]
    InvertedWindow {
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    },

    #[error("timestamp arithmetic out of range")]
    OutOfRange,
}

/// A half-open time bin `(start, end]`.
///
/// A sample exactly on `start` belongs to the previous bin; one exactly on
/// `end` belongs to this bin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Bin {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Bin {
    /// Returns true if `ts` falls in `(start, end]`.
    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.start < ts && ts <= self.end
    }

    /// Returns the bin width.
    pub fn width(&self) -> TimeDelta {
        self.end - self.start
    }
}

/// Converts a configured interval into a bin step, rejecting zero and
/// sub-second intervals.
pub fn interval_step(interval: Duration) -> Result<TimeDelta, BinError> {
    if interval.as_secs() == 0 || interval.subsec_nanos() != 0 {
        return Err(BinError::InvalidInterval { interval });
    }

    let secs =
        i64::try_from(interval.as_secs()).map_err(|_| BinError::InvalidInterval { interval })?;
    TimeDelta::try_seconds(secs).ok_or(BinError::InvalidInterval { interval })
}

/// Drops the sub-second part of a timestamp.
pub fn truncate_to_second(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts - TimeDelta::nanoseconds(i64::from(ts.timestamp_subsec_nanos()))
}

/// Floors a timestamp to the interval boundary counted from the Unix epoch.
///
/// `round_down(10:07:30, 5m) == 10:05:00`. The sub-second part is dropped
/// before flooring.
pub fn round_down(ts: DateTime<Utc>, interval: Duration) -> Result<DateTime<Utc>, BinError> {
    let step_ms = interval_step(interval)?.num_milliseconds();
    let ms = truncate_to_second(ts).timestamp_millis();
    let floored = ms.div_euclid(step_ms) * step_ms;

    DateTime::from_timestamp_millis(floored).ok_or(BinError::OutOfRange)
}

/// Returns the start of the interval-aligned bin that will contain `ts`.
///
/// Bins are right-closed, so a timestamp exactly on a boundary belongs to the
/// bin that ends there, and its aligned start is the previous boundary.
pub fn aligned_bin_start(
    ts: DateTime<Utc>,
    interval: Duration,
) -> Result<DateTime<Utc>, BinError> {
    let just_before = ts
        .checked_sub_signed(TimeDelta::nanoseconds(1))
        .ok_or(BinError::OutOfRange)?;
    round_down(just_before, interval)
}

/// Builds the ordered bins covering `(since, until]`.
///
/// Both ends are truncated to whole seconds. Bins start at `since` (not
/// wall-clock aligned) and step forward by `interval` until a bin end reaches
/// `until`. When the window is not an exact multiple of the interval the last
/// bin overshoots `until`. The result always holds at least one bin.
pub fn generate_bins(
    since: DateTime<Utc>,
    until: DateTime<Utc>,
    interval: Duration,
) -> Result<Vec<Bin>, BinError> {
    let step = interval_step(interval)?;

    if since > until {
        return Err(BinError::InvertedWindow { since, until });
    }

    let mut cursor = truncate_to_second(since);
    let until = truncate_to_second(until);

    let span_ms = (until - cursor).num_milliseconds();
    let step_ms = step.num_milliseconds();
    let expected = usize::try_from(span_ms / step_ms + 1).unwrap_or(1);
    let mut bins = Vec::with_capacity(expected);

    loop {
        let end = cursor
            .checked_add_signed(step)
            .ok_or(BinError::OutOfRange)?;
        bins.push(Bin { start: cursor, end });
        cursor = end;

        if cursor >= until {
            break;
        }
    }

    Ok(bins)
}

/// Returns the index of the bin containing `ts` by linear scan, or `None` when
/// `ts` is outside the covered window.
///
/// Samples outside the window are dropped by callers; that is intended.
pub fn find_bin(ts: DateTime<Utc>, bins: &[Bin]) -> Option<usize> {
    bins.iter().position(|bin| bin.contains(ts))
}

/// Constant-time bin lookup over uniform, contiguous bins.
///
/// Produces the same answer as [`find_bin`] for every timestamp. Built with
/// [`BinIndex::new`], which refuses bin sequences that are not uniform.
#[derive(Debug, Clone, Copy)]
pub struct BinIndex<'a> {
    bins: &'a [Bin],
    width_ns: i64,
}

impl<'a> BinIndex<'a> {
    /// Creates an index, or `None` if `bins` is empty, non-contiguous, or of
    /// mixed width.
    pub fn new(bins: &'a [Bin]) -> Option<Self> {
        let first = bins.first()?;
        let width = first.width();
        let width_ns = width.num_nanoseconds()?;
        if width_ns <= 0 {
            return None;
        }

        let uniform = bins.iter().all(|b| b.width() == width)
            && bins.windows(2).all(|pair| pair[0].end == pair[1].start);
        if !uniform {
            return None;
        }

        Some(Self { bins, width_ns })
    }

    /// Returns the bin index for `ts`, or `None` when out of range.
    pub fn find(&self, ts: DateTime<Utc>) -> Option<usize> {
        let first = self.bins.first()?;
        let last = self.bins.last()?;

        if ts <= first.start || ts > last.end {
            return None;
        }

        // Offsets beyond ~292 years do not fit in i64 nanoseconds.
        let Some(offset_ns) = (ts - first.start).num_nanoseconds() else {
            return find_bin(ts, self.bins);
        };

        // Shift by one nanosecond so a timestamp on a boundary lands in the
        // bin that ends there.
        let idx = usize::try_from((offset_ns - 1) / self.width_ns).ok()?;

        self.bins
            .get(idx)
            .filter(|bin| bin.contains(ts))
            .map(|_| idx)
    }
}
