//! Boundaries to the outside world: where raw samples come from, where
//! aggregates and the watermark are kept, and the exclusive run lock.

pub mod clickhouse;
pub mod memory;

use anyhow::Result;
use chrono::{DateTime, Utc};

use crate::agg::{AggregateRecord, RawSample};

/// Source of raw samples.
pub trait SampleSource: Send + Sync {
    /// Returns samples with `since < ts <= until`, ascending by timestamp.
    /// `None` for `since` means no lower bound.
    fn fetch(
        &self,
        since: Option<DateTime<Utc>>,
        until: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<Vec<RawSample>>> + Send;
}

/// Destination for aggregate records.
pub trait AggregateStore: Send + Sync {
    /// Inserts or replaces records keyed on `(server_id, metric_type,
    /// bin_end)`. Writing the same key twice must leave one row.
    fn upsert(
        &self,
        records: &[AggregateRecord],
    ) -> impl std::future::Future<Output = Result<()>> + Send;
}

/// Persisted "last processed sample" timestamp.
pub trait WatermarkStore: Send + Sync {
    /// Returns the stored watermark, or `None` before the first run.
    fn get(&self) -> impl std::future::Future<Output = Result<Option<DateTime<Utc>>>> + Send;

    /// Atomically inserts or replaces the singleton watermark.
    fn set(&self, ts: DateTime<Utc>) -> impl std::future::Future<Output = Result<()>> + Send;
}

/// Process-external exclusive lock guarding a run.
pub trait RunLock: Send + Sync {
    /// Attempts to take the lock without waiting. Returns `false` if another
    /// holder has it.
    fn try_acquire(&self, lock_id: u64) -> impl std::future::Future<Output = Result<bool>> + Send;

    /// Releases a lock taken by [`RunLock::try_acquire`].
    fn release(&self, lock_id: u64) -> impl std::future::Future<Output = Result<()>> + Send;
}
