//! In-process implementations of the store traits.
//!
//! Each type is a cheap handle around shared state, so a clone kept by a test
//! observes what the coordinator did. Failure switches let tests exercise the
//! abort paths.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::{AggregateStore, RunLock, SampleSource, WatermarkStore};
use crate::agg::{AggregateRecord, RawSample};

/// Raw samples held in memory.
#[derive(Debug, Clone, Default)]
pub struct MemorySampleSource {
    samples: Arc<Mutex<Vec<RawSample>>>,
    fail: Arc<AtomicBool>,
    fetches: Arc<AtomicUsize>,
}

impl MemorySampleSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds samples. Insertion order does not matter.
    pub fn extend(&self, samples: impl IntoIterator<Item = RawSample>) {
        self.samples.lock().extend(samples);
    }

    /// Makes every following fetch fail until cleared.
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Number of fetch calls made.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

impl SampleSource for MemorySampleSource {
    async fn fetch(
        &self,
        since: Option<DateTime<Utc>>,
        until: DateTime<Utc>,
    ) -> Result<Vec<RawSample>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);

        if self.fail.load(Ordering::SeqCst) {
            bail!("sample source unavailable");
        }

        let mut out: Vec<RawSample> = self
            .samples
            .lock()
            .iter()
            .filter(|s| since.map_or(true, |since| s.ts > since) && s.ts <= until)
            .cloned()
            .collect();
        out.sort_by_key(|s| s.ts);

        Ok(out)
    }
}

type RecordKey = (String, String, DateTime<Utc>);

/// Aggregate records keyed on `(server_id, metric_type, bin_end)`.
#[derive(Debug, Clone, Default)]
pub struct MemoryAggregateStore {
    rows: Arc<Mutex<BTreeMap<RecordKey, AggregateRecord>>>,
    writes: Arc<AtomicUsize>,
    /// Remaining successful row writes before failing, if armed.
    fail_after: Arc<Mutex<Option<usize>>>,
}

impl MemoryAggregateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lets `rows` more rows through, then fails every write until disarmed.
    /// Simulates a crash part way through persisting a run.
    pub fn fail_after(&self, rows: usize) {
        *self.fail_after.lock() = Some(rows);
    }

    /// Clears a failure armed by [`MemoryAggregateStore::fail_after`].
    pub fn disarm(&self) {
        *self.fail_after.lock() = None;
    }

    /// Returns all stored records ordered by key.
    pub fn records(&self) -> Vec<AggregateRecord> {
        self.rows.lock().values().cloned().collect()
    }

    /// Number of distinct keys stored.
    pub fn len(&self) -> usize {
        self.rows.lock().len()
    }

    /// Returns true if nothing has been stored.
    pub fn is_empty(&self) -> bool {
        self.rows.lock().is_empty()
    }

    /// Total row writes, counting overwrites.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

impl AggregateStore for MemoryAggregateStore {
    async fn upsert(&self, records: &[AggregateRecord]) -> Result<()> {
        for record in records {
            {
                let mut budget = self.fail_after.lock();
                if let Some(remaining) = budget.as_mut() {
                    if *remaining == 0 {
                        bail!("aggregate store unavailable");
                    }
                    *remaining -= 1;
                }
            }

            let key = (
                record.server_id.clone(),
                record.metric_type.clone(),
                record.bin_end,
            );
            self.rows.lock().insert(key, record.clone());
            self.writes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// Singleton watermark cell.
#[derive(Debug, Clone, Default)]
pub struct MemoryWatermarkStore {
    value: Arc<Mutex<Option<DateTime<Utc>>>>,
    fail_set: Arc<AtomicBool>,
    sets: Arc<AtomicUsize>,
}

impl MemoryWatermarkStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store that already holds `ts`.
    pub fn with_value(ts: DateTime<Utc>) -> Self {
        let store = Self::default();
        *store.value.lock() = Some(ts);
        store
    }

    /// Returns the current value without going through the trait.
    pub fn value(&self) -> Option<DateTime<Utc>> {
        *self.value.lock()
    }

    /// Makes every following `set` fail until cleared.
    pub fn set_failing(&self, fail: bool) {
        self.fail_set.store(fail, Ordering::SeqCst);
    }

    /// Number of successful `set` calls.
    pub fn set_count(&self) -> usize {
        self.sets.load(Ordering::SeqCst)
    }
}

impl WatermarkStore for MemoryWatermarkStore {
    async fn get(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(*self.value.lock())
    }

    async fn set(&self, ts: DateTime<Utc>) -> Result<()> {
        if self.fail_set.load(Ordering::SeqCst) {
            bail!("watermark store unavailable");
        }
        *self.value.lock() = Some(ts);
        self.sets.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Lock table shared by every clone.
#[derive(Debug, Clone, Default)]
pub struct MemoryRunLock {
    held: Arc<Mutex<HashSet<u64>>>,
    releases: Arc<AtomicUsize>,
}

impl MemoryRunLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if `lock_id` is currently held.
    pub fn is_held(&self, lock_id: u64) -> bool {
        self.held.lock().contains(&lock_id)
    }

    /// Number of successful releases.
    pub fn release_count(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }
}

impl RunLock for MemoryRunLock {
    async fn try_acquire(&self, lock_id: u64) -> Result<bool> {
        Ok(self.held.lock().insert(lock_id))
    }

    async fn release(&self, lock_id: u64) -> Result<()> {
        if !self.held.lock().remove(&lock_id) {
            bail!("run lock {lock_id} is not held");
        }
        self.releases.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
