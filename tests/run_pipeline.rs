use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use metrics_rollup::agg::{find_bin, generate_bins, AggregateRecord, RawSample};
use metrics_rollup::clock::FixedClock;
use metrics_rollup::config::{ClickHouseConfig, InvalidSamplePolicy};
use metrics_rollup::coordinator::{RunCoordinator, RunOutcome, RunReport, RunSettings};
use metrics_rollup::lock::FileRunLock;
use metrics_rollup::migrate::{Migrator, SchemaBackend, SchemaState};
use metrics_rollup::store::memory::{
    MemoryAggregateStore, MemoryRunLock, MemorySampleSource, MemoryWatermarkStore,
};
use metrics_rollup::store::{RunLock, WatermarkStore};
use parking_lot::Mutex;

const LOCK_ID: u64 = 987_654;

/// Schema backend that only counts statements and keeps the latest state.
#[derive(Clone, Default)]
struct CountingSchema {
    state: Arc<Mutex<SchemaState>>,
    statements: Arc<AtomicUsize>,
}

impl CountingSchema {
    fn statement_count(&self) -> usize {
        self.statements.load(Ordering::SeqCst)
    }
}

impl SchemaBackend for CountingSchema {
    async fn state(&self) -> anyhow::Result<SchemaState> {
        Ok(*self.state.lock())
    }

    async fn record(&self, state: SchemaState) -> anyhow::Result<()> {
        *self.state.lock() = state;
        Ok(())
    }

    async fn execute(&self, _statement: &str) -> anyhow::Result<()> {
        self.statements.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, h, m, s).unwrap()
}

fn settings() -> RunSettings {
    RunSettings {
        interval: Duration::from_secs(300),
        lock_id: LOCK_ID,
        invalid_samples: InvalidSamplePolicy::Skip,
    }
}

fn committed(outcome: RunOutcome) -> RunReport {
    match outcome {
        RunOutcome::Committed(report) => report,
        RunOutcome::LockDenied => panic!("expected a committed run"),
    }
}

fn find<'a>(
    records: &'a [AggregateRecord],
    server: &str,
    bin_end: DateTime<Utc>,
) -> &'a AggregateRecord {
    records
        .iter()
        .find(|r| r.server_id == server && r.bin_end == bin_end)
        .unwrap_or_else(|| panic!("no record for {server} at {bin_end}"))
}

/// Two servers, one metric, samples spread over three 5m bins.
fn seed(source: &MemorySampleSource) {
    source.extend([
        RawSample::new("web-1", "cpu", at(0, 1, 0), 10.0),
        RawSample::new("web-1", "cpu", at(0, 4, 0), 20.0),
        RawSample::new("web-1", "cpu", at(0, 7, 30), 30.0),
        RawSample::new("web-1", "cpu", at(0, 14, 59), 40.0),
        RawSample::new("web-2", "cpu", at(0, 5, 0), 1.0),
        RawSample::new("web-2", "cpu", at(0, 9, 0), 2.0),
    ]);
}

#[test]
fn scenario_a_bins_and_assignment() {
    let bins = generate_bins(at(0, 0, 0), at(0, 15, 0), Duration::from_secs(300)).expect("bins");

    let ends: Vec<_> = bins.iter().map(|b| b.end).collect();
    assert_eq!(ends, vec![at(0, 5, 0), at(0, 10, 0), at(0, 15, 0)]);

    let slot = find_bin(at(0, 7, 30), &bins).expect("in window");
    assert_eq!(bins[slot].end, at(0, 10, 0));
}

#[tokio::test]
async fn scenario_b_statistics_through_a_run() {
    let source = MemorySampleSource::new();
    let store = MemoryAggregateStore::new();
    for (i, value) in (1..=10).enumerate() {
        source.extend([RawSample::new(
            "db-1",
            "latency",
            at(0, 1, 0) + TimeDelta::seconds(i as i64 * 10),
            f64::from(value),
        )]);
    }

    let coordinator = RunCoordinator::new(
        source,
        store.clone(),
        MemoryWatermarkStore::new(),
        MemoryRunLock::new(),
        FixedClock::new(at(0, 6, 0)),
        settings(),
    );

    let report = committed(coordinator.run_once().await.expect("run"));
    assert_eq!(report.processed, 10);

    let records = store.records();
    assert_eq!(records.len(), 1);
    let r = &records[0];
    assert_eq!(r.bin_end, at(0, 5, 0));
    assert!((r.avg - 5.5).abs() < 1e-12);
    assert_eq!(r.min, 1.0);
    assert_eq!(r.max, 10.0);
    assert_eq!(r.p90, 10.0);
    assert_eq!(r.p80, 9.0);
    assert_eq!(r.sample_count, 10);
}

#[tokio::test]
async fn scenario_c_no_rows_keeps_watermark() {
    let watermark = MemoryWatermarkStore::with_value(at(0, 2, 0));
    let store = MemoryAggregateStore::new();
    let lock = MemoryRunLock::new();

    let coordinator = RunCoordinator::new(
        MemorySampleSource::new(),
        store.clone(),
        watermark.clone(),
        lock.clone(),
        FixedClock::new(at(0, 16, 0)),
        settings(),
    );

    let report = committed(coordinator.run_once().await.expect("run"));
    assert_eq!(report.records_persisted, 0);
    assert_eq!(watermark.value(), Some(at(0, 2, 0)));
    assert_eq!(watermark.set_count(), 0);
    assert!(store.is_empty());
    assert!(!lock.is_held(LOCK_ID));
}

#[tokio::test]
async fn full_window_produces_one_record_per_group() {
    let source = MemorySampleSource::new();
    seed(&source);
    let store = MemoryAggregateStore::new();
    let watermark = MemoryWatermarkStore::new();

    let coordinator = RunCoordinator::new(
        source,
        store.clone(),
        watermark.clone(),
        MemoryRunLock::new(),
        FixedClock::new(at(0, 16, 0)),
        settings(),
    );

    let report = committed(coordinator.run_once().await.expect("run"));
    assert_eq!(report.cutoff, at(0, 15, 0));
    assert_eq!(report.fetched, 6);
    assert_eq!(report.records_persisted, 5);

    let records = store.records();
    assert_eq!(find(&records, "web-1", at(0, 5, 0)).avg, 15.0);
    assert_eq!(find(&records, "web-1", at(0, 10, 0)).max, 30.0);
    assert_eq!(find(&records, "web-1", at(0, 15, 0)).sample_count, 1);
    // 00:05:00 is the right edge of the first bin.
    assert_eq!(find(&records, "web-2", at(0, 5, 0)).avg, 1.0);
    assert_eq!(find(&records, "web-2", at(0, 10, 0)).avg, 2.0);

    assert_eq!(watermark.value(), Some(at(0, 14, 59)));
}

#[tokio::test]
async fn rerunning_the_same_window_does_not_duplicate() {
    let source = MemorySampleSource::new();
    seed(&source);
    let store = MemoryAggregateStore::new();

    for _ in 0..2 {
        // Fresh watermark each time so the whole window is reprocessed.
        let coordinator = RunCoordinator::new(
            source.clone(),
            store.clone(),
            MemoryWatermarkStore::new(),
            MemoryRunLock::new(),
            FixedClock::new(at(0, 16, 0)),
            settings(),
        );
        committed(coordinator.run_once().await.expect("run"));
    }

    assert_eq!(store.len(), 5);
    assert_eq!(store.write_count(), 10);
}

#[tokio::test]
async fn partial_persist_then_rerun_converges() {
    let source = MemorySampleSource::new();
    seed(&source);
    let store = MemoryAggregateStore::new();
    let watermark = MemoryWatermarkStore::new();
    let lock = MemoryRunLock::new();

    let coordinator = RunCoordinator::new(
        source.clone(),
        store.clone(),
        watermark.clone(),
        lock.clone(),
        FixedClock::new(at(0, 16, 0)),
        settings(),
    );

    store.fail_after(2);
    assert!(coordinator.run_once().await.is_err());
    assert_eq!(store.len(), 2);
    assert_eq!(watermark.value(), None);
    assert!(!lock.is_held(LOCK_ID));

    store.disarm();
    committed(coordinator.run_once().await.expect("rerun"));

    let reference = MemoryAggregateStore::new();
    let clean = RunCoordinator::new(
        source,
        reference.clone(),
        MemoryWatermarkStore::new(),
        MemoryRunLock::new(),
        FixedClock::new(at(0, 16, 0)),
        settings(),
    );
    committed(clean.run_once().await.expect("clean run"));

    assert_eq!(store.records(), reference.records());
    assert_eq!(watermark.value(), Some(at(0, 14, 59)));
}

#[tokio::test]
async fn incremental_runs_follow_the_watermark() {
    let source = MemorySampleSource::new();
    let store = MemoryAggregateStore::new();
    let watermark = MemoryWatermarkStore::new();

    let coordinator = RunCoordinator::new(
        source.clone(),
        store.clone(),
        watermark.clone(),
        MemoryRunLock::new(),
        FixedClock::new(at(0, 6, 0)),
        settings(),
    );

    source.extend([RawSample::new("web-1", "cpu", at(0, 3, 0), 1.0)]);
    let first = committed(coordinator.run_once().await.expect("first"));
    assert_eq!(first.new_watermark, Some(at(0, 3, 0)));

    source.extend([
        RawSample::new("web-1", "cpu", at(0, 8, 0), 2.0),
        RawSample::new("web-1", "cpu", at(0, 12, 0), 3.0),
    ]);
    coordinator.clock().set(at(0, 11, 0));
    let second = committed(coordinator.run_once().await.expect("second"));
    assert_eq!(second.previous_watermark, Some(at(0, 3, 0)));
    assert_eq!(second.fetched, 1);
    assert_eq!(second.new_watermark, Some(at(0, 8, 0)));

    coordinator.clock().set(at(0, 16, 0));
    let third = committed(coordinator.run_once().await.expect("third"));
    assert_eq!(third.fetched, 1);
    assert_eq!(third.new_watermark, Some(at(0, 12, 0)));

    let ends: Vec<_> = store.records().iter().map(|r| r.bin_end).collect();
    assert_eq!(ends, vec![at(0, 5, 0), at(0, 10, 0), at(0, 15, 0)]);
}

#[tokio::test]
async fn late_row_replaces_the_stored_bin_record() {
    let source = MemorySampleSource::new();
    let store = MemoryAggregateStore::new();

    let coordinator = RunCoordinator::new(
        source.clone(),
        store.clone(),
        MemoryWatermarkStore::new(),
        MemoryRunLock::new(),
        FixedClock::new(at(0, 11, 0)),
        settings(),
    );

    source.extend([
        RawSample::new("web-1", "cpu", at(0, 6, 0), 10.0),
        RawSample::new("web-1", "cpu", at(0, 7, 0), 20.0),
    ]);
    committed(coordinator.run_once().await.expect("first"));
    assert_eq!(find(&store.records(), "web-1", at(0, 10, 0)).sample_count, 2);

    // Lands in the same closed bin after it was rolled up, but is newer than
    // the watermark (00:07).
    source.extend([RawSample::new("web-1", "cpu", at(0, 9, 0), 60.0)]);
    coordinator.clock().set(at(0, 12, 0));
    let late = committed(coordinator.run_once().await.expect("late"));
    assert_eq!(late.fetched, 1);
    assert_eq!(late.new_watermark, Some(at(0, 9, 0)));

    let records = store.records();
    assert_eq!(records.len(), 1);
    let r = find(&records, "web-1", at(0, 10, 0));
    assert_eq!(r.sample_count, 1);
    assert_eq!(r.avg, 60.0);
    assert_eq!(r.min, 60.0);
}

#[tokio::test]
async fn migrations_wait_for_the_run_lock() {
    let dir = tempfile::tempdir().expect("tempdir");
    let schema = CountingSchema::default();
    let migrator = Migrator::new(schema.clone(), &ClickHouseConfig::default());

    let run = FileRunLock::new(dir.path());
    assert!(run.try_acquire(LOCK_ID).await.expect("acquire"));

    let lock = FileRunLock::new(dir.path());
    let skipped = migrator.up_locked(&lock, LOCK_ID).await.expect("up_locked");
    assert_eq!(skipped, None);
    assert_eq!(schema.statement_count(), 0);

    run.release(LOCK_ID).await.expect("release");
    let applied = migrator.up_locked(&lock, LOCK_ID).await.expect("up_locked");
    assert_eq!(applied, Some(1));
    assert_eq!(schema.statement_count(), 3);
    assert!(!lock.is_held(LOCK_ID));
}

#[tokio::test]
async fn file_lock_excludes_a_second_coordinator() {
    let dir = tempfile::tempdir().expect("tempdir");
    let source = MemorySampleSource::new();
    seed(&source);
    let store = MemoryAggregateStore::new();
    let watermark = MemoryWatermarkStore::new();

    let coordinator = RunCoordinator::new(
        source.clone(),
        store.clone(),
        watermark.clone(),
        FileRunLock::new(dir.path()),
        FixedClock::new(at(0, 16, 0)),
        settings(),
    );

    let other = FileRunLock::new(dir.path());
    assert!(other.try_acquire(LOCK_ID).await.expect("acquire"));

    let outcome = coordinator.run_once().await.expect("run");
    assert_eq!(outcome, RunOutcome::LockDenied);
    assert_eq!(source.fetch_count(), 0);
    assert_eq!(watermark.get().await.expect("get"), None);

    other.release(LOCK_ID).await.expect("release");
    committed(coordinator.run_once().await.expect("run after release"));
    assert_eq!(store.len(), 5);
}

#[tokio::test]
async fn concurrent_runs_commit_exactly_once() {
    let source = MemorySampleSource::new();
    seed(&source);
    let store = MemoryAggregateStore::new();
    let watermark = MemoryWatermarkStore::new();
    let lock = MemoryRunLock::new();

    let make = || {
        RunCoordinator::new(
            source.clone(),
            store.clone(),
            watermark.clone(),
            lock.clone(),
            FixedClock::new(at(0, 16, 0)),
            settings(),
        )
    };
    let (a, b) = (make(), make());

    let (ra, rb) = tokio::join!(a.run_once(), b.run_once());
    let outcomes = [ra.expect("run a"), rb.expect("run b")];

    let denied = outcomes
        .iter()
        .filter(|o| matches!(o, RunOutcome::LockDenied))
        .count();
    // The memory stores never yield, so the first run finishes before the
    // second starts and both may commit; the second then sees no new rows.
    let committed_with_rows = outcomes
        .iter()
        .filter(|o| matches!(o, RunOutcome::Committed(r) if r.fetched > 0))
        .count();
    assert_eq!(committed_with_rows, 1);
    assert!(denied <= 1);
    assert_eq!(store.len(), 5);
    assert_eq!(watermark.value(), Some(at(0, 14, 59)));
}
