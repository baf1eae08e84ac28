use std::alloc::System;
use std::hint::black_box;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use metrics_rollup::agg::{find_bin, generate_bins, summarize, BinIndex};
use serial_test::serial;
use stats_alloc::{Region, StatsAlloc, INSTRUMENTED_SYSTEM};

#[global_allocator]
static GLOBAL: &StatsAlloc<System> = &INSTRUMENTED_SYSTEM;

fn day_start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

fn probe_timestamps(n: usize) -> Vec<DateTime<Utc>> {
    (0..n)
        .map(|i| day_start() + TimeDelta::milliseconds(i as i64 * 7_919))
        .collect()
}

fn measure_alloc_counts<T>(f: impl FnOnce() -> T) -> (T, usize, usize) {
    // Calibrate for ambient allocator activity in the test harness process.
    let idle_region = Region::new(&GLOBAL);
    black_box(());
    let idle = idle_region.change();

    let region = Region::new(&GLOBAL);
    let output = f();
    let used = region.change();

    let allocations = used.allocations.saturating_sub(idle.allocations);
    let deallocations = used.deallocations.saturating_sub(idle.deallocations);
    (output, allocations, deallocations)
}

#[test]
#[serial]
fn bin_index_find_allocates_zero() {
    let bins = generate_bins(
        day_start(),
        day_start() + TimeDelta::hours(24),
        Duration::from_secs(300),
    )
    .expect("bins");
    let index = BinIndex::new(&bins).expect("uniform bins");
    let probes = probe_timestamps(4_096);

    let (_hits, allocations, deallocations) = measure_alloc_counts(|| {
        let mut hits = 0usize;
        for ts in &probes {
            if black_box(index.find(*ts)).is_some() {
                hits += 1;
            }
        }
        hits
    });

    assert!(
        allocations <= 2,
        "BinIndex::find allocation budget exceeded: {}",
        allocations
    );
    assert!(
        deallocations <= 2,
        "BinIndex::find deallocation budget exceeded: {}",
        deallocations
    );
}

#[test]
#[serial]
fn linear_find_bin_allocates_zero() {
    let bins = generate_bins(
        day_start(),
        day_start() + TimeDelta::hours(1),
        Duration::from_secs(60),
    )
    .expect("bins");
    let probes = probe_timestamps(512);

    let (_hits, allocations, _deallocations) = measure_alloc_counts(|| {
        probes
            .iter()
            .filter(|ts| black_box(find_bin(**ts, &bins)).is_some())
            .count()
    });

    assert!(
        allocations <= 2,
        "find_bin allocation budget exceeded: {}",
        allocations
    );
}

#[test]
#[serial]
fn summarize_sorts_in_place() {
    let mut values: Vec<f64> = (0..10_000).map(|i| ((i * 7_919) % 10_007) as f64).collect();

    let (summary, allocations, _deallocations) =
        measure_alloc_counts(|| summarize(black_box(&mut values)));

    let summary = summary.expect("non-empty");
    assert_eq!(summary.count, 10_000);
    assert!(
        allocations <= 2,
        "summarize allocation budget exceeded: {}",
        allocations
    );
}
