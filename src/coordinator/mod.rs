//! One exclusive, watermark-driven aggregation run.
//!
//! ```text
//! Idle -> LockAcquiring -> LockDenied -> Idle
//!                       -> Running -> Committed -> Idle
//!                                  -> Aborted   -> Idle
//! ```

pub mod scheduler;

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::{debug, error, info};

use crate::agg::{aggregate, aligned_bin_start, round_down, RawSample};
use crate::clock::Clock;
use crate::config::{Config, InvalidSamplePolicy};
use crate::export::health::HealthMetrics;
use crate::store::{AggregateStore, RunLock, SampleSource, WatermarkStore};

/// Per-run parameters.
#[derive(Debug, Clone, Copy)]
pub struct RunSettings {
    pub interval: Duration,
    pub lock_id: u64,
    pub invalid_samples: InvalidSamplePolicy,
}

impl RunSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            interval: cfg.aggregation.interval,
            lock_id: cfg.lock.id,
            invalid_samples: cfg.aggregation.invalid_samples,
        }
    }
}

/// Where the coordinator is in its run lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Idle,
    LockAcquiring,
    LockDenied,
    Running,
    Committed,
    Aborted,
}

impl RunPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::LockAcquiring => "lock_acquiring",
            Self::LockDenied => "lock_denied",
            Self::Running => "running",
            Self::Committed => "committed",
            Self::Aborted => "aborted",
        }
    }
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a committed run did.
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    /// Upper bound of the window, `round_down(now, interval)`.
    pub cutoff: DateTime<Utc>,
    pub previous_watermark: Option<DateTime<Utc>>,
    /// Watermark after the run. Equal to `previous_watermark` when nothing
    /// was processed.
    pub new_watermark: Option<DateTime<Utc>>,
    pub fetched: usize,
    pub processed: usize,
    pub skipped_invalid: usize,
    pub dropped_out_of_window: usize,
    pub records_persisted: usize,
}

impl RunReport {
    fn empty(cutoff: DateTime<Utc>, previous: Option<DateTime<Utc>>) -> Self {
        Self {
            cutoff,
            previous_watermark: previous,
            new_watermark: previous,
            fetched: 0,
            processed: 0,
            skipped_invalid: 0,
            dropped_out_of_window: 0,
            records_persisted: 0,
        }
    }
}

/// Result of [`RunCoordinator::run_once`] when no error occurred.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// Another holder had the lock. Nothing was read or written.
    LockDenied,
    Committed(RunReport),
}

/// Drives a single run: lock, fetch past the watermark, aggregate, persist,
/// advance the watermark, unlock.
pub struct RunCoordinator<S, A, W, L, C> {
    source: S,
    store: A,
    watermark: W,
    lock: L,
    clock: C,
    settings: RunSettings,
    health: Option<Arc<HealthMetrics>>,
    phase: parking_lot::Mutex<RunPhase>,
}

impl<S, A, W, L, C> RunCoordinator<S, A, W, L, C>
where
    S: SampleSource,
    A: AggregateStore,
    W: WatermarkStore,
    L: RunLock,
    C: Clock,
{
    pub fn new(
        source: S,
        store: A,
        watermark: W,
        lock: L,
        clock: C,
        settings: RunSettings,
    ) -> Self {
        Self {
            source,
            store,
            watermark,
            lock,
            clock,
            settings,
            health: None,
            phase: parking_lot::Mutex::new(RunPhase::Idle),
        }
    }

    /// Reports run outcomes to `health`.
    pub fn with_health(mut self, health: Arc<HealthMetrics>) -> Self {
        self.health = Some(health);
        self
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    /// Current lifecycle phase. `Idle` between runs.
    pub fn phase(&self) -> RunPhase {
        *self.phase.lock()
    }

    /// Performs one run.
    ///
    /// Lock denial is not an error. Any failure after the lock was taken
    /// leaves the watermark where it was; the lock is released either way.
    ///
    /// Records are upserted by `(server_id, metric_type, bin_end)`. A row
    /// that arrives late but is still newer than the watermark yields a
    /// record built from this run's rows alone, which replaces the record
    /// already stored for that bin instead of merging with it.
    pub async fn run_once(&self) -> Result<RunOutcome> {
        let lock_id = self.settings.lock_id;

        self.transition(RunPhase::LockAcquiring);
        let acquired = match self.lock.try_acquire(lock_id).await {
            Ok(acquired) => acquired,
            Err(e) => {
                self.abort("failed");
                return Err(e).context("acquiring run lock");
            }
        };

        if !acquired {
            self.transition(RunPhase::LockDenied);
            info!(lock_id, "run lock held elsewhere, skipping run");
            self.count_run("lock_denied");
            self.transition(RunPhase::Idle);
            return Ok(RunOutcome::LockDenied);
        }

        self.transition(RunPhase::Running);
        let started = Instant::now();

        let result = self.execute().await;
        let released = self.lock.release(lock_id).await;

        if let Some(health) = &self.health {
            health.run_duration.observe(started.elapsed().as_secs_f64());
        }

        match (result, released) {
            (Ok(report), Ok(())) => {
                self.transition(RunPhase::Committed);
                self.record_commit(&report);
                info!(
                    cutoff = %report.cutoff,
                    fetched = report.fetched,
                    processed = report.processed,
                    skipped = report.skipped_invalid,
                    dropped = report.dropped_out_of_window,
                    records = report.records_persisted,
                    watermark = ?report.new_watermark,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "run committed",
                );
                self.transition(RunPhase::Idle);
                Ok(RunOutcome::Committed(report))
            }
            (Ok(_), Err(e)) => {
                self.abort("failed");
                Err(e).context("releasing run lock after a successful run")
            }
            (Err(e), Ok(())) => {
                error!(error = %format!("{e:#}"), "run aborted");
                self.abort("failed");
                Err(e)
            }
            (Err(e), Err(release_err)) => {
                error!(error = %format!("{e:#}"), "run aborted");
                error!(
                    error = %format!("{release_err:#}"),
                    lock_id, "releasing run lock after a failed run",
                );
                self.abort("failed");
                Err(e)
            }
        }
    }

    /// The `Running` phase. Called with the lock held.
    async fn execute(&self) -> Result<RunReport> {
        let interval = self.settings.interval;

        let previous = self.watermark.get().await.context("reading watermark")?;
        let now = self.clock.now();
        let cutoff = round_down(now, interval).context("computing cutoff")?;

        let mut report = RunReport::empty(cutoff, previous);

        if previous.is_some_and(|w| w >= cutoff) {
            debug!(
                cutoff = %cutoff,
                watermark = ?previous,
                "no closed interval past the watermark",
            );
            return Ok(report);
        }

        let fetched = self
            .source
            .fetch(previous, cutoff)
            .await
            .context("fetching raw samples")?;
        report.fetched = fetched.len();

        // The source contract already bounds rows to the window. Rows that
        // slip through anyway must not move the watermark.
        let (samples, outside): (Vec<RawSample>, Vec<RawSample>) = fetched
            .into_iter()
            .partition(|s| previous.map_or(true, |w| s.ts > w) && s.ts <= cutoff);
        report.dropped_out_of_window = outside.len();

        debug!(
            fetched = report.fetched,
            in_window = samples.len(),
            watermark = ?previous,
            cutoff = %cutoff,
            "raw samples fetched",
        );

        let Some(first) = samples.iter().map(|s| s.ts).min() else {
            info!(cutoff = %cutoff, "no new samples");
            return Ok(report);
        };

        let since = aligned_bin_start(first, interval).context("aligning first bin")?;
        let aggregation = aggregate(
            &samples,
            since,
            cutoff,
            interval,
            self.settings.invalid_samples,
        )
        .context("aggregating samples")?;

        report.processed = aggregation.processed;
        report.skipped_invalid = aggregation.skipped_invalid;
        report.dropped_out_of_window += aggregation.dropped_out_of_window;

        debug!(
            bins = aggregation.bin_count,
            records = aggregation.records.len(),
            "samples aggregated",
        );

        self.store
            .upsert(&aggregation.records)
            .await
            .context("persisting aggregate records")?;
        report.records_persisted = aggregation.records.len();

        if let Some(high_water) = aggregation.high_water {
            if previous.map_or(true, |w| high_water > w) {
                self.watermark
                    .set(high_water)
                    .await
                    .context("advancing watermark")?;
                report.new_watermark = Some(high_water);
            }
        }

        Ok(report)
    }

    fn transition(&self, to: RunPhase) {
        let mut phase = self.phase.lock();
        let from = *phase;
        debug!(from = %from, to = %to, "run phase");
        *phase = to;
    }

    fn abort(&self, outcome: &str) {
        self.transition(RunPhase::Aborted);
        self.count_run(outcome);
        self.transition(RunPhase::Idle);
    }

    fn count_run(&self, outcome: &str) {
        if let Some(health) = &self.health {
            health.runs.with_label_values(&[outcome]).inc();
        }
    }

    fn record_commit(&self, report: &RunReport) {
        self.count_run("committed");

        let Some(health) = &self.health else {
            return;
        };

        health.samples_fetched.inc_by(report.fetched as f64);
        health.samples_processed.inc_by(report.processed as f64);
        health.samples_skipped.inc_by(report.skipped_invalid as f64);
        health.samples_dropped.inc_by(report.dropped_out_of_window as f64);
        health.records_persisted.inc_by(report.records_persisted as f64);

        if let Some(watermark) = report.new_watermark {
            health
                .watermark_seconds
                .set(watermark.timestamp_millis() as f64 / 1000.0);
        }
        health
            .last_success_seconds
            .set(self.clock.now().timestamp_millis() as f64 / 1000.0);
    }
}
