use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::{RunCoordinator, RunOutcome};
use crate::clock::{until_next_tick, Clock};
use crate::store::{AggregateStore, RunLock, SampleSource, WatermarkStore};

/// Runs `coordinator` now and then at every `period` boundary plus `delay`
/// until `cancel` fires.
///
/// A failed run is logged and the loop carries on. Cancellation is only
/// observed between runs, so an in-flight run always finishes.
pub async fn run_scheduled<S, A, W, L, C>(
    coordinator: &RunCoordinator<S, A, W, L, C>,
    period: Duration,
    delay: Duration,
    cancel: CancellationToken,
) where
    S: SampleSource,
    A: AggregateStore,
    W: WatermarkStore,
    L: RunLock,
    C: Clock,
{
    info!(
        period = ?period,
        delay = ?delay,
        "scheduler started",
    );

    loop {
        if cancel.is_cancelled() {
            break;
        }

        match coordinator.run_once().await {
            Ok(RunOutcome::Committed(report)) => {
                debug!(records = report.records_persisted, "scheduled run committed");
            }
            Ok(RunOutcome::LockDenied) => {}
            Err(e) => {
                error!(error = %format!("{e:#}"), "scheduled run failed");
            }
        }

        let wait = until_next_tick(coordinator.clock().now(), period, delay);
        debug!(wait = ?wait, "waiting for next tick");

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(wait) => {}
        }
    }

    info!("scheduler stopped");
}
