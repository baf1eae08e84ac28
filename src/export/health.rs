use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const NAMESPACE: &str = "metrics_rollup";

/// Prometheus metrics describing aggregation runs.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    /// Runs by outcome (committed, lock_denied, failed).
    pub runs: CounterVec,
    /// Raw samples returned by the source.
    pub samples_fetched: Counter,
    /// Raw samples folded into aggregates.
    pub samples_processed: Counter,
    /// Raw samples rejected by validation.
    pub samples_skipped: Counter,
    /// Raw samples outside the bin window.
    pub samples_dropped: Counter,
    /// Aggregate records written.
    pub records_persisted: Counter,
    /// Wall time of runs that held the lock.
    pub run_duration: Histogram,
    /// Current watermark as unix seconds.
    pub watermark_seconds: Gauge,
    /// Unix seconds of the last committed run.
    pub last_success_seconds: Gauge,
    /// Whether the ClickHouse pool is connected (1=yes, 0=no).
    pub clickhouse_connected: Gauge,
    /// ClickHouse write errors by table.
    pub clickhouse_batch_errors: CounterVec,
    /// ClickHouse statement duration by operation.
    pub clickhouse_batch_duration: HistogramVec,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let runs = CounterVec::new(
            Opts::new("runs_total", "Aggregation runs by outcome.").namespace(NAMESPACE),
            &["outcome"],
        )?;
        let samples_fetched = Counter::with_opts(
            Opts::new(
                "samples_fetched_total",
                "Raw samples returned by the sample source.",
            )
            .namespace(NAMESPACE),
        )?;
        let samples_processed = Counter::with_opts(
            Opts::new(
                "samples_processed_total",
                "Raw samples folded into aggregates.",
            )
            .namespace(NAMESPACE),
        )?;
        let samples_skipped = Counter::with_opts(
            Opts::new(
                "samples_skipped_total",
                "Raw samples rejected as malformed.",
            )
            .namespace(NAMESPACE),
        )?;
        let samples_dropped = Counter::with_opts(
            Opts::new(
                "samples_dropped_total",
                "Raw samples outside the run's bin window.",
            )
            .namespace(NAMESPACE),
        )?;
        let records_persisted = Counter::with_opts(
            Opts::new(
                "records_persisted_total",
                "Aggregate records written to the store.",
            )
            .namespace(NAMESPACE),
        )?;
        let run_duration = Histogram::with_opts(
            HistogramOpts::new(
                "run_duration_seconds",
                "Duration of aggregation runs that held the lock.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0]),
        )?;
        let watermark_seconds = Gauge::with_opts(
            Opts::new(
                "watermark_seconds",
                "Timestamp of the last processed raw sample (unix seconds).",
            )
            .namespace(NAMESPACE),
        )?;
        let last_success_seconds = Gauge::with_opts(
            Opts::new(
                "last_success_seconds",
                "Completion time of the last committed run (unix seconds).",
            )
            .namespace(NAMESPACE),
        )?;
        let clickhouse_connected = Gauge::with_opts(
            Opts::new(
                "clickhouse_connected",
                "Whether ClickHouse connection is established (1=yes, 0=no).",
            )
            .namespace(NAMESPACE),
        )?;
        let clickhouse_batch_errors = CounterVec::new(
            Opts::new(
                "clickhouse_batch_errors_total",
                "ClickHouse statement errors by table.",
            )
            .namespace(NAMESPACE),
            &["table"],
        )?;
        let clickhouse_batch_duration = HistogramVec::new(
            HistogramOpts::new(
                "clickhouse_batch_duration_seconds",
                "ClickHouse statement duration by operation.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
            &["operation"],
        )?;

        registry.register(Box::new(runs.clone()))?;
        registry.register(Box::new(samples_fetched.clone()))?;
        registry.register(Box::new(samples_processed.clone()))?;
        registry.register(Box::new(samples_skipped.clone()))?;
        registry.register(Box::new(samples_dropped.clone()))?;
        registry.register(Box::new(records_persisted.clone()))?;
        registry.register(Box::new(run_duration.clone()))?;
        registry.register(Box::new(watermark_seconds.clone()))?;
        registry.register(Box::new(last_success_seconds.clone()))?;
        registry.register(Box::new(clickhouse_connected.clone()))?;
        registry.register(Box::new(clickhouse_batch_errors.clone()))?;
        registry.register(Box::new(clickhouse_batch_duration.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            runs,
            samples_fetched,
            samples_processed,
            samples_skipped,
            samples_dropped,
            records_persisted,
            run_duration,
            watermark_seconds,
            last_success_seconds,
            clickhouse_connected,
            clickhouse_batch_errors,
            clickhouse_batch_duration,
        })
    }

    /// Renders all metrics in the Prometheus text format.
    pub fn render(&self) -> Result<String> {
        encode_registry(&self.registry)
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    pub async fn start(&self) -> Result<()> {
        let bind_addr = bind_address(&self.addr);

        let app_state = Arc::new(AppState {
            registry: self.registry.clone(),
        });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(())
    }

    /// Gracefully shuts down the health metrics server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

/// Expands the ":port" shorthand to all interfaces.
fn bind_address(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    }
}

fn encode_registry(registry: &Registry) -> Result<String> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&registry.gather(), &mut buffer)
        .context("encoding metrics")?;
    String::from_utf8(buffer).context("converting metrics to string")
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match encode_registry(&state.registry) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "encoding metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registered() {
        let health = HealthMetrics::new(":0").expect("metrics");
        health.runs.with_label_values(&["committed"]).inc();
        health.samples_fetched.inc_by(3.0);
        health.clickhouse_batch_errors.with_label_values(&["aggregated_metrics"]).inc();

        let text = health.render().expect("render");
        assert!(text.contains("metrics_rollup_runs_total{outcome=\"committed\"} 1"));
        assert!(text.contains("metrics_rollup_samples_fetched_total 3"));
        assert!(text.contains("metrics_rollup_clickhouse_batch_errors_total"));
        assert!(text.contains("metrics_rollup_watermark_seconds"));
    }

    #[test]
    fn test_bind_address() {
        assert_eq!(bind_address(":9090"), "0.0.0.0:9090");
        assert_eq!(bind_address("127.0.0.1:9090"), "127.0.0.1:9090");
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let health = HealthMetrics::new("127.0.0.1:0").expect("metrics");
        health.start().await.expect("start");
        health.stop().await.expect("stop");
        // Stopping twice is harmless.
        health.stop().await.expect("stop");
    }
}
