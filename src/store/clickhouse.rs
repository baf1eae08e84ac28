//! ClickHouse-backed stores.
//!
//! Statements are rendered as SQL text and sent over the native protocol,
//! one multi-row INSERT per batch.

use std::fmt::Write;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clickhouse_rs::Pool;

use super::{AggregateStore, SampleSource, WatermarkStore};
use crate::agg::{AggregateRecord, RawSample};
use crate::config::ClickHouseConfig;
use crate::export::health::HealthMetrics;

/// Fully qualified table names derived from configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tables {
    pub raw: String,
    pub aggregate: String,
    pub state: String,
}

impl Tables {
    pub fn from_config(cfg: &ClickHouseConfig) -> Self {
        Self {
            raw: format!("{}.{}", cfg.database, cfg.raw_table),
            aggregate: format!("{}.{}", cfg.database, cfg.aggregate_table),
            state: format!("{}.{}", cfg.database, cfg.state_table),
        }
    }
}

/// Shared pool, table names and health handle.
#[derive(Clone)]
struct Shared {
    pool: Pool,
    tables: Tables,
    health: Option<Arc<HealthMetrics>>,
}

impl Shared {
    fn record_batch_error(&self, table: &str) {
        if let Some(health) = &self.health {
            health
                .clickhouse_batch_errors
                .with_label_values(&[table])
                .inc();
        }
    }

    fn observe_duration(&self, operation: &str, started: Instant) {
        if let Some(health) = &self.health {
            health
                .clickhouse_batch_duration
                .with_label_values(&[operation])
                .observe(started.elapsed().as_secs_f64());
        }
    }
}

/// Builds the three ClickHouse stores over one pool.
pub fn stores(
    pool: Pool,
    cfg: &ClickHouseConfig,
    health: Option<Arc<HealthMetrics>>,
) -> (
    ClickHouseSampleSource,
    ClickHouseAggregateStore,
    ClickHouseWatermarkStore,
) {
    let shared = Shared {
        pool,
        tables: Tables::from_config(cfg),
        health,
    };

    (
        ClickHouseSampleSource {
            shared: shared.clone(),
        },
        ClickHouseAggregateStore {
            shared: shared.clone(),
            batch_size: cfg.batch_size.max(1),
        },
        ClickHouseWatermarkStore { shared },
    )
}

/// Reads raw samples from the raw metrics table.
pub struct ClickHouseSampleSource {
    shared: Shared,
}

impl SampleSource for ClickHouseSampleSource {
    async fn fetch(
        &self,
        since: Option<DateTime<Utc>>,
        until: DateTime<Utc>,
    ) -> Result<Vec<RawSample>> {
        let sql = select_samples_sql(&self.shared.tables.raw, since, until);
        let started = Instant::now();

        let mut handle = self
            .shared
            .pool
            .get_handle()
            .await
            .context("getting handle for sample fetch")?;

        let block = match handle.query(sql.as_str()).fetch_all().await {
            Ok(block) => block,
            Err(e) => {
                self.shared.record_batch_error(&self.shared.tables.raw);
                return Err(e).context("fetching raw samples");
            }
        };
        self.shared.observe_duration("fetch", started);

        let mut samples = Vec::with_capacity(block.row_count());
        for row in block.rows() {
            let server_id: String = row.get("server_id").context("reading server_id")?;
            let metric_type: String = row.get("metric_type").context("reading metric_type")?;
            let ts_ms: i64 = row.get("ts_ms").context("reading ts_ms")?;
            let value: f64 = row.get("metric_value").context("reading metric_value")?;

            let ts = DateTime::<Utc>::from_timestamp_millis(ts_ms)
                .with_context(|| format!("sample timestamp {ts_ms}ms out of range"))?;

            samples.push(RawSample {
                server_id,
                metric_type,
                ts,
                value,
            });
        }

        Ok(samples)
    }
}

/// Writes aggregate records into a ReplacingMergeTree keyed on
/// `(server_id, metric_type, bin_end)`.
pub struct ClickHouseAggregateStore {
    shared: Shared,
    batch_size: usize,
}

impl AggregateStore for ClickHouseAggregateStore {
    async fn upsert(&self, records: &[AggregateRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let updated = format_datetime(Utc::now());
        let table = &self.shared.tables.aggregate;

        for chunk in records.chunks(self.batch_size) {
            let sql = insert_aggregates_sql(table, chunk, &updated);
            let started = Instant::now();

            let mut handle = self
                .shared
                .pool
                .get_handle()
                .await
                .context("getting handle for aggregate insert")?;

            if let Err(e) = handle.execute(sql.as_str()).await {
                self.shared.record_batch_error(table);
                return Err(e)
                    .with_context(|| format!("inserting {} rows into {table}", chunk.len()));
            }
            self.shared.observe_duration("upsert", started);

            tracing::debug!(rows = chunk.len(), table = %table, "aggregate batch written");
        }

        Ok(())
    }
}

/// Singleton watermark row (`id = 1`) in the run state table.
pub struct ClickHouseWatermarkStore {
    shared: Shared,
}

impl WatermarkStore for ClickHouseWatermarkStore {
    async fn get(&self) -> Result<Option<DateTime<Utc>>> {
        let sql = format!(
            "SELECT toUnixTimestamp64Milli(watermark) AS watermark_ms FROM {} FINAL WHERE id = 1",
            self.shared.tables.state
        );

        let mut handle = self
            .shared
            .pool
            .get_handle()
            .await
            .context("getting handle for watermark read")?;

        let block = handle
            .query(sql.as_str())
            .fetch_all()
            .await
            .context("querying watermark")?;

        let Some(row) = block.rows().next() else {
            return Ok(None);
        };

        let ms: i64 = row.get("watermark_ms").context("reading watermark")?;
        let ts = DateTime::<Utc>::from_timestamp_millis(ms)
            .with_context(|| format!("watermark {ms}ms out of range"))?;

        Ok(Some(ts))
    }

    async fn set(&self, ts: DateTime<Utc>) -> Result<()> {
        let table = &self.shared.tables.state;
        let sql = format!(
            "INSERT INTO {table} (id, watermark, updated_date_time) VALUES (1, {}, {})",
            format_datetime(ts),
            format_datetime(Utc::now()),
        );

        let mut handle = self
            .shared
            .pool
            .get_handle()
            .await
            .context("getting handle for watermark write")?;

        if let Err(e) = handle.execute(sql.as_str()).await {
            self.shared.record_batch_error(table);
            return Err(e).context("writing watermark");
        }

        Ok(())
    }
}

fn select_samples_sql(
    table: &str,
    since: Option<DateTime<Utc>>,
    until: DateTime<Utc>,
) -> String {
    let mut sql = String::with_capacity(256);
    let _ = write!(
        sql,
        "SELECT server_id, metric_type, toUnixTimestamp64Milli(ts) AS ts_ms, metric_value \
         FROM {table} WHERE ts <= {}",
        from_millis(until),
    );
    if let Some(since) = since {
        let _ = write!(sql, " AND ts > {}", from_millis(since));
    }
    sql.push_str(" ORDER BY ts");
    sql
}

fn insert_aggregates_sql(table: &str, records: &[AggregateRecord], updated: &str) -> String {
    let columns = "server_id, metric_type, bin_end, avg_value, min_value, max_value, \
                   p90_value, p80_value, sample_count, updated_date_time";

    let mut sql = String::with_capacity(96 + table.len() + columns.len() + records.len() * 160);
    let _ = write!(sql, "INSERT INTO {table} ({columns}) VALUES ");

    for (idx, r) in records.iter().enumerate() {
        if idx > 0 {
            sql.push_str(", ");
        }
        let _ = write!(
            sql,
            "('{}', '{}', {}, {}, {}, {}, {}, {}, {}, {updated})",
            escape_sql(&r.server_id),
            escape_sql(&r.metric_type),
            format_datetime(r.bin_end),
            r.avg,
            r.min,
            r.max,
            r.p90,
            r.p80,
            r.sample_count,
        );
    }

    sql
}

/// Renders a timestamp as a millisecond-exact DateTime64 expression.
fn from_millis(ts: DateTime<Utc>) -> String {
    format!(
        "fromUnixTimestamp64Milli(toInt64({}), 'UTC')",
        ts.timestamp_millis()
    )
}

/// Formats a timestamp as a ClickHouse DateTime64(3) literal.
fn format_datetime(dt: DateTime<Utc>) -> String {
    format!("'{}'", dt.format("%Y-%m-%d %H:%M:%S%.3f"))
}

/// Escapes a string value for SQL insertion (single-quote escaping).
fn escape_sql(s: &str) -> String {
    s.replace('\\', "\\\\").replace('\'', "\\'")
}
