use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Top-level configuration for the rollup job.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (trace, debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Binning and validation settings.
    #[serde(default)]
    pub aggregation: AggregationConfig,

    /// Exclusive run lock settings.
    #[serde(default)]
    pub lock: LockConfig,

    /// Periodic scheduling used by the daemon command.
    #[serde(default)]
    pub schedule: ScheduleConfig,

    /// ClickHouse connection and table configuration.
    #[serde(default)]
    pub clickhouse: ClickHouseConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// Binning and validation settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AggregationConfig {
    /// Bin width. Must be a whole number of seconds. Default: 5m.
    #[serde(default = "default_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// What to do with samples whose value is not a finite number.
    #[serde(default)]
    pub invalid_samples: InvalidSamplePolicy,
}

/// Handling of malformed samples.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidSamplePolicy {
    /// Log, count and leave the sample out of the statistics.
    #[default]
    Skip,
    /// Abort the run without advancing the watermark.
    Fail,
}

/// Exclusive run lock settings.
#[derive(Debug, Clone, Deserialize)]
pub struct LockConfig {
    /// Lock identifier shared by every instance of the job. Default: 987654.
    #[serde(default = "default_lock_id")]
    pub id: u64,

    /// Directory holding the lock file. Default: the system temp directory.
    #[serde(default = "default_lock_dir")]
    pub dir: PathBuf,
}

/// Periodic scheduling used by the daemon command.
#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleConfig {
    /// Time between runs. Defaults to the aggregation interval.
    #[serde(default, with = "humantime_serde")]
    pub every: Option<Duration>,

    /// Offset after each boundary before a run starts, giving late samples a
    /// chance to land. Default: 10s.
    #[serde(default = "default_schedule_delay", with = "humantime_serde")]
    pub delay: Duration,
}

/// ClickHouse connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ClickHouseConfig {
    /// ClickHouse native protocol address (host:port).
    #[serde(default)]
    pub endpoint: String,

    /// Target database name. Default: "default".
    #[serde(default = "default_database")]
    pub database: String,

    /// ClickHouse username.
    #[serde(default)]
    pub username: String,

    /// ClickHouse password.
    #[serde(default)]
    pub password: String,

    /// Raw sample table. Default: "metrics".
    #[serde(default = "default_raw_table")]
    pub raw_table: String,

    /// Aggregate table. Default: "aggregated_metrics".
    #[serde(default = "default_aggregate_table")]
    pub aggregate_table: String,

    /// Watermark table. Default: "run_state".
    #[serde(default = "default_state_table")]
    pub state_table: String,

    /// Aggregate rows per insert. Default: 1000.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Schema migration configuration.
    #[serde(default)]
    pub migrations: MigrationsConfig,
}

/// Schema migration behavior configuration.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct MigrationsConfig {
    /// Run migrations before the first run. Default: false.
    #[serde(default)]
    pub enabled: bool,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Deserialize)]
pub struct HealthConfig {
    /// Listen address. Empty disables the server. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_interval() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_lock_id() -> u64 {
    987_654
}

fn default_lock_dir() -> PathBuf {
    std::env::temp_dir()
}

fn default_schedule_delay() -> Duration {
    Duration::from_secs(10)
}

fn default_database() -> String {
    "default".to_string()
}

fn default_raw_table() -> String {
    "metrics".to_string()
}

fn default_aggregate_table() -> String {
    "aggregated_metrics".to_string()
}

fn default_state_table() -> String {
    "run_state".to_string()
}

fn default_batch_size() -> usize {
    1000
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            aggregation: AggregationConfig::default(),
            lock: LockConfig::default(),
            schedule: ScheduleConfig::default(),
            clickhouse: ClickHouseConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            interval: default_interval(),
            invalid_samples: InvalidSamplePolicy::default(),
        }
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            id: default_lock_id(),
            dir: default_lock_dir(),
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            every: None,
            delay: default_schedule_delay(),
        }
    }
}

impl Default for ClickHouseConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            database: default_database(),
            username: String::new(),
            password: String::new(),
            raw_table: default_raw_table(),
            aggregate_table: default_aggregate_table(),
            state_table: default_state_table(),
            batch_size: default_batch_size(),
            migrations: MigrationsConfig::default(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            addr: default_health_addr(),
        }
    }
}

// --- Validation and loading ---

impl ScheduleConfig {
    /// Returns the effective time between runs.
    pub fn period(&self, aggregation: &AggregationConfig) -> Duration {
        self.every.unwrap_or(aggregation.interval)
    }
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        Self::from_yaml(&data).with_context(|| format!("parsing config file {}", path.display()))
    }

    /// Parse and validate configuration from YAML text.
    pub fn from_yaml(data: &str) -> Result<Self> {
        let cfg: Config = serde_yaml::from_str(data).context("decoding YAML")?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        let interval = self.aggregation.interval;
        if interval.is_zero() {
            bail!("aggregation.interval must be positive");
        }
        if interval.subsec_nanos() != 0 {
            bail!("aggregation.interval must be a whole number of seconds, got {interval:?}");
        }

        if self.schedule.period(&self.aggregation).is_zero() {
            bail!("schedule.every must be positive");
        }
        if self.schedule.delay >= self.schedule.period(&self.aggregation) {
            bail!("schedule.delay must be shorter than schedule.every");
        }

        if self.lock.dir.as_os_str().is_empty() {
            bail!("lock.dir must not be empty");
        }

        if self.clickhouse.endpoint.is_empty() {
            bail!("clickhouse.endpoint is required");
        }
        if self.clickhouse.database.is_empty() {
            bail!("clickhouse.database is required");
        }
        for (name, table) in [
            ("database", &self.clickhouse.database),
            ("raw_table", &self.clickhouse.raw_table),
            ("aggregate_table", &self.clickhouse.aggregate_table),
            ("state_table", &self.clickhouse.state_table),
        ] {
            if !is_identifier(table) {
                bail!("clickhouse.{name} is not a valid identifier: {table:?}");
            }
        }
        if self.clickhouse.batch_size == 0 {
            bail!("clickhouse.batch_size must be positive");
        }

        Ok(())
    }
}

/// Returns true for plain SQL identifiers (letters, digits, underscore).
fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
