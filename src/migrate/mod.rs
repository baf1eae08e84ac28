//! Schema setup for the rollup tables.
//!
//! Migrations are embedded SQL templates. Every state change is appended to
//! a ledger table in the target database and the newest ledger row is the
//! current schema state. A migration that stops partway leaves its version
//! marked dirty, and nothing runs against a dirty schema.

use std::fmt;
use std::future::Future;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clickhouse_rs::Pool;
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::config::ClickHouseConfig;
use crate::store::RunLock;

/// Ledger table created next to the rollup tables.
const LEDGER_TABLE: &str = "rollup_schema";

struct Migration {
    version: u32,
    name: &'static str,
    up: &'static str,
    down: &'static str,
}

/// Ordered by version.
static MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    name: "init",
    up: include_str!("sql/001_init.up.sql"),
    down: include_str!("sql/001_init.down.sql"),
}];

/// Latest recorded schema version. Version 0 means nothing was applied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchemaState {
    pub version: u32,
    pub dirty: bool,
}

impl fmt::Display for SchemaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.dirty {
            write!(f, "{} (dirty)", self.version)
        } else {
            write!(f, "{}", self.version)
        }
    }
}

/// Where schema statements run and where the ledger lives.
pub trait SchemaBackend: Send + Sync {
    /// Newest ledger entry, or the default state if there is none.
    fn state(&self) -> impl Future<Output = Result<SchemaState>> + Send;

    /// Appends `state` to the ledger.
    fn record(&self, state: SchemaState) -> impl Future<Output = Result<()>> + Send;

    /// Executes one DDL statement.
    fn execute(&self, statement: &str) -> impl Future<Output = Result<()>> + Send;
}

/// Placeholder values for the SQL templates.
#[derive(Debug, Clone)]
struct SchemaNames {
    database: String,
    raw_table: String,
    aggregate_table: String,
    state_table: String,
}

impl SchemaNames {
    fn from_config(cfg: &ClickHouseConfig) -> Self {
        Self {
            database: cfg.database.clone(),
            raw_table: cfg.raw_table.clone(),
            aggregate_table: cfg.aggregate_table.clone(),
            state_table: cfg.state_table.clone(),
        }
    }

    fn render(&self, template: &str) -> String {
        template
            .replace("{database}", &self.database)
            .replace("{raw_table}", &self.raw_table)
            .replace("{aggregate_table}", &self.aggregate_table)
            .replace("{state_table}", &self.state_table)
    }
}

/// Applies and reverts the embedded migrations against a [`SchemaBackend`].
pub struct Migrator<B> {
    backend: B,
    names: SchemaNames,
}

impl<B: SchemaBackend> Migrator<B> {
    pub fn new(backend: B, cfg: &ClickHouseConfig) -> Self {
        Self {
            backend,
            names: SchemaNames::from_config(cfg),
        }
    }

    pub async fn status(&self) -> Result<SchemaState> {
        self.backend.state().await
    }

    /// Applies every migration newer than the recorded version and returns
    /// how many ran.
    pub async fn up(&self) -> Result<usize> {
        let current = self.clean_state().await?;

        let mut applied = 0;
        for migration in MIGRATIONS.iter().filter(|m| m.version > current.version) {
            self.step(migration, migration.up, migration.version).await?;
            applied += 1;
        }

        if applied == 0 {
            info!(version = current.version, "schema up to date");
        }
        Ok(applied)
    }

    /// Reverts the newest applied migration. Returns the resulting state, or
    /// `None` if nothing was applied.
    pub async fn down(&self) -> Result<Option<SchemaState>> {
        let current = self.clean_state().await?;
        if current.version == 0 {
            info!("no migrations to revert");
            return Ok(None);
        }

        let idx = MIGRATIONS
            .iter()
            .position(|m| m.version == current.version)
            .with_context(|| format!("schema version {} is not embedded here", current.version))?;
        let target = idx
            .checked_sub(1)
            .map_or(0, |prev| MIGRATIONS[prev].version);

        let migration = &MIGRATIONS[idx];
        self.step(migration, migration.down, target).await?;

        Ok(Some(SchemaState {
            version: target,
            dirty: false,
        }))
    }

    /// Runs [`Migrator::up`] while holding the run lock, so no run touches
    /// the tables mid-migration. Returns `None` without migrating when the
    /// lock is held elsewhere.
    pub async fn up_locked<L: RunLock>(&self, lock: &L, lock_id: u64) -> Result<Option<usize>> {
        under_lock(lock, lock_id, self.up()).await
    }

    /// Runs [`Migrator::down`] while holding the run lock.
    pub async fn down_locked<L: RunLock>(
        &self,
        lock: &L,
        lock_id: u64,
    ) -> Result<Option<Option<SchemaState>>> {
        under_lock(lock, lock_id, self.down()).await
    }

    async fn clean_state(&self) -> Result<SchemaState> {
        let state = self.backend.state().await.context("reading schema state")?;
        if state.dirty {
            bail!(
                "schema version {} is dirty after an interrupted migration and must be repaired by hand",
                state.version
            );
        }
        Ok(state)
    }

    /// Marks `migration` dirty, runs `template`, then records `target` clean.
    async fn step(&self, migration: &Migration, template: &str, target: u32) -> Result<()> {
        let id = format!("{:03}_{}", migration.version, migration.name);
        info!(migration = %id, target, "migrating schema");

        self.backend
            .record(SchemaState {
                version: migration.version,
                dirty: true,
            })
            .await
            .context("marking schema dirty")?;

        let sql = self.names.render(template);
        for statement in statements(&sql) {
            self.backend.execute(&statement).await.with_context(|| {
                format!(
                    "migration {id} failed on: {}",
                    statement.lines().next().unwrap_or_default(),
                )
            })?;
        }

        self.backend
            .record(SchemaState {
                version: target,
                dirty: false,
            })
            .await
            .context("recording schema version")
    }
}

async fn under_lock<L, T>(
    lock: &L,
    lock_id: u64,
    work: impl Future<Output = Result<T>>,
) -> Result<Option<T>>
where
    L: RunLock,
{
    if !lock
        .try_acquire(lock_id)
        .await
        .context("acquiring run lock for migrations")?
    {
        return Ok(None);
    }

    let result = work.await;
    let released = lock.release(lock_id).await;

    match result {
        Ok(value) => {
            released.context("releasing run lock after migrations")?;
            Ok(Some(value))
        }
        Err(e) => {
            if let Err(release_err) = released {
                warn!(
                    error = %format!("{release_err:#}"),
                    lock_id, "releasing run lock after a failed migration",
                );
            }
            Err(e)
        }
    }
}

/// Statements in a rendered template. Lines starting with `--` are dropped.
fn statements(sql: &str) -> Vec<String> {
    let body = sql
        .lines()
        .filter(|line| !line.trim_start().starts_with("--"))
        .collect::<Vec<_>>()
        .join("\n");

    body.split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Ledger and DDL over a ClickHouse pool.
pub struct ClickHouseSchema {
    pool: Pool,
    ledger: String,
    last_seq: Mutex<i64>,
}

impl ClickHouseSchema {
    pub fn new(pool: Pool, cfg: &ClickHouseConfig) -> Self {
        Self {
            pool,
            ledger: format!("{}.{LEDGER_TABLE}", cfg.database),
            last_seq: Mutex::new(0),
        }
    }

    /// Strictly increasing within this process, so a dirty mark and its
    /// clean follow-up never tie.
    fn next_seq(&self) -> i64 {
        let mut last = self.last_seq.lock();
        *last = Utc::now().timestamp_micros().max(*last + 1);
        *last
    }
}

impl SchemaBackend for ClickHouseSchema {
    async fn state(&self) -> Result<SchemaState> {
        let mut handle = self
            .pool
            .get_handle()
            .await
            .context("getting handle for schema state")?;

        handle
            .execute(create_ledger_sql(&self.ledger).as_str())
            .await
            .with_context(|| format!("creating {}", self.ledger))?;

        let sql = format!(
            "SELECT version, dirty FROM {} ORDER BY seq DESC LIMIT 1",
            self.ledger
        );
        let block = handle
            .query(sql.as_str())
            .fetch_all()
            .await
            .context("querying schema state")?;

        let Some(row) = block.rows().next() else {
            return Ok(SchemaState::default());
        };

        let version: u32 = row.get("version").context("reading version")?;
        let dirty: u8 = row.get("dirty").context("reading dirty")?;
        Ok(SchemaState {
            version,
            dirty: dirty != 0,
        })
    }

    async fn record(&self, state: SchemaState) -> Result<()> {
        let sql = format!(
            "INSERT INTO {} (seq, version, dirty, recorded_at) VALUES ({}, {}, {}, now64(3))",
            self.ledger,
            self.next_seq(),
            state.version,
            u8::from(state.dirty),
        );

        let mut handle = self
            .pool
            .get_handle()
            .await
            .context("getting handle for schema ledger")?;

        handle
            .execute(sql.as_str())
            .await
            .with_context(|| format!("recording schema state {state}"))?;
        Ok(())
    }

    async fn execute(&self, statement: &str) -> Result<()> {
        let mut handle = self
            .pool
            .get_handle()
            .await
            .context("getting handle for migration")?;

        handle.execute(statement).await?;
        Ok(())
    }
}

fn create_ledger_sql(ledger: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {ledger} (\
         seq Int64, version UInt32, dirty UInt8, recorded_at DateTime64(3, 'UTC')\
         ) ENGINE = MergeTree ORDER BY seq"
    )
}
