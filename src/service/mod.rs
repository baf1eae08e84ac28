use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::clock::SystemClock;
use crate::config::Config;
use crate::coordinator::scheduler::run_scheduled;
use crate::coordinator::{RunCoordinator, RunOutcome, RunSettings};
use crate::export::health::HealthMetrics;
use crate::export::ClickHouseClient;
use crate::lock::FileRunLock;
use crate::migrate::{ClickHouseSchema, Migrator, SchemaState};
use crate::store::clickhouse::{
    self, ClickHouseAggregateStore, ClickHouseSampleSource, ClickHouseWatermarkStore,
};

/// Coordinator wired to ClickHouse and the file lock.
pub type ClickHouseCoordinator = RunCoordinator<
    ClickHouseSampleSource,
    ClickHouseAggregateStore,
    ClickHouseWatermarkStore,
    FileRunLock,
    SystemClock,
>;

/// Wires configuration to ClickHouse, the run lock, and the health server.
pub struct Service {
    cfg: Config,
    health: Arc<HealthMetrics>,
    client: ClickHouseClient,
}

impl Service {
    /// Creates the service and its health metrics. Nothing is connected yet.
    pub fn new(cfg: Config) -> Result<Self> {
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);
        let client = ClickHouseClient::new(cfg.clickhouse.clone(), Some(Arc::clone(&health)));

        Ok(Self {
            cfg,
            health,
            client,
        })
    }

    pub fn health(&self) -> &Arc<HealthMetrics> {
        &self.health
    }

    /// Performs a single coordinated run and disconnects.
    pub async fn run_once(&mut self) -> Result<RunOutcome> {
        let coordinator = self.connect().await?;
        let outcome = coordinator.run_once().await;
        self.client.close();
        outcome
    }

    /// Runs on the configured schedule until `cancel` fires, serving health
    /// metrics meanwhile.
    pub async fn run_daemon(&mut self, cancel: CancellationToken) -> Result<()> {
        // Start health first so probes respond while connecting.
        if !self.cfg.health.addr.is_empty() {
            self.health
                .start()
                .await
                .context("starting health metrics server")?;
        }

        let result = self.schedule(cancel).await;

        self.client.close();
        self.health.stop().await?;

        result
    }

    /// Applies pending migrations under the run lock and returns how many ran.
    pub async fn migrate_up(&mut self) -> Result<usize> {
        let migrator = self.migrator().await?;
        let applied = migrator.up_locked(&self.run_lock(), self.cfg.lock.id).await;
        self.client.close();

        applied?.context("run lock is held by another process, migrations not applied")
    }

    /// Reverts the newest migration under the run lock.
    pub async fn migrate_down(&mut self) -> Result<Option<SchemaState>> {
        let migrator = self.migrator().await?;
        let reverted = migrator.down_locked(&self.run_lock(), self.cfg.lock.id).await;
        self.client.close();

        reverted?.context("run lock is held by another process, nothing reverted")
    }

    pub async fn migrate_status(&mut self) -> Result<SchemaState> {
        let state = self.migrator().await?.status().await;
        self.client.close();
        state
    }

    async fn migrator(&mut self) -> Result<Migrator<ClickHouseSchema>> {
        let pool = self.client.connect().await?;
        let schema = ClickHouseSchema::new(pool, &self.cfg.clickhouse);
        Ok(Migrator::new(schema, &self.cfg.clickhouse))
    }

    fn run_lock(&self) -> FileRunLock {
        FileRunLock::new(self.cfg.lock.dir.clone())
    }

    async fn schedule(&mut self, cancel: CancellationToken) -> Result<()> {
        let coordinator = self.connect().await?;
        let period = self.cfg.schedule.period(&self.cfg.aggregation);

        run_scheduled(&coordinator, period, self.cfg.schedule.delay, cancel).await;

        Ok(())
    }

    async fn connect(&mut self) -> Result<ClickHouseCoordinator> {
        let pool = self.client.connect().await?;
        let lock = self.run_lock();

        if self.cfg.clickhouse.migrations.enabled {
            let migrator = Migrator::new(
                ClickHouseSchema::new(pool.clone(), &self.cfg.clickhouse),
                &self.cfg.clickhouse,
            );
            match migrator
                .up_locked(&lock, self.cfg.lock.id)
                .await
                .context("applying ClickHouse migrations")?
            {
                Some(applied) => info!(applied, "ClickHouse schema ready"),
                None => info!("run lock held elsewhere, leaving migrations to its holder"),
            }
        }

        let (source, store, watermark) =
            clickhouse::stores(pool, &self.cfg.clickhouse, Some(Arc::clone(&self.health)));

        info!(
            interval = ?self.cfg.aggregation.interval,
            lock_id = self.cfg.lock.id,
            lock_dir = %self.cfg.lock.dir.display(),
            "run coordinator ready",
        );

        Ok(RunCoordinator::new(
            source,
            store,
            watermark,
            lock,
            SystemClock,
            RunSettings::from_config(&self.cfg),
        )
        .with_health(Arc::clone(&self.health)))
    }
}
