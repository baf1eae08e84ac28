pub mod health;

use std::sync::Arc;

use anyhow::{Context, Result};
use clickhouse_rs::Pool;

use crate::config::ClickHouseConfig;
use health::HealthMetrics;

/// Owns the ClickHouse native TCP connection pool shared by the stores
/// and the migrator.
///
/// LZ4 compression, pool of 2 to 5 connections.
pub struct ClickHouseClient {
    cfg: ClickHouseConfig,
    pool: Option<Pool>,
    health: Option<Arc<HealthMetrics>>,
}

impl ClickHouseClient {
    /// Creates a client with the given configuration. Nothing is opened
    /// until [`ClickHouseClient::connect`].
    pub fn new(cfg: ClickHouseConfig, health: Option<Arc<HealthMetrics>>) -> Self {
        Self {
            cfg,
            pool: None,
            health,
        }
    }

    /// Opens the connection pool and verifies connectivity with a ping.
    pub async fn connect(&mut self) -> Result<Pool> {
        let dsn = self.build_dsn();
        let pool = Pool::new(dsn);

        let ping = async {
            let mut handle = pool
                .get_handle()
                .await
                .context("opening ClickHouse connection")?;
            handle.ping().await.context("pinging ClickHouse")
        };

        if let Err(e) = ping.await {
            self.set_connected(false);
            return Err(e);
        }

        tracing::info!(
            endpoint = %self.cfg.endpoint,
            database = %self.cfg.database,
            "ClickHouse connected"
        );

        self.set_connected(true);
        self.pool = Some(pool.clone());

        Ok(pool)
    }

    /// Returns the connection pool, if connected.
    pub fn pool(&self) -> Option<&Pool> {
        self.pool.as_ref()
    }

    /// Returns the client configuration.
    pub fn config(&self) -> &ClickHouseConfig {
        &self.cfg
    }

    /// Drops the connection pool.
    pub fn close(&mut self) {
        if self.pool.take().is_some() {
            self.set_connected(false);
            tracing::debug!("ClickHouse pool closed");
        }
    }

    fn set_connected(&self, connected: bool) {
        if let Some(health) = &self.health {
            health
                .clickhouse_connected
                .set(if connected { 1.0 } else { 0.0 });
        }
    }

    /// Builds a clickhouse-rs compatible TCP DSN from configuration.
    ///
    /// Format: `tcp://[user[:pass]@]host:port/database?options`
    fn build_dsn(&self) -> String {
        let mut dsn = "tcp://".to_string();

        if !self.cfg.username.is_empty() {
            dsn.push_str(&self.cfg.username);
            if !self.cfg.password.is_empty() {
                dsn.push(':');
                dsn.push_str(&self.cfg.password);
            }
            dsn.push('@');
        }

        dsn.push_str(&self.cfg.endpoint);
        dsn.push('/');
        dsn.push_str(&self.cfg.database);
        dsn.push_str("?compression=lz4&pool_min=2&pool_max=5");

        dsn
    }
}
