use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

use metrics_rollup::config::Config;
use metrics_rollup::coordinator::RunOutcome;
use metrics_rollup::service::Service;

/// Rolls raw server metrics up into fixed-interval statistics.
#[derive(Parser)]
#[command(name = "metrics-rollup", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error). Overrides
    /// the config file.
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Perform one aggregation run and exit.
    Run,
    /// Run on a schedule until SIGINT/SIGTERM, serving health metrics.
    Daemon,
    /// Manage the ClickHouse schema.
    Migrate {
        #[command(subcommand)]
        action: MigrateAction,
    },
    /// Print version information and exit.
    Version,
}

#[derive(Subcommand)]
enum MigrateAction {
    /// Apply all pending migrations.
    Up,
    /// Roll back the last applied migration.
    Down,
    /// Print the current schema version and whether it is dirty.
    Status,
}

/// Build-time version info.
mod version {
    /// Release version string (set at build time).
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Command::Version = cli.command {
        println!("metrics-rollup {}", version::full());
        return Ok(());
    }

    let config_path = cli
        .config
        .context("--config is required (use --help for usage)")?;

    let cfg = Config::load(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;

    let log_level = cli.log_level.as_deref().unwrap_or(&cfg.log_level);
    let filter = EnvFilter::try_new(log_level)
        .with_context(|| format!("invalid log level: {log_level}"))?;

    fmt().with_env_filter(filter).with_target(true).init();

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting metrics-rollup",
    );

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async { dispatch(cli.command, cfg).await })
}

async fn dispatch(command: Command, cfg: Config) -> Result<()> {
    let mut service = Service::new(cfg)?;

    match command {
        Command::Run => match service.run_once().await? {
            RunOutcome::LockDenied => {
                tracing::info!("another run holds the lock, nothing to do");
            }
            RunOutcome::Committed(report) => {
                tracing::info!(
                    records = report.records_persisted,
                    watermark = ?report.new_watermark,
                    "run finished",
                );
            }
        },
        Command::Daemon => {
            let cancel = CancellationToken::new();
            tokio::spawn(shutdown_on_signal(cancel.clone()));

            service.run_daemon(cancel).await?;
            tracing::info!("metrics-rollup stopped");
        }
        Command::Migrate { action } => {
            match action {
                MigrateAction::Up => {
                    let applied = service.migrate_up().await?;
                    tracing::info!(applied, "migrations applied");
                }
                MigrateAction::Down => match service.migrate_down().await? {
                    Some(state) => tracing::info!(version = %state, "migration reverted"),
                    None => tracing::info!("no migration to revert"),
                },
                MigrateAction::Status => {
                    let state = service.migrate_status().await?;
                    println!("schema version: {state}");
                }
            }
        }
        Command::Version => {}
    }

    Ok(())
}

/// Cancels `cancel` on SIGINT or SIGTERM.
async fn shutdown_on_signal(cancel: CancellationToken) {
    let ctrl_c = tokio::signal::ctrl_c();
    let mut sigterm =
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                tracing::error!(error = %e, "registering SIGTERM handler");
                let _ = ctrl_c.await;
                cancel.cancel();
                return;
            }
        };

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("received SIGINT, shutting down after the current run");
        }
        _ = sigterm.recv() => {
            tracing::info!("received SIGTERM, shutting down after the current run");
        }
    }

    cancel.cancel();
}
