use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use gridfeed::config::Config;
use gridfeed::migrate::{Migrator, SqlMigrator};
use gridfeed::store::Store;
use gridfeed::Job;

/// Scheduled ingestion of grid-aligned energy series.
#[derive(Parser)]
#[command(name = "gridfeed", about)]
struct Cli {
    /// Optional YAML configuration file; GRIDFEED_* variables override it.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Apply pending schema migrations before running the job.
    #[arg(long, global = true)]
    migrate: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Fetch day-ahead prices for the next delivery day.
    Prices {
        /// Window start (RFC 3339). Requires --end.
        #[arg(long, value_parser = parse_utc)]
        start: Option<DateTime<Utc>>,

        /// Window end (RFC 3339), exclusive. Requires --start.
        #[arg(long, value_parser = parse_utc)]
        end: Option<DateTime<Utc>>,
    },
    /// Store the current averaged site telemetry.
    Telemetry,
    /// Drain the snapshot inbox into the canonical sensor log.
    Reconcile,
    /// Write Parquet exports of the canonical tables.
    Export,
    /// Manage the canonical store schema.
    Migrate {
        #[command(subcommand)]
        action: MigrateAction,
    },
    /// Print version information and exit.
    Version,
}

#[derive(Subcommand, Clone, Copy)]
enum MigrateAction {
    /// Apply all pending migrations.
    Up,
    /// Roll back the last applied migration.
    Down,
    /// Print the current version and dirty flag.
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

fn parse_utc(value: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| format!("expected an RFC 3339 timestamp: {e}"))
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Command::Version = cli.command {
        println!("gridfeed {}", version::full());
        return ExitCode::SUCCESS;
    }

    if let Err(err) = init_tracing(&cli.log_level) {
        eprintln!("gridfeed: {err:#}");
        return ExitCode::from(2);
    }

    let mut cfg = match Config::load(cli.config.as_deref()) {
        Ok(cfg) => cfg,
        Err(err) => {
            tracing::error!(error = %err, "loading configuration");
            eprintln!("gridfeed: {}", gridfeed::error_chain(&err));
            return err.exit_code();
        }
    };
    cfg.database.migrate_on_start |= cli.migrate;

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting gridfeed",
    );

    let job = match cli.command {
        Command::Prices { start, end } => Job::Prices { start, end },
        Command::Telemetry => Job::Telemetry,
        Command::Reconcile => Job::Reconcile,
        Command::Export => Job::Export,
        Command::Migrate { action } => {
            return match migrate(&cfg, action) {
                Ok(()) => ExitCode::SUCCESS,
                Err(err) => {
                    tracing::error!(error = %err, "migration failed");
                    eprintln!("gridfeed migrate: {err:#}");
                    ExitCode::FAILURE
                }
            };
        }
        Command::Version => return ExitCode::SUCCESS,
    };

    gridfeed::run(cfg, job)
}

fn init_tracing(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(log_level)
        .with_context(|| format!("invalid log level: {log_level}"))?;

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    Ok(())
}

fn migrate(cfg: &Config, action: MigrateAction) -> Result<()> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async {
        let store = Store::connect(&cfg.database.url, cfg.database.timeout).await?;
        let migrator = SqlMigrator::new(store.conn());
        let result = match action {
            MigrateAction::Up => migrator.up().await,
            MigrateAction::Down => migrator.down().await,
            MigrateAction::Status => migrator.status().await.map(|(version, dirty)| {
                println!("version {version}, dirty {dirty}");
            }),
        };
        store.close().await?;
        result
    })
}
