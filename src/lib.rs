pub mod config;
pub mod error;
pub mod export;
pub mod grid;
pub mod jobs;
pub mod migrate;
pub mod reconcile;
pub mod source;
pub mod store;

use std::process::ExitCode;

use chrono::{DateTime, Utc};
use tracing::{error, info};

use crate::config::Config;
use crate::error::{IngestError, IngestResult};
use crate::export::Exporter;
use crate::migrate::{Migrator, SqlMigrator};
use crate::store::{Store, UpsertMerger};

/// A scheduled job invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Job {
    /// Day-ahead prices. Without an explicit window the next delivery day
    /// in the configured time zone is fetched.
    Prices {
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    },
    Telemetry,
    Reconcile,
    Export,
}

impl Job {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Prices { .. } => "prices",
            Self::Telemetry => "telemetry",
            Self::Reconcile => "reconcile",
            Self::Export => "export",
        }
    }
}

/// Runs one job to completion on a single-threaded runtime and maps the
/// outcome to a process exit code.
pub fn run(config: Config, job: Job) -> ExitCode {
    let rt = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "building tokio runtime");
            return ExitCode::FAILURE;
        }
    };

    let name = job.name();
    match rt.block_on(execute(&config, job)) {
        Ok(()) => {
            info!(job = name, "job finished");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!(job = name, error = %err, "job failed");
            eprintln!("gridfeed {name}: {}", error_chain(&err));
            err.exit_code()
        }
    }
}

/// Runs one job against the canonical store.
pub async fn execute(config: &Config, job: Job) -> IngestResult<()> {
    // Job settings are checked before any connection is opened.
    check_job_config(config, &job)?;

    let store = Store::connect(&config.database.url, config.database.timeout).await?;
    let result = execute_with_store(config, &store, job).await;
    let closed = store.close().await;
    result?;
    closed
}

fn check_job_config(config: &Config, job: &Job) -> IngestResult<()> {
    match job {
        Job::Prices { start, end } => {
            config.require_prices()?;
            if start.is_some() != end.is_some() {
                return Err(IngestError::config("--start and --end must be given together"));
            }
        }
        Job::Telemetry => {
            config.require_telemetry()?;
        }
        Job::Reconcile => {
            config.require_snapshots()?;
        }
        Job::Export => {
            config.require_export()?;
        }
    }
    Ok(())
}

async fn execute_with_store(config: &Config, store: &Store, job: Job) -> IngestResult<()> {
    if config.database.migrate_on_start {
        SqlMigrator::new(store.conn())
            .up()
            .await
            .map_err(|e| IngestError::persist("schema_migrations", e))?;
    }

    let merger = UpsertMerger::new(config.database.batch_size);
    let now = Utc::now();

    match job {
        Job::Prices { start, end } => {
            let (start, end) = match (start, end) {
                (Some(start), Some(end)) => (start, end),
                _ => jobs::delivery_day_window(config.tz()?, now)?,
            };
            let client = source::prices::Client::new(config.require_prices()?, config.http_timeout)?;
            let report = jobs::run_prices(&client, store.conn(), &merger, start, end).await?;
            info!(rows = report.rows_written, batches = report.batches, "prices stored");
        }
        Job::Telemetry => {
            let cfg = config.require_telemetry()?;
            let client = source::telemetry::Client::new(cfg, config.http_timeout)?;
            let report = jobs::run_telemetry(&client, store.conn(), &merger, cfg, now).await?;
            info!(rows = report.rows_written, "telemetry stored");
        }
        Job::Reconcile => {
            let (inbox, extension) = config.require_snapshots()?;
            jobs::run_reconcile(
                store.conn(),
                inbox,
                extension,
                merger,
                config.database.timeout,
            )
            .await?;
        }
        Job::Export => {
            let (dir, tables) = config.require_export()?;
            let exporter = Exporter::new(dir, config.export.retention);
            jobs::run_export(store.conn(), &exporter, &tables, now).await?;
        }
    }

    Ok(())
}

/// Formats an error with its full source chain.
pub fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let text = cause.to_string();
        if !message.contains(&text) {
            message.push_str(": ");
            message.push_str(&text);
        }
        source = cause.source();
    }
    message
}
