//! One entry point per scheduled job. Each job is a single sequential unit
//! of work: fetch, expand onto the grid, merge.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Days, LocalResult, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use sea_orm::sea_query::Value;
use sea_orm::{ConnectionTrait, DatabaseConnection};
use tracing::info;

use crate::config::TelemetryConfig;
use crate::error::{IngestError, IngestResult};
use crate::export::{ExportReport, Exporter};
use crate::grid::{self, floor_to_grid};
use crate::reconcile::{ReconcileReport, SnapshotReconciler};
use crate::source::{PriceSource, TelemetrySource};
use crate::store::tables::{SeriesTable, DAY_AHEAD_PRICES, SITE_TELEMETRY};
use crate::store::{ConflictPolicy, MergeReport, StoreRow, UpsertMerger, ValueColumn};

/// UTC bounds of the delivery day following `now` in `tz`.
///
/// Local midnights that fall into a DST gap resolve to the first instant
/// after the gap; ambiguous ones to the earlier instant.
pub fn delivery_day_window(tz: Tz, now: DateTime<Utc>) -> IngestResult<(DateTime<Utc>, DateTime<Utc>)> {
    let today = now.with_timezone(&tz).date_naive();
    let next = |day: NaiveDate| {
        day.checked_add_days(Days::new(1))
            .ok_or_else(|| IngestError::config(format!("no day after {day}")))
    };
    let start_day = next(today)?;
    let end_day = next(start_day)?;
    Ok((local_midnight(tz, start_day)?, local_midnight(tz, end_day)?))
}

fn local_midnight(tz: Tz, day: NaiveDate) -> IngestResult<DateTime<Utc>> {
    let midnight = day.and_time(chrono::NaiveTime::MIN);
    resolve_local(tz, midnight)
        .or_else(|| {
            // Skip forward out of a DST gap.
            (1..=4)
                .map(|q| midnight + chrono::Duration::minutes(15 * q))
                .find_map(|t| resolve_local(tz, t))
        })
        .ok_or_else(|| IngestError::config(format!("{day} has no local midnight in {tz}")))
}

fn resolve_local(tz: Tz, local: NaiveDateTime) -> Option<DateTime<Utc>> {
    match tz.from_local_datetime(&local) {
        LocalResult::Single(t) | LocalResult::Ambiguous(t, _) => Some(t.with_timezone(&Utc)),
        LocalResult::None => None,
    }
}

/// Fetches day-ahead prices for `[start, end)` and merges them with
/// `Overwrite`, so republished prices replace earlier ones.
pub async fn run_prices<S, C>(
    source: &S,
    conn: &C,
    merger: &UpsertMerger,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> IngestResult<MergeReport>
where
    S: PriceSource,
    C: ConnectionTrait,
{
    info!(%start, %end, "running prices job");

    let periods = source.fetch_periods(start, end).await?;
    let rows = grid::expand("day-ahead prices", &periods, start, end)?;

    let rows: Vec<StoreRow> = rows
        .into_iter()
        .map(|row| StoreRow::new(row.ts, vec![Value::from(row.value)]))
        .collect();

    merger
        .merge(conn, &DAY_AHEAD_PRICES, &["price"], rows, ConflictPolicy::Overwrite)
        .await
}

/// Fetches averaged telemetry and stores one row keyed at `now` floored to
/// the grid.
pub async fn run_telemetry<S, C>(
    source: &S,
    conn: &C,
    merger: &UpsertMerger,
    cfg: &TelemetryConfig,
    now: DateTime<Utc>,
) -> IngestResult<MergeReport>
where
    S: TelemetrySource,
    C: ConnectionTrait,
{
    let columns = static_columns(&SITE_TELEMETRY, &cfg.columns)?;
    let ts = floor_to_grid(now);
    info!(%ts, window_secs = cfg.window.as_secs(), columns = columns.len(), "running telemetry job");

    let averages = source.fetch_averages(cfg.window, &columns).await?;
    if !averages.has_data() {
        return Err(IngestError::NoDataAvailable { what: "telemetry" });
    }
    if averages.values.len() != columns.len() {
        return Err(IngestError::parse(
            "telemetry response",
            format!(
                "{} values for {} requested columns",
                averages.values.len(),
                columns.len()
            ),
        ));
    }

    let values = columns
        .iter()
        .zip(averages.values)
        .map(|(column, reading)| reading.map_or_else(|| column.kind.null(), Value::from))
        .collect();
    let names: Vec<&'static str> = columns.iter().map(|c| c.name).collect();
    merger
        .merge(
            conn,
            &SITE_TELEMETRY,
            &names,
            vec![StoreRow::new(ts, values)],
            ConflictPolicy::Overwrite,
        )
        .await
}

/// Drains the snapshot inbox. Fails with the first snapshot error once every
/// snapshot was attempted.
pub async fn run_reconcile(
    conn: &DatabaseConnection,
    inbox: &Path,
    extension: &str,
    merger: UpsertMerger,
    open_timeout: Duration,
) -> IngestResult<ReconcileReport> {
    SnapshotReconciler::new(inbox, extension, merger, open_timeout)
        .run(conn)
        .await?
        .into_result()
}

/// Exports each table in turn, stopping at the first failure.
pub async fn run_export<C: ConnectionTrait>(
    conn: &C,
    exporter: &Exporter,
    tables: &[&'static SeriesTable],
    now: DateTime<Utc>,
) -> IngestResult<Vec<ExportReport>> {
    info!(dir = %exporter.dir().display(), tables = tables.len(), "running export job");
    let mut reports = Vec::with_capacity(tables.len());
    for table in tables {
        reports.push(exporter.export_table(conn, table, now).await?);
    }
    Ok(reports)
}

fn static_columns(
    table: &'static SeriesTable,
    names: &[String],
) -> IngestResult<Vec<&'static ValueColumn>> {
    names
        .iter()
        .map(|name| {
            table
                .columns
                .iter()
                .find(|c| c.name == name)
                .ok_or_else(|| IngestError::config(format!("unknown {} column {name:?}", table.name)))
        })
        .collect()
}
