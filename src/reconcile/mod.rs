//! Drains the snapshot inbox into the canonical `weather` table.
//!
//! Each snapshot is an immutable SQLite file. A snapshot moves through
//! `Pending -> Read -> Merged -> Relocated`, or `Pending -> Skipped ->
//! Relocated` when it does not carry a usable `weather` table. Moving the
//! file into `<inbox>/processed/` is the commit point: anything that fails
//! before it leaves the file in the inbox for the next run, and because the
//! merge never overwrites stored rows, replaying a half-processed file is
//! harmless.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};
use sea_orm::sea_query::Value;
use sea_orm::{ConnectionTrait, DatabaseConnection, QueryResult, Statement};
use tracing::{info, warn};

use crate::error::{IngestError, IngestResult};
use crate::store::tables::{KEY_COLUMN, WEATHER};
use crate::store::{self, ColumnKind, ConflictPolicy, StoreRow, UpsertMerger, ValueColumn};

/// Name of the subdirectory holding relocated snapshots.
pub const PROCESSED_DIR: &str = "processed";

/// What happened to one snapshot that reached the processed directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotOutcome {
    Merged { rows: usize, written: u64 },
    Skipped { reason: String },
}

/// Summary of one inbox drain.
#[derive(Debug, Default)]
pub struct ReconcileReport {
    pub merged: usize,
    pub skipped: usize,
    pub rows_written: u64,
    /// Snapshots left in the inbox, with the error that stopped them.
    pub failures: Vec<(PathBuf, IngestError)>,
}

impl ReconcileReport {
    pub fn failed(&self) -> usize {
        self.failures.len()
    }

    /// Converts the report into the invocation result: the first failure,
    /// if any snapshot failed.
    pub fn into_result(self) -> IngestResult<Self> {
        if self.failures.is_empty() {
            return Ok(self);
        }
        let mut failures = self.failures;
        let (_, first) = failures.remove(0);
        Err(first)
    }
}

pub struct SnapshotReconciler {
    inbox: PathBuf,
    extension: String,
    merger: UpsertMerger,
    open_timeout: Duration,
}

impl SnapshotReconciler {
    pub fn new(
        inbox: impl Into<PathBuf>,
        extension: impl Into<String>,
        merger: UpsertMerger,
        open_timeout: Duration,
    ) -> Self {
        Self {
            inbox: inbox.into(),
            extension: extension.into().trim_start_matches('.').to_string(),
            merger,
            open_timeout,
        }
    }

    pub fn processed_dir(&self) -> PathBuf {
        self.inbox.join(PROCESSED_DIR)
    }

    /// Snapshot files waiting in the inbox, in name order.
    pub fn pending(&self) -> IngestResult<Vec<PathBuf>> {
        let entries = fs::read_dir(&self.inbox).map_err(|e| {
            IngestError::persist(
                "snapshot inbox",
                anyhow::Error::new(e).context(format!("listing {}", self.inbox.display())),
            )
        })?;

        let mut files = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| IngestError::persist("snapshot inbox", e))?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            if path.extension().and_then(|ext| ext.to_str()) != Some(self.extension.as_str()) {
                continue;
            }
            files.push(path);
        }
        files.sort();
        Ok(files)
    }

    /// Processes every pending snapshot.
    ///
    /// A failing snapshot does not stop the drain; failures are collected in
    /// the report. Only an unreadable inbox fails the call itself.
    pub async fn run(&self, conn: &DatabaseConnection) -> IngestResult<ReconcileReport> {
        let pending = self.pending()?;
        let processed = self.processed_dir();
        fs::create_dir_all(&processed).map_err(|e| {
            IngestError::persist(
                "snapshot inbox",
                anyhow::Error::new(e).context(format!("creating {}", processed.display())),
            )
        })?;

        info!(inbox = %self.inbox.display(), pending = pending.len(), "draining snapshot inbox");

        let mut report = ReconcileReport::default();
        for path in pending {
            match self.process(conn, &path).await {
                Ok(SnapshotOutcome::Merged { rows, written }) => {
                    info!(snapshot = %path.display(), rows, written, "snapshot merged");
                    report.merged += 1;
                    report.rows_written += written;
                }
                Ok(SnapshotOutcome::Skipped { reason }) => {
                    warn!(snapshot = %path.display(), %reason, "snapshot skipped");
                    report.skipped += 1;
                }
                Err(err) => {
                    warn!(snapshot = %path.display(), error = %err, "snapshot left in inbox");
                    report.failures.push((path, err));
                }
            }
        }

        info!(
            merged = report.merged,
            skipped = report.skipped,
            failed = report.failed(),
            rows_written = report.rows_written,
            "snapshot inbox drained"
        );

        Ok(report)
    }

    /// Reads, merges and relocates a single snapshot.
    pub async fn process(&self, conn: &DatabaseConnection, path: &Path) -> IngestResult<SnapshotOutcome> {
        let label = snapshot_label(path);
        let snapshot = store::open_read_only(path, self.open_timeout)
            .await
            .map_err(|e| IngestError::persist(label.clone(), e))?;

        let outcome = self.merge_snapshot(conn, &snapshot).await;
        // Closed on every path; the file must not be held open while it moves.
        let closed = snapshot.close().await;
        let outcome = outcome?;
        closed.map_err(|e| IngestError::persist(label, e))?;

        self.relocate(path)?;
        Ok(outcome)
    }

    async fn merge_snapshot(
        &self,
        conn: &DatabaseConnection,
        snapshot: &DatabaseConnection,
    ) -> IngestResult<SnapshotOutcome> {
        let columns = snapshot_columns(snapshot).await?;
        if columns.is_empty() {
            return Ok(SnapshotOutcome::Skipped {
                reason: format!("no {} table", WEATHER.name),
            });
        }
        if !columns.iter().any(|c| c == KEY_COLUMN) {
            return Ok(SnapshotOutcome::Skipped {
                reason: format!("{} has no {KEY_COLUMN} column", WEATHER.name),
            });
        }

        let rows = read_snapshot_rows(snapshot, &columns).await?;
        let count = rows.len();
        let report = self
            .merger
            .merge(
                conn,
                &WEATHER,
                &WEATHER.column_names(),
                rows,
                ConflictPolicy::KeepExisting,
            )
            .await?;

        Ok(SnapshotOutcome::Merged {
            rows: count,
            written: report.rows_written,
        })
    }

    fn relocate(&self, path: &Path) -> IngestResult<()> {
        let Some(name) = path.file_name() else {
            return Err(IngestError::persist(
                "snapshot inbox",
                anyhow::anyhow!("snapshot path {} has no file name", path.display()),
            ));
        };
        let target = self.processed_dir().join(name);
        fs::rename(path, &target).map_err(|e| {
            IngestError::persist(
                "snapshot inbox",
                anyhow::Error::new(e).context(format!(
                    "moving {} to {}",
                    path.display(),
                    target.display()
                )),
            )
        })
    }
}

fn snapshot_label(path: &Path) -> String {
    format!("snapshot {}", path.display())
}

/// Column names of the snapshot's `weather` table; empty when the table
/// does not exist.
async fn snapshot_columns(snapshot: &DatabaseConnection) -> IngestResult<Vec<String>> {
    let sql = format!("SELECT name FROM pragma_table_info('{}')", WEATHER.name);
    let rows = snapshot
        .query_all(Statement::from_string(snapshot.get_database_backend(), sql))
        .await
        .map_err(|e| IngestError::persist("snapshot schema", e))?;

    rows.iter()
        .map(|row| {
            row.try_get::<String>("", "name")
                .map_err(|e| IngestError::persist("snapshot schema", e))
        })
        .collect()
}

/// Reads every snapshot row as text. Columns the snapshot lacks read as
/// NULL; columns it has beyond the canonical set are ignored.
async fn read_snapshot_rows(snapshot: &DatabaseConnection, columns: &[String]) -> IngestResult<Vec<StoreRow>> {
    let selected: Vec<String> = WEATHER
        .columns
        .iter()
        .map(|column| {
            let name = column.name;
            if columns.iter().any(|c| c == name) {
                format!("CAST({name} AS TEXT) AS {name}")
            } else {
                format!("NULL AS {name}")
            }
        })
        .collect();
    let sql = format!(
        "SELECT CAST(ts AS TEXT) AS ts, typeof(ts) AS ts_type, {} FROM {}",
        selected.join(", "),
        WEATHER.name,
    );

    let rows = snapshot
        .query_all(Statement::from_string(snapshot.get_database_backend(), sql))
        .await
        .map_err(|e| IngestError::persist("snapshot rows", e))?;

    rows.iter().map(decode_snapshot_row).collect()
}

fn decode_snapshot_row(row: &QueryResult) -> IngestResult<StoreRow> {
    let text = |col: &str| {
        row.try_get::<Option<String>>("", col)
            .map_err(|e| IngestError::parse("snapshot row", format!("column {col}: {e}")))
    };

    let ts_type = text("ts_type")?.unwrap_or_default();
    let ts_text = text("ts")?
        .ok_or_else(|| IngestError::parse("snapshot row", "row without ts"))?;
    let ts = decode_snapshot_ts(&ts_text, &ts_type)?;

    let values = WEATHER
        .columns
        .iter()
        .map(|column| {
            let cell = text(column.name)?;
            decode_snapshot_value(column, cell).map_err(|reason| {
                IngestError::parse("snapshot row", format!("{} at {ts}: {reason}", column.name))
            })
        })
        .collect::<IngestResult<Vec<_>>>()?;

    Ok(StoreRow::new(ts, values))
}

/// Converts one snapshot cell, read as text, into a value of the column's
/// kind. Empty cells are NULL.
pub fn decode_snapshot_value(column: &ValueColumn, cell: Option<String>) -> Result<Value, String> {
    let Some(cell) = cell.filter(|c| !c.trim().is_empty()) else {
        return Ok(column.kind.null());
    };
    let raw = cell.trim();
    match column.kind {
        ColumnKind::Double => raw
            .parse::<f64>()
            .map(Value::from)
            .map_err(|_| format!("{raw:?} is not a number")),
        ColumnKind::Integer => match raw.parse::<i64>() {
            Ok(v) => Ok(Value::from(v)),
            Err(_) => raw
                .parse::<f64>()
                .ok()
                .filter(|v| v.is_finite())
                .map(|v| Value::from(v.round() as i64))
                .ok_or_else(|| format!("{raw:?} is not a number")),
        },
        ColumnKind::Json => serde_json::from_str::<serde_json::Value>(raw)
            .map(Value::from)
            .map_err(|e| format!("not JSON: {e}")),
        ColumnKind::Text => Ok(Value::from(cell)),
    }
}

/// Decodes a snapshot timestamp stored as RFC 3339 text, SQLite datetime
/// text, or epoch seconds.
pub fn decode_snapshot_ts(text: &str, sqlite_type: &str) -> IngestResult<DateTime<Utc>> {
    let text = text.trim();
    let invalid = || IngestError::parse("snapshot row", format!("invalid ts {text:?}"));

    if matches!(sqlite_type, "integer" | "real") || text.bytes().all(|b| b.is_ascii_digit()) {
        let secs: f64 = text.parse().map_err(|_| invalid())?;
        return DateTime::from_timestamp(secs.trunc() as i64, 0).ok_or_else(invalid);
    }

    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Ok(ts.with_timezone(&Utc));
    }

    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(text, format).ok())
        .map(|naive| naive.and_utc())
        .ok_or_else(invalid)
}
