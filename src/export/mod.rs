use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow_array::{
    ArrayRef, Float64Array, Int64Array, RecordBatch, StringArray, TimestampMicrosecondArray,
};
use arrow_schema::{DataType, Field, Schema, TimeUnit};
use chrono::{DateTime, NaiveDateTime, Utc};
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use sea_orm::sea_query::Value;
use sea_orm::ConnectionTrait;
use tracing::{debug, info, warn};

use crate::error::{IngestError, IngestResult};
use crate::store::tables::{SeriesTable, CREATED_AT, KEY_COLUMN, UPDATED_AT};
use crate::store::{read_rows, ColumnKind, StoredRow};

/// Timestamp embedded in export file names.
const STAMP_FORMAT: &str = "%Y%m%dT%H%M%SZ";
const LATEST_SUFFIX: &str = "latest";
const EXTENSION: &str = "parquet";

/// Result of exporting one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportReport {
    pub path: PathBuf,
    pub rows: usize,
    pub pruned: Vec<PathBuf>,
}

/// Writes full-table Parquet exports of canonical tables.
///
/// Files are written under a temporary name and renamed into place, so a
/// reader never sees a partial export. `<table>-latest.parquet` always
/// points at the newest complete export.
pub struct Exporter {
    dir: PathBuf,
    retention: usize,
}

impl Exporter {
    pub fn new(dir: impl Into<PathBuf>, retention: usize) -> Self {
        Self {
            dir: dir.into(),
            retention: retention.max(1),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Exports every row of `table` as of `now`.
    pub async fn export_table<C: ConnectionTrait>(
        &self,
        conn: &C,
        table: &SeriesTable,
        now: DateTime<Utc>,
    ) -> IngestResult<ExportReport> {
        let rows = read_rows(conn, table).await?;
        let err = |e: anyhow::Error| IngestError::persist(format!("{} export", table.name), e);

        fs::create_dir_all(&self.dir).map_err(|e| err(e.into()))?;

        let batch = to_record_batch(table, &rows).map_err(err)?;
        let path = self.export_path(table, now);
        write_atomic(&path, &batch).map_err(err)?;

        let latest = self.latest_path(table);
        copy_atomic(&path, &latest).map_err(err)?;

        let pruned = self.prune(table).map_err(err)?;

        info!(
            table = table.name,
            rows = rows.len(),
            path = %path.display(),
            pruned = pruned.len(),
            "table exported"
        );

        Ok(ExportReport {
            path,
            rows: rows.len(),
            pruned,
        })
    }

    pub fn export_path(&self, table: &SeriesTable, at: DateTime<Utc>) -> PathBuf {
        self.dir
            .join(format!("{}-{}.{EXTENSION}", table.name, at.format(STAMP_FORMAT)))
    }

    pub fn latest_path(&self, table: &SeriesTable) -> PathBuf {
        self.dir
            .join(format!("{}-{LATEST_SUFFIX}.{EXTENSION}", table.name))
    }

    /// Timestamped exports of `table`, newest first.
    pub fn list_exports(&self, table: &SeriesTable) -> anyhow::Result<Vec<(DateTime<Utc>, PathBuf)>> {
        let prefix = format!("{}-", table.name);
        let suffix = format!(".{EXTENSION}");

        let mut exports = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(stamp) = name
                .strip_prefix(&prefix)
                .and_then(|rest| rest.strip_suffix(&suffix))
            else {
                continue;
            };
            // Other tables sharing the prefix and the latest alias fail here.
            let Ok(at) = NaiveDateTime::parse_from_str(stamp, STAMP_FORMAT) else {
                continue;
            };
            exports.push((at.and_utc(), path));
        }
        exports.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(exports)
    }

    /// Deletes all but the newest `retention` exports of `table`.
    fn prune(&self, table: &SeriesTable) -> anyhow::Result<Vec<PathBuf>> {
        let mut pruned = Vec::new();
        for (_, path) in self.list_exports(table)?.into_iter().skip(self.retention) {
            fs::remove_file(&path)?;
            debug!(path = %path.display(), "pruned export");
            pruned.push(path);
        }
        Ok(pruned)
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

fn write_atomic(path: &Path, batch: &RecordBatch) -> anyhow::Result<()> {
    let tmp = tmp_path(path);
    let written = write_parquet(&tmp, batch).and_then(|()| Ok(fs::rename(&tmp, path)?));
    discard_on_error(&tmp, written)
}

fn write_parquet(path: &Path, batch: &RecordBatch) -> anyhow::Result<()> {
    let file = File::create(path)?;
    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build();
    let mut writer = ArrowWriter::try_new(file, batch.schema(), Some(props))?;
    writer.write(batch)?;
    writer.close()?;
    Ok(())
}

fn copy_atomic(from: &Path, to: &Path) -> anyhow::Result<()> {
    let tmp = tmp_path(to);
    let copied = fs::copy(from, &tmp)
        .map_err(anyhow::Error::from)
        .and_then(|_| Ok(fs::rename(&tmp, to)?));
    discard_on_error(&tmp, copied)
}

/// Removes the temporary file of a failed write.
fn discard_on_error(tmp: &Path, result: anyhow::Result<()>) -> anyhow::Result<()> {
    if result.is_err() {
        if let Err(e) = fs::remove_file(tmp) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %tmp.display(), error = %e, "failed to remove temporary export");
            }
        }
    }
    result
}

fn timestamp_type() -> DataType {
    DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into()))
}

/// Arrow schema of an exported table: key, value columns, audit columns.
pub fn export_schema(table: &SeriesTable) -> Schema {
    let mut fields = vec![Field::new(KEY_COLUMN, timestamp_type(), false)];
    fields.extend(table.columns.iter().map(|column| {
        let data_type = match column.kind {
            ColumnKind::Double => DataType::Float64,
            ColumnKind::Integer => DataType::Int64,
            ColumnKind::Json | ColumnKind::Text => DataType::Utf8,
        };
        Field::new(column.name, data_type, true)
    }));
    fields.push(Field::new(CREATED_AT, timestamp_type(), false));
    fields.push(Field::new(UPDATED_AT, timestamp_type(), false));
    Schema::new(fields)
}

fn timestamps(rows: &[StoredRow], get: impl Fn(&StoredRow) -> DateTime<Utc>) -> ArrayRef {
    let micros: Vec<i64> = rows.iter().map(|r| get(r).timestamp_micros()).collect();
    Arc::new(TimestampMicrosecondArray::from(micros).with_timezone("UTC"))
}

fn to_record_batch(table: &SeriesTable, rows: &[StoredRow]) -> anyhow::Result<RecordBatch> {
    let mut arrays = vec![timestamps(rows, |r| r.ts)];

    for (i, column) in table.columns.iter().enumerate() {
        let array: ArrayRef = match column.kind {
            ColumnKind::Double => {
                let values = rows
                    .iter()
                    .map(|r| as_double(&r.values[i]))
                    .collect::<anyhow::Result<Vec<_>>>()?;
                Arc::new(Float64Array::from(values))
            }
            ColumnKind::Integer => {
                let values = rows
                    .iter()
                    .map(|r| as_integer(&r.values[i]))
                    .collect::<anyhow::Result<Vec<_>>>()?;
                Arc::new(Int64Array::from(values))
            }
            ColumnKind::Json | ColumnKind::Text => {
                let values = rows
                    .iter()
                    .map(|r| as_text(&r.values[i]))
                    .collect::<anyhow::Result<Vec<_>>>()?;
                Arc::new(StringArray::from(values))
            }
        };
        arrays.push(array);
    }

    arrays.push(timestamps(rows, |r| r.created_at));
    arrays.push(timestamps(rows, |r| r.updated_at));

    Ok(RecordBatch::try_new(Arc::new(export_schema(table)), arrays)?)
}

fn as_double(value: &Value) -> anyhow::Result<Option<f64>> {
    match value {
        Value::Double(v) => Ok(*v),
        other => anyhow::bail!("expected a double, got {other:?}"),
    }
}

fn as_integer(value: &Value) -> anyhow::Result<Option<i64>> {
    match value {
        Value::BigInt(v) => Ok(*v),
        other => anyhow::bail!("expected an integer, got {other:?}"),
    }
}

fn as_text(value: &Value) -> anyhow::Result<Option<String>> {
    match value {
        Value::String(v) => Ok(v.as_ref().map(|s| s.to_string())),
        Value::Json(v) => Ok(v.as_ref().map(|j| j.to_string())),
        other => anyhow::bail!("expected text, got {other:?}"),
    }
}
