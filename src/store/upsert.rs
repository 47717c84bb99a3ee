use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use sea_orm::sea_query::{Alias, OnConflict, Query, SimpleExpr, Value};
use sea_orm::ConnectionTrait;
use tracing::{debug, info};

use crate::error::{IngestError, IngestResult};
use crate::grid::is_grid_aligned;

use super::tables::{SeriesTable, CREATED_AT, KEY_COLUMN, UPDATED_AT};

/// Default number of rows per INSERT statement.
pub const DEFAULT_BATCH_SIZE: usize = 500;

/// What to do when a row's key already exists in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictPolicy {
    /// Replace the value columns and `updated_at`; `created_at` is kept.
    Overwrite,
    /// Leave the stored row untouched.
    KeepExisting,
}

/// One keyed row ready to be merged. `values` follow the column list passed
/// to [`UpsertMerger::merge`].
#[derive(Debug, Clone, PartialEq)]
pub struct StoreRow {
    pub ts: DateTime<Utc>,
    pub values: Vec<Value>,
}

impl StoreRow {
    pub fn new(ts: DateTime<Utc>, values: Vec<Value>) -> Self {
        Self { ts, values }
    }
}

/// Outcome of one merge call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeReport {
    /// Rows handed to the merger, before key collapsing.
    pub rows_submitted: usize,
    /// Rows inserted or updated, as reported by the backend.
    pub rows_written: u64,
    /// Statements executed.
    pub batches: usize,
}

/// Batched keyed writer for canonical tables.
#[derive(Debug, Clone, Copy)]
pub struct UpsertMerger {
    batch_size: usize,
}

impl Default for UpsertMerger {
    fn default() -> Self {
        Self::new(DEFAULT_BATCH_SIZE)
    }
}

impl UpsertMerger {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Merges `rows` into `table`.
    ///
    /// Every row is validated before the first statement runs. Batches are
    /// written in key order; a failing batch aborts the call and leaves
    /// earlier batches in place.
    pub async fn merge<C: ConnectionTrait>(
        &self,
        conn: &C,
        table: &SeriesTable,
        columns: &[&'static str],
        rows: Vec<StoreRow>,
        policy: ConflictPolicy,
    ) -> IngestResult<MergeReport> {
        validate_columns(table, columns)?;

        let rows_submitted = rows.len();
        let keyed = collapse(table, columns, rows, policy)?;

        let mut report = MergeReport {
            rows_submitted,
            ..MergeReport::default()
        };
        if keyed.is_empty() {
            return Ok(report);
        }

        let now = Utc::now();
        let keyed: Vec<(DateTime<Utc>, Vec<Value>)> = keyed.into_iter().collect();

        for chunk in keyed.chunks(self.batch_size) {
            let mut insert = Query::insert();
            insert.into_table(Alias::new(table.name)).columns(
                std::iter::once(KEY_COLUMN)
                    .chain(columns.iter().copied())
                    .chain([CREATED_AT, UPDATED_AT])
                    .map(Alias::new),
            );

            for (ts, values) in chunk {
                let exprs = std::iter::once(Value::from(*ts))
                    .chain(values.iter().cloned())
                    .chain([Value::from(now), Value::from(now)])
                    .map(SimpleExpr::Value);
                insert
                    .values(exprs)
                    .map_err(|e| IngestError::persist(table.name, e))?;
            }

            let mut on_conflict = OnConflict::column(Alias::new(KEY_COLUMN));
            match policy {
                ConflictPolicy::Overwrite => on_conflict.update_columns(
                    columns
                        .iter()
                        .copied()
                        .chain([UPDATED_AT])
                        .map(Alias::new),
                ),
                ConflictPolicy::KeepExisting => on_conflict.do_nothing(),
            };
            insert.on_conflict(on_conflict);

            let result = super::exec(conn, &insert).await.map_err(|e| {
                IngestError::persist(
                    table.name,
                    anyhow::Error::new(e).context(format!(
                        "batch {} of {} rows",
                        report.batches + 1,
                        chunk.len()
                    )),
                )
            })?;

            report.batches += 1;
            report.rows_written += result.rows_affected();
            debug!(
                table = table.name,
                batch = report.batches,
                rows = chunk.len(),
                affected = result.rows_affected(),
                "merged batch"
            );
        }

        info!(
            table = table.name,
            ?policy,
            submitted = report.rows_submitted,
            written = report.rows_written,
            batches = report.batches,
            "merge complete"
        );

        Ok(report)
    }
}

fn validate_columns(table: &SeriesTable, columns: &[&'static str]) -> IngestResult<()> {
    if columns.is_empty() {
        return Err(IngestError::persist(
            table.name,
            anyhow::anyhow!("merge needs at least one value column"),
        ));
    }
    for (i, name) in columns.iter().enumerate() {
        if table.column(name).is_none() {
            return Err(IngestError::persist(
                table.name,
                anyhow::anyhow!("unknown column {name}"),
            ));
        }
        if columns[..i].contains(name) {
            return Err(IngestError::persist(
                table.name,
                anyhow::anyhow!("column {name} listed twice"),
            ));
        }
    }
    Ok(())
}

/// Validates rows and collapses duplicate keys so a statement never touches
/// the same key twice.
fn collapse(
    table: &SeriesTable,
    columns: &[&'static str],
    rows: Vec<StoreRow>,
    policy: ConflictPolicy,
) -> IngestResult<BTreeMap<DateTime<Utc>, Vec<Value>>> {
    let mut keyed = BTreeMap::new();
    for row in rows {
        if !is_grid_aligned(row.ts) {
            return Err(IngestError::parse(
                "store row",
                format!("{} key {} is not aligned to the grid", table.name, row.ts),
            ));
        }
        if row.values.len() != columns.len() {
            return Err(IngestError::parse(
                "store row",
                format!(
                    "{} row at {} has {} values for {} columns",
                    table.name,
                    row.ts,
                    row.values.len(),
                    columns.len()
                ),
            ));
        }
        match policy {
            ConflictPolicy::Overwrite => {
                keyed.insert(row.ts, row.values);
            }
            ConflictPolicy::KeepExisting => {
                keyed.entry(row.ts).or_insert(row.values);
            }
        }
    }
    Ok(keyed)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use chrono::TimeZone;

    use crate::migrate::{Migrator, SqlMigrator};
    use crate::store::tables::{DAY_AHEAD_PRICES, SITE_TELEMETRY};
    use crate::store::{read_rows, Store};

    async fn migrated_store(dir: &tempfile::TempDir) -> Store {
        let store = Store::connect_sqlite(&dir.path().join("store.db"), Duration::from_secs(5))
            .await
            .expect("connect");
        SqlMigrator::new(store.conn()).up().await.expect("migrate");
        store
    }

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, h, m, 0).unwrap()
    }

    fn price_rows(values: &[(DateTime<Utc>, f64)]) -> Vec<StoreRow> {
        values
            .iter()
            .map(|(ts, v)| StoreRow::new(*ts, vec![Value::from(*v)]))
            .collect()
    }

    fn prices(rows: &[crate::store::StoredRow]) -> Vec<Value> {
        rows.iter().map(|r| r.values[0].clone()).collect()
    }

    #[test]
    fn test_collapse_policies() {
        let rows = price_rows(&[(at(0, 0), 1.0), (at(0, 0), 2.0), (at(0, 15), 3.0)]);

        let last = collapse(&DAY_AHEAD_PRICES, &["price"], rows.clone(), ConflictPolicy::Overwrite)
            .expect("collapse");
        assert_eq!(last[&at(0, 0)], vec![Value::from(2.0)]);
        assert_eq!(last.len(), 2);

        let first = collapse(&DAY_AHEAD_PRICES, &["price"], rows, ConflictPolicy::KeepExisting)
            .expect("collapse");
        assert_eq!(first[&at(0, 0)], vec![Value::from(1.0)]);
    }

    #[test]
    fn test_collapse_rejects_misaligned_and_ragged_rows() {
        let misaligned = price_rows(&[(at(0, 7), 1.0)]);
        assert!(collapse(&DAY_AHEAD_PRICES, &["price"], misaligned, ConflictPolicy::Overwrite)
            .expect_err("misaligned")
            .is_parse());

        let ragged = vec![StoreRow::new(at(0, 0), vec![])];
        assert!(collapse(&DAY_AHEAD_PRICES, &["price"], ragged, ConflictPolicy::Overwrite)
            .expect_err("ragged")
            .is_parse());
    }

    #[test]
    fn test_unknown_or_duplicate_columns_rejected() {
        assert!(validate_columns(&DAY_AHEAD_PRICES, &["pv_feed_in_w"]).is_err());
        assert!(validate_columns(&SITE_TELEMETRY, &["pv_feed_in_w", "pv_feed_in_w"]).is_err());
        assert!(validate_columns(&SITE_TELEMETRY, &[]).is_err());
        assert!(validate_columns(&SITE_TELEMETRY, &["pv_feed_in_w", "sma_json"]).is_ok());
    }

    #[tokio::test]
    async fn test_overwrite_replaces_values_and_keeps_created_at() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = migrated_store(&dir).await;
        let merger = UpsertMerger::new(2);

        let first = merger
            .merge(
                store.conn(),
                &DAY_AHEAD_PRICES,
                &["price"],
                price_rows(&[(at(0, 0), 1.0), (at(0, 15), 2.0), (at(0, 30), 3.0)]),
                ConflictPolicy::Overwrite,
            )
            .await
            .expect("merge");
        assert_eq!(first.rows_submitted, 3);
        assert_eq!(first.rows_written, 3);
        assert_eq!(first.batches, 2);

        let before = read_rows(store.conn(), &DAY_AHEAD_PRICES).await.expect("read");
        tokio::time::sleep(Duration::from_millis(20)).await;

        merger
            .merge(
                store.conn(),
                &DAY_AHEAD_PRICES,
                &["price"],
                price_rows(&[(at(0, 15), 20.0)]),
                ConflictPolicy::Overwrite,
            )
            .await
            .expect("merge");

        let after = read_rows(store.conn(), &DAY_AHEAD_PRICES).await.expect("read");
        assert_eq!(
            prices(&after),
            vec![Value::from(1.0), Value::from(20.0), Value::from(3.0)]
        );
        assert_eq!(after[1].created_at, before[1].created_at);
        assert!(after[1].updated_at > before[1].updated_at);
        assert!(after[1].updated_at - before[1].updated_at >= chrono::Duration::milliseconds(20));
        assert_eq!(after[0], before[0]);
    }

    #[tokio::test]
    async fn test_keep_existing_never_touches_stored_rows() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = migrated_store(&dir).await;
        let merger = UpsertMerger::default();

        merger
            .merge(
                store.conn(),
                &DAY_AHEAD_PRICES,
                &["price"],
                price_rows(&[(at(1, 0), 5.0)]),
                ConflictPolicy::KeepExisting,
            )
            .await
            .expect("merge");
        let before = read_rows(store.conn(), &DAY_AHEAD_PRICES).await.expect("read");

        let report = merger
            .merge(
                store.conn(),
                &DAY_AHEAD_PRICES,
                &["price"],
                price_rows(&[(at(1, 0), 99.0), (at(1, 15), 6.0)]),
                ConflictPolicy::KeepExisting,
            )
            .await
            .expect("merge");
        assert_eq!(report.rows_written, 1);

        let after = read_rows(store.conn(), &DAY_AHEAD_PRICES).await.expect("read");
        assert_eq!(after[0], before[0]);
        assert_eq!(prices(&after), vec![Value::from(5.0), Value::from(6.0)]);
    }

    #[tokio::test]
    async fn test_null_values_and_column_subsets() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = migrated_store(&dir).await;

        let rows = vec![StoreRow::new(
            at(2, 0),
            vec![
                Value::from(Some(21.5)),
                Value::from(None::<i64>),
                Value::from(Some(serde_json::json!({"inverter": {"w": 1500}}))),
            ],
        )];
        UpsertMerger::default()
            .merge(
                store.conn(),
                &SITE_TELEMETRY,
                &["temperature_c", "pv_feed_in_w", "sma_json"],
                rows,
                ConflictPolicy::Overwrite,
            )
            .await
            .expect("merge");

        let stored = read_rows(store.conn(), &SITE_TELEMETRY).await.expect("read");
        assert_eq!(stored.len(), 1);
        let value = |name: &str| {
            let i = SITE_TELEMETRY
                .columns
                .iter()
                .position(|c| c.name == name)
                .expect("column");
            stored[0].values[i].clone()
        };
        assert_eq!(value("temperature_c"), Value::from(Some(21.5)));
        assert_eq!(value("pv_feed_in_w"), Value::from(None::<i64>));
        assert_eq!(value("dew_point_c"), Value::from(None::<f64>));
        assert_eq!(
            value("sma_json"),
            Value::from(Some(serde_json::json!({"inverter": {"w": 1500}})))
        );
    }

    #[tokio::test]
    async fn test_empty_input_performs_no_writes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = migrated_store(&dir).await;
        let report = UpsertMerger::default()
            .merge(
                store.conn(),
                &DAY_AHEAD_PRICES,
                &["price"],
                Vec::new(),
                ConflictPolicy::Overwrite,
            )
            .await
            .expect("merge");
        assert_eq!(report, MergeReport::default());
    }
}
