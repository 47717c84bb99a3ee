pub mod tables;
pub mod upsert;

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sea_orm::sea_query::{
    Alias, MysqlQueryBuilder, Order, PostgresQueryBuilder, Query, QueryStatementWriter,
    SqliteQueryBuilder, Value,
};
use sea_orm::{
    ConnectOptions, ConnectionTrait, Database, DatabaseBackend, DatabaseConnection, DbErr,
    ExecResult, QueryResult, Statement,
};
use tracing::info;

use crate::error::{IngestError, IngestResult};

pub use tables::{ColumnKind, SeriesTable, ValueColumn};
pub use upsert::{ConflictPolicy, MergeReport, StoreRow, UpsertMerger};

/// Connection to the canonical store.
///
/// Postgres in production; SQLite works for local runs and tests.
pub struct Store {
    conn: DatabaseConnection,
}

impl Store {
    /// Connects to the store at `url`, bounding connect and acquire time.
    pub async fn connect(url: &str, timeout: Duration) -> IngestResult<Self> {
        let mut options = ConnectOptions::new(url.to_string());
        options
            .max_connections(2)
            .min_connections(1)
            .connect_timeout(timeout)
            .acquire_timeout(timeout)
            .sqlx_logging(false);

        let conn = Database::connect(options)
            .await
            .map_err(|e| IngestError::persist("canonical store", e))?;

        info!(backend = ?conn.get_database_backend(), "connected to canonical store");

        Ok(Self { conn })
    }

    /// Connects to a SQLite file, creating it if missing.
    pub async fn connect_sqlite(path: &Path, timeout: Duration) -> IngestResult<Self> {
        Self::connect(&format!("sqlite://{}?mode=rwc", path.display()), timeout).await
    }

    pub fn conn(&self) -> &DatabaseConnection {
        &self.conn
    }

    /// Closes the connection pool.
    pub async fn close(self) -> IngestResult<()> {
        self.conn
            .close()
            .await
            .map_err(|e| IngestError::persist("canonical store", e))
    }
}

/// Opens a SQLite file read-only. The file is never created or written.
pub async fn open_read_only(path: &Path, timeout: Duration) -> Result<DatabaseConnection, DbErr> {
    let mut options = ConnectOptions::new(format!("sqlite://{}?mode=ro", path.display()));
    options
        .max_connections(1)
        .connect_timeout(timeout)
        .acquire_timeout(timeout)
        .sqlx_logging(false);
    Database::connect(options).await
}

/// A persisted canonical row.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRow {
    pub ts: DateTime<Utc>,
    /// Values in the table's column order.
    pub values: Vec<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Reads every row of `table`, ordered by key.
pub async fn read_rows<C: ConnectionTrait>(conn: &C, table: &SeriesTable) -> IngestResult<Vec<StoredRow>> {
    let mut select = Query::select();
    select
        .from(Alias::new(table.name))
        .column(Alias::new(tables::KEY_COLUMN))
        .columns(table.columns.iter().map(|c| Alias::new(c.name)))
        .column(Alias::new(tables::CREATED_AT))
        .column(Alias::new(tables::UPDATED_AT))
        .order_by(Alias::new(tables::KEY_COLUMN), Order::Asc);

    let rows = query_all(conn, &select)
        .await
        .map_err(|e| IngestError::persist(table.name, e))?;

    rows.iter()
        .map(|row| decode_row(row, table).map_err(|e| IngestError::persist(table.name, e)))
        .collect()
}

/// Number of rows in `table`.
pub async fn count_rows<C: ConnectionTrait>(conn: &C, table: &SeriesTable) -> IngestResult<u64> {
    let sql = format!("SELECT COUNT(*) AS n FROM {}", table.name);
    let row = conn
        .query_one(Statement::from_string(conn.get_database_backend(), sql))
        .await
        .map_err(|e| IngestError::persist(table.name, e))?;
    let n: i64 = match row {
        Some(row) => row
            .try_get("", "n")
            .map_err(|e| IngestError::persist(table.name, e))?,
        None => 0,
    };
    Ok(n.max(0) as u64)
}

fn decode_row(row: &QueryResult, table: &SeriesTable) -> Result<StoredRow, DbErr> {
    let ts: DateTime<Utc> = row.try_get("", tables::KEY_COLUMN)?;
    let values = table
        .columns
        .iter()
        .map(|column| decode_value(row, column))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(StoredRow {
        ts,
        values,
        created_at: row.try_get("", tables::CREATED_AT)?,
        updated_at: row.try_get("", tables::UPDATED_AT)?,
    })
}

fn decode_value(row: &QueryResult, column: &ValueColumn) -> Result<Value, DbErr> {
    Ok(match column.kind {
        ColumnKind::Double => row.try_get::<Option<f64>>("", column.name)?.into(),
        ColumnKind::Integer => row.try_get::<Option<i64>>("", column.name)?.into(),
        ColumnKind::Json => row
            .try_get::<Option<serde_json::Value>>("", column.name)?
            .into(),
        ColumnKind::Text => row.try_get::<Option<String>>("", column.name)?.into(),
    })
}

fn build_stmt<S: QueryStatementWriter>(
    backend: DatabaseBackend,
    stmt: &S,
) -> (String, sea_orm::sea_query::Values) {
    match backend {
        DatabaseBackend::Postgres => stmt.build(PostgresQueryBuilder),
        DatabaseBackend::MySql => stmt.build(MysqlQueryBuilder),
        _ => stmt.build(SqliteQueryBuilder),
    }
}

pub(crate) async fn exec<C, S>(conn: &C, stmt: &S) -> Result<ExecResult, DbErr>
where
    C: ConnectionTrait,
    S: QueryStatementWriter,
{
    let backend = conn.get_database_backend();
    let (sql, values) = build_stmt(backend, stmt);
    conn.execute(Statement::from_sql_and_values(backend, sql, values))
        .await
}

pub(crate) async fn query_all<C, S>(conn: &C, stmt: &S) -> Result<Vec<QueryResult>, DbErr>
where
    C: ConnectionTrait,
    S: QueryStatementWriter,
{
    let backend = conn.get_database_backend();
    let (sql, values) = build_stmt(backend, stmt);
    conn.query_all(Statement::from_sql_and_values(backend, sql, values))
        .await
}
