use anyhow::{Context, Result};
use sea_orm::{ConnectionTrait, DatabaseBackend, DatabaseConnection, Statement};

/// Embedded SQL migration with version, direction, and content per backend.
struct Migration {
    version: u32,
    postgres_up: &'static str,
    postgres_down: &'static str,
    sqlite_up: &'static str,
    sqlite_down: &'static str,
}

impl Migration {
    fn up_sql(&self, backend: DatabaseBackend) -> Result<&'static str> {
        match backend {
            DatabaseBackend::Postgres => Ok(self.postgres_up),
            DatabaseBackend::Sqlite => Ok(self.sqlite_up),
            other => anyhow::bail!("no migrations for backend {other:?}"),
        }
    }

    fn down_sql(&self, backend: DatabaseBackend) -> Result<&'static str> {
        match backend {
            DatabaseBackend::Postgres => Ok(self.postgres_down),
            DatabaseBackend::Sqlite => Ok(self.sqlite_down),
            other => anyhow::bail!("no migrations for backend {other:?}"),
        }
    }
}

/// All embedded migrations, ordered by version.
static MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    postgres_up: include_str!("sql/postgres/001_init.up.sql"),
    postgres_down: include_str!("sql/postgres/001_init.down.sql"),
    sqlite_up: include_str!("sql/sqlite/001_init.up.sql"),
    sqlite_down: include_str!("sql/sqlite/001_init.down.sql"),
}];

/// Manages canonical store schema migrations.
///
/// Tracks the applied version in a single-row `schema_migrations` table with
/// a dirty flag set while a migration is in flight.
pub trait Migrator: Send {
    /// Applies all pending forward migrations.
    fn up(&self) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Rolls back the last applied migration.
    fn down(&self) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Returns the current migration version and dirty flag.
    fn status(&self) -> impl std::future::Future<Output = Result<(u32, bool)>> + Send;
}

/// Migration runner over a sea-orm connection (Postgres or SQLite).
pub struct SqlMigrator<'a> {
    conn: &'a DatabaseConnection,
}

impl<'a> SqlMigrator<'a> {
    /// Creates a new migrator on the given connection.
    pub fn new(conn: &'a DatabaseConnection) -> Self {
        Self { conn }
    }

    fn backend(&self) -> DatabaseBackend {
        self.conn.get_database_backend()
    }

    async fn execute(&self, sql: &str) -> Result<()> {
        self.conn
            .execute(Statement::from_string(self.backend(), sql.to_string()))
            .await?;
        Ok(())
    }

    /// Ensures the schema_migrations tracking table exists.
    async fn ensure_migrations_table(&self) -> Result<()> {
        self.execute(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version BIGINT NOT NULL,
                dirty BOOLEAN NOT NULL
            )",
        )
        .await
        .context("creating schema_migrations table")
    }

    /// Returns the current migration version and dirty state.
    async fn current_version(&self) -> Result<(u32, bool)> {
        let row = self
            .conn
            .query_one(Statement::from_string(
                self.backend(),
                "SELECT version, dirty FROM schema_migrations LIMIT 1",
            ))
            .await
            .context("querying migration version")?;

        match row {
            Some(row) => {
                let version: i64 = row.try_get("", "version").context("reading version")?;
                let dirty: bool = row.try_get("", "dirty").context("reading dirty flag")?;
                Ok((u32::try_from(version).context("migration version out of range")?, dirty))
            }
            None => Ok((0, false)),
        }
    }

    /// Replaces the single tracking row.
    async fn set_version(&self, version: u32, dirty: bool) -> Result<()> {
        self.clear_version().await?;

        let dirty_val = if dirty { "TRUE" } else { "FALSE" };
        let sql = format!("INSERT INTO schema_migrations (version, dirty) VALUES ({version}, {dirty_val})");
        self.execute(&sql)
            .await
            .context("inserting migration version")
    }

    async fn clear_version(&self) -> Result<()> {
        self.execute("DELETE FROM schema_migrations")
            .await
            .context("clearing schema_migrations")
    }

    /// Splits a SQL string into individual statements and executes each.
    async fn execute_sql(&self, sql: &str) -> Result<()> {
        for statement in split_statements(sql) {
            self.execute(statement).await.with_context(|| {
                let preview: String = statement.chars().take(80).collect();
                format!("executing migration statement: {preview}...")
            })?;
        }

        Ok(())
    }
}

impl Migrator for SqlMigrator<'_> {
    async fn up(&self) -> Result<()> {
        self.ensure_migrations_table().await?;

        let (current_version, dirty) = self.current_version().await?;

        if dirty {
            anyhow::bail!(
                "migration version {current_version} is dirty, manual intervention required"
            );
        }

        tracing::info!(current_version, backend = ?self.backend(), "running migrations");

        let mut applied = 0u32;

        for migration in MIGRATIONS {
            if migration.version <= current_version {
                continue;
            }

            let sql = migration.up_sql(self.backend())?;

            tracing::info!(version = migration.version, "applying migration");

            self.set_version(migration.version, true).await?;

            self.execute_sql(sql)
                .await
                .with_context(|| format!("applying migration version {}", migration.version))?;

            self.set_version(migration.version, false).await?;

            applied += 1;
        }

        if applied == 0 {
            tracing::info!("no pending migrations");
        } else {
            let (final_version, _) = self.current_version().await?;
            tracing::info!(version = final_version, applied, "migrations completed");
        }

        Ok(())
    }

    async fn down(&self) -> Result<()> {
        self.ensure_migrations_table().await?;

        let (current_version, _) = self.current_version().await?;

        if current_version == 0 {
            tracing::info!("no migrations to roll back");
            return Ok(());
        }

        let migration = MIGRATIONS
            .iter()
            .find(|m| m.version == current_version)
            .with_context(|| format!("migration version {current_version} not found"))?;
        let sql = migration.down_sql(self.backend())?;

        tracing::info!(version = current_version, "rolling back migration");

        self.set_version(current_version, true).await?;

        self.execute_sql(sql)
            .await
            .with_context(|| format!("rolling back migration version {current_version}"))?;

        let prev_version = MIGRATIONS
            .iter()
            .filter(|m| m.version < current_version)
            .map(|m| m.version)
            .max()
            .unwrap_or(0);

        if prev_version == 0 {
            self.clear_version().await?;
        } else {
            self.set_version(prev_version, false).await?;
        }

        tracing::info!(version = prev_version, "rollback completed");

        Ok(())
    }

    async fn status(&self) -> Result<(u32, bool)> {
        self.ensure_migrations_table().await?;
        self.current_version().await
    }
}

/// Splits SQL text into individual statements by semicolons.
///
/// Embedded migrations never carry a semicolon inside a statement.
fn split_statements(sql: &str) -> Vec<&str> {
    sql.split(';')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .collect()
}
