//! Database migration helpers.
//!
//! This module applies the schema in [`super::schema`] and records which
//! parts have been applied, so that any number of processes can open the
//! same database file concurrently.

use sqlx::SqlitePool;
use thiserror::Error;

use super::schema;

/// Errors that can occur during migration operations.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// Database query failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Migration script failed to execute.
    #[error("Migration failed: {0}")]
    MigrationFailed(String),
}

/// Migration runner for applying schema changes.
pub struct MigrationRunner {
    pool: SqlitePool,
}

impl MigrationRunner {
    /// Creates a new migration runner.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Runs all pending migrations.
    ///
    /// Idempotent: every statement uses `IF NOT EXISTS` and applied parts are
    /// recorded with `INSERT OR IGNORE`, so a concurrent runner on another
    /// process cannot make this fail.
    pub async fn run_migrations(&self) -> Result<(), MigrationError> {
        self.ensure_migrations_table().await?;

        for (idx, statement) in schema::all_schema_statements().iter().enumerate() {
            let migration_name = format!("schema_v1_part_{}", idx);

            if !self.is_migration_applied(&migration_name).await? {
                self.apply_migration(&migration_name, statement).await?;
            }
        }

        Ok(())
    }

    async fn ensure_migrations_table(&self) -> Result<(), MigrationError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS _migrations (
                id         INTEGER PRIMARY KEY AUTOINCREMENT,
                name       TEXT NOT NULL UNIQUE,
                applied_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn is_migration_applied(&self, name: &str) -> Result<bool, MigrationError> {
        let result: Option<(i64,)> = sqlx::query_as("SELECT id FROM _migrations WHERE name = ?1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;

        Ok(result.is_some())
    }

    async fn apply_migration(&self, name: &str, sql: &str) -> Result<(), MigrationError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(sql)
            .execute(&mut *tx)
            .await
            .map_err(|e| MigrationError::MigrationFailed(format!("{}: {}", name, e)))?;

        sqlx::query("INSERT OR IGNORE INTO _migrations (name) VALUES (?1)")
            .bind(name)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        tracing::debug!(migration = name, "Applied migration");

        Ok(())
    }

    /// Returns a list of applied migrations.
    pub async fn list_applied_migrations(&self) -> Result<Vec<AppliedMigration>, MigrationError> {
        self.ensure_migrations_table().await?;

        let migrations: Vec<AppliedMigration> =
            sqlx::query_as("SELECT name, applied_at FROM _migrations ORDER BY id")
                .fetch_all(&self.pool)
                .await?;

        Ok(migrations)
    }
}

/// Record of an applied migration.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AppliedMigration {
    /// Name of the migration.
    pub name: String,
    /// When the migration was applied.
    pub applied_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};

    async fn temp_pool(dir: &tempfile::TempDir) -> SqlitePool {
        let opts = SqliteConnectOptions::new()
            .filename(dir.path().join("migrations.db"))
            .create_if_missing(true);
        SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await
            .unwrap()
    }

    #[test]
    fn test_migration_error_display() {
        let err = MigrationError::MigrationFailed("test error".to_string());
        assert!(err.to_string().contains("test error"));
    }

    #[tokio::test]
    async fn test_run_migrations_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let runner = MigrationRunner::new(temp_pool(&dir).await);

        runner.run_migrations().await.unwrap();
        runner.run_migrations().await.unwrap();

        let applied = runner.list_applied_migrations().await.unwrap();
        assert_eq!(applied.len(), schema::all_schema_statements().len());
        assert_eq!(applied[0].name, "schema_v1_part_0");
    }

    #[tokio::test]
    async fn test_tables_exist_after_migration() {
        let dir = tempfile::tempdir().unwrap();
        let pool = temp_pool(&dir).await;
        MigrationRunner::new(pool.clone())
            .run_migrations()
            .await
            .unwrap();

        for table in [
            schema::tables::JOBS,
            schema::tables::CONFIG,
            schema::tables::WORKERS,
        ] {
            let found: Option<(String,)> =
                sqlx::query_as("SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1")
                    .bind(table)
                    .fetch_optional(&pool)
                    .await
                    .unwrap();
            assert!(found.is_some(), "table {} should exist", table);
        }
    }
}
