//! Database pool with split reader/writer connections in WAL mode.
//!
//! SQLite allows only one writer at a time. This module provides a `DatabasePool`
//! with a multi-connection reader pool for concurrent reads and a single-connection
//! writer pool for serialized writes. Every resolver transaction runs on the
//! writer, so concurrent workers never interleave inside one.

use std::str::FromStr;
use std::time::Duration;

use dagrun_types::config::SqliteConfig;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};

/// Split read/write pool for SQLite.
///
/// - `reader`: Multi-connection pool (up to 8) for concurrent SELECT queries.
/// - `writer`: Single-connection pool for serialized INSERT/UPDATE/DELETE.
#[derive(Clone)]
pub struct DatabasePool {
    pub reader: SqlitePool,
    pub writer: SqlitePool,
}

impl DatabasePool {
    /// Open a pool with the default pragmas (WAL, NORMAL sync).
    pub async fn new(database_url: &str) -> Result<Self, sqlx::Error> {
        Self::connect(database_url, &SqliteConfig::default()).await
    }

    /// Open the database file named in `config`, creating it if missing.
    pub async fn from_config(config: &SqliteConfig) -> Result<Self, sqlx::Error> {
        let url = format!("sqlite://{}?mode=rwc", config.path);
        Self::connect(&url, config).await
    }

    /// Runs migrations on the writer before the reader pool is opened.
    pub async fn connect(database_url: &str, config: &SqliteConfig) -> Result<Self, sqlx::Error> {
        let base_opts = SqliteConnectOptions::from_str(database_url)?
            .journal_mode(SqliteJournalMode::from_str(&config.journal_mode)?)
            .synchronous(SqliteSynchronous::from_str(&config.synchronous)?)
            .pragma("cache_size", config.cache_size.to_string())
            .pragma("temp_store", config.temp_store.clone())
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5))
            .create_if_missing(true);

        let read_opts = base_opts.clone().read_only(true);
        let write_opts = base_opts;

        let writer = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(write_opts)
            .await?;

        sqlx::migrate!("../../migrations/sqlite").run(&writer).await?;

        let reader = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(read_opts)
            .await?;

        tracing::debug!(url = database_url, "opened sqlite pools");
        Ok(Self { reader, writer })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn temp_pool(dir: &tempfile::TempDir, file: &str) -> DatabasePool {
        let db_path = dir.path().join(file);
        let url = format!("sqlite://{}?mode=rwc", db_path.display());
        DatabasePool::new(&url).await.unwrap()
    }

    #[tokio::test]
    async fn test_pool_creates_tables() {
        let dir = tempfile::tempdir().unwrap();
        let pool = temp_pool(&dir, "test.db").await;

        let tables: Vec<(String,)> = sqlx::query_as(
            "SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%' AND name != '_sqlx_migrations' ORDER BY name",
        )
        .fetch_all(&pool.reader)
        .await
        .unwrap();

        let table_names: Vec<&str> = tables.iter().map(|t| t.0.as_str()).collect();
        for table in [
            "DAGs",
            "DAG_Workspaces",
            "DAG_Parameters",
            "Tasks",
            "DAG_Tasks",
            "Dependencies",
            "DAG_Runs",
            "DAG_Run_Parameters",
            "Task_Runs",
            "Task_Pods",
        ] {
            assert!(table_names.contains(&table), "{table} table missing");
        }
    }

    #[tokio::test]
    async fn test_pool_wal_mode() {
        let dir = tempfile::tempdir().unwrap();
        let pool = temp_pool(&dir, "test_wal.db").await;

        let result: (String,) = sqlx::query_as("PRAGMA journal_mode")
            .fetch_one(&pool.writer)
            .await
            .unwrap();

        assert_eq!(result.0.to_lowercase(), "wal");
    }

    #[tokio::test]
    async fn test_pool_foreign_keys_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let pool = temp_pool(&dir, "test_fk.db").await;

        let result: (i32,) = sqlx::query_as("PRAGMA foreign_keys")
            .fetch_one(&pool.writer)
            .await
            .unwrap();

        assert_eq!(result.0, 1, "foreign keys should be enabled");
    }

    #[tokio::test]
    async fn test_pool_from_config_applies_pragmas() {
        let dir = tempfile::tempdir().unwrap();
        let config = SqliteConfig {
            path: dir.path().join("cfg.db").display().to_string(),
            cache_size: -4000,
            ..Default::default()
        };
        let pool = DatabasePool::from_config(&config).await.unwrap();

        let (cache,): (i64,) = sqlx::query_as("PRAGMA cache_size")
            .fetch_one(&pool.writer)
            .await
            .unwrap();
        assert_eq!(cache, -4000);
    }
}
