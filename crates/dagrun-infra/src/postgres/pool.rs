//! Postgres connection pool.
//!
//! Unlike SQLite there is no reader/writer split: Postgres handles concurrent
//! writers itself, and resolver transactions serialize per run by locking the
//! run row.

use dagrun_types::config::PostgresConfig;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

/// Connect to `config.url` and run pending migrations.
pub async fn connect(config: &PostgresConfig) -> Result<PgPool, sqlx::Error> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections.max(1))
        .acquire_timeout(std::time::Duration::from_secs(5))
        .connect(&config.url)
        .await?;

    sqlx::migrate!("../../migrations/postgres").run(&pool).await?;

    tracing::debug!(max_connections = config.max_connections, "opened postgres pool");
    Ok(pool)
}
