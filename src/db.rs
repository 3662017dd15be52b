use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Executor, SqlitePool};
use tracing::info;

use crate::config::Config;

const SCHEMA: &str = include_str!("../migrations/20260829_000001_initial_schema.sql");

/// Open (or create) the SQLite database and bring the schema up to date.
pub async fn create_pool(config: &Config) -> Result<SqlitePool> {
    let db_path = config.db_path();
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating data directory {}", parent.display()))?;
    }

    let options = SqliteConnectOptions::new()
        .filename(&db_path)
        .create_if_missing(true)
        // WAL so the scheduler loop and API handlers don't serialize on writes
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .with_context(|| format!("opening database {}", db_path.display()))?;

    run_migrations(&pool).await?;
    info!(path = %db_path.display(), "database ready");
    Ok(pool)
}

pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    pool.execute(SCHEMA).await.context("applying database schema")?;
    Ok(())
}

/// In-memory pool with the schema applied, shared by store/pipeline/scheduler tests.
#[cfg(test)]
pub async fn test_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("connecting to in-memory database");
    run_migrations(&pool).await.expect("applying migrations");
    pool
}
