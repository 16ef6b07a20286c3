//! Database initialization
//!
//! Opens (creating if needed) the SQLite store, creates the canonical tables
//! from their descriptors, adds columns missing from legacy tables and seeds
//! the runtime settings.

use crate::db::schema_sync::SchemaSync;
use crate::db::table_schemas::ALL_SCHEMAS;
use crate::{Error, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

/// Settings key: per-store override of `store.max_lock_wait_ms` (not seeded)
pub const SETTING_MAX_LOCK_WAIT_MS: &str = "ingest_max_lock_wait_ms";
/// Settings key: SQLite busy timeout applied to every connection
pub const SETTING_BUSY_TIMEOUT_MS: &str = "ingest_busy_timeout_ms";

const DEFAULT_BUSY_TIMEOUT_MS: u64 = 250;

/// Initialize database connection and create tables if needed
pub async fn init_database(db_path: &Path) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let pool = connect(db_path, DEFAULT_BUSY_TIMEOUT_MS).await?;

    if newly_created {
        info!("Initialized new database: {}", db_path.display());
    } else {
        info!("Opened existing database: {}", db_path.display());
    }

    create_tables(&pool).await?;
    init_default_settings(&pool).await?;

    // Busy timeout is a per-connection pragma; reopen if the stored value differs
    let timeout_ms = get_setting_u64(&pool, SETTING_BUSY_TIMEOUT_MS, DEFAULT_BUSY_TIMEOUT_MS).await?;
    if timeout_ms != DEFAULT_BUSY_TIMEOUT_MS {
        pool.close().await;
        let pool = connect(db_path, timeout_ms).await?;
        info!("Database busy timeout set to {} ms", timeout_ms);
        return Ok(pool);
    }

    info!("Database busy timeout set to {} ms", timeout_ms);
    Ok(pool)
}

/// Single-connection in-memory database with all tables created
///
/// Used by tests and dry runs; the database lives as long as the pool.
pub async fn init_in_memory() -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await?;

    create_tables(&pool).await?;
    init_default_settings(&pool).await?;
    Ok(pool)
}

async fn connect(db_path: &Path, busy_timeout_ms: u64) -> Result<SqlitePool> {
    // WAL allows concurrent readers with one writer
    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .foreign_keys(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_millis(busy_timeout_ms));

    let pool = SqlitePoolOptions::new()
        .max_connections(20)
        .min_connections(1)
        .connect_with(options)
        .await?;

    Ok(pool)
}

/// Create every table the ingestion core needs (idempotent)
pub async fn create_tables(pool: &SqlitePool) -> Result<()> {
    create_settings_table(pool).await?;
    create_schema_version_table(pool).await?;

    for schema in ALL_SCHEMAS {
        sqlx::query(&schema.create_table_sql()).execute(pool).await?;
    }

    // Phase 2: add columns missing from tables created by older versions
    let mut added = 0;
    for schema in ALL_SCHEMAS {
        added += SchemaSync::sync_entity(pool, schema).await?;
    }
    if added > 0 {
        info!("Schema sync added {} column(s) to legacy tables", added);
    }

    Ok(())
}

async fn create_schema_version_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Create the settings table
///
/// Stores runtime configuration key-value pairs.
pub async fn create_settings_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT,
            updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Ensure all runtime settings exist, resetting NULL values to defaults
async fn init_default_settings(pool: &SqlitePool) -> Result<()> {
    ensure_setting(pool, SETTING_BUSY_TIMEOUT_MS, "250").await?;
    Ok(())
}

async fn ensure_setting(pool: &SqlitePool, key: &str, default_value: &str) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO settings (key, value) VALUES (?, ?)
        ON CONFLICT(key) DO UPDATE SET
            value = COALESCE(settings.value, excluded.value),
            updated_at = CURRENT_TIMESTAMP
        WHERE settings.value IS NULL
        "#,
    )
    .bind(key)
    .bind(default_value)
    .execute(pool)
    .await?;

    Ok(())
}

/// Read a numeric setting, falling back to `default` when absent
pub async fn get_setting_u64(pool: &SqlitePool, key: &str, default: u64) -> Result<u64> {
    let value: Option<Option<String>> = sqlx::query_scalar("SELECT value FROM settings WHERE key = ?")
        .bind(key)
        .fetch_optional(pool)
        .await?;

    match value.flatten() {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| Error::Config(format!("Setting {} is not a number: {}", key, raw))),
        None => Ok(default),
    }
}

/// Write a setting
pub async fn set_setting(pool: &SqlitePool, key: &str, value: &str) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO settings (key, value) VALUES (?, ?)
        ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = CURRENT_TIMESTAMP
        "#,
    )
    .bind(key)
    .bind(value)
    .execute(pool)
    .await?;

    Ok(())
}
