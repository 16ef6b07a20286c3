//! Versioned store migrations
//!
//! Tracked in the `schema_version` table; each step runs once and is safe to
//! re-run if interrupted before its version row was written.
//!
//! - **v1:** collapse legacy duplicates and enforce natural-key uniqueness

use crate::db::dedup::{DedupProcedure, DedupReport};
use crate::error::IngestResult;
use parl_common::db::SCHEMA_VERSION;
use sqlx::SqlitePool;
use tracing::{info, warn};

/// Latest applied version, 0 for a store that has never been migrated
pub async fn get_schema_version(pool: &SqlitePool) -> IngestResult<i32> {
    let version: Option<i32> = sqlx::query_scalar("SELECT MAX(version) FROM schema_version")
        .fetch_one(pool)
        .await?;
    Ok(version.unwrap_or(0))
}

async fn set_schema_version(pool: &SqlitePool, version: i32) -> IngestResult<()> {
    sqlx::query("INSERT OR IGNORE INTO schema_version (version) VALUES (?)")
        .bind(version)
        .execute(pool)
        .await?;
    Ok(())
}

/// Run all pending migrations
///
/// Returns the dedup report when v1 ran in this call.
pub async fn run_migrations(pool: &SqlitePool, max_lock_wait_ms: u64) -> IngestResult<Option<DedupReport>> {
    let current_version = get_schema_version(pool).await?;

    if current_version == SCHEMA_VERSION {
        info!("Store schema is up to date (v{})", current_version);
        return Ok(None);
    }

    if current_version > SCHEMA_VERSION {
        warn!(
            "Store schema version ({}) is newer than this build ({}); skipping migrations",
            current_version, SCHEMA_VERSION
        );
        return Ok(None);
    }

    info!("Running store migrations: v{} -> v{}", current_version, SCHEMA_VERSION);

    let mut report = None;
    if current_version < 1 {
        report = Some(migrate_v1(pool, max_lock_wait_ms).await?);
        set_schema_version(pool, 1).await?;
        info!("Migration v1 completed");
    }

    Ok(report)
}

/// v1: dedup every canonical table and create the natural-key unique indexes
async fn migrate_v1(pool: &SqlitePool, max_lock_wait_ms: u64) -> IngestResult<DedupReport> {
    DedupProcedure::new(pool.clone(), max_lock_wait_ms).run().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use parl_common::db::{SchemaIntrospector, ALL_SCHEMAS};

    #[tokio::test]
    async fn v1_creates_indexes_and_records_version() {
        let pool = parl_common::db::init_in_memory().await.unwrap();
        assert_eq!(get_schema_version(&pool).await.unwrap(), 0);

        let report = run_migrations(&pool, 1000).await.unwrap();
        assert!(report.is_some());
        assert_eq!(get_schema_version(&pool).await.unwrap(), 1);

        for schema in ALL_SCHEMAS {
            assert!(SchemaIntrospector::index_exists(&pool, &schema.unique_index_name()).await.unwrap());
        }
    }

    #[tokio::test]
    async fn second_run_is_a_no_op() {
        let pool = parl_common::db::init_in_memory().await.unwrap();
        run_migrations(&pool, 1000).await.unwrap();

        assert!(run_migrations(&pool, 1000).await.unwrap().is_none());
        let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM schema_version")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(rows, 1);
    }
}
