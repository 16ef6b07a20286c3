//! Store capability detection
//!
//! Probed once when the upsert engine is built. The set-based write path
//! needs `INSERT ... ON CONFLICT ... RETURNING` (SQLite 3.35+) and a unique
//! index on every table's natural key.

use parl_common::db::{SchemaIntrospector, ALL_SCHEMAS};
use parl_common::Result;
use serde::Serialize;
use sqlx::SqlitePool;
use tracing::info;

/// First SQLite release supporting `RETURNING`
const RETURNING_MIN_VERSION: (u32, u32, u32) = (3, 35, 0);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoreCapabilities {
    pub sqlite_version: String,
    /// Tables still lacking their natural-key unique index
    pub missing_unique_indexes: Vec<&'static str>,
    /// Whether the set-based write path may be used
    pub supports_atomic_upsert: bool,
}

impl StoreCapabilities {
    /// Probe the store
    pub async fn detect(pool: &SqlitePool, force_fallback: bool) -> Result<Self> {
        let sqlite_version: String = sqlx::query_scalar("SELECT sqlite_version()")
            .fetch_one(pool)
            .await?;

        let mut missing_unique_indexes = Vec::new();
        for schema in ALL_SCHEMAS {
            if !SchemaIntrospector::index_exists(pool, &schema.unique_index_name()).await? {
                missing_unique_indexes.push(schema.table);
            }
        }

        let version_ok = parse_version(&sqlite_version).map_or(false, |v| v >= RETURNING_MIN_VERSION);
        let supports_atomic_upsert = version_ok && missing_unique_indexes.is_empty() && !force_fallback;

        info!(
            sqlite_version = %sqlite_version,
            missing_indexes = missing_unique_indexes.len(),
            force_fallback,
            atomic = supports_atomic_upsert,
            "Detected store capabilities"
        );

        Ok(Self {
            sqlite_version,
            missing_unique_indexes,
            supports_atomic_upsert,
        })
    }

    /// Capabilities that force the per-row path
    pub fn fallback_only() -> Self {
        Self {
            sqlite_version: String::new(),
            missing_unique_indexes: Vec::new(),
            supports_atomic_upsert: false,
        }
    }
}

fn parse_version(version: &str) -> Option<(u32, u32, u32)> {
    let mut parts = version.trim().split('.').map(|p| p.parse::<u32>().ok());
    let major = parts.next()??;
    let minor = parts.next().flatten().unwrap_or(0);
    let patch = parts.next().flatten().unwrap_or(0);
    Some((major, minor, patch))
}
