//! parl-ingest library interface
//!
//! Natural-key identity resolution and idempotent upsert of parliamentary
//! records (committees, bills, debates, votes, meetings, speeches).
//!
//! Pipeline: [`SourceAdapter`] → [`Normalizer`] → [`UpsertEngine`], driven
//! per batch by [`BatchOrchestrator`].

pub mod adapters;
pub mod db;
pub mod error;
pub mod merge;
pub mod models;
pub mod natural_key;
pub mod normalize;
pub mod orchestrator;
pub mod types;
pub mod utils;

pub use crate::db::{DedupProcedure, DedupReport, UpsertEngine};
pub use crate::error::{IngestError, IngestResult, ItemError, ItemErrorKind};
pub use crate::models::{BatchResult, BatchState, CanonicalRecord};
pub use crate::normalize::Normalizer;
pub use crate::orchestrator::{BatchOrchestrator, RetryPolicy};
pub use crate::types::{FetchFilters, RawPayload, SourceAdapter};

use parl_common::config::TomlConfig;
use parl_common::db::{get_setting_u64, SETTING_MAX_LOCK_WAIT_MS};
use sqlx::SqlitePool;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Open store plus the engine built on it
pub struct IngestContext {
    pub pool: SqlitePool,
    pub engine: Arc<UpsertEngine>,
    pub config: TomlConfig,
    /// Dedup report when this open ran the uniqueness migration
    pub migration_report: Option<DedupReport>,
}

impl IngestContext {
    /// Open (or create) the store at `db_path`, migrate it, and build the engine
    pub async fn open(db_path: &Path, config: TomlConfig) -> IngestResult<Self> {
        let pool = parl_common::db::init_database(db_path).await?;
        Self::from_pool(pool, config).await
    }

    /// Same as [`IngestContext::open`] for an already-initialized pool
    pub async fn from_pool(pool: SqlitePool, mut config: TomlConfig) -> IngestResult<Self> {
        config.store.max_lock_wait_ms =
            get_setting_u64(&pool, SETTING_MAX_LOCK_WAIT_MS, config.store.max_lock_wait_ms).await?;

        let migration_report = db::run_migrations(&pool, config.store.max_lock_wait_ms).await?;

        // Capabilities must be probed after migrations create the unique indexes
        let engine = Arc::new(UpsertEngine::new(pool.clone(), &config.store).await?);
        info!(
            atomic_upsert = engine.capabilities().supports_atomic_upsert,
            max_lock_wait_ms = config.store.max_lock_wait_ms,
            "Ingest store ready"
        );

        Ok(Self {
            pool,
            engine,
            config,
            migration_report,
        })
    }

    /// Orchestrator over `adapter` using this context's engine and settings
    pub fn orchestrator(&self, adapter: Arc<dyn SourceAdapter>) -> IngestResult<BatchOrchestrator> {
        let normalizer = Normalizer::from_config(&self.config.normalize)?;
        Ok(BatchOrchestrator::new(adapter, normalizer, Arc::clone(&self.engine)).with_fetch_config(&self.config.fetch))
    }

    /// Dedup procedure over this context's store
    ///
    /// Must not run while batches are writing.
    pub fn dedup(&self) -> DedupProcedure {
        DedupProcedure::new(self.pool.clone(), self.config.store.max_lock_wait_ms)
    }
}
