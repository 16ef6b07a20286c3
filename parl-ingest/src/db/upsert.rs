//! Idempotent upsert engine
//!
//! Writes canonical records keyed by natural key. Two write paths share one
//! merge policy (see [`crate::merge`]):
//!
//! - **Set-based** (store has `RETURNING` and every natural-key unique index):
//!   one `INSERT ... ON CONFLICT(natural_key) DO UPDATE ... RETURNING` per
//!   chunk, inside a transaction that also resolves parents.
//! - **Per-row** (older stores, missing indexes, or a chunk that failed):
//!   read, merge in memory, then `UPDATE ... WHERE id = ? AND revision = ?`.
//!   A lost race is retried once, then reported as a store conflict.
//!
//! Which path is used is decided once, when the engine is built.
//!
//! Records sharing a natural key within one call are merged first, in input
//! order. The first occurrence carries the store outcome; later occurrences
//! count as updates.

use crate::db::capabilities::StoreCapabilities;
use crate::db::records::{self, bind_record, bind_value, placeholders, write_columns, MAX_IN_LIST};
use crate::error::{IngestError, IngestResult, ItemErrorKind};
use crate::merge::{conflict_assignments, merge};
use crate::models::CanonicalRecord;
use crate::utils::{begin_monitored, retry_on_lock};
use chrono::{DateTime, Utc};
use parl_common::config::StoreConfig;
use parl_common::db::EntitySchema;
use parl_common::time::format_timestamp;
use parl_common::{EntityType, Result};
use sqlx::SqlitePool;
use std::collections::{HashMap, HashSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Bound parameters per statement, kept under SQLite's historical limit of 999
const MAX_BIND_PARAMS: usize = 900;

/// Outcome for one input record
#[derive(Debug, Clone)]
pub enum UpsertOutcome {
    Stored { record: CanonicalRecord, created: bool },
    Failed { kind: ItemErrorKind, reason: String },
    /// Not attempted because the call was cancelled
    Dropped,
}

impl UpsertOutcome {
    fn failed(kind: ItemErrorKind, reason: impl Into<String>) -> Self {
        UpsertOutcome::Failed {
            kind,
            reason: reason.into(),
        }
    }

    fn from_error(err: &IngestError) -> Self {
        Self::failed(ItemErrorKind::of(err), err.to_string())
    }
}

/// Outcomes of one `upsert_many` call, positionally aligned with its input
#[derive(Debug, Default)]
pub struct UpsertReport {
    pub outcomes: Vec<UpsertOutcome>,
}

impl UpsertReport {
    pub fn created(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o, UpsertOutcome::Stored { created: true, .. }))
            .count()
    }

    pub fn updated(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o, UpsertOutcome::Stored { created: false, .. }))
            .count()
    }

    pub fn stored(&self) -> usize {
        self.created() + self.updated()
    }

    pub fn failed(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o, UpsertOutcome::Failed { .. }))
            .count()
    }

    pub fn dropped(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o, UpsertOutcome::Dropped))
            .count()
    }
}

/// Input records sharing one natural key
struct Group {
    indices: Vec<usize>,
    record: CanonicalRecord,
}

/// Result of one per-row write attempt
enum RowWrite {
    Stored(CanonicalRecord, bool),
    MissingParent(String),
    Conflict,
}

pub struct UpsertEngine {
    pool: SqlitePool,
    capabilities: StoreCapabilities,
    max_lock_wait_ms: u64,
}

impl UpsertEngine {
    /// Build an engine, probing the store's capabilities once
    pub async fn new(pool: SqlitePool, config: &StoreConfig) -> Result<Self> {
        let capabilities = StoreCapabilities::detect(&pool, config.force_fallback).await?;
        Ok(Self::with_capabilities(pool, capabilities, config.max_lock_wait_ms))
    }

    pub fn with_capabilities(pool: SqlitePool, capabilities: StoreCapabilities, max_lock_wait_ms: u64) -> Self {
        Self {
            pool,
            capabilities,
            max_lock_wait_ms,
        }
    }

    pub fn capabilities(&self) -> &StoreCapabilities {
        &self.capabilities
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Upsert a single record
    pub async fn upsert(&self, record: CanonicalRecord) -> IngestResult<(CanonicalRecord, bool)> {
        let entity_type = record.entity_type;
        let natural_key = record.natural_key.clone();
        let parent_key = record.parent.as_ref().map(|p| p.natural_key.clone()).unwrap_or_default();

        let report = self.upsert_many(entity_type, vec![record]).await;
        match report.outcomes.into_iter().next() {
            Some(UpsertOutcome::Stored { record, created }) => Ok((record, created)),
            Some(UpsertOutcome::Failed { kind, reason }) => Err(match kind {
                ItemErrorKind::StoreConflict => IngestError::StoreConflict {
                    entity_type,
                    natural_key,
                },
                ItemErrorKind::MissingParent => IngestError::MissingParent {
                    entity_type,
                    natural_key,
                    parent_key,
                },
                ItemErrorKind::ValidationError | ItemErrorKind::MissingIdentityField => {
                    IngestError::Validation(reason)
                }
                _ => IngestError::StoreFailed(reason),
            }),
            _ => Err(IngestError::StoreFailed(format!("{} '{}' was not written", entity_type, natural_key))),
        }
    }

    /// Upsert a batch of records of one type
    pub async fn upsert_many(&self, entity_type: EntityType, records: Vec<CanonicalRecord>) -> UpsertReport {
        self.upsert_many_until(entity_type, records, &CancellationToken::new()).await
    }

    /// Upsert a batch, stopping between chunks (or rows) once `cancel` fires
    ///
    /// Work already committed stays committed; the rest is reported as
    /// [`UpsertOutcome::Dropped`].
    pub async fn upsert_many_until(
        &self,
        entity_type: EntityType,
        records: Vec<CanonicalRecord>,
        cancel: &CancellationToken,
    ) -> UpsertReport {
        let schema = EntitySchema::for_type(entity_type);
        let now = parl_common::time::now();
        let total = records.len();

        let mut outcomes: Vec<Option<UpsertOutcome>> = vec![None; total];
        let groups = collapse(entity_type, records, now, &mut outcomes);

        let group_outcomes = if self.capabilities.supports_atomic_upsert {
            self.write_set_based(schema, &groups, now, cancel).await
        } else {
            self.write_per_row(schema, &groups, now, cancel).await
        };

        for (group, outcome) in groups.iter().zip(group_outcomes) {
            let mut indices = group.indices.iter();
            if let Some(first) = indices.next() {
                for later in indices {
                    outcomes[*later] = Some(match &outcome {
                        UpsertOutcome::Stored { record, .. } => UpsertOutcome::Stored {
                            record: record.clone(),
                            created: false,
                        },
                        other => other.clone(),
                    });
                }
                outcomes[*first] = Some(outcome);
            }
        }

        let report = UpsertReport {
            outcomes: outcomes
                .into_iter()
                .map(|o| o.unwrap_or(UpsertOutcome::Dropped))
                .collect(),
        };

        info!(
            entity_type = %entity_type,
            total,
            created = report.created(),
            updated = report.updated(),
            failed = report.failed(),
            dropped = report.dropped(),
            atomic = self.capabilities.supports_atomic_upsert,
            "Upsert complete"
        );
        report
    }

    // ------------------------------------------------------------------
    // Set-based path
    // ------------------------------------------------------------------

    async fn write_set_based(
        &self,
        schema: &'static EntitySchema,
        groups: &[Group],
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Vec<UpsertOutcome> {
        let rows_per_chunk = (MAX_BIND_PARAMS / write_columns(schema).len()).clamp(1, MAX_IN_LIST);
        let mut outcomes = Vec::with_capacity(groups.len());

        for chunk in groups.chunks(rows_per_chunk) {
            if cancel.is_cancelled() {
                outcomes.extend(chunk.iter().map(|_| UpsertOutcome::Dropped));
                continue;
            }

            let records: Vec<&CanonicalRecord> = chunk.iter().map(|g| &g.record).collect();
            let result = retry_on_lock("upsert::write_chunk", self.max_lock_wait_ms, || {
                self.write_chunk(schema, &records, now)
            })
            .await;

            match result {
                Ok(chunk_outcomes) => outcomes.extend(chunk_outcomes),
                Err(err) => {
                    warn!(
                        table = schema.table,
                        rows = chunk.len(),
                        error = %err,
                        "Set-based write failed, replaying chunk row by row"
                    );
                    outcomes.extend(self.write_per_row(schema, chunk, now, cancel).await);
                }
            }
        }

        outcomes
    }

    async fn write_chunk(
        &self,
        schema: &'static EntitySchema,
        chunk: &[&CanonicalRecord],
        now: DateTime<Utc>,
    ) -> Result<Vec<UpsertOutcome>> {
        let mut tx = begin_monitored(&self.pool, "upsert::write_chunk").await?;

        let parent_ids = resolve_parents(tx.conn(), schema, chunk).await?;

        let keys: Vec<&str> = chunk.iter().map(|r| r.natural_key.as_str()).collect();
        let existing: HashSet<String> = {
            let sql = format!(
                "SELECT natural_key FROM {} WHERE natural_key IN ({})",
                schema.table,
                placeholders(keys.len())
            );
            let mut query = sqlx::query_scalar::<_, String>(&sql);
            for key in &keys {
                query = query.bind(*key);
            }
            query.fetch_all(tx.conn()).await?.into_iter().collect()
        };

        let mut outcomes: Vec<Option<UpsertOutcome>> = vec![None; chunk.len()];
        let mut pending: Vec<(usize, CanonicalRecord)> = Vec::with_capacity(chunk.len());
        for (pos, record) in chunk.iter().enumerate() {
            match attach_parent(schema, record, &parent_ids) {
                Ok(mut prepared) => {
                    prepared.first_seen = Some(now);
                    prepared.last_updated = Some(now);
                    prepared.revision = 0;
                    pending.push((pos, prepared));
                }
                Err(failure) => outcomes[pos] = Some(failure),
            }
        }

        if !pending.is_empty() {
            let columns = write_columns(schema);
            let row_placeholders = format!("({})", placeholders(columns.len()));
            let sql = format!(
                "INSERT INTO {table} ({columns}) VALUES {rows} \
                 ON CONFLICT(natural_key) DO UPDATE SET {assignments} \
                 RETURNING {returning}",
                table = schema.table,
                columns = columns.join(", "),
                rows = vec![row_placeholders.as_str(); pending.len()].join(", "),
                assignments = conflict_assignments(schema).join(", "),
                returning = records::select_list(schema),
            );

            let mut query = sqlx::query(&sql);
            for (_, record) in &pending {
                query = bind_record(query, record);
            }
            let rows = query.fetch_all(tx.conn()).await?;

            let mut returned: HashMap<String, CanonicalRecord> = HashMap::with_capacity(rows.len());
            for row in &rows {
                let record = records::record_from_row(schema, row)?;
                returned.insert(record.natural_key.clone(), record);
            }

            for (pos, record) in pending {
                outcomes[pos] = Some(match returned.remove(&record.natural_key) {
                    Some(mut stored) => {
                        stored.parent = record.parent;
                        UpsertOutcome::Stored {
                            created: !existing.contains(&stored.natural_key),
                            record: stored,
                        }
                    }
                    None => UpsertOutcome::failed(ItemErrorKind::StoreFailed, "row not returned by upsert"),
                });
            }
        }

        tx.commit().await?;
        debug!(table = schema.table, rows = chunk.len(), "Chunk committed");

        Ok(outcomes
            .into_iter()
            .map(|o| o.unwrap_or_else(|| UpsertOutcome::failed(ItemErrorKind::StoreFailed, "no outcome")))
            .collect())
    }

    // ------------------------------------------------------------------
    // Per-row path
    // ------------------------------------------------------------------

    async fn write_per_row(
        &self,
        schema: &'static EntitySchema,
        groups: &[Group],
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Vec<UpsertOutcome> {
        let mut outcomes = Vec::with_capacity(groups.len());
        for group in groups {
            if cancel.is_cancelled() {
                outcomes.push(UpsertOutcome::Dropped);
                continue;
            }
            outcomes.push(self.upsert_row(schema, &group.record, now).await);
        }
        outcomes
    }

    async fn upsert_row(&self, schema: &'static EntitySchema, record: &CanonicalRecord, now: DateTime<Utc>) -> UpsertOutcome {
        let mut conflicts = 0;
        loop {
            let result = retry_on_lock("upsert::write_row", self.max_lock_wait_ms, || {
                self.write_row(schema, record, now)
            })
            .await;

            match result {
                Ok(RowWrite::Stored(stored, created)) => return UpsertOutcome::Stored { record: stored, created },
                Ok(RowWrite::MissingParent(parent_key)) => {
                    return UpsertOutcome::from_error(&IngestError::MissingParent {
                        entity_type: schema.entity_type,
                        natural_key: record.natural_key.clone(),
                        parent_key,
                    })
                }
                Ok(RowWrite::Conflict) if conflicts == 0 => {
                    conflicts += 1;
                    debug!(natural_key = %record.natural_key, "Concurrent write detected, retrying once");
                }
                Ok(RowWrite::Conflict) => {
                    return UpsertOutcome::from_error(&IngestError::StoreConflict {
                        entity_type: schema.entity_type,
                        natural_key: record.natural_key.clone(),
                    })
                }
                Err(err) => return UpsertOutcome::failed(ItemErrorKind::StoreFailed, err.to_string()),
            }
        }
    }

    async fn write_row(&self, schema: &'static EntitySchema, record: &CanonicalRecord, now: DateTime<Utc>) -> Result<RowWrite> {
        let mut tx = begin_monitored(&self.pool, "upsert::write_row").await?;

        let parent_ids = resolve_parents(tx.conn(), schema, &[record]).await?;
        let incoming = match attach_parent(schema, record, &parent_ids) {
            Ok(r) => r,
            Err(_) => {
                let parent_key = record.parent.as_ref().map(|p| p.natural_key.clone()).unwrap_or_default();
                return Ok(RowWrite::MissingParent(parent_key));
            }
        };

        let existing = records::find_by_key(tx.conn(), schema, &record.natural_key).await?;
        let mut merged = merge(existing.as_ref(), incoming, now);

        let created = match &existing {
            Some(current) => {
                let mut assignments: Vec<String> = schema.field_columns().map(|c| format!("{} = ?", c.name)).collect();
                if let Some(link) = &schema.parent {
                    assignments.push(format!("{} = ?", link.column));
                }
                assignments.push("last_updated = ?".to_string());
                assignments.push("revision = revision + 1".to_string());

                let sql = format!(
                    "UPDATE {} SET {} WHERE id = ? AND revision = ?",
                    schema.table,
                    assignments.join(", ")
                );
                let mut query = sqlx::query(&sql);
                for column in schema.field_columns() {
                    query = bind_value(query, merged.field(column.name));
                }
                if schema.parent.is_some() {
                    query = query.bind(merged.parent_id);
                }
                let affected = query
                    .bind(merged.last_updated.as_ref().map(format_timestamp))
                    .bind(current.id)
                    .bind(current.revision)
                    .execute(tx.conn())
                    .await?
                    .rows_affected();

                if affected == 0 {
                    return Ok(RowWrite::Conflict);
                }
                merged.revision = current.revision + 1;
                false
            }
            None => {
                merged.revision = 0;
                let columns = write_columns(schema);
                let sql = format!(
                    "INSERT INTO {} ({}) VALUES ({}) RETURNING id",
                    schema.table,
                    columns.join(", "),
                    placeholders(columns.len())
                );
                let inserted: std::result::Result<i64, sqlx::Error> =
                    bind_record(sqlx::query(&sql), &merged)
                        .fetch_one(tx.conn())
                        .await
                        .and_then(|row| sqlx::Row::try_get(&row, 0));
                match inserted {
                    Ok(id) => merged.id = Some(id),
                    Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                        return Ok(RowWrite::Conflict);
                    }
                    Err(err) => return Err(err.into()),
                }
                true
            }
        };

        tx.commit().await?;
        Ok(RowWrite::Stored(merged, created))
    }
}

/// Merge input records sharing a natural key; reject records that cannot be written
fn collapse(
    entity_type: EntityType,
    records: Vec<CanonicalRecord>,
    now: DateTime<Utc>,
    outcomes: &mut [Option<UpsertOutcome>],
) -> Vec<Group> {
    let mut groups: Vec<Group> = Vec::new();
    let mut by_key: HashMap<String, usize> = HashMap::new();

    for (index, record) in records.into_iter().enumerate() {
        if record.entity_type != entity_type {
            outcomes[index] = Some(UpsertOutcome::failed(
                ItemErrorKind::ValidationError,
                format!("expected {} record, got {}", entity_type, record.entity_type),
            ));
            continue;
        }
        if record.natural_key.trim().is_empty() {
            outcomes[index] = Some(UpsertOutcome::failed(ItemErrorKind::MissingIdentityField, "record has no natural key"));
            continue;
        }

        match by_key.get(&record.natural_key) {
            Some(&pos) => {
                let group = &mut groups[pos];
                group.record = merge(Some(&group.record), record, now);
                group.indices.push(index);
            }
            None => {
                by_key.insert(record.natural_key.clone(), groups.len());
                groups.push(Group {
                    indices: vec![index],
                    record,
                });
            }
        }
    }

    groups
}

/// Parent ids for every parent reference in `records`
async fn resolve_parents(
    conn: &mut sqlx::SqliteConnection,
    schema: &EntitySchema,
    records: &[&CanonicalRecord],
) -> Result<HashMap<String, i64>> {
    let Some(link) = &schema.parent else {
        return Ok(HashMap::new());
    };
    let parent_schema = EntitySchema::for_type(link.parent);

    let mut keys: Vec<&str> = records
        .iter()
        .filter_map(|r| r.parent.as_ref())
        .map(|p| p.natural_key.as_str())
        .collect();
    keys.sort_unstable();
    keys.dedup();

    let mut ids = HashMap::with_capacity(keys.len());
    for batch in keys.chunks(MAX_IN_LIST) {
        ids.extend(records::resolve_ids(&mut *conn, parent_schema, batch).await?);
    }
    Ok(ids)
}

/// Copy of `record` with its parent id resolved, or the failure to report
fn attach_parent(
    schema: &EntitySchema,
    record: &CanonicalRecord,
    parent_ids: &HashMap<String, i64>,
) -> std::result::Result<CanonicalRecord, UpsertOutcome> {
    let mut prepared = record.clone();
    let Some(link) = &schema.parent else {
        return Ok(prepared);
    };

    prepared.parent_id = prepared
        .parent
        .as_ref()
        .and_then(|p| parent_ids.get(&p.natural_key).copied());

    if link.required && prepared.parent_id.is_none() {
        let parent_key = record.parent.as_ref().map(|p| p.natural_key.as_str()).unwrap_or("<none>");
        return Err(UpsertOutcome::from_error(&IngestError::MissingParent {
            entity_type: schema.entity_type,
            natural_key: record.natural_key.clone(),
            parent_key: parent_key.to_string(),
        }));
    }
    Ok(prepared)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FieldValue;

    fn committee(code: &str, name: &str) -> CanonicalRecord {
        let mut record = CanonicalRecord::new(EntityType::Committee, format!("ca-federal-{}", code));
        record.identity.insert("jurisdiction", FieldValue::text("ca-federal"));
        record.identity.insert("code", FieldValue::text(code));
        record.set_field("name", FieldValue::text(name));
        record
    }

    #[test]
    fn collapse_merges_same_key_in_order() {
        let now = Utc::now();
        let mut first = committee("FINA", "Finance");
        first.set_field("short_name", FieldValue::text("FINA"));
        let records = vec![first, committee("HESA", "Health"), committee("FINA", "Finance (renamed)")];
        let mut outcomes = vec![None; 3];

        let groups = collapse(EntityType::Committee, records, now, &mut outcomes);

        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].indices, vec![0, 2]);
        assert_eq!(groups[0].record.text("name"), Some("Finance (renamed)"));
        assert_eq!(groups[0].record.text("short_name"), Some("FINA"));
        assert!(outcomes.iter().all(Option::is_none));
    }

    #[test]
    fn collapse_rejects_wrong_type_and_keyless_records() {
        let mut outcomes = vec![None; 2];
        let mut keyless = committee("FINA", "Finance");
        keyless.natural_key = "  ".into();
        let records = vec![CanonicalRecord::new(EntityType::Bill, "x"), keyless];

        let groups = collapse(EntityType::Committee, records, Utc::now(), &mut outcomes);

        assert!(groups.is_empty());
        assert!(matches!(outcomes[0], Some(UpsertOutcome::Failed { kind: ItemErrorKind::ValidationError, .. })));
        assert!(matches!(
            outcomes[1],
            Some(UpsertOutcome::Failed { kind: ItemErrorKind::MissingIdentityField, .. })
        ));
    }

    #[tokio::test]
    async fn per_row_path_creates_then_updates() {
        let pool = parl_common::db::init_in_memory().await.unwrap();
        let engine = UpsertEngine::with_capabilities(pool, StoreCapabilities::fallback_only(), 1000);

        let (stored, created) = engine.upsert(committee("FINA", "Finance")).await.unwrap();
        assert!(created);
        assert_eq!(stored.revision, 0);

        let (stored, created) = engine.upsert(committee("FINA", "Finance")).await.unwrap();
        assert!(!created);
        assert_eq!(stored.revision, 1);
        assert_eq!(stored.text("name"), Some("Finance"));
    }
}
