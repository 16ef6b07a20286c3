//! Duplicate collapse and natural-key enforcement
//!
//! For every canonical table, parents first:
//!
//! 1. Recompute each row's natural key from its stored identity columns.
//! 2. Group rows by recomputed key. In each group the lowest id survives.
//! 3. Per group, in one transaction: fill the survivor's empty enrichment
//!    from the losers, repoint dependent foreign keys to the survivor, delete
//!    the losers.
//! 4. Rewrite surviving rows whose stored key or identity is not canonical.
//! 5. Verify no natural key is held twice, then create the unique index.
//!
//! Re-running on a clean store changes nothing.
//!
//! Precondition: no upsert engine may write while this runs. Rows written
//! between steps 1 and 5 would not be considered.

use crate::error::{IngestError, IngestResult};
use crate::merge::fill_enrichment;
use crate::models::CanonicalRecord;
use crate::db::records::{self, bind_value, placeholders};
use crate::natural_key::{self, CanonicalIdentity, IdentityAttributes};
use crate::types::FieldValue;
use crate::utils::{begin_monitored, retry_on_lock};
use parl_common::db::{EntitySchema, SchemaIntrospector, ALL_SCHEMAS};
use parl_common::EntityType;
use serde::Serialize;
use sqlx::SqlitePool;
use std::collections::BTreeMap;
use tracing::{info, warn};

/// What the procedure changed for one table
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct EntityDedupStats {
    pub entity_type: EntityType,
    pub scanned: usize,
    /// Rows whose identity cannot produce a key; left untouched
    pub unkeyable: usize,
    pub duplicate_sets: usize,
    /// Loser rows deleted
    pub rows_removed: usize,
    /// Dependent rows whose foreign key was moved to a survivor
    pub references_repointed: u64,
    /// Survivor columns filled from losers
    pub fields_filled: usize,
    /// Survivors whose key or identity was rewritten in canonical form
    pub keys_normalized: usize,
    pub index_created: bool,
}

impl EntityDedupStats {
    fn new(entity_type: EntityType) -> Self {
        Self {
            entity_type,
            scanned: 0,
            unkeyable: 0,
            duplicate_sets: 0,
            rows_removed: 0,
            references_repointed: 0,
            fields_filled: 0,
            keys_normalized: 0,
            index_created: false,
        }
    }

    pub fn mutations(&self) -> u64 {
        (self.rows_removed + self.fields_filled + self.keys_normalized + usize::from(self.index_created)) as u64
            + self.references_repointed
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DedupReport {
    pub entities: Vec<EntityDedupStats>,
}

impl DedupReport {
    /// Total writes performed; zero on a store that was already clean
    pub fn total_mutations(&self) -> u64 {
        self.entities.iter().map(EntityDedupStats::mutations).sum()
    }

    pub fn for_type(&self, entity_type: EntityType) -> Option<&EntityDedupStats> {
        self.entities.iter().find(|s| s.entity_type == entity_type)
    }
}

/// Foreign keys pointing at rows that do not exist
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DanglingReferences {
    pub table: &'static str,
    pub column: &'static str,
    pub count: i64,
}

/// A stored row with its recomputed canonical identity
struct Keyed {
    record: CanonicalRecord,
    identity: CanonicalIdentity,
    key: String,
}

pub struct DedupProcedure {
    pool: SqlitePool,
    max_lock_wait_ms: u64,
}

impl DedupProcedure {
    pub fn new(pool: SqlitePool, max_lock_wait_ms: u64) -> Self {
        Self { pool, max_lock_wait_ms }
    }

    /// Run over every canonical table, parents first
    pub async fn run(&self) -> IngestResult<DedupReport> {
        let mut report = DedupReport::default();
        for schema in ALL_SCHEMAS {
            report.entities.push(self.run_entity(schema).await?);
        }

        info!(mutations = report.total_mutations(), "Dedup complete");
        Ok(report)
    }

    /// Run over one table
    pub async fn run_entity(&self, schema: &'static EntitySchema) -> IngestResult<EntityDedupStats> {
        let mut stats = EntityDedupStats::new(schema.entity_type);

        let rows = records::find_all(&self.pool, schema).await?;
        stats.scanned = rows.len();

        let mut groups: BTreeMap<String, Vec<Keyed>> = BTreeMap::new();
        for record in rows {
            match rekey(&record) {
                Ok((identity, key)) => groups.entry(key.clone()).or_default().push(Keyed { record, identity, key }),
                Err(err) => {
                    stats.unkeyable += 1;
                    warn!(table = schema.table, id = ?record.id, error = %err, "Row cannot be keyed, skipping");
                }
            }
        }

        let mut survivors = Vec::with_capacity(groups.len());
        for (_, mut group) in groups {
            // find_all orders by id, so the first row is the survivor
            let mut survivor = group.remove(0);
            if !group.is_empty() {
                stats.duplicate_sets += 1;
                let (filled, repointed) = self.collapse_set(schema, &mut survivor, &group).await?;
                stats.fields_filled += filled;
                stats.references_repointed += repointed;
                stats.rows_removed += group.len();
            }
            survivors.push(survivor);
        }

        stats.keys_normalized = self.normalize_keys(schema, &survivors).await?;

        let duplicate_keys = count_duplicate_keys(&self.pool, schema).await?;
        if duplicate_keys > 0 {
            return Err(IngestError::ConstraintViolation {
                table: schema.table,
                duplicate_keys,
            });
        }

        let index = schema.unique_index_name();
        if !SchemaIntrospector::index_exists(&self.pool, &index).await? {
            let sql = format!(
                "CREATE UNIQUE INDEX IF NOT EXISTS {} ON {}(natural_key)",
                index, schema.table
            );
            sqlx::query(&sql).execute(&self.pool).await?;
            stats.index_created = true;
        }

        info!(
            table = schema.table,
            scanned = stats.scanned,
            duplicate_sets = stats.duplicate_sets,
            rows_removed = stats.rows_removed,
            references_repointed = stats.references_repointed,
            keys_normalized = stats.keys_normalized,
            unkeyable = stats.unkeyable,
            index_created = stats.index_created,
            "Dedup table pass complete"
        );
        Ok(stats)
    }

    /// Fold one duplicate set into its survivor; returns (fields filled, references moved)
    async fn collapse_set(
        &self,
        schema: &'static EntitySchema,
        survivor: &mut Keyed,
        losers: &[Keyed],
    ) -> IngestResult<(usize, u64)> {
        let loser_records: Vec<CanonicalRecord> = losers.iter().map(|l| l.record.clone()).collect();
        let loser_ids: Vec<i64> = loser_records.iter().filter_map(|r| r.id).collect();

        let mut filled_record = survivor.record.clone();
        let mut filled: Vec<&'static str> = fill_enrichment(&mut filled_record, &loser_records);
        if let Some(link) = &schema.parent {
            if filled_record.parent_id.is_none() {
                filled_record.parent_id = loser_records.iter().find_map(|r| r.parent_id);
                if filled_record.parent_id.is_some() {
                    filled.push(link.column);
                }
            }
        }

        let survivor_id = survivor.record.id;
        let record = &filled_record;
        let filled_ref = &filled;
        let loser_ids_ref = &loser_ids;

        let repointed = retry_on_lock("dedup::collapse_set", self.max_lock_wait_ms, || async move {
            let mut tx = begin_monitored(&self.pool, "dedup::collapse_set").await?;

            if !filled_ref.is_empty() {
                let assignments: Vec<String> = filled_ref.iter().map(|c| format!("{} = ?", c)).collect();
                let sql = format!("UPDATE {} SET {} WHERE id = ?", schema.table, assignments.join(", "));
                let mut query = sqlx::query(&sql);
                for column in filled_ref.iter() {
                    if schema.parent.map_or(false, |l| l.column == *column) {
                        query = query.bind(record.parent_id);
                    } else {
                        query = bind_value(query, record.field(column));
                    }
                }
                query.bind(survivor_id).execute(tx.conn()).await?;
            }

            let mut repointed = 0u64;
            for dependent in schema.dependents() {
                let sql = format!(
                    "UPDATE {t} SET {c} = ? WHERE {c} IN ({ids})",
                    t = dependent.table,
                    c = dependent.column,
                    ids = placeholders(loser_ids_ref.len())
                );
                let mut query = sqlx::query(&sql).bind(survivor_id);
                for id in loser_ids_ref.iter() {
                    query = query.bind(*id);
                }
                repointed += query.execute(tx.conn()).await?.rows_affected();
            }

            let sql = format!(
                "DELETE FROM {} WHERE id IN ({})",
                schema.table,
                placeholders(loser_ids_ref.len())
            );
            let mut query = sqlx::query(&sql);
            for id in loser_ids_ref.iter() {
                query = query.bind(*id);
            }
            query.execute(tx.conn()).await?;

            tx.commit().await?;
            Ok(repointed)
        })
        .await?;

        info!(
            table = schema.table,
            natural_key = %survivor.key,
            survivor = ?survivor_id,
            removed = loser_ids.len(),
            repointed,
            "Collapsed duplicate set"
        );

        let filled_count = filled.len();
        survivor.record = filled_record;
        Ok((filled_count, repointed))
    }

    /// Rewrite non-canonical keys/identity of surviving rows
    ///
    /// Two phases in one transaction, so a survivor may take a key another
    /// survivor is about to give up without tripping the unique index.
    async fn normalize_keys(&self, schema: &'static EntitySchema, survivors: &[Keyed]) -> IngestResult<usize> {
        let stale: Vec<&Keyed> = survivors
            .iter()
            .filter(|s| {
                s.record.natural_key != s.key
                    || schema
                        .identity
                        .iter()
                        .any(|c| s.record.field(c.name) != s.identity.get(c.name).unwrap_or(&FieldValue::Null))
            })
            .collect();
        if stale.is_empty() {
            return Ok(0);
        }

        let stale_ref = &stale;
        retry_on_lock("dedup::normalize_keys", self.max_lock_wait_ms, || async move {
            let mut tx = begin_monitored(&self.pool, "dedup::normalize_keys").await?;

            let park = format!("UPDATE {} SET natural_key = ? WHERE id = ?", schema.table);
            for row in stale_ref.iter() {
                sqlx::query(&park)
                    .bind(format!("~dedup~{}", row.record.id.unwrap_or_default()))
                    .bind(row.record.id)
                    .execute(tx.conn())
                    .await?;
            }

            let mut assignments = vec!["natural_key = ?".to_string()];
            assignments.extend(schema.identity.iter().map(|c| format!("{} = ?", c.name)));
            let sql = format!("UPDATE {} SET {} WHERE id = ?", schema.table, assignments.join(", "));
            for row in stale_ref.iter() {
                let mut query = sqlx::query(&sql).bind(row.key.clone());
                for column in schema.identity {
                    query = bind_value(query, row.identity.get(column.name).unwrap_or(&FieldValue::Null));
                }
                query.bind(row.record.id).execute(tx.conn()).await?;
            }

            tx.commit().await?;
            Ok(())
        })
        .await?;

        info!(table = schema.table, rows = stale.len(), "Normalized stored keys");
        Ok(stale.len())
    }
}

/// Canonical identity and key recomputed from a stored row
fn rekey(record: &CanonicalRecord) -> Result<(CanonicalIdentity, String), crate::error::KeyError> {
    let attributes: IdentityAttributes = record
        .schema()
        .identity
        .iter()
        .filter_map(|c| record.field(c.name).to_raw().map(|v| (c.name, v)))
        .collect();
    let identity = natural_key::canonicalize_identity(record.entity_type, &attributes)?;
    let key = natural_key::render_key(record.schema(), &identity).into_string();
    Ok((identity, key))
}

async fn count_duplicate_keys(pool: &SqlitePool, schema: &EntitySchema) -> IngestResult<usize> {
    let sql = format!(
        "SELECT COUNT(*) FROM (SELECT natural_key FROM {} WHERE natural_key IS NOT NULL GROUP BY natural_key HAVING COUNT(*) > 1)",
        schema.table
    );
    let count: i64 = sqlx::query_scalar(&sql).fetch_one(pool).await?;
    Ok(count.max(0) as usize)
}

/// Count foreign keys whose target row is missing, per dependent column
pub async fn verify_references(pool: &SqlitePool) -> IngestResult<Vec<DanglingReferences>> {
    let mut findings = Vec::new();
    for schema in ALL_SCHEMAS {
        let Some(link) = &schema.parent else {
            continue;
        };
        let parent = EntitySchema::for_type(link.parent);
        let sql = format!(
            "SELECT COUNT(*) FROM {t} WHERE {c} IS NOT NULL AND {c} NOT IN (SELECT id FROM {p})",
            t = schema.table,
            c = link.column,
            p = parent.table
        );
        let count: i64 = sqlx::query_scalar(&sql).fetch_one(pool).await?;
        findings.push(DanglingReferences {
            table: schema.table,
            column: link.column,
            count,
        });
    }
    Ok(findings)
}
