//! Field-level merge policy
//!
//! | Column class | On merge                                        |
//! |--------------|-------------------------------------------------|
//! | identity     | never changed                                   |
//! | content      | replaced by the incoming value, even if empty   |
//! | enrichment   | replaced only by a non-empty incoming value     |
//! | parent FK    | replaced only by a resolved incoming parent     |
//!
//! The same policy is expressed twice: [`merge`] applies it in memory (the
//! per-row write path and in-batch duplicate collapsing), and
//! [`conflict_assignments`] renders it as the `DO UPDATE SET` clause of the
//! set-based write path. Both must agree.

use crate::models::CanonicalRecord;
use chrono::{DateTime, Utc};
use parl_common::db::{ColumnKind, EntitySchema};

/// How a column behaves when an existing record is merged
///
/// Both write paths dispatch on this classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeRule {
    Identity,
    Overwrite,
    Additive,
}

/// Rule for a column of `schema`
pub fn rule_for(schema: &EntitySchema, column: &str) -> MergeRule {
    if schema.identity.iter().any(|c| c.name == column) {
        MergeRule::Identity
    } else if schema.is_enrichment(column) || schema.parent.map_or(false, |p| p.column == column) {
        MergeRule::Additive
    } else {
        MergeRule::Overwrite
    }
}

/// Merge an incoming record into the stored one
///
/// With no existing record the incoming one is returned with both timestamps
/// set to `now`. Otherwise the result carries the existing id, key, identity
/// and `first_seen`; `revision` is left for the store to advance.
pub fn merge(existing: Option<&CanonicalRecord>, incoming: CanonicalRecord, now: DateTime<Utc>) -> CanonicalRecord {
    let Some(existing) = existing else {
        let mut created = incoming;
        created.first_seen = Some(now);
        created.last_updated = Some(now);
        return created;
    };

    let schema = existing.schema();
    let mut merged = existing.clone();

    for column in schema.field_columns() {
        match rule_for(schema, column.name) {
            MergeRule::Overwrite => {
                let value = incoming.field(column.name).clone();
                merged.set_field(column.name, value);
            }
            MergeRule::Additive => {
                let value = incoming.field(column.name);
                if !value.is_empty() {
                    merged.set_field(column.name, value.clone());
                }
            }
            MergeRule::Identity => {}
        }
    }

    if incoming.parent.is_some() {
        merged.parent = incoming.parent;
    }
    if incoming.parent_id.is_some() {
        merged.parent_id = incoming.parent_id;
    }

    merged.first_seen = existing.first_seen.or(Some(now));
    merged.last_updated = Some(now);
    merged
}

/// Fill empty enrichment columns of `target` from `donors`, in order
///
/// Returns the names of the columns that were filled.
pub fn fill_enrichment(target: &mut CanonicalRecord, donors: &[CanonicalRecord]) -> Vec<&'static str> {
    let schema = target.schema();
    let mut filled = Vec::new();

    for column in schema.enrichment {
        if !target.field(column.name).is_empty() {
            continue;
        }
        let donated = donors
            .iter()
            .map(|d| d.field(column.name))
            .find(|v| !v.is_empty())
            .cloned();
        if let Some(value) = donated {
            target.enrichment.insert(column.name, value);
            filled.push(column.name);
        }
    }

    filled
}

/// `DO UPDATE SET` assignments for an `INSERT ... ON CONFLICT(natural_key)`
///
/// Bookkeeping columns are included: `last_updated` takes the incoming value,
/// `revision` advances, `first_seen` is left alone.
pub fn conflict_assignments(schema: &EntitySchema) -> Vec<String> {
    let table = schema.table;
    let mut assignments = Vec::new();

    let columns = schema
        .field_columns()
        .map(|c| (c.name, c.kind))
        .chain(schema.parent.map(|link| (link.column, ColumnKind::Integer)));
    for (column, kind) in columns {
        match rule_for(schema, column) {
            MergeRule::Overwrite => assignments.push(format!("{c} = excluded.{c}", c = column)),
            MergeRule::Additive => assignments.push(additive_assignment(table, column, kind)),
            MergeRule::Identity => {}
        }
    }

    assignments.push("last_updated = excluded.last_updated".to_string());
    assignments.push(format!("revision = {}.revision + 1", table));
    assignments
}

fn additive_assignment(table: &str, column: &str, kind: ColumnKind) -> String {
    match kind {
        ColumnKind::Text => format!(
            "{c} = CASE WHEN TRIM(excluded.{c}) <> '' THEN excluded.{c} ELSE {t}.{c} END",
            c = column,
            t = table
        ),
        ColumnKind::Integer => format!("{c} = COALESCE(excluded.{c}, {t}.{c})", c = column, t = table),
    }
}
