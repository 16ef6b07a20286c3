//! Row ↔ record mapping for the canonical tables
//!
//! Column lists are derived from the table descriptors, never from the live
//! schema.

use crate::models::CanonicalRecord;
use crate::normalize::SittingCalendar;
use crate::types::FieldValue;
use chrono::NaiveDate;
use parl_common::db::{ColumnKind, EntitySchema};
use parl_common::time::{format_timestamp, parse_timestamp};
use parl_common::Result;
use sqlx::query::Query;
use sqlx::sqlite::{SqliteArguments, SqliteRow};
use sqlx::{Executor, Row, Sqlite, SqlitePool};
use std::collections::HashMap;

/// Largest number of keys placed in one `IN (...)` list
pub const MAX_IN_LIST: usize = 500;

/// Columns written by an INSERT, in bind order
pub fn write_columns(schema: &EntitySchema) -> Vec<&'static str> {
    let mut columns = vec!["natural_key"];
    columns.extend(schema.identity.iter().map(|c| c.name));
    columns.extend(schema.field_columns().map(|c| c.name));
    if let Some(link) = &schema.parent {
        columns.push(link.column);
    }
    columns.extend(["first_seen", "last_updated", "revision"]);
    columns
}

/// Every column read back into a record: `id` followed by [`write_columns`]
pub fn select_list(schema: &EntitySchema) -> String {
    let mut columns = vec!["id"];
    columns.extend(write_columns(schema));
    columns.join(", ")
}

/// `?, ?, ...` with `n` placeholders
pub fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

/// Bind one column value
pub fn bind_value<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    value: &FieldValue,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    match value {
        FieldValue::Null => query.bind(None::<String>),
        FieldValue::Text(s) => query.bind(s.clone()),
        FieldValue::Integer(n) => query.bind(*n),
    }
}

/// Bind a record's values in [`write_columns`] order
pub fn bind_record<'q>(
    mut query: Query<'q, Sqlite, SqliteArguments<'q>>,
    record: &CanonicalRecord,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    let schema = record.schema();

    query = query.bind(record.natural_key.clone());
    for column in schema.identity {
        query = bind_value(query, record.field(column.name));
    }
    for column in schema.field_columns() {
        query = bind_value(query, record.field(column.name));
    }
    if schema.parent.is_some() {
        query = query.bind(record.parent_id);
    }
    query
        .bind(record.first_seen.as_ref().map(format_timestamp))
        .bind(record.last_updated.as_ref().map(format_timestamp))
        .bind(record.revision)
}

/// Read a column, tolerating legacy rows whose stored type differs from the descriptor
pub fn read_value(row: &SqliteRow, name: &str, kind: ColumnKind) -> Result<FieldValue> {
    let value = match kind {
        ColumnKind::Integer => match row.try_get::<Option<i64>, _>(name) {
            Ok(v) => FieldValue::from(v),
            Err(_) => FieldValue::from(row.try_get::<Option<String>, _>(name)?),
        },
        ColumnKind::Text => match row.try_get::<Option<String>, _>(name) {
            Ok(v) => FieldValue::from(v),
            Err(_) => FieldValue::from(row.try_get::<Option<i64>, _>(name)?.map(|n| n.to_string())),
        },
    };
    Ok(value)
}

/// Build a record from a row selected with [`select_list`]
pub fn record_from_row(schema: &EntitySchema, row: &SqliteRow) -> Result<CanonicalRecord> {
    let natural_key: Option<String> = row.try_get("natural_key")?;
    let mut record = CanonicalRecord::new(schema.entity_type, natural_key.unwrap_or_default());
    record.id = Some(row.try_get("id")?);

    for column in schema.identity {
        record
            .identity
            .insert(column.name, read_value(row, column.name, column.kind)?);
    }
    for column in schema.field_columns() {
        let value = read_value(row, column.name, column.kind)?;
        record.set_field(column.name, value);
    }
    if let Some(link) = &schema.parent {
        record.parent_id = row.try_get(link.column)?;
    }

    let first_seen: Option<String> = row.try_get("first_seen")?;
    let last_updated: Option<String> = row.try_get("last_updated")?;
    record.first_seen = first_seen.as_deref().and_then(parse_timestamp);
    record.last_updated = last_updated.as_deref().and_then(parse_timestamp);
    record.revision = row.try_get::<Option<i64>, _>("revision")?.unwrap_or(0);

    Ok(record)
}

/// Stored record with the given natural key (lowest id if duplicated)
pub async fn find_by_key<'e, E>(executor: E, schema: &EntitySchema, natural_key: &str) -> Result<Option<CanonicalRecord>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let sql = format!(
        "SELECT {} FROM {} WHERE natural_key = ? ORDER BY id LIMIT 1",
        select_list(schema),
        schema.table
    );
    let row = sqlx::query(&sql).bind(natural_key).fetch_optional(executor).await?;
    row.map(|r| record_from_row(schema, &r)).transpose()
}

/// Every stored record of a type, ordered by id
pub async fn find_all(pool: &SqlitePool, schema: &EntitySchema) -> Result<Vec<CanonicalRecord>> {
    let sql = format!("SELECT {} FROM {} ORDER BY id", select_list(schema), schema.table);
    let rows = sqlx::query(&sql).fetch_all(pool).await?;
    rows.iter().map(|r| record_from_row(schema, r)).collect()
}

/// Surrogate ids for a set of natural keys (lowest id per key)
///
/// `keys` must not exceed [`MAX_IN_LIST`].
pub async fn resolve_ids<'e, E>(executor: E, schema: &EntitySchema, keys: &[&str]) -> Result<HashMap<String, i64>>
where
    E: Executor<'e, Database = Sqlite>,
{
    if keys.is_empty() {
        return Ok(HashMap::new());
    }
    let sql = format!(
        "SELECT natural_key, MIN(id) FROM {} WHERE natural_key IN ({}) GROUP BY natural_key",
        schema.table,
        placeholders(keys.len())
    );
    let mut query = sqlx::query_as::<_, (String, i64)>(&sql);
    for key in keys {
        query = query.bind(*key);
    }
    Ok(query.fetch_all(executor).await?.into_iter().collect())
}

/// Sitting calendar built from every stored debate
pub async fn load_sitting_calendar(pool: &SqlitePool) -> Result<SittingCalendar> {
    let rows: Vec<(String, i64, i64, String)> = sqlx::query_as(
        r#"
        SELECT jurisdiction, parliament, session, sitting_date
        FROM debates
        WHERE jurisdiction IS NOT NULL AND parliament IS NOT NULL
          AND session IS NOT NULL AND sitting_date IS NOT NULL
        "#,
    )
    .fetch_all(pool)
    .await?;

    let mut calendar = SittingCalendar::new();
    for (jurisdiction, parliament, session, sitting_date) in rows {
        let (Ok(parliament), Ok(session)) = (u32::try_from(parliament), u32::try_from(session)) else {
            continue;
        };
        if let Ok(date) = NaiveDate::parse_from_str(&sitting_date, "%Y-%m-%d") {
            calendar.insert(&jurisdiction, date, parliament, session);
        }
    }

    tracing::debug!(sittings = calendar.len(), "Loaded sitting calendar");
    Ok(calendar)
}
