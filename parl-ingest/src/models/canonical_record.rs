//! Canonical record: the typed, validated form of one entity
//!
//! Columns are partitioned exactly as the table descriptor partitions them:
//! identity (immutable, forms the natural key), content (overwritten on every
//! merge) and enrichment (only ever filled in).

use crate::types::FieldValue;
use chrono::{DateTime, Utc};
use parl_common::db::EntitySchema;
use parl_common::EntityType;
use std::collections::BTreeMap;

static NULL: FieldValue = FieldValue::Null;

/// Reference to the record this one depends on, by natural key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParentRef {
    pub entity_type: EntityType,
    pub natural_key: String,
    /// A record with a required parent fails when the parent is not stored
    pub required: bool,
}

/// Typed record ready for the store
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalRecord {
    pub entity_type: EntityType,
    /// Surrogate row id; storage-internal, `None` until stored
    pub id: Option<i64>,
    pub natural_key: String,
    pub identity: BTreeMap<&'static str, FieldValue>,
    pub content: BTreeMap<&'static str, FieldValue>,
    pub enrichment: BTreeMap<&'static str, FieldValue>,
    pub parent: Option<ParentRef>,
    /// Resolved parent surrogate id
    pub parent_id: Option<i64>,
    pub first_seen: Option<DateTime<Utc>>,
    pub last_updated: Option<DateTime<Utc>>,
    pub revision: i64,
}

impl CanonicalRecord {
    /// Empty record of the given type and key
    pub fn new(entity_type: EntityType, natural_key: impl Into<String>) -> Self {
        Self {
            entity_type,
            id: None,
            natural_key: natural_key.into(),
            identity: BTreeMap::new(),
            content: BTreeMap::new(),
            enrichment: BTreeMap::new(),
            parent: None,
            parent_id: None,
            first_seen: None,
            last_updated: None,
            revision: 0,
        }
    }

    pub fn schema(&self) -> &'static EntitySchema {
        EntitySchema::for_type(self.entity_type)
    }

    /// Value of any identity, content or enrichment column (`Null` if unset)
    pub fn field(&self, name: &str) -> &FieldValue {
        self.identity
            .get(name)
            .or_else(|| self.content.get(name))
            .or_else(|| self.enrichment.get(name))
            .unwrap_or(&NULL)
    }

    /// Text value of a column, if set
    pub fn text(&self, name: &str) -> Option<&str> {
        self.field(name).as_text()
    }

    /// Set a content or enrichment column, routed by the descriptor
    pub fn set_field(&mut self, name: &'static str, value: FieldValue) {
        if self.schema().is_enrichment(name) {
            self.enrichment.insert(name, value);
        } else {
            self.content.insert(name, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_field_routes_by_descriptor() {
        let mut record = CanonicalRecord::new(EntityType::Bill, "ca-federal-44-1-C-10");
        record.set_field("title", FieldValue::text("An Act"));
        record.set_field("summary", FieldValue::text("Summary"));

        assert!(record.content.contains_key("title"));
        assert!(record.enrichment.contains_key("summary"));
        assert_eq!(record.text("title"), Some("An Act"));
        assert_eq!(record.field("status"), &FieldValue::Null);
    }
}
