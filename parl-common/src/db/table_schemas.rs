//! Canonical Table Descriptors
//!
//! Single source of truth for every canonical table: which columns form the
//! identity, which are mutable content, which are additive enrichment, and
//! which foreign keys point at which parent. The upsert engine, the schema
//! sync and the dedup procedure all consult these descriptors instead of
//! introspecting the live database.
//!
//! Bump [`SCHEMA_VERSION`] whenever a descriptor changes.

use crate::db::schema_sync::ColumnDefinition;
use crate::EntityType;

/// Version of the descriptor set below
pub const SCHEMA_VERSION: i32 = 1;

/// Placeholder timestamp for rows that predate the `first_seen`/`last_updated` columns
pub const EPOCH_TIMESTAMP: &str = "1970-01-01T00:00:00.000000Z";

/// Storage class of a column
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Text,
    Integer,
}

impl ColumnKind {
    pub fn sql_type(&self) -> &'static str {
        match self {
            ColumnKind::Text => "TEXT",
            ColumnKind::Integer => "INTEGER",
        }
    }
}

/// How a raw identity value is canonicalized before it joins a natural key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityRule {
    /// Lower-cased, alias-resolved jurisdiction ("CA" → "ca-federal")
    Jurisdiction,
    /// Trimmed, whitespace-collapsed, upper-cased code ("fina " → "FINA")
    Code,
    /// Non-negative integer (parliament, session, sequence numbers)
    Number,
    /// Calendar date, `YYYY-MM-DD`
    Date,
}

/// Identity column: immutable once set, part of the natural key
#[derive(Debug, Clone, Copy)]
pub struct IdentityColumn {
    pub name: &'static str,
    pub kind: ColumnKind,
    pub rule: IdentityRule,
}

/// Content or enrichment column
#[derive(Debug, Clone, Copy)]
pub struct FieldColumn {
    pub name: &'static str,
    pub kind: ColumnKind,
}

/// Foreign key from a dependent table to its parent's surrogate id
#[derive(Debug, Clone, Copy)]
pub struct ParentLink {
    /// FK column on the dependent table
    pub column: &'static str,
    pub parent: EntityType,
    /// Whether a row may exist without a resolved parent
    pub required: bool,
}

/// A (table, column) pair referencing some canonical table's `id`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DependentRef {
    pub entity_type: EntityType,
    pub table: &'static str,
    pub column: &'static str,
}

/// Descriptor of one canonical table
#[derive(Debug)]
pub struct EntitySchema {
    pub entity_type: EntityType,
    pub table: &'static str,
    /// Ordered: the natural key is rendered in this order
    pub identity: &'static [IdentityColumn],
    pub content: &'static [FieldColumn],
    pub enrichment: &'static [FieldColumn],
    pub parent: Option<ParentLink>,
}

const fn id_col(name: &'static str, kind: ColumnKind, rule: IdentityRule) -> IdentityColumn {
    IdentityColumn { name, kind, rule }
}

const fn text(name: &'static str) -> FieldColumn {
    FieldColumn { name, kind: ColumnKind::Text }
}

const fn int(name: &'static str) -> FieldColumn {
    FieldColumn { name, kind: ColumnKind::Integer }
}

const JURISDICTION: IdentityColumn = id_col("jurisdiction", ColumnKind::Text, IdentityRule::Jurisdiction);
const PARLIAMENT: IdentityColumn = id_col("parliament", ColumnKind::Integer, IdentityRule::Number);
const SESSION: IdentityColumn = id_col("session", ColumnKind::Integer, IdentityRule::Number);
const SITTING_DATE: IdentityColumn = id_col("sitting_date", ColumnKind::Text, IdentityRule::Date);

static COMMITTEES: EntitySchema = EntitySchema {
    entity_type: EntityType::Committee,
    table: "committees",
    identity: &[JURISDICTION, id_col("code", ColumnKind::Text, IdentityRule::Code)],
    content: &[text("name"), text("chamber")],
    enrichment: &[text("short_name"), text("website_url")],
    parent: None,
};

static BILLS: EntitySchema = EntitySchema {
    entity_type: EntityType::Bill,
    table: "bills",
    identity: &[
        JURISDICTION,
        PARLIAMENT,
        SESSION,
        id_col("number", ColumnKind::Text, IdentityRule::Code),
    ],
    content: &[text("title"), text("status"), text("introduced_on"), text("chamber")],
    enrichment: &[text("short_title"), text("summary"), text("sponsor_name"), text("text_url")],
    parent: None,
};

static DEBATES: EntitySchema = EntitySchema {
    entity_type: EntityType::Debate,
    table: "debates",
    identity: &[JURISDICTION, PARLIAMENT, SESSION, SITTING_DATE],
    content: &[text("sitting_number"), text("source_url")],
    enrichment: &[text("summary"), text("video_url")],
    parent: None,
};

static VOTES: EntitySchema = EntitySchema {
    entity_type: EntityType::Vote,
    table: "votes",
    identity: &[
        JURISDICTION,
        PARLIAMENT,
        SESSION,
        id_col("number", ColumnKind::Integer, IdentityRule::Number),
    ],
    content: &[
        text("held_on"),
        text("description"),
        text("result"),
        int("yea_total"),
        int("nay_total"),
        int("paired_total"),
    ],
    enrichment: &[text("context_summary")],
    parent: Some(ParentLink {
        column: "bill_id",
        parent: EntityType::Bill,
        required: false,
    }),
};

static MEETINGS: EntitySchema = EntitySchema {
    entity_type: EntityType::Meeting,
    table: "meetings",
    identity: &[
        JURISDICTION,
        PARLIAMENT,
        SESSION,
        id_col("committee_code", ColumnKind::Text, IdentityRule::Code),
        id_col("number", ColumnKind::Integer, IdentityRule::Number),
    ],
    content: &[text("held_on"), text("title"), text("status")],
    enrichment: &[text("evidence_url"), text("minutes_url")],
    parent: Some(ParentLink {
        column: "committee_id",
        parent: EntityType::Committee,
        required: true,
    }),
};

static SPEECHES: EntitySchema = EntitySchema {
    entity_type: EntityType::Speech,
    table: "speeches",
    identity: &[
        JURISDICTION,
        PARLIAMENT,
        SESSION,
        SITTING_DATE,
        id_col("sequence", ColumnKind::Integer, IdentityRule::Number),
    ],
    content: &[text("speaker_name"), text("content"), text("spoken_at"), text("heading")],
    enrichment: &[text("speaker_party"), text("speaker_slug")],
    parent: Some(ParentLink {
        column: "debate_id",
        parent: EntityType::Debate,
        required: true,
    }),
};

/// All descriptors, parents before dependents
pub static ALL_SCHEMAS: [&EntitySchema; 6] =
    [&COMMITTEES, &BILLS, &DEBATES, &VOTES, &MEETINGS, &SPEECHES];

impl EntitySchema {
    /// Descriptor for an entity type
    pub fn for_type(entity_type: EntityType) -> &'static EntitySchema {
        match entity_type {
            EntityType::Committee => &COMMITTEES,
            EntityType::Bill => &BILLS,
            EntityType::Debate => &DEBATES,
            EntityType::Vote => &VOTES,
            EntityType::Meeting => &MEETINGS,
            EntityType::Speech => &SPEECHES,
        }
    }

    /// Tables whose foreign keys reference this table's `id`
    pub fn dependents(&self) -> Vec<DependentRef> {
        ALL_SCHEMAS
            .iter()
            .filter_map(|schema| {
                schema
                    .parent
                    .filter(|link| link.parent == self.entity_type)
                    .map(|link| DependentRef {
                        entity_type: schema.entity_type,
                        table: schema.table,
                        column: link.column,
                    })
            })
            .collect()
    }

    /// Name of the unique index enforcing natural-key identity
    pub fn unique_index_name(&self) -> String {
        format!("ux_{}_natural_key", self.table)
    }

    /// Content and enrichment columns together, content first
    pub fn field_columns(&self) -> impl Iterator<Item = &'static FieldColumn> {
        self.content.iter().chain(self.enrichment.iter())
    }

    /// Whether `name` is one of this table's enrichment columns
    pub fn is_enrichment(&self, name: &str) -> bool {
        self.enrichment.iter().any(|c| c.name == name)
    }

    /// Expected column list, used both for table creation and schema sync
    pub fn expected_columns(&self) -> Vec<ColumnDefinition> {
        let mut columns = vec![
            ColumnDefinition::new("id", "INTEGER").primary_key(),
            ColumnDefinition::new("natural_key", "TEXT"),
        ];

        for col in self.identity {
            columns.push(ColumnDefinition::new(col.name, col.kind.sql_type()));
        }
        for col in self.field_columns() {
            columns.push(ColumnDefinition::new(col.name, col.kind.sql_type()));
        }
        if let Some(link) = &self.parent {
            columns.push(
                ColumnDefinition::new(link.column, "INTEGER")
                    .references(EntitySchema::for_type(link.parent).table),
            );
        }

        columns.push(
            ColumnDefinition::new("first_seen", "TEXT")
                .not_null()
                .default(format!("'{}'", EPOCH_TIMESTAMP)),
        );
        columns.push(
            ColumnDefinition::new("last_updated", "TEXT")
                .not_null()
                .default(format!("'{}'", EPOCH_TIMESTAMP)),
        );
        columns.push(ColumnDefinition::new("revision", "INTEGER").not_null().default("0"));

        columns
    }

    /// `CREATE TABLE IF NOT EXISTS` statement for this descriptor.
    ///
    /// The natural-key unique index is deliberately not part of the table
    /// definition; it is created by the dedup procedure once the table is clean.
    pub fn create_table_sql(&self) -> String {
        let columns: Vec<String> = self
            .expected_columns()
            .iter()
            .map(|col| {
                if col.primary_key {
                    format!("{} INTEGER PRIMARY KEY AUTOINCREMENT", col.name)
                } else {
                    col.to_sql()
                }
            })
            .collect();

        format!(
            "CREATE TABLE IF NOT EXISTS {} (\n    {}\n)",
            self.table,
            columns.join(",\n    ")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_type_has_a_descriptor() {
        for entity_type in EntityType::ALL {
            assert_eq!(EntitySchema::for_type(entity_type).entity_type, entity_type);
        }
    }

    #[test]
    fn committee_dependents_are_meetings() {
        let deps = EntitySchema::for_type(EntityType::Committee).dependents();
        assert_eq!(
            deps,
            vec![DependentRef {
                entity_type: EntityType::Meeting,
                table: "meetings",
                column: "committee_id",
            }]
        );
        assert!(EntitySchema::for_type(EntityType::Speech).dependents().is_empty());
    }

    #[test]
    fn parents_precede_dependents() {
        for (idx, schema) in ALL_SCHEMAS.iter().enumerate() {
            if let Some(link) = schema.parent {
                let parent_idx = ALL_SCHEMAS
                    .iter()
                    .position(|s| s.entity_type == link.parent)
                    .unwrap();
                assert!(parent_idx < idx, "{} listed before its parent", schema.table);
            }
        }
    }

    #[test]
    fn create_table_sql_contains_bookkeeping_columns() {
        let sql = EntitySchema::for_type(EntityType::Meeting).create_table_sql();
        assert!(sql.contains("id INTEGER PRIMARY KEY AUTOINCREMENT"));
        assert!(sql.contains("natural_key TEXT"));
        assert!(sql.contains("committee_id INTEGER REFERENCES committees(id)"));
        assert!(sql.contains("revision INTEGER NOT NULL DEFAULT 0"));
    }

    #[test]
    fn column_names_are_unique_per_table() {
        for schema in ALL_SCHEMAS {
            let mut names: Vec<String> =
                schema.expected_columns().into_iter().map(|c| c.name).collect();
            let total = names.len();
            names.sort();
            names.dedup();
            assert_eq!(names.len(), total, "duplicate column in {}", schema.table);
        }
    }
}
