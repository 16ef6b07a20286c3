//! Record normalization
//!
//! Converts one [`RawPayload`] into a [`CanonicalRecord`]: resolves field
//! aliases, canonicalizes identity, infers parliament/session from the
//! sitting calendar when a source only gives a date, parses dates and
//! timestamps, and derives the parent reference.
//!
//! Normalization is pure. The only outside state it reads is the
//! [`NormalizeContext`] the caller passes in.

pub mod calendar;
pub mod dates;
pub mod fields;

pub use calendar::SittingCalendar;

use crate::error::{IngestError, IngestResult};
use crate::models::{CanonicalRecord, ParentRef};
use crate::natural_key::{self, IdentityAttributes};
use crate::types::{FieldValue, RawPayload};
use chrono::{FixedOffset, Utc};
use parl_common::config::NormalizeConfig;
use parl_common::db::{ColumnKind, EntitySchema};
use parl_common::time::{format_date, format_timestamp};
use parl_common::EntityType;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::trace;

/// How a raw value is turned into a column value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Text,
    Integer,
    /// `YYYY-MM-DD`
    Date,
    /// RFC 3339, UTC
    Timestamp,
}

struct FieldSpec {
    column: &'static str,
    aliases: &'static [&'static str],
    format: Format,
}

const fn field(column: &'static str, aliases: &'static [&'static str], format: Format) -> FieldSpec {
    FieldSpec { column, aliases, format }
}

/// Per-entity source vocabulary
struct EntitySpec {
    /// Identity columns beyond jurisdiction/parliament/session
    identity: &'static [FieldSpec],
    fields: &'static [FieldSpec],
    /// Aliases naming the parent (votes → bill number, meetings → committee code)
    parent_aliases: &'static [&'static str],
    /// Date used for calendar lookup when parliament/session are absent
    date_column: Option<&'static str>,
}

const JURISDICTION_ALIASES: &[&str] = &["jurisdiction", "jurisdiction_code", "legislature"];
const PARLIAMENT_ALIASES: &[&str] = &["parliament", "parliament_number"];
const SESSION_ALIASES: &[&str] = &["session", "session_number"];

static COMMITTEE_SPEC: EntitySpec = EntitySpec {
    identity: &[field("code", &["code", "acronym", "short_code"], Format::Text)],
    fields: &[
        field("name", &["name", "title"], Format::Text),
        field("chamber", &["chamber", "house"], Format::Text),
        field("short_name", &["short_name"], Format::Text),
        field("website_url", &["website_url", "web_url"], Format::Text),
    ],
    parent_aliases: &[],
    date_column: None,
};

static BILL_SPEC: EntitySpec = EntitySpec {
    identity: &[field("number", &["number", "bill_number"], Format::Text)],
    fields: &[
        field("title", &["title", "name"], Format::Text),
        field("status", &["status", "status_code"], Format::Text),
        field("introduced_on", &["introduced_on", "introduced"], Format::Date),
        field("chamber", &["chamber", "home_chamber"], Format::Text),
        field("short_title", &["short_title"], Format::Text),
        field("summary", &["summary"], Format::Text),
        field("sponsor_name", &["sponsor_name", "sponsor"], Format::Text),
        field("text_url", &["text_url"], Format::Text),
    ],
    parent_aliases: &[],
    date_column: Some("introduced_on"),
};

static DEBATE_SPEC: EntitySpec = EntitySpec {
    identity: &[field("sitting_date", &["sitting_date", "date"], Format::Date)],
    fields: &[
        field("sitting_number", &["sitting_number", "number"], Format::Text),
        field("source_url", &["source_url", "url"], Format::Text),
        field("summary", &["summary"], Format::Text),
        field("video_url", &["video_url"], Format::Text),
    ],
    parent_aliases: &[],
    date_column: Some("sitting_date"),
};

static VOTE_SPEC: EntitySpec = EntitySpec {
    identity: &[field("number", &["number", "vote_number"], Format::Integer)],
    fields: &[
        field("held_on", &["held_on", "date"], Format::Date),
        field("description", &["description"], Format::Text),
        field("result", &["result"], Format::Text),
        field("yea_total", &["yea_total", "yeas"], Format::Integer),
        field("nay_total", &["nay_total", "nays"], Format::Integer),
        field("paired_total", &["paired_total", "paired"], Format::Integer),
        field("context_summary", &["context_summary", "context"], Format::Text),
    ],
    parent_aliases: &["bill_number", "bill", "bill_url"],
    date_column: Some("held_on"),
};

static MEETING_SPEC: EntitySpec = EntitySpec {
    identity: &[
        field("committee_code", &["committee_code", "committee"], Format::Text),
        field("number", &["number", "meeting_number"], Format::Integer),
    ],
    fields: &[
        field("held_on", &["held_on", "date"], Format::Date),
        field("title", &["title"], Format::Text),
        field("status", &["status"], Format::Text),
        field("evidence_url", &["evidence_url", "evidence"], Format::Text),
        field("minutes_url", &["minutes_url", "minutes"], Format::Text),
    ],
    parent_aliases: &[],
    date_column: Some("held_on"),
};

static SPEECH_SPEC: EntitySpec = EntitySpec {
    identity: &[
        field("sitting_date", &["sitting_date", "date"], Format::Date),
        field("sequence", &["sequence", "seq", "index"], Format::Integer),
    ],
    fields: &[
        field("speaker_name", &["speaker_name", "attribution"], Format::Text),
        field("content", &["content", "text"], Format::Text),
        field("spoken_at", &["spoken_at", "time"], Format::Timestamp),
        field("heading", &["heading", "h1"], Format::Text),
        field("speaker_party", &["speaker_party", "party"], Format::Text),
        field("speaker_slug", &["speaker_slug", "politician"], Format::Text),
    ],
    parent_aliases: &[],
    date_column: Some("sitting_date"),
};

fn spec_for(entity_type: EntityType) -> &'static EntitySpec {
    match entity_type {
        EntityType::Committee => &COMMITTEE_SPEC,
        EntityType::Bill => &BILL_SPEC,
        EntityType::Debate => &DEBATE_SPEC,
        EntityType::Vote => &VOTE_SPEC,
        EntityType::Meeting => &MEETING_SPEC,
        EntityType::Speech => &SPEECH_SPEC,
    }
}

/// Outside state available to normalization
#[derive(Debug, Clone, Default)]
pub struct NormalizeContext {
    pub calendar: SittingCalendar,
}

/// Stateless payload → record converter
#[derive(Debug, Clone, Default)]
pub struct Normalizer {
    default_jurisdiction: Option<String>,
    source_offset: Option<FixedOffset>,
}

impl Normalizer {
    pub fn new(default_jurisdiction: Option<String>, source_offset: Option<FixedOffset>) -> Self {
        Self {
            default_jurisdiction,
            source_offset,
        }
    }

    pub fn from_config(config: &NormalizeConfig) -> IngestResult<Self> {
        let source_offset = match config.source_utc_offset_minutes {
            Some(minutes) => Some(dates::offset_from_minutes(minutes).ok_or_else(|| {
                parl_common::Error::Config(format!("source_utc_offset_minutes out of range: {}", minutes))
            })?),
            None => None,
        };
        Ok(Self::new(config.default_jurisdiction.clone(), source_offset))
    }

    /// Convert one raw payload into a canonical record
    ///
    /// Fails with [`IngestError::MissingIdentityField`] when no natural key
    /// can be built, and [`IngestError::Validation`] for malformed fields.
    pub fn normalize(
        &self,
        entity_type: EntityType,
        raw: &RawPayload,
        ctx: &NormalizeContext,
    ) -> IngestResult<CanonicalRecord> {
        let body = raw
            .body
            .as_object()
            .ok_or_else(|| IngestError::Validation(format!("item {}: payload is not a JSON object", raw.item_ref)))?;

        let spec = spec_for(entity_type);
        let schema = EntitySchema::for_type(entity_type);

        let mut values = self.read_fields(body, spec)?;
        let mut attributes = self.read_identity(body, spec)?;

        self.derive_sitting_date(entity_type, body, &mut attributes);
        infer_session(&mut attributes, spec, &values, ctx);

        let identity = natural_key::canonicalize_identity(entity_type, &attributes)?;
        let key = natural_key::render_key(schema, &identity);

        let mut record = CanonicalRecord::new(entity_type, key.into_string());
        record.identity = identity;

        for column in schema.field_columns() {
            let value = values.remove(column.name).unwrap_or_default();
            record.set_field(column.name, value);
        }

        validate(&record)?;
        record.parent = parent_ref(entity_type, &record, body, spec);

        trace!(entity_type = %entity_type, natural_key = %record.natural_key, "Normalized record");
        Ok(record)
    }

    fn read_fields(
        &self,
        body: &Map<String, Value>,
        spec: &EntitySpec,
    ) -> IngestResult<BTreeMap<&'static str, FieldValue>> {
        let mut values = BTreeMap::new();
        for f in spec.fields {
            values.insert(f.column, self.convert(body, f)?);
        }
        Ok(values)
    }

    fn read_identity(&self, body: &Map<String, Value>, spec: &EntitySpec) -> IngestResult<IdentityAttributes> {
        let mut attributes = IdentityAttributes::new();

        let jurisdiction = fields::text_field(body, JURISDICTION_ALIASES).or_else(|| self.default_jurisdiction.clone());
        if let Some(j) = jurisdiction {
            attributes.insert("jurisdiction", j);
        }

        let session_text = fields::text_field(body, SESSION_ALIASES);
        match session_text.as_deref().and_then(fields::split_session_label) {
            Some((parliament, session)) => {
                attributes.insert("parliament", parliament.to_string());
                attributes.insert("session", session.to_string());
            }
            None => {
                if let Some(s) = session_text {
                    attributes.insert("session", s);
                }
            }
        }
        if let Some(p) = fields::text_field(body, PARLIAMENT_ALIASES) {
            attributes.insert("parliament", p);
        }

        for f in spec.identity {
            let value = match f.format {
                Format::Date => self.convert(body, f)?.to_raw(),
                Format::Text => fields::text_field(body, f.aliases).map(|t| fields::path_tail(&t).to_string()),
                _ => fields::text_field(body, f.aliases),
            };
            if let Some(v) = value {
                attributes.insert(f.column, v);
            }
        }

        Ok(attributes)
    }

    /// A speech without an explicit sitting date sat on the local date it was spoken
    fn derive_sitting_date(&self, entity_type: EntityType, body: &Map<String, Value>, attributes: &mut IdentityAttributes) {
        if entity_type != EntityType::Speech || attributes.contains_key("sitting_date") {
            return;
        }
        let spoken_at = SPEECH_SPEC
            .fields
            .iter()
            .find(|f| f.column == "spoken_at")
            .and_then(|f| fields::text_field(body, f.aliases));
        if let Some(ts) = spoken_at.and_then(|t| dates::parse_timestamp(&t, self.source_offset).ok()) {
            attributes.insert("sitting_date", format_date(&ts.date_naive()));
        }
    }

    fn convert(&self, body: &Map<String, Value>, f: &FieldSpec) -> IngestResult<FieldValue> {
        let Some(value) = fields::lookup(body, f.aliases) else {
            return Ok(FieldValue::Null);
        };

        match f.format {
            Format::Text => Ok(fields::value_text(value).map(FieldValue::Text).unwrap_or_default()),
            Format::Integer => fields::value_integer(value)
                .map(FieldValue::from)
                .map_err(|bad| IngestError::Validation(format!("{}: not an integer: {}", f.column, bad))),
            Format::Date => match fields::value_text(value) {
                None => Ok(FieldValue::Null),
                Some(text) => dates::parse_date(&text)
                    .map(|d| FieldValue::Text(format_date(&d)))
                    .map_err(|e| IngestError::Validation(format!("{}: {}", f.column, e))),
            },
            Format::Timestamp => match fields::value_text(value) {
                None => Ok(FieldValue::Null),
                Some(text) => dates::parse_timestamp(&text, self.source_offset)
                    .map(|ts| FieldValue::Text(format_timestamp(&ts.with_timezone(&Utc))))
                    .map_err(|e| IngestError::Validation(format!("{}: {}", f.column, e))),
            },
        }
    }
}

/// Fill parliament/session from the sitting calendar when the source omits them
fn infer_session(
    attributes: &mut IdentityAttributes,
    spec: &EntitySpec,
    values: &BTreeMap<&'static str, FieldValue>,
    ctx: &NormalizeContext,
) {
    if attributes.contains_key("parliament") && attributes.contains_key("session") {
        return;
    }
    let Some(date_column) = spec.date_column else {
        return;
    };
    let Some(jurisdiction) = attributes
        .get("jurisdiction")
        .and_then(|j| natural_key::canonical_jurisdiction(j))
    else {
        return;
    };
    let date = attributes
        .get(date_column)
        .cloned()
        .or_else(|| values.get(date_column).and_then(FieldValue::to_raw))
        .and_then(|raw| natural_key::canonical_date(&raw));
    let Some(date) = date else {
        return;
    };

    if let Some((parliament, session)) = ctx.calendar.lookup(&jurisdiction, date) {
        trace!(%jurisdiction, %date, parliament, session, "Inferred session from sitting calendar");
        attributes.entry("parliament").or_insert_with(|| parliament.to_string());
        attributes.entry("session").or_insert_with(|| session.to_string());
    }
}

/// Entity-specific required-field checks
fn validate(record: &CanonicalRecord) -> IngestResult<()> {
    let schema = record.schema();

    for column in schema.field_columns() {
        if column.kind == ColumnKind::Integer {
            if let Some(n) = record.field(column.name).as_integer() {
                if n < 0 {
                    return Err(IngestError::Validation(format!(
                        "{} '{}': {} must not be negative",
                        record.entity_type, record.natural_key, column.name
                    )));
                }
            }
        }
    }

    if record.entity_type == EntityType::Speech && record.field("content").is_empty() {
        return Err(IngestError::Validation(format!(
            "speech '{}' has no text content",
            record.natural_key
        )));
    }

    Ok(())
}

/// Natural key of the record this one depends on
fn parent_ref(
    entity_type: EntityType,
    record: &CanonicalRecord,
    body: &Map<String, Value>,
    spec: &EntitySpec,
) -> Option<ParentRef> {
    let link = EntitySchema::for_type(entity_type).parent?;
    let raw = |name: &str| record.field(name).to_raw();

    let mut attributes = IdentityAttributes::new();
    let parent_schema = EntitySchema::for_type(link.parent);
    for column in parent_schema.identity {
        let value = match (entity_type, column.name) {
            (EntityType::Meeting, "code") => raw("committee_code"),
            (EntityType::Vote, "number") => fields::text_field(body, spec.parent_aliases)
                .map(|t| fields::path_tail(&t).to_string()),
            (_, name) => raw(name),
        };
        if let Some(v) = value {
            attributes.insert(column.name, v);
        }
    }

    match natural_key::build_key(link.parent, &attributes) {
        Ok(key) => Some(ParentRef {
            entity_type: link.parent,
            natural_key: key.into_string(),
            required: link.required,
        }),
        Err(err) => {
            // Votes need not reference a bill
            trace!(entity_type = %entity_type, error = %err, "No parent reference");
            None
        }
    }
}
