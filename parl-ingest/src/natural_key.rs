//! Natural key construction
//!
//! A natural key is the `-`-joined canonical form of an entity's identity
//! columns, in descriptor order:
//!
//! | Entity    | Key shape                         | Example                          |
//! |-----------|-----------------------------------|----------------------------------|
//! | committee | `jur-CODE`                        | `ca-federal-FINA`                |
//! | bill      | `jur-P-S-NUMBER`                  | `ca-federal-44-1-C-10`           |
//! | debate    | `jur-P-S-YYYY-MM-DD`              | `ca-federal-44-1-2023-05-02`     |
//! | vote      | `jur-P-S-N`                       | `ca-federal-44-1-312`            |
//! | meeting   | `jur-P-S-CODE-N`                  | `ca-federal-44-1-FINA-87`        |
//! | speech    | `jur-P-S-YYYY-MM-DD-SEQ`          | `ca-federal-44-1-2023-05-02-14`  |
//!
//! Canonicalization is pure and total over its inputs: the same identity
//! attributes always produce the same key, regardless of source casing,
//! padding or jurisdiction alias.

use crate::error::KeyError;
use crate::types::FieldValue;
use chrono::NaiveDate;
use parl_common::db::{EntitySchema, IdentityColumn, IdentityRule};
use parl_common::EntityType;
use std::collections::BTreeMap;
use std::fmt;

/// Raw identity attributes by column name, before canonicalization
pub type IdentityAttributes = BTreeMap<&'static str, String>;

/// Canonical identity values by column name
pub type CanonicalIdentity = BTreeMap<&'static str, FieldValue>;

/// Rendered natural key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NaturalKey(String);

impl NaturalKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Known spellings of each jurisdiction, after lower-casing and `_`/space → `-`
const JURISDICTION_ALIASES: &[(&str, &[&str])] = &[
    ("ca-federal", &["ca", "can", "canada", "federal", "ca-fed", "ca-federal", "canada-federal"]),
    ("ca-ab", &["ab", "alberta", "ca-ab"]),
    ("ca-bc", &["bc", "british-columbia", "ca-bc"]),
    ("ca-mb", &["mb", "manitoba", "ca-mb"]),
    ("ca-nb", &["nb", "new-brunswick", "ca-nb"]),
    ("ca-nl", &["nl", "newfoundland-and-labrador", "newfoundland", "ca-nl"]),
    ("ca-ns", &["ns", "nova-scotia", "ca-ns"]),
    ("ca-nt", &["nt", "northwest-territories", "ca-nt"]),
    ("ca-nu", &["nu", "nunavut", "ca-nu"]),
    ("ca-on", &["on", "ontario", "ca-on"]),
    ("ca-pe", &["pe", "pei", "prince-edward-island", "ca-pe"]),
    ("ca-qc", &["qc", "quebec", "québec", "ca-qc"]),
    ("ca-sk", &["sk", "saskatchewan", "ca-sk"]),
    ("ca-yt", &["yt", "yukon", "ca-yt"]),
];

/// Canonical jurisdiction tag, or `None` for blank input
///
/// Unknown jurisdictions keep their normalized spelling so that new sources
/// still produce stable keys.
pub fn canonical_jurisdiction(raw: &str) -> Option<String> {
    let lowered = raw.trim().to_lowercase();
    if lowered.is_empty() {
        return None;
    }

    let mut normalized = String::with_capacity(lowered.len());
    for ch in lowered.chars() {
        let ch = if ch == '_' || ch.is_whitespace() { '-' } else { ch };
        if ch == '-' && normalized.ends_with('-') {
            continue;
        }
        normalized.push(ch);
    }
    let normalized = normalized.trim_matches('-').to_string();

    let canonical = JURISDICTION_ALIASES
        .iter()
        .find(|(_, aliases)| aliases.contains(&normalized.as_str()))
        .map(|(canonical, _)| canonical.to_string());

    Some(canonical.unwrap_or(normalized))
}

/// Numbers, dates and codes never contain lower-case letters, so a jurisdiction
/// whose last segment has one cannot absorb the next key part.
fn has_lowercase_tail(jurisdiction: &str) -> bool {
    jurisdiction
        .rsplit('-')
        .next()
        .is_some_and(|tail| tail.chars().any(char::is_lowercase))
}

/// Trimmed, whitespace-collapsed, upper-cased code, or `None` for blank input
pub fn canonical_code(raw: &str) -> Option<String> {
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed.to_uppercase())
    }
}

/// Non-negative integer with surrounding whitespace and leading zeros ignored
pub fn canonical_number(raw: &str) -> Option<u32> {
    raw.trim().parse::<u32>().ok()
}

/// Calendar date in `YYYY-MM-DD` form
pub fn canonical_date(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").ok()
}

fn canonicalize_one(
    entity_type: EntityType,
    column: &IdentityColumn,
    raw: Option<&str>,
) -> Result<FieldValue, KeyError> {
    let missing = || KeyError::MissingIdentityField {
        entity_type,
        field: column.name,
    };
    let invalid = |value: &str| KeyError::InvalidIdentityField {
        entity_type,
        field: column.name,
        value: value.to_string(),
    };

    let raw = raw.filter(|v| !v.trim().is_empty()).ok_or_else(missing)?;

    match column.rule {
        IdentityRule::Jurisdiction => {
            let jurisdiction = canonical_jurisdiction(raw).ok_or_else(missing)?;
            if !has_lowercase_tail(&jurisdiction) {
                return Err(invalid(raw));
            }
            Ok(FieldValue::Text(jurisdiction))
        }
        IdentityRule::Code => canonical_code(raw).map(FieldValue::Text).ok_or_else(missing),
        IdentityRule::Number => canonical_number(raw)
            .map(|n| FieldValue::Integer(i64::from(n)))
            .ok_or_else(|| invalid(raw)),
        IdentityRule::Date => canonical_date(raw)
            .map(|d| FieldValue::Text(parl_common::time::format_date(&d)))
            .ok_or_else(|| invalid(raw)),
    }
}

/// Canonicalize every identity attribute of `entity_type`
///
/// Fails with [`KeyError::MissingIdentityField`] on the first absent or blank
/// attribute (in key order), and [`KeyError::InvalidIdentityField`] when a
/// number or date does not parse.
pub fn canonicalize_identity(
    entity_type: EntityType,
    attributes: &IdentityAttributes,
) -> Result<CanonicalIdentity, KeyError> {
    let schema = EntitySchema::for_type(entity_type);
    let mut identity = CanonicalIdentity::new();
    for column in schema.identity {
        let raw = attributes.get(column.name).map(String::as_str);
        identity.insert(column.name, canonicalize_one(entity_type, column, raw)?);
    }
    Ok(identity)
}

/// Render a key from already-canonical identity values
pub fn render_key(schema: &EntitySchema, identity: &CanonicalIdentity) -> NaturalKey {
    let parts: Vec<String> = schema
        .identity
        .iter()
        .map(|column| identity.get(column.name).and_then(FieldValue::to_raw).unwrap_or_default())
        .collect();
    NaturalKey(parts.join("-"))
}

/// Build the natural key for a set of raw identity attributes
pub fn build_key(entity_type: EntityType, attributes: &IdentityAttributes) -> Result<NaturalKey, KeyError> {
    let identity = canonicalize_identity(entity_type, attributes)?;
    Ok(render_key(EntitySchema::for_type(entity_type), &identity))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs(pairs: &[(&'static str, &str)]) -> IdentityAttributes {
        pairs.iter().map(|(k, v)| (*k, v.to_string())).collect()
    }

    #[test]
    fn bill_key_from_mixed_case_alias() {
        let key = build_key(
            EntityType::Bill,
            &attrs(&[("jurisdiction", "CA"), ("parliament", "44"), ("session", "1"), ("number", "c-10")]),
        )
        .unwrap();
        assert_eq!(key.as_str(), "ca-federal-44-1-C-10");
    }

    #[test]
    fn key_is_stable_across_source_formatting() {
        let a = build_key(
            EntityType::Meeting,
            &attrs(&[
                ("jurisdiction", "Canada"),
                ("parliament", "44"),
                ("session", "1"),
                ("committee_code", "fina"),
                ("number", "87"),
            ]),
        )
        .unwrap();
        let b = build_key(
            EntityType::Meeting,
            &attrs(&[
                ("jurisdiction", " ca_federal "),
                ("parliament", "044"),
                ("session", " 1"),
                ("committee_code", " FINA "),
                ("number", "0087"),
            ]),
        )
        .unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "ca-federal-44-1-FINA-87");
    }

    #[test]
    fn speech_and_debate_keys_embed_the_date() {
        let debate = build_key(
            EntityType::Debate,
            &attrs(&[("jurisdiction", "ca"), ("parliament", "44"), ("session", "1"), ("sitting_date", "2023-05-02")]),
        )
        .unwrap();
        assert_eq!(debate.as_str(), "ca-federal-44-1-2023-05-02");

        let speech = build_key(
            EntityType::Speech,
            &attrs(&[
                ("jurisdiction", "ca"),
                ("parliament", "44"),
                ("session", "1"),
                ("sitting_date", "2023-05-02"),
                ("sequence", "14"),
            ]),
        )
        .unwrap();
        assert_eq!(speech.as_str(), "ca-federal-44-1-2023-05-02-14");
    }

    #[test]
    fn missing_and_blank_attributes_are_reported() {
        let err = build_key(EntityType::Committee, &attrs(&[("jurisdiction", "ca")])).unwrap_err();
        assert_eq!(
            err,
            KeyError::MissingIdentityField {
                entity_type: EntityType::Committee,
                field: "code"
            }
        );

        let err = build_key(EntityType::Committee, &attrs(&[("jurisdiction", "  "), ("code", "FINA")])).unwrap_err();
        assert!(matches!(err, KeyError::MissingIdentityField { field: "jurisdiction", .. }));
    }

    #[test]
    fn unparseable_numbers_and_dates_are_invalid() {
        let err = build_key(
            EntityType::Vote,
            &attrs(&[("jurisdiction", "ca"), ("parliament", "44th"), ("session", "1"), ("number", "3")]),
        )
        .unwrap_err();
        assert!(matches!(err, KeyError::InvalidIdentityField { field: "parliament", .. }));

        let err = build_key(
            EntityType::Debate,
            &attrs(&[("jurisdiction", "ca"), ("parliament", "44"), ("session", "1"), ("sitting_date", "May 2")]),
        )
        .unwrap_err();
        assert!(matches!(err, KeyError::InvalidIdentityField { field: "sitting_date", .. }));
    }

    #[test]
    fn jurisdiction_cannot_swallow_the_next_key_part() {
        let err = build_key(
            EntityType::Bill,
            &attrs(&[("jurisdiction", "zz-44"), ("parliament", "1"), ("session", "1"), ("number", "C")]),
        )
        .unwrap_err();
        assert!(matches!(err, KeyError::InvalidIdentityField { field: "jurisdiction", .. }));

        let err = build_key(EntityType::Committee, &attrs(&[("jurisdiction", "zz-."), ("code", "X")])).unwrap_err();
        assert!(matches!(err, KeyError::InvalidIdentityField { field: "jurisdiction", .. }));

        let key = build_key(
            EntityType::Bill,
            &attrs(&[("jurisdiction", "zz"), ("parliament", "44"), ("session", "1"), ("number", "1-C")]),
        )
        .unwrap();
        assert_eq!(key.as_str(), "zz-44-1-1-C");

        let key = build_key(EntityType::Committee, &attrs(&[("jurisdiction", "ca-on"), ("code", "FINA")])).unwrap();
        assert_eq!(key.as_str(), "ca-on-FINA");
    }

    #[test]
    fn jurisdiction_aliases_resolve() {
        assert_eq!(canonical_jurisdiction("Ontario").as_deref(), Some("ca-on"));
        assert_eq!(canonical_jurisdiction("british columbia").as_deref(), Some("ca-bc"));
        assert_eq!(canonical_jurisdiction("CA-Federal").as_deref(), Some("ca-federal"));
        assert_eq!(canonical_jurisdiction("us  senate").as_deref(), Some("us-senate"));
        assert_eq!(canonical_jurisdiction(""), None);
    }

    #[test]
    fn codes_collapse_whitespace() {
        assert_eq!(canonical_code("  fina \t sub ").as_deref(), Some("FINA SUB"));
        assert_eq!(canonical_code("   "), None);
    }
}
