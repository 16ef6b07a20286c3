//! JSON fixture adapter for offline runs and backfills
//!
//! The document is an object keyed by entity plural (`"bills"`, `"votes"`,
//! ...), each holding an array of raw items. The file is re-read on every
//! fetch so it can be edited between runs.

use crate::adapters::http::item_ref;
use crate::error::FetchError;
use crate::normalize::fields::{lookup, split_session_label, text_field, value_integer};
use crate::types::{AdapterItemError, FetchFilters, FetchResponse, RawPayload, SourceAdapter};
use chrono::NaiveDate;
use parl_common::EntityType;
use serde_json::{Map, Value};
use std::path::PathBuf;

const DATE_ALIASES: &[&str] = &["date", "sitting_date", "time", "spoken_at"];

pub struct JsonFileAdapter {
    path: PathBuf,
}

impl JsonFileAdapter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn load(&self) -> Result<Value, FetchError> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| FetchError::Permanent(format!("Read {} failed: {}", self.path.display(), e)))?;
        serde_json::from_str(&content)
            .map_err(|e| FetchError::Permanent(format!("Parse {} failed: {}", self.path.display(), e)))
    }
}

/// Whether an item passes the parliament/session/date filters
///
/// Items lacking a filtered attribute are kept; the normalizer decides what
/// to do with them.
fn matches(item: &Map<String, Value>, filters: &FetchFilters) -> bool {
    let label = text_field(item, &["session"]).and_then(|s| split_session_label(&s));
    let integer = |aliases: &[&str]| lookup(item, aliases).and_then(|v| value_integer(v).ok().flatten());

    let parliament = integer(&["parliament", "parliamentnum"]).or(label.map(|(p, _)| i64::from(p)));
    let session = match label {
        Some((_, s)) => Some(i64::from(s)),
        None => integer(&["session", "sessnum"]),
    };

    if let (Some(wanted), Some(actual)) = (filters.parliament, parliament) {
        if i64::from(wanted) != actual {
            return false;
        }
    }
    if let (Some(wanted), Some(actual)) = (filters.session, session) {
        if i64::from(wanted) != actual {
            return false;
        }
    }
    if !filters.date_range.is_open() {
        let date = text_field(item, DATE_ALIASES)
            .and_then(|raw| NaiveDate::parse_from_str(raw.get(..10)?, "%Y-%m-%d").ok());
        if let Some(date) = date {
            return filters.date_range.contains(date);
        }
    }
    true
}

#[async_trait::async_trait]
impl SourceAdapter for JsonFileAdapter {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn fetch(&self, entity_type: EntityType, filters: &FetchFilters) -> Result<FetchResponse, FetchError> {
        let document = self.load().await?;
        let items = match document.get(entity_type.plural()) {
            Some(Value::Array(items)) => items.clone(),
            Some(_) => {
                return Err(FetchError::Permanent(format!(
                    "'{}' in {} is not an array",
                    entity_type.plural(),
                    self.path.display()
                )))
            }
            None => Vec::new(),
        };

        let mut response = FetchResponse::default();
        let selected = items
            .into_iter()
            .enumerate()
            .filter(|(_, item)| item.as_object().map_or(true, |map| matches(map, filters)))
            .skip(filters.offset as usize)
            .take(filters.limit as usize);

        for (position, item) in selected {
            let item_ref = item_ref(&item, position);
            if item.is_object() {
                response.data.push(RawPayload::new(item_ref, item));
            } else {
                response.errors.push(AdapterItemError {
                    item_ref,
                    message: format!("item is not an object: {}", item),
                });
            }
        }

        tracing::debug!(
            entity_type = %entity_type,
            path = %self.path.display(),
            items = response.data.len(),
            errors = response.errors.len(),
            "Read fixture items"
        );
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    fn fixture(document: Value) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(document.to_string().as_bytes()).unwrap();
        file
    }

    #[tokio::test]
    async fn filters_by_session_and_pages() {
        let file = fixture(json!({
            "bills": [
                {"id": 1, "session": "44-1", "number": "C-1"},
                {"id": 2, "session": "43-2", "number": "C-2"},
                {"id": 3, "session": "44-1", "number": "C-3"},
                {"id": 4, "session": "44-1", "number": "C-4"}
            ]
        }));
        let adapter = JsonFileAdapter::new(file.path());
        let filters = FetchFilters {
            parliament: Some(44),
            session: Some(1),
            limit: 2,
            offset: 1,
            ..Default::default()
        };

        let response = adapter.fetch(EntityType::Bill, &filters).await.unwrap();
        let refs: Vec<&str> = response.data.iter().map(|p| p.item_ref.as_str()).collect();
        assert_eq!(refs, vec!["3", "4"]);
    }

    #[tokio::test]
    async fn date_range_applies_to_debates() {
        let file = fixture(json!({
            "debates": [
                {"id": "a", "date": "2023-05-01"},
                {"id": "b", "date": "2023-06-01"}
            ]
        }));
        let adapter = JsonFileAdapter::new(file.path());
        let mut filters = FetchFilters::default();
        filters.date_range.from = NaiveDate::from_ymd_opt(2023, 5, 15);

        let response = adapter.fetch(EntityType::Debate, &filters).await.unwrap();
        assert_eq!(response.data.len(), 1);
        assert_eq!(response.data[0].item_ref, "b");
    }

    #[tokio::test]
    async fn missing_file_is_permanent_and_absent_section_is_empty() {
        let adapter = JsonFileAdapter::new("/nonexistent/parl-fixture.json");
        let err = adapter.fetch(EntityType::Vote, &FetchFilters::default()).await.unwrap_err();
        assert!(matches!(err, FetchError::Permanent(_)));

        let file = fixture(json!({"bills": []}));
        let response = JsonFileAdapter::new(file.path())
            .fetch(EntityType::Vote, &FetchFilters::default())
            .await
            .unwrap();
        assert!(response.data.is_empty());
    }

    #[tokio::test]
    async fn non_object_items_become_errors() {
        let file = fixture(json!({"committees": [{"id": 1}, "junk"]}));
        let response = JsonFileAdapter::new(file.path())
            .fetch(EntityType::Committee, &FetchFilters::default())
            .await
            .unwrap();
        assert_eq!(response.data.len(), 1);
        assert_eq!(response.errors.len(), 1);
        assert_eq!(response.errors[0].item_ref, "1");
    }
}
