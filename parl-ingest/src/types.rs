//! Core Types and Trait Definitions
//!
//! Defines the boundary between source adapters and the ingestion core:
//! - **Adapter side:** [`SourceAdapter`] yields [`RawPayload`]s plus per-item errors
//! - **Core side:** [`FieldValue`] is the typed cell value every canonical column holds

use crate::error::FetchError;
use chrono::NaiveDate;
use parl_common::EntityType;
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Field values
// ============================================================================

/// Value of a single canonical column
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum FieldValue {
    #[default]
    Null,
    Text(String),
    Integer(i64),
}

impl FieldValue {
    /// Text value, with blank strings collapsed to `Null`
    pub fn text(value: impl Into<String>) -> Self {
        let value = value.into();
        if value.trim().is_empty() {
            FieldValue::Null
        } else {
            FieldValue::Text(value)
        }
    }

    /// True for `Null` and for whitespace-only text
    pub fn is_empty(&self) -> bool {
        match self {
            FieldValue::Null => true,
            FieldValue::Text(s) => s.trim().is_empty(),
            FieldValue::Integer(_) => false,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            FieldValue::Integer(n) => Some(*n),
            _ => None,
        }
    }

    /// Raw string form used when rebuilding a natural key from stored values
    pub fn to_raw(&self) -> Option<String> {
        match self {
            FieldValue::Null => None,
            FieldValue::Text(s) => Some(s.clone()),
            FieldValue::Integer(n) => Some(n.to_string()),
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Null => f.write_str("NULL"),
            FieldValue::Text(s) => f.write_str(s),
            FieldValue::Integer(n) => write!(f, "{}", n),
        }
    }
}

impl From<Option<String>> for FieldValue {
    fn from(value: Option<String>) -> Self {
        value.map(FieldValue::text).unwrap_or(FieldValue::Null)
    }
}

impl From<Option<i64>> for FieldValue {
    fn from(value: Option<i64>) -> Self {
        value.map(FieldValue::Integer).unwrap_or(FieldValue::Null)
    }
}

// ============================================================================
// Adapter boundary
// ============================================================================

/// One untyped item as delivered by a source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawPayload {
    /// Source reference (id, URL or position) used in error reports
    pub item_ref: String,
    pub body: serde_json::Value,
}

impl RawPayload {
    pub fn new(item_ref: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            item_ref: item_ref.into(),
            body,
        }
    }
}

/// Item the adapter could not deliver
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterItemError {
    pub item_ref: String,
    pub message: String,
}

/// Result of one adapter fetch call
///
/// Partial success is normal: `data` holds what arrived, `errors` what did not.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FetchResponse {
    pub data: Vec<RawPayload>,
    pub errors: Vec<AdapterItemError>,
}

/// Inclusive date window; either end may be open
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
}

impl DateRange {
    pub fn contains(&self, date: NaiveDate) -> bool {
        self.from.map_or(true, |from| date >= from) && self.to.map_or(true, |to| date <= to)
    }

    pub fn is_open(&self) -> bool {
        self.from.is_none() && self.to.is_none()
    }
}

/// Which slice of the source to fetch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchFilters {
    pub parliament: Option<u32>,
    pub session: Option<u32>,
    pub limit: u32,
    pub offset: u32,
    #[serde(default)]
    pub date_range: DateRange,
}

impl Default for FetchFilters {
    fn default() -> Self {
        Self {
            parliament: None,
            session: None,
            limit: 100,
            offset: 0,
            date_range: DateRange::default(),
        }
    }
}

/// Pluggable producer of raw payloads
///
/// Implementations classify their failures: [`FetchError::Transient`] is
/// retried by the orchestrator, [`FetchError::Permanent`] is not. Items that
/// fail individually go into [`FetchResponse::errors`] instead.
///
/// # Example
/// ```rust,ignore
/// pub struct FixedAdapter(Vec<RawPayload>);
///
/// #[async_trait::async_trait]
/// impl SourceAdapter for FixedAdapter {
///     fn name(&self) -> &'static str { "fixed" }
///
///     async fn fetch(&self, _: EntityType, _: &FetchFilters) -> Result<FetchResponse, FetchError> {
///         Ok(FetchResponse { data: self.0.clone(), errors: vec![] })
///     }
/// }
/// ```
#[async_trait::async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Adapter name for logging
    fn name(&self) -> &'static str;

    async fn fetch(
        &self,
        entity_type: EntityType,
        filters: &FetchFilters,
    ) -> Result<FetchResponse, FetchError>;
}
