//! Error types for parl-ingest
//!
//! Item-level problems are reported as [`ItemError`] values inside a batch
//! result; only [`IngestError`] escapes a batch, and only for conditions that
//! make the whole batch meaningless.

use parl_common::EntityType;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Natural key construction failure
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    /// A required identity attribute is absent or blank
    #[error("{entity_type}: missing identity field '{field}'")]
    MissingIdentityField {
        entity_type: EntityType,
        field: &'static str,
    },

    /// An identity attribute is present but cannot be canonicalized
    #[error("{entity_type}: invalid identity field '{field}': {value:?}")]
    InvalidIdentityField {
        entity_type: EntityType,
        field: &'static str,
        value: String,
    },
}

/// Adapter fetch failure
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// Network or remote-side failure worth retrying
    #[error("transient fetch failure: {0}")]
    Transient(String),

    /// Request or response that will fail the same way every time
    #[error("permanent fetch failure: {0}")]
    Permanent(String),
}

/// Errors surfaced by the ingestion core
#[derive(Debug, Error)]
pub enum IngestError {
    /// Record cannot be assigned a natural key (fatal to that item)
    #[error("Missing identity field: {0}")]
    MissingIdentityField(KeyError),

    /// Record failed required-field or shape checks (fatal to that item)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Remote fetch kept failing after all retry attempts
    #[error("Transient fetch error after {attempts} attempt(s): {message}")]
    TransientFetch { attempts: u32, message: String },

    /// Remote fetch failed in a way retries cannot fix
    #[error("Permanent fetch error: {0}")]
    PermanentFetch(String),

    /// Optimistic write raced with a concurrent writer
    #[error("Store conflict on {entity_type} '{natural_key}'")]
    StoreConflict {
        entity_type: EntityType,
        natural_key: String,
    },

    /// Required parent record is not in the store
    #[error("{entity_type} '{natural_key}': parent '{parent_key}' not found")]
    MissingParent {
        entity_type: EntityType,
        natural_key: String,
        parent_key: String,
    },

    /// Store rejected a write for a reason other than a conflict
    #[error("Store write failed: {0}")]
    StoreFailed(String),

    /// Duplicates remain after dedup; the uniqueness constraint was not forced
    #[error("Constraint violation on {table}: {duplicate_keys} natural key(s) still duplicated")]
    ConstraintViolation { table: &'static str, duplicate_keys: usize },

    /// Batch cannot produce any meaningful result
    #[error("Batch aborted for {entity_type}: {reason}")]
    BatchAborted {
        entity_type: EntityType,
        reason: String,
    },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Common(#[from] parl_common::Error),
}

impl From<KeyError> for IngestError {
    fn from(err: KeyError) -> Self {
        IngestError::MissingIdentityField(err)
    }
}

/// Result type for the ingestion core
pub type IngestResult<T> = Result<T, IngestError>;

/// Category of a per-item failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ItemErrorKind {
    /// Adapter reported the item as failed
    FetchFailed,
    /// No natural key could be built
    MissingIdentityField,
    /// Required fields absent or malformed
    ValidationError,
    /// Required parent record not present in the store
    MissingParent,
    /// Optimistic write lost twice to a concurrent writer
    StoreConflict,
    /// Store rejected the write
    StoreFailed,
}

impl ItemErrorKind {
    /// Classify an item-level error
    pub fn of(err: &IngestError) -> Self {
        match err {
            IngestError::MissingIdentityField(KeyError::MissingIdentityField { .. }) => {
                ItemErrorKind::MissingIdentityField
            }
            IngestError::MissingIdentityField(KeyError::InvalidIdentityField { .. }) => {
                ItemErrorKind::ValidationError
            }
            IngestError::Validation(_) => ItemErrorKind::ValidationError,
            IngestError::StoreConflict { .. } => ItemErrorKind::StoreConflict,
            IngestError::MissingParent { .. } => ItemErrorKind::MissingParent,
            IngestError::TransientFetch { .. } | IngestError::PermanentFetch(_) => {
                ItemErrorKind::FetchFailed
            }
            _ => ItemErrorKind::StoreFailed,
        }
    }
}

/// One failed item within a batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemError {
    /// Source reference of the item (id, URL or position)
    pub item_ref: String,
    /// Position within the fetched data, when the item reached the core
    pub index: Option<usize>,
    pub kind: ItemErrorKind,
    pub reason: String,
}

impl ItemError {
    pub fn new(item_ref: impl Into<String>, index: Option<usize>, kind: ItemErrorKind, reason: impl Into<String>) -> Self {
        Self {
            item_ref: item_ref.into(),
            index,
            kind,
            reason: reason.into(),
        }
    }

    /// Build from an item-level [`IngestError`]
    pub fn from_error(item_ref: impl Into<String>, index: Option<usize>, err: &IngestError) -> Self {
        Self::new(item_ref, index, ItemErrorKind::of(err), err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_errors_classify_as_missing_identity() {
        let err: IngestError = KeyError::MissingIdentityField {
            entity_type: EntityType::Bill,
            field: "number",
        }
        .into();

        assert_eq!(ItemErrorKind::of(&err), ItemErrorKind::MissingIdentityField);
        assert!(err.to_string().contains("number"));
    }

    #[test]
    fn item_error_keeps_reason_text() {
        let err = IngestError::Validation("unparseable timestamp 'noon-ish'".into());
        let item = ItemError::from_error("23", Some(23), &err);

        assert_eq!(item.kind, ItemErrorKind::ValidationError);
        assert_eq!(item.index, Some(23));
        assert!(item.reason.contains("noon-ish"));
    }
}
