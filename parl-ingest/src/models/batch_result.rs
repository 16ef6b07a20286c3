//! Batch state machine and result accounting
//!
//! A batch progresses FETCHING → NORMALIZING → STORING and ends in one of
//! DONE, PARTIAL (some items failed) or CANCELLED.

use crate::error::ItemError;
use chrono::{DateTime, Utc};
use parl_common::EntityType;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Batch workflow state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BatchState {
    /// Adapter fetch in progress (including retries)
    Fetching,
    /// Raw payloads being converted to canonical records
    Normalizing,
    /// Upsert engine writing
    Storing,
    /// Every fetched item stored
    Done,
    /// Finished, at least one item failed
    Partial,
    /// Stopped by cancellation; remaining items dropped
    Cancelled,
}

impl BatchState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, BatchState::Done | BatchState::Partial | BatchState::Cancelled)
    }
}

/// Outcome of one batch
///
/// Accounting invariant: `fetched = stored + failed.len() + dropped`, and
/// `stored = created + updated`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResult {
    pub batch_id: Uuid,
    pub entity_type: EntityType,
    pub state: BatchState,

    /// Items the adapter reported, delivered or failed
    pub fetched: usize,
    /// Items that produced a canonical record
    pub normalized: usize,
    pub stored: usize,
    pub created: usize,
    pub updated: usize,
    /// Items skipped because the batch was cancelled
    pub dropped: usize,
    pub failed: Vec<ItemError>,

    /// Adapter fetch attempts, including the successful one
    pub attempts: u32,

    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl BatchResult {
    pub fn new(entity_type: EntityType) -> Self {
        Self {
            batch_id: Uuid::new_v4(),
            entity_type,
            state: BatchState::Fetching,
            fetched: 0,
            normalized: 0,
            stored: 0,
            created: 0,
            updated: 0,
            dropped: 0,
            failed: Vec::new(),
            attempts: 0,
            started_at: Utc::now(),
            ended_at: None,
        }
    }

    /// Transition to a new state, stamping the end time on terminal states
    pub fn transition_to(&mut self, new_state: BatchState) {
        tracing::debug!(
            batch_id = %self.batch_id,
            entity_type = %self.entity_type,
            from = ?self.state,
            to = ?new_state,
            "Batch state transition"
        );
        self.state = new_state;
        if new_state.is_terminal() {
            self.ended_at = Some(Utc::now());
        }
    }

    /// Terminal state implied by the counts
    pub fn finish(&mut self, cancelled: bool) {
        let state = if cancelled {
            BatchState::Cancelled
        } else if self.failed.is_empty() {
            BatchState::Done
        } else {
            BatchState::Partial
        };
        self.transition_to(state);
    }

    pub fn record_failure(&mut self, error: ItemError) {
        self.failed.push(error);
    }

    /// Whether every fetched item is accounted for exactly once
    pub fn is_reconciled(&self) -> bool {
        self.fetched == self.stored + self.failed.len() + self.dropped
            && self.stored == self.created + self.updated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ItemErrorKind;

    #[test]
    fn finish_picks_state_from_outcome() {
        let mut result = BatchResult::new(EntityType::Bill);
        result.finish(false);
        assert_eq!(result.state, BatchState::Done);
        assert!(result.ended_at.is_some());

        let mut result = BatchResult::new(EntityType::Bill);
        result.record_failure(ItemError::new("7", Some(7), ItemErrorKind::ValidationError, "bad"));
        result.finish(false);
        assert_eq!(result.state, BatchState::Partial);

        let mut result = BatchResult::new(EntityType::Bill);
        result.finish(true);
        assert_eq!(result.state, BatchState::Cancelled);
    }

    #[test]
    fn reconciliation_counts_every_item() {
        let mut result = BatchResult::new(EntityType::Speech);
        result.fetched = 50;
        result.stored = 49;
        result.created = 40;
        result.updated = 9;
        result.record_failure(ItemError::new("23", Some(23), ItemErrorKind::ValidationError, "bad timestamp"));
        assert!(result.is_reconciled());

        result.updated = 8;
        assert!(!result.is_reconciled());
    }

    #[test]
    fn state_serializes_uppercase() {
        assert_eq!(serde_json::to_string(&BatchState::Partial).unwrap(), "\"PARTIAL\"");
    }
}
