//! Batch orchestrator
//!
//! Drives one batch through FETCHING → NORMALIZING → STORING:
//!
//! - Fetch with a per-call timeout; transient failures are retried with
//!   capped exponential backoff, permanent ones abort the batch.
//! - Per-item problems (adapter item errors, normalization failures, store
//!   failures) never abort the batch; they are collected in
//!   [`BatchResult::failed`].
//! - Cancellation is checked between items and between store chunks; items
//!   not yet stored are counted as dropped.

use crate::db::records::load_sitting_calendar;
use crate::db::{UpsertEngine, UpsertOutcome};
use crate::error::{FetchError, IngestError, IngestResult, ItemError, ItemErrorKind};
use crate::models::{BatchResult, BatchState};
use crate::normalize::{NormalizeContext, Normalizer};
use crate::types::{FetchFilters, FetchResponse, SourceAdapter};
use futures::future::join_all;
use parl_common::config::FetchConfig;
use parl_common::EntityType;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Capped exponential backoff for transient fetch failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&FetchConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &FetchConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }

    /// Delay before the attempt following failed attempt `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_delay.saturating_mul(factor).min(self.max_delay)
    }
}

pub struct BatchOrchestrator {
    adapter: Arc<dyn SourceAdapter>,
    normalizer: Normalizer,
    engine: Arc<UpsertEngine>,
    retry: RetryPolicy,
    fetch_timeout: Duration,
    cancel: CancellationToken,
}

impl BatchOrchestrator {
    pub fn new(adapter: Arc<dyn SourceAdapter>, normalizer: Normalizer, engine: Arc<UpsertEngine>) -> Self {
        let fetch = FetchConfig::default();
        Self {
            adapter,
            normalizer,
            engine,
            retry: RetryPolicy::from_config(&fetch),
            fetch_timeout: Duration::from_millis(fetch.timeout_ms),
            cancel: CancellationToken::new(),
        }
    }

    /// Apply retry and timeout settings from configuration
    pub fn with_fetch_config(mut self, config: &FetchConfig) -> Self {
        self.retry = RetryPolicy::from_config(config);
        self.fetch_timeout = Duration::from_millis(config.timeout_ms);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    /// Share an externally owned cancellation token
    pub fn with_cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Token that cancels every batch run by this orchestrator
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run one batch
    ///
    /// Returns `Err` only for batch-level failures: fetch retries exhausted,
    /// permanent fetch failure, or nothing delivered at all.
    pub async fn run(&self, entity_type: EntityType, filters: &FetchFilters) -> IngestResult<BatchResult> {
        let mut result = BatchResult::new(entity_type);
        info!(
            batch_id = %result.batch_id,
            entity_type = %entity_type,
            adapter = self.adapter.name(),
            offset = filters.offset,
            limit = filters.limit,
            "Starting batch"
        );

        if self.cancel.is_cancelled() {
            result.finish(true);
            return Ok(result);
        }

        // FETCHING
        let response = self.fetch_with_retry(entity_type, filters, &mut result).await?;
        result.fetched = response.data.len() + response.errors.len();

        if response.data.is_empty() && !response.errors.is_empty() {
            let first = &response.errors[0];
            return Err(IngestError::BatchAborted {
                entity_type,
                reason: format!(
                    "all {} item(s) failed to fetch (first: {}: {})",
                    response.errors.len(),
                    first.item_ref,
                    first.message
                ),
            });
        }

        for error in response.errors {
            warn!(entity_type = %entity_type, item = %error.item_ref, "Adapter item failed: {}", error.message);
            result.record_failure(ItemError::new(error.item_ref, None, ItemErrorKind::FetchFailed, error.message));
        }

        // NORMALIZING
        result.transition_to(BatchState::Normalizing);
        let ctx = NormalizeContext {
            calendar: load_sitting_calendar(self.engine.pool()).await?,
        };

        let total = response.data.len();
        let mut records = Vec::with_capacity(total);
        let mut refs = Vec::with_capacity(total);
        for (index, payload) in response.data.iter().enumerate() {
            if self.cancel.is_cancelled() {
                result.dropped += total - index;
                break;
            }
            match self.normalizer.normalize(entity_type, payload, &ctx) {
                Ok(record) => {
                    records.push(record);
                    refs.push((index, payload.item_ref.clone()));
                }
                Err(err) => {
                    warn!(entity_type = %entity_type, item = %payload.item_ref, index, "Normalization failed: {}", err);
                    result.record_failure(ItemError::from_error(payload.item_ref.clone(), Some(index), &err));
                }
            }
        }
        result.normalized = records.len();

        // STORING
        result.transition_to(BatchState::Storing);
        let report = self.engine.upsert_many_until(entity_type, records, &self.cancel).await;

        for ((index, item_ref), outcome) in refs.into_iter().zip(report.outcomes) {
            match outcome {
                UpsertOutcome::Stored { created, .. } => {
                    result.stored += 1;
                    if created {
                        result.created += 1;
                    } else {
                        result.updated += 1;
                    }
                }
                UpsertOutcome::Failed { kind, reason } => {
                    warn!(entity_type = %entity_type, item = %item_ref, index, ?kind, "Store failed: {}", reason);
                    result.record_failure(ItemError::new(item_ref, Some(index), kind, reason));
                }
                UpsertOutcome::Dropped => result.dropped += 1,
            }
        }

        result.finish(result.dropped > 0);
        info!(
            batch_id = %result.batch_id,
            entity_type = %entity_type,
            state = ?result.state,
            fetched = result.fetched,
            stored = result.stored,
            created = result.created,
            updated = result.updated,
            failed = result.failed.len(),
            dropped = result.dropped,
            attempts = result.attempts,
            "Batch complete"
        );
        Ok(result)
    }

    /// Run every entity type, parents before children
    ///
    /// Types within a dependency tier run concurrently. A failed batch does
    /// not stop later tiers; their items whose parents are missing fail
    /// individually.
    pub async fn run_all(&self, filters: &FetchFilters) -> Vec<(EntityType, IngestResult<BatchResult>)> {
        let mut results = Vec::new();
        for tier in EntityType::TIERS {
            if self.cancel.is_cancelled() {
                break;
            }
            let outcomes = join_all(tier.iter().map(|entity_type| self.run(*entity_type, filters))).await;
            results.extend(tier.iter().copied().zip(outcomes));
        }
        results
    }

    async fn fetch_with_retry(
        &self,
        entity_type: EntityType,
        filters: &FetchFilters,
        result: &mut BatchResult,
    ) -> IngestResult<FetchResponse> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            result.attempts = attempt;

            let outcome = match tokio::time::timeout(self.fetch_timeout, self.adapter.fetch(entity_type, filters)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(FetchError::Transient(format!(
                    "fetch timed out after {} ms",
                    self.fetch_timeout.as_millis()
                ))),
            };

            match outcome {
                Ok(response) => return Ok(response),
                Err(FetchError::Permanent(message)) => {
                    warn!(entity_type = %entity_type, attempt, "Permanent fetch failure: {}", message);
                    return Err(IngestError::PermanentFetch(message));
                }
                Err(FetchError::Transient(message)) => {
                    if attempt >= self.retry.max_attempts {
                        warn!(entity_type = %entity_type, attempts = attempt, "Fetch retries exhausted: {}", message);
                        return Err(IngestError::TransientFetch {
                            attempts: attempt,
                            message,
                        });
                    }

                    let delay = self.retry.delay_for(attempt);
                    warn!(
                        entity_type = %entity_type,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Transient fetch failure, retrying: {}",
                        message
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.cancel.cancelled() => {
                            return Err(IngestError::BatchAborted {
                                entity_type,
                                reason: "cancelled while waiting to retry fetch".into(),
                            });
                        }
                    }
                }
            }
        }
    }
}
