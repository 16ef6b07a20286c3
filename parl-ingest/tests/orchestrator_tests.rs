//! Integration tests for batch orchestration
//!
//! Covers:
//! - Per-item failures leave the rest of the batch intact
//! - Fetch retry on transient failures, abort on permanent ones
//! - Cancellation accounting
//! - Dependency-ordered `run_all`

mod helpers;

use helpers::*;
use parl_common::EntityType;
use parl_ingest::error::FetchError;
use parl_ingest::types::{FetchFilters, FetchResponse, SourceAdapter};
use parl_ingest::{BatchState, IngestError, ItemErrorKind};
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn one_bad_timestamp_fails_only_that_speech() {
    let ctx = open_memory_store(false).await;

    let mut speeches: Vec<_> = (0..50)
        .map(|i| speech_payload(i + 1, &format!("2023-05-02T14:{:02}:00-04:00", i)))
        .collect();
    speeches[23]["time"] = json!("quarter past never");

    let adapter = Arc::new(
        MockAdapter::new()
            .with_items(EntityType::Debate, vec![debate_payload("2023-05-02")])
            .with_items(EntityType::Speech, speeches),
    );
    let orchestrator = fast_orchestrator(&ctx, adapter);

    let debates = orchestrator.run(EntityType::Debate, &FetchFilters::default()).await.unwrap();
    assert_eq!(debates.state, BatchState::Done);

    let result = orchestrator.run(EntityType::Speech, &FetchFilters::default()).await.unwrap();
    assert_eq!(result.state, BatchState::Partial);
    assert_eq!(result.fetched, 50);
    assert_eq!(result.stored, 49);
    assert_eq!(result.failed.len(), 1);
    assert_eq!(result.failed[0].kind, ItemErrorKind::ValidationError);
    assert_eq!(result.failed[0].index, Some(23));
    assert!(result.is_reconciled());
    assert_eq!(count(&ctx.pool, "speeches").await, 49);

    let orphaned: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM speeches WHERE debate_id IS NULL")
        .fetch_one(&ctx.pool)
        .await
        .unwrap();
    assert_eq!(orphaned, 0);
}

#[tokio::test]
async fn transient_failure_is_retried() {
    let ctx = open_memory_store(false).await;
    let adapter = Arc::new(
        MockAdapter::new()
            .with_items(EntityType::Bill, vec![bill_payload("C-1", "First")])
            .failing_first(EntityType::Bill, vec![FetchError::Transient("HTTP 503".into())]),
    );

    let result = fast_orchestrator(&ctx, adapter.clone())
        .run(EntityType::Bill, &FetchFilters::default())
        .await
        .unwrap();

    assert_eq!(result.attempts, 2);
    assert_eq!(adapter.calls(), 2);
    assert_eq!(result.state, BatchState::Done);
    assert_eq!(result.created, 1);
}

#[tokio::test]
async fn exhausted_retries_fail_the_batch() {
    let ctx = open_memory_store(false).await;
    let adapter = Arc::new(MockAdapter::new().failing_first(
        EntityType::Bill,
        vec![
            FetchError::Transient("timeout".into()),
            FetchError::Transient("timeout".into()),
            FetchError::Transient("timeout".into()),
        ],
    ));

    let err = fast_orchestrator(&ctx, adapter.clone())
        .run(EntityType::Bill, &FetchFilters::default())
        .await
        .unwrap_err();

    assert!(matches!(err, IngestError::TransientFetch { attempts: 3, .. }));
    assert_eq!(adapter.calls(), 3);
    assert_eq!(count(&ctx.pool, "bills").await, 0);
}

#[tokio::test]
async fn permanent_failure_is_not_retried() {
    let ctx = open_memory_store(false).await;
    let adapter = Arc::new(
        MockAdapter::new().failing_first(EntityType::Vote, vec![FetchError::Permanent("HTTP 404".into())]),
    );

    let err = fast_orchestrator(&ctx, adapter.clone())
        .run(EntityType::Vote, &FetchFilters::default())
        .await
        .unwrap_err();

    assert!(matches!(err, IngestError::PermanentFetch(_)));
    assert_eq!(adapter.calls(), 1);
}

#[tokio::test]
async fn adapter_item_errors_are_reported_per_item() {
    let ctx = open_memory_store(false).await;
    let adapter = Arc::new(
        MockAdapter::new()
            .with_items(EntityType::Bill, vec![bill_payload("C-1", "One"), bill_payload("C-2", "Two")])
            .with_item_errors(EntityType::Bill, &["/bills/44-1/C-3/"]),
    );

    let result = fast_orchestrator(&ctx, adapter)
        .run(EntityType::Bill, &FetchFilters::default())
        .await
        .unwrap();

    assert_eq!(result.fetched, 3);
    assert_eq!(result.stored, 2);
    assert_eq!(result.failed.len(), 1);
    assert_eq!(result.failed[0].kind, ItemErrorKind::FetchFailed);
    assert_eq!(result.failed[0].item_ref, "/bills/44-1/C-3/");
    assert_eq!(result.state, BatchState::Partial);
    assert!(result.is_reconciled());
}

#[tokio::test]
async fn nothing_delivered_aborts_the_batch() {
    let ctx = open_memory_store(false).await;
    let adapter = Arc::new(MockAdapter::new().with_item_errors(EntityType::Committee, &["1", "2"]));

    let err = fast_orchestrator(&ctx, adapter)
        .run(EntityType::Committee, &FetchFilters::default())
        .await
        .unwrap_err();

    assert!(matches!(err, IngestError::BatchAborted { entity_type: EntityType::Committee, .. }));
}

#[tokio::test]
async fn empty_source_is_a_clean_batch() {
    let ctx = open_memory_store(false).await;
    let result = fast_orchestrator(&ctx, Arc::new(MockAdapter::new()))
        .run(EntityType::Debate, &FetchFilters::default())
        .await
        .unwrap();

    assert_eq!(result.state, BatchState::Done);
    assert_eq!(result.fetched, 0);
    assert!(result.is_reconciled());
}

#[tokio::test]
async fn missing_parent_fails_the_item_not_the_batch() {
    let ctx = open_memory_store(false).await;
    let adapter = Arc::new(
        MockAdapter::new()
            .with_items(EntityType::Committee, vec![json!({"jurisdiction": "ca", "code": "FINA", "name": "Finance"})])
            .with_items(
                EntityType::Meeting,
                vec![
                    json!({"jurisdiction": "ca", "session": "44-1", "committee": "FINA", "number": 1}),
                    json!({"jurisdiction": "ca", "session": "44-1", "committee": "HESA", "number": 1}),
                ],
            ),
    );
    let orchestrator = fast_orchestrator(&ctx, adapter);

    orchestrator.run(EntityType::Committee, &FetchFilters::default()).await.unwrap();
    let result = orchestrator.run(EntityType::Meeting, &FetchFilters::default()).await.unwrap();

    assert_eq!(result.stored, 1);
    assert_eq!(result.failed.len(), 1);
    assert_eq!(result.failed[0].kind, ItemErrorKind::MissingParent);
    assert_eq!(result.failed[0].index, Some(1));
    assert!(result.is_reconciled());
}

#[tokio::test]
async fn cancelled_before_start_does_nothing() {
    let ctx = open_memory_store(false).await;
    let adapter = Arc::new(MockAdapter::new().with_items(EntityType::Bill, vec![bill_payload("C-1", "One")]));
    let orchestrator = fast_orchestrator(&ctx, adapter.clone());

    orchestrator.cancel_token().cancel();
    let result = orchestrator.run(EntityType::Bill, &FetchFilters::default()).await.unwrap();

    assert_eq!(result.state, BatchState::Cancelled);
    assert_eq!(adapter.calls(), 0);
    assert_eq!(count(&ctx.pool, "bills").await, 0);
}

/// Delivers its items and cancels the batch on the way out
struct CancellingAdapter {
    inner: MockAdapter,
    cancel: CancellationToken,
}

#[async_trait::async_trait]
impl SourceAdapter for CancellingAdapter {
    fn name(&self) -> &'static str {
        "cancelling"
    }

    async fn fetch(&self, entity_type: EntityType, filters: &FetchFilters) -> Result<FetchResponse, FetchError> {
        let response = self.inner.fetch(entity_type, filters).await;
        self.cancel.cancel();
        response
    }
}

#[tokio::test]
async fn cancellation_after_fetch_drops_remaining_items() {
    let ctx = open_memory_store(false).await;
    let cancel = CancellationToken::new();
    let adapter = Arc::new(CancellingAdapter {
        inner: MockAdapter::new().with_items(
            EntityType::Bill,
            (1..=5).map(|n| bill_payload(&format!("C-{}", n), "Bill")).collect(),
        ),
        cancel: cancel.clone(),
    });

    let orchestrator = fast_orchestrator(&ctx, adapter).with_cancel_token(cancel);
    let result = orchestrator.run(EntityType::Bill, &FetchFilters::default()).await.unwrap();

    assert_eq!(result.state, BatchState::Cancelled);
    assert_eq!(result.fetched, 5);
    assert_eq!(result.stored, 0);
    assert_eq!(result.dropped, 5);
    assert!(result.is_reconciled());
    assert_eq!(count(&ctx.pool, "bills").await, 0);
}

#[tokio::test]
async fn run_all_stores_parents_before_children() {
    let ctx = open_memory_store(false).await;
    let adapter = Arc::new(
        MockAdapter::new()
            .with_items(EntityType::Committee, vec![json!({"jurisdiction": "ca", "code": "FINA", "name": "Finance"})])
            .with_items(EntityType::Bill, vec![bill_payload("C-10", "Act")])
            .with_items(EntityType::Debate, vec![debate_payload("2023-05-02")])
            .with_items(
                EntityType::Vote,
                vec![json!({"jurisdiction": "ca", "session": "44-1", "number": 312, "bill": "C-10", "result": "Passed"})],
            )
            .with_items(
                EntityType::Meeting,
                vec![json!({"jurisdiction": "ca", "session": "44-1", "committee": "/committees/fina/", "number": 87})],
            )
            .with_items(EntityType::Speech, vec![speech_payload(1, "2023-05-02T14:00:00-04:00")]),
    );

    let results = fast_orchestrator(&ctx, adapter).run_all(&FetchFilters::default()).await;

    assert_eq!(results.len(), 6);
    for (entity_type, outcome) in &results {
        let result = outcome.as_ref().unwrap_or_else(|e| panic!("{} failed: {}", entity_type, e));
        assert_eq!(result.state, BatchState::Done, "{} not done: {:?}", entity_type, result.failed);
    }

    let unlinked: i64 = sqlx::query_scalar(
        "SELECT (SELECT COUNT(*) FROM votes WHERE bill_id IS NULL)
              + (SELECT COUNT(*) FROM meetings WHERE committee_id IS NULL)
              + (SELECT COUNT(*) FROM speeches WHERE debate_id IS NULL)",
    )
    .fetch_one(&ctx.pool)
    .await
    .unwrap();
    assert_eq!(unlinked, 0);
}
