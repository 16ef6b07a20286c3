//! Shared fixtures for parl-ingest integration tests

#![allow(dead_code)]

use parl_common::config::{StoreConfig, TomlConfig};
use parl_common::EntityType;
use parl_ingest::error::FetchError;
use parl_ingest::types::{AdapterItemError, FetchFilters, FetchResponse, RawPayload, SourceAdapter};
use parl_ingest::{BatchOrchestrator, IngestContext, Normalizer, RetryPolicy};
use serde_json::Value;
use sqlx::SqlitePool;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Adapter serving scripted responses per entity type
///
/// Scripted failures are consumed first; after that every fetch returns the
/// entity's fixed data.
#[derive(Default)]
pub struct MockAdapter {
    data: Mutex<HashMap<EntityType, FetchResponse>>,
    failures: Mutex<HashMap<EntityType, VecDeque<FetchError>>>,
    calls: AtomicU32,
}

impl MockAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_items(self, entity_type: EntityType, items: Vec<Value>) -> Self {
        let data = items
            .into_iter()
            .enumerate()
            .map(|(i, body)| RawPayload::new(i.to_string(), body))
            .collect();
        self.with_response(entity_type, FetchResponse { data, errors: Vec::new() })
    }

    pub fn with_response(self, entity_type: EntityType, response: FetchResponse) -> Self {
        self.data.lock().unwrap().insert(entity_type, response);
        self
    }

    pub fn with_item_errors(self, entity_type: EntityType, refs: &[&str]) -> Self {
        {
            let mut data = self.data.lock().unwrap();
            let entry = data.entry(entity_type).or_default();
            entry.errors.extend(refs.iter().map(|r| AdapterItemError {
                item_ref: r.to_string(),
                message: "upstream returned 404".into(),
            }));
        }
        self
    }

    pub fn failing_first(self, entity_type: EntityType, errors: Vec<FetchError>) -> Self {
        self.failures.lock().unwrap().insert(entity_type, errors.into());
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl SourceAdapter for MockAdapter {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn fetch(&self, entity_type: EntityType, _filters: &FetchFilters) -> Result<FetchResponse, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self
            .failures
            .lock()
            .unwrap()
            .get_mut(&entity_type)
            .and_then(VecDeque::pop_front)
        {
            return Err(err);
        }
        Ok(self.data.lock().unwrap().get(&entity_type).cloned().unwrap_or_default())
    }
}

/// Migrated in-memory store with its engine
pub async fn open_memory_store(force_fallback: bool) -> IngestContext {
    let pool = parl_common::db::init_in_memory().await.unwrap();
    open_with_pool(pool, force_fallback).await
}

pub async fn open_with_pool(pool: SqlitePool, force_fallback: bool) -> IngestContext {
    let config = TomlConfig {
        store: StoreConfig {
            force_fallback,
            ..Default::default()
        },
        ..Default::default()
    };
    IngestContext::from_pool(pool, config).await.unwrap()
}

/// Orchestrator with millisecond retry delays
pub fn fast_orchestrator(ctx: &IngestContext, adapter: Arc<dyn SourceAdapter>) -> BatchOrchestrator {
    BatchOrchestrator::new(adapter, Normalizer::default(), Arc::clone(&ctx.engine))
        .with_retry(RetryPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        })
        .with_fetch_timeout(Duration::from_secs(5))
}

pub async fn count(pool: &SqlitePool, table: &str) -> i64 {
    sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", table))
        .fetch_one(pool)
        .await
        .unwrap()
}

pub fn bill_payload(number: &str, title: &str) -> Value {
    serde_json::json!({
        "jurisdiction": "ca",
        "session": "44-1",
        "number": number,
        "name": {"en": title},
        "status": "Introduced"
    })
}

pub fn speech_payload(sequence: u32, time: &str) -> Value {
    serde_json::json!({
        "jurisdiction": "ca",
        "session": "44-1",
        "sequence": sequence,
        "time": time,
        "content": {"en": format!("Speech number {}", sequence)},
        "attribution": "Member"
    })
}

pub fn debate_payload(date: &str) -> Value {
    serde_json::json!({
        "jurisdiction": "ca",
        "session": "44-1",
        "date": date,
        "number": "200"
    })
}
