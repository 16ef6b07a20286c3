//! HTTP source adapter
//!
//! Reads paginated JSON listings from a parliamentary open-data API with a
//! minimum interval between requests.

use crate::error::FetchError;
use crate::types::{AdapterItemError, FetchFilters, FetchResponse, RawPayload, SourceAdapter};
use parl_common::EntityType;
use reqwest::StatusCode;
use serde_json::Value;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

const USER_AGENT: &str = concat!("parl-ingest/", env!("CARGO_PKG_VERSION"));

/// Listing path for each entity type, relative to the base URL
pub fn entity_path(entity_type: EntityType) -> &'static str {
    match entity_type {
        EntityType::Committee => "committees/",
        EntityType::Bill => "bills/",
        EntityType::Debate => "debates/",
        EntityType::Vote => "votes/",
        EntityType::Meeting => "committees/meetings/",
        EntityType::Speech => "speeches/",
    }
}

/// Serializes requests to at most one per `min_interval`
struct RateLimiter {
    last_request: Mutex<Option<Instant>>,
    min_interval: Duration,
}

impl RateLimiter {
    fn new(min_interval_ms: u64) -> Self {
        Self {
            last_request: Mutex::new(None),
            min_interval: Duration::from_millis(min_interval_ms),
        }
    }

    async fn wait(&self) {
        let mut last = self.last_request.lock().await;

        if let Some(last_time) = *last {
            let elapsed = last_time.elapsed();
            if elapsed < self.min_interval {
                let wait_time = self.min_interval - elapsed;
                tracing::debug!("Rate limiting: waiting {:?}", wait_time);
                tokio::time::sleep(wait_time).await;
            }
        }

        *last = Some(Instant::now());
    }
}

pub struct HttpAdapter {
    http_client: reqwest::Client,
    base_url: String,
    rate_limiter: RateLimiter,
}

impl HttpAdapter {
    pub fn new(base_url: impl Into<String>, timeout_ms: u64, min_request_interval_ms: u64) -> Result<Self, FetchError> {
        let http_client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .map_err(|e| FetchError::Permanent(format!("HTTP client setup failed: {}", e)))?;

        Ok(Self {
            http_client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            rate_limiter: RateLimiter::new(min_request_interval_ms),
        })
    }

    pub fn listing_url(&self, entity_type: EntityType) -> String {
        format!("{}/{}", self.base_url, entity_path(entity_type))
    }
}

/// Query parameters for a listing request
pub fn query_params(filters: &FetchFilters) -> Vec<(&'static str, String)> {
    let mut params = vec![
        ("format", "json".to_string()),
        ("limit", filters.limit.to_string()),
        ("offset", filters.offset.to_string()),
    ];
    if let Some(parliament) = filters.parliament {
        params.push(("parliament", parliament.to_string()));
    }
    if let Some(session) = filters.session {
        params.push(("session", session.to_string()));
    }
    if let Some(from) = filters.date_range.from {
        params.push(("date__gte", from.format("%Y-%m-%d").to_string()));
    }
    if let Some(to) = filters.date_range.to {
        params.push(("date__lte", to.format("%Y-%m-%d").to_string()));
    }
    params
}

/// Map a non-success status to a fetch error
pub fn classify_status(status: StatusCode, body: &str) -> FetchError {
    let message = format!("HTTP {}: {}", status.as_u16(), body.chars().take(200).collect::<String>());
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        FetchError::Transient(message)
    } else {
        FetchError::Permanent(message)
    }
}

fn classify_request_error(err: &reqwest::Error) -> FetchError {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        FetchError::Transient(err.to_string())
    } else {
        FetchError::Permanent(err.to_string())
    }
}

/// Split a listing document into payloads and per-item errors
///
/// Accepts a bare array or an object holding `objects` (or `data`) plus an
/// optional `errors` array.
pub fn parse_listing(document: Value) -> Result<FetchResponse, FetchError> {
    let (items, errors) = match document {
        Value::Array(items) => (items, Vec::new()),
        Value::Object(mut map) => {
            let items = match map.remove("objects").or_else(|| map.remove("data")) {
                Some(Value::Array(items)) => items,
                Some(other) => {
                    return Err(FetchError::Permanent(format!("listing items are not an array: {}", other)))
                }
                None => return Err(FetchError::Permanent("listing has no 'objects' or 'data' array".into())),
            };
            let errors = match map.remove("errors") {
                Some(Value::Array(errors)) => errors,
                _ => Vec::new(),
            };
            (items, errors)
        }
        other => return Err(FetchError::Permanent(format!("unexpected listing document: {}", other))),
    };

    let mut response = FetchResponse::default();
    for (position, item) in items.into_iter().enumerate() {
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
    for (position, error) in errors.into_iter().enumerate() {
        response.errors.push(AdapterItemError {
            item_ref: item_ref(&error, position),
            message: error
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| error.to_string()),
        });
    }
    Ok(response)
}

/// Source reference for an item: its `url`, then `id`, then its position
pub fn item_ref(item: &Value, position: usize) -> String {
    ["url", "item_ref", "id"]
        .iter()
        .find_map(|k| match item.get(*k) {
            Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        })
        .unwrap_or_else(|| position.to_string())
}

#[async_trait::async_trait]
impl SourceAdapter for HttpAdapter {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn fetch(&self, entity_type: EntityType, filters: &FetchFilters) -> Result<FetchResponse, FetchError> {
        self.rate_limiter.wait().await;

        let url = self.listing_url(entity_type);
        tracing::debug!(entity_type = %entity_type, url = %url, offset = filters.offset, "Fetching listing");

        let response = self
            .http_client
            .get(&url)
            .query(&query_params(filters))
            .send()
            .await
            .map_err(|e| classify_request_error(&e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        let document: Value = response
            .json()
            .await
            .map_err(|e| FetchError::Permanent(format!("Invalid JSON from {}: {}", url, e)))?;

        parse_listing(document)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use serde_json::json;

    #[test]
    fn listing_url_joins_without_double_slash() {
        let adapter = HttpAdapter::new("https://api.example.org/", 1000, 0).unwrap();
        assert_eq!(adapter.listing_url(EntityType::Meeting), "https://api.example.org/committees/meetings/");
    }

    #[test]
    fn filters_become_query_params() {
        let mut filters = FetchFilters {
            parliament: Some(44),
            session: Some(1),
            ..Default::default()
        };
        filters.date_range.from = NaiveDate::from_ymd_opt(2023, 1, 1);

        let params = query_params(&filters);
        assert!(params.contains(&("parliament", "44".to_string())));
        assert!(params.contains(&("session", "1".to_string())));
        assert!(params.contains(&("date__gte", "2023-01-01".to_string())));
        assert!(!params.iter().any(|(k, _)| *k == "date__lte"));
    }

    #[test]
    fn throttling_and_server_errors_are_transient() {
        assert!(matches!(classify_status(StatusCode::TOO_MANY_REQUESTS, ""), FetchError::Transient(_)));
        assert!(matches!(classify_status(StatusCode::BAD_GATEWAY, ""), FetchError::Transient(_)));
        assert!(matches!(classify_status(StatusCode::NOT_FOUND, ""), FetchError::Permanent(_)));
    }

    #[test]
    fn wrapped_listing_keeps_item_errors() {
        let response = parse_listing(json!({
            "objects": [{"url": "/bills/44-1/C-10/"}, 7],
            "errors": [{"id": 12, "message": "gone"}]
        }))
        .unwrap();

        assert_eq!(response.data.len(), 1);
        assert_eq!(response.data[0].item_ref, "/bills/44-1/C-10/");
        assert_eq!(response.errors.len(), 2);
        assert_eq!(response.errors[1].item_ref, "12");
        assert_eq!(response.errors[1].message, "gone");
    }

    #[test]
    fn bare_array_is_accepted() {
        let response = parse_listing(json!([{"id": 1}, {"id": 2}])).unwrap();
        assert_eq!(response.data.len(), 2);
        assert!(parse_listing(json!("nope")).is_err());
    }
}
