//! Source adapters
//!
//! Reference implementations of [`SourceAdapter`](crate::types::SourceAdapter):
//! a rate-limited HTTP client for the live API and a JSON fixture reader.

pub mod file;
pub mod http;

pub use file::JsonFileAdapter;
pub use http::HttpAdapter;

use crate::error::FetchError;
use crate::types::SourceAdapter;
use parl_common::config::{FetchConfig, SourceConfig, SourceKind};
use std::sync::Arc;

/// Build the adapter selected by configuration
pub fn build_adapter(source: &SourceConfig, fetch: &FetchConfig) -> Result<Arc<dyn SourceAdapter>, FetchError> {
    match source.kind {
        SourceKind::Http => Ok(Arc::new(HttpAdapter::new(
            source.base_url.clone(),
            fetch.timeout_ms,
            source.min_request_interval_ms,
        )?)),
        SourceKind::File => {
            let path = source
                .path
                .clone()
                .ok_or_else(|| FetchError::Permanent("source.kind = \"file\" requires source.path".into()))?;
            Ok(Arc::new(JsonFileAdapter::new(path)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_source_requires_a_path() {
        let source = SourceConfig {
            kind: SourceKind::File,
            path: None,
            ..Default::default()
        };
        assert!(build_adapter(&source, &FetchConfig::default()).is_err());
    }

    #[test]
    fn adapter_matches_kind() {
        let source = SourceConfig {
            kind: SourceKind::File,
            path: Some("fixture.json".into()),
            ..Default::default()
        };
        let adapter = build_adapter(&source, &FetchConfig::default()).unwrap();
        assert_eq!(adapter.name(), "file");

        let adapter = build_adapter(&SourceConfig::default(), &FetchConfig::default()).unwrap();
        assert_eq!(adapter.name(), "http");
    }
}
