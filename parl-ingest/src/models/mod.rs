//! Data models for parl-ingest
//!
//! - Canonical records flowing from the normalizer to the store
//! - Batch state machine and result accounting

pub mod batch_result;
pub mod canonical_record;

pub use batch_result::{BatchResult, BatchState};
pub use canonical_record::{CanonicalRecord, ParentRef};
