//! Store access for the canonical tables
//!
//! Table creation lives in `parl_common::db`; this module owns everything
//! that reads or writes canonical records.

pub mod capabilities;
pub mod dedup;
pub mod migrations;
pub mod records;
pub mod upsert;

pub use capabilities::StoreCapabilities;
pub use dedup::{verify_references, DanglingReferences, DedupProcedure, DedupReport, EntityDedupStats};
pub use migrations::run_migrations;
pub use upsert::{UpsertEngine, UpsertOutcome, UpsertReport};
