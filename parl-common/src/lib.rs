//! # Parl Common Library
//!
//! Shared code for the parliamentary record ingestion services:
//! - Entity type catalogue
//! - Database initialization and the versioned schema descriptor
//! - Configuration loading and root folder resolution
//! - Error types
//! - Timestamp utilities

pub mod config;
pub mod db;
pub mod entity;
pub mod error;
pub mod time;

pub use entity::EntityType;
pub use error::{Error, Result};
