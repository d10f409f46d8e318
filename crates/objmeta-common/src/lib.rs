//! objmeta Common - Shared types and utilities
//!
//! This crate provides the entity types, error taxonomy, configuration and
//! request context used across all objmeta components.

pub mod config;
pub mod context;
pub mod error;
pub mod types;

pub use config::{CacheEngine, Config};
pub use context::RequestContext;
pub use error::{Error, Result};
pub use types::*;
