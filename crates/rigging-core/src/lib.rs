//! Rigging Core - configuration and dependency graph for Rigging
//!
//! This crate loads project configuration, validates it and resolves it into
//! an immutable [`ConfigGraph`] of modules, services, runtime tasks and tests,
//! each carrying a content version used for result caching.

pub mod config;
pub mod error;
pub mod graph;

pub use config::{load_config, load_config_or_default, validate_config, ProjectConfig};
pub use error::{ConfigError, GraphError, Result, RiggingError};
pub use graph::{ConfigGraph, EntityKind, EntityNode, EntityRef, FileHasher, FixedHasher, SourceHasher};
