//! Error types for Rigging

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using RiggingError
pub type Result<T> = std::result::Result<T, RiggingError>;

/// Main error type for Rigging operations
#[derive(Debug, Error)]
pub enum RiggingError {
    /// Configuration-related errors
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Config graph resolution errors
    #[error(transparent)]
    Graph(#[from] GraphError),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic errors
    #[error("{0}")]
    Other(String),
}

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Configuration file not found
    #[error("Configuration file not found at {0}")]
    NotFound(PathBuf),

    /// Failed to parse configuration
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Invalid configuration value
    #[error("Invalid configuration: {field} - {message}")]
    InvalidValue { field: String, message: String },

    /// Missing required field
    #[error("Missing required configuration field: {0}")]
    MissingField(String),

    /// YAML parsing error
    #[error("YAML parsing error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// TOML parsing error
    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    /// IO error
    #[error("IO error reading config: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while resolving the config graph
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    /// Dependency edges form a cycle; the cycle is listed in traversal order
    #[error("Circular dependency detected: {}", format_cycle(.cycle))]
    CircularDependency { cycle: Vec<String> },

    /// A declared dependency does not name any known entity
    #[error("{entity} depends on unknown {kind} '{dependency}'")]
    UnknownDependency {
        entity: String,
        kind: String,
        dependency: String,
    },

    /// Two entities share a name within one namespace
    #[error("Duplicate {kind} name '{name}'")]
    DuplicateName { kind: String, name: String },

    /// A lookup named an entity that is not in the graph
    #[error("Unknown {kind} '{name}'")]
    UnknownEntity { kind: String, name: String },
}

fn format_cycle(cycle: &[String]) -> String {
    match cycle.first() {
        Some(first) => format!("{} -> {}", cycle.join(" -> "), first),
        None => String::new(),
    }
}

impl RiggingError {
    /// Create a new "other" error with a message
    pub fn other<S: Into<String>>(msg: S) -> Self {
        Self::Other(msg.into())
    }

    /// Whether this error comes from configuration or graph resolution
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Config(_) | Self::Graph(_))
    }
}
