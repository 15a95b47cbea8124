//! Configuration system for Anamnesis.
//!
//! Configuration is layered: built-in defaults, then an optional file, then
//! `ANAMNESIS_`-prefixed environment variables, and is validated once at the end.

mod builder;
mod loader;
mod models;
mod validation;

pub use builder::ConfigBuilder;
pub use loader::ConfigLoader;
pub use models::*;
pub use validation::validate_config;

/// Default configuration file names that the system will look for
pub const DEFAULT_CONFIG_FILES: &[&str] = &[
    "anamnesis.toml",
    "anamnesis.yaml",
    "anamnesis.yml",
    "anamnesis.json",
    ".anamnesis/config.toml",
    ".anamnesis/config.yaml",
    ".anamnesis/config.yml",
    ".anamnesis/config.json",
];

/// Environment variable prefix; nested keys are separated by `__`,
/// e.g. `ANAMNESIS_STORAGE__GRAPH__ENGINE=memory`
pub const ENV_PREFIX: &str = "ANAMNESIS_";

/// Configuration error type
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Error occurred during file loading
    #[error("Failed to load configuration file: {0}")]
    FileLoadError(String),

    /// Error occurred during validation
    #[error("Configuration validation error: {0}")]
    ValidationError(String),

    /// Error occurred during parsing
    #[error("Configuration parsing error: {0}")]
    ParseError(String),
}

impl From<ConfigError> for crate::AnamnesisError {
    fn from(err: ConfigError) -> Self {
        crate::AnamnesisError::Configuration(err.to_string())
    }
}

/// Result type for configuration operations
pub type Result<T> = std::result::Result<T, ConfigError>;
