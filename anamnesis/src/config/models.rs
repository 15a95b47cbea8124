//! Configuration model definitions.
//!
//! This module contains the configuration structures for all Anamnesis components.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Main configuration structure for Anamnesis.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AnamnesisConfig {
    /// Storage configuration
    pub storage: StorageConfig,

    /// Fact memory configuration
    pub memory: MemoryConfig,

    /// Conversation ledger configuration
    pub context: ContextConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Default data directory under the platform's data location
pub(crate) fn default_data_dir() -> PathBuf {
    directories::ProjectDirs::from("org", "anamnesis", "anamnesis")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("./data"))
}

/// Configuration for storage components.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Base directory for storage
    pub data_dir: PathBuf,

    /// Graph backend configuration
    pub graph: GraphBackendConfig,

    /// Message content sink configuration
    pub content: ContentSinkConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            graph: GraphBackendConfig::default(),
            content: ContentSinkConfig::default(),
        }
    }
}

impl StorageConfig {
    /// Resolve a storage path against `data_dir` unless it is absolute
    pub fn resolve(&self, path: &std::path::Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.data_dir.join(path)
        }
    }
}

/// Graph backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphBackendConfig {
    /// Which backend to run
    pub engine: GraphEngine,

    /// Path to store graph data (relative to data_dir), used by RocksDB
    pub path: PathBuf,

    /// SurrealDB namespace
    pub namespace: String,

    /// SurrealDB database
    pub database: String,
}

impl Default for GraphBackendConfig {
    fn default() -> Self {
        Self {
            engine: GraphEngine::SurrealRocksDb,
            path: PathBuf::from("graph"),
            namespace: "anamnesis".to_string(),
            database: "main".to_string(),
        }
    }
}

/// Graph backend engine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GraphEngine {
    /// Process-local copy-on-write graph, no persistence
    Memory,

    /// Embedded SurrealDB, in memory
    SurrealMemory,

    /// Embedded SurrealDB on RocksDB
    #[serde(rename = "surreal_rocksdb")]
    SurrealRocksDb,
}

impl GraphEngine {
    pub fn is_surreal(&self) -> bool {
        matches!(self, GraphEngine::SurrealMemory | GraphEngine::SurrealRocksDb)
    }
}

/// Message content sink configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContentSinkConfig {
    /// Where closed content and commit markers go
    pub kind: ContentSinkKind,

    /// Ledger directory (relative to data_dir), used by the file sink
    pub path: PathBuf,
}

impl Default for ContentSinkConfig {
    fn default() -> Self {
        Self {
            kind: ContentSinkKind::File,
            path: PathBuf::from("messages"),
        }
    }
}

/// Content sink kind.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ContentSinkKind {
    /// Process memory
    Memory,

    /// One directory per message on disk
    File,
}

/// Fact memory configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MemoryConfig {
    /// Most entities a single unit may declare
    pub max_entities_per_unit: usize,

    /// Most relationships a single unit may declare
    pub max_relationships_per_unit: usize,

    /// Limit applied to queries that do not carry their own
    pub default_query_limit: Option<usize>,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_entities_per_unit: 1000,
            max_relationships_per_unit: 1000,
            default_query_limit: None,
        }
    }
}

/// Conversation ledger configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ContextConfig {
    /// Restore committed messages from the content sink on startup
    pub restore_on_open: bool,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            restore_on_open: true,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: LogLevel,

    /// Log format
    pub format: LogFormat,

    /// File to log to (if any)
    pub file: Option<PathBuf>,

    /// Whether to log to stdout
    pub stdout: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Default,
            file: None,
            stdout: true,
        }
    }
}

/// Log level.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Trace level
    Trace,

    /// Debug level
    Debug,

    /// Info level
    Info,

    /// Warn level
    Warn,

    /// Error level
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "trace"),
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Error => write!(f, "error"),
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            _ => Err(format!("Invalid log level: {}", s)),
        }
    }
}

/// Log format.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Default format
    Default,

    /// JSON format
    Json,

    /// Compact format
    Compact,

    /// Pretty format
    Pretty,
}
