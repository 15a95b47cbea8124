//! Error types for storage operations

use std::error::Error;
use std::fmt;

/// Error type for graph backend and content sink operations
#[derive(Debug)]
pub enum StorageError {
    /// Configuration error
    Configuration(String),

    /// Connection error
    Connection(String),

    /// Query error
    Query(String),

    /// Transaction error
    Transaction(String),

    /// Internal error
    Internal(String),

    /// Validation error
    Validation(String),

    /// Data not found
    NotFound(String),

    /// Serialization/deserialization error
    Serialization(String),

    /// Multiple errors occurred
    Multiple(Vec<Box<StorageError>>),
}

pub type StorageResult<T> = Result<T, StorageError>;

impl StorageError {
    /// Combine a primary failure with a follow-up failure (e.g. a failed rollback)
    /// into one error, flattening nested `Multiple` values.
    pub fn aggregate(primary: StorageError, secondary: StorageError) -> StorageError {
        let mut errors = Vec::new();
        for err in [primary, secondary] {
            match err {
                StorageError::Multiple(inner) => errors.extend(inner),
                other => errors.push(Box::new(other)),
            }
        }
        StorageError::Multiple(errors)
    }
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::Configuration(msg) => write!(f, "Configuration error: {}", msg),
            StorageError::Connection(msg) => write!(f, "Connection error: {}", msg),
            StorageError::Query(msg) => write!(f, "Query error: {}", msg),
            StorageError::Transaction(msg) => write!(f, "Transaction error: {}", msg),
            StorageError::Internal(msg) => write!(f, "Internal error: {}", msg),
            StorageError::Validation(msg) => write!(f, "Validation error: {}", msg),
            StorageError::NotFound(msg) => write!(f, "Not found: {}", msg),
            StorageError::Serialization(msg) => write!(f, "Serialization error: {}", msg),
            StorageError::Multiple(errors) => {
                write!(f, "Multiple errors: ")?;
                for (i, err) in errors.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", err)?;
                }
                Ok(())
            }
        }
    }
}

impl Error for StorageError {}

/// Convert a JSON error to a storage error
impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

/// Convert a standard IO error to a storage error
impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::Connection(err.to_string())
    }
}

// This allows StorageError to be converted to the top-level AnamnesisError
impl From<StorageError> for crate::AnamnesisError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(msg) => crate::AnamnesisError::NotFound(msg),
            StorageError::Validation(msg) => crate::AnamnesisError::Validation(msg),
            other => crate::AnamnesisError::Storage(other.to_string()),
        }
    }
}
