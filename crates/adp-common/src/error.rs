//! Error types for the ad-data pipeline

use thiserror::Error;

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, AdpError>;

/// Main error type for the ad-data pipeline
///
/// The variants map onto how the orchestrator reacts: `Schema` and
/// `UnsupportedFormat` are fatal for a single source file only, `Storage` is
/// logged and the object retried on a later run, while `SchemaMismatch` and
/// `Swap` abort the whole run.
#[derive(Error, Debug)]
pub enum AdpError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Object storage error: {0}")]
    Storage(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Unsupported source format: {0}")]
    UnsupportedFormat(String),

    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Schema mismatch between record sets: {0}")]
    SchemaMismatch(String),

    #[error("Table swap failure: {0}")]
    Swap(String),

    #[error("Configuration error: {0}")]
    Config(String),
}
