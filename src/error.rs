//! Error types for farm-scheduler operations.
//!
//! One enum per subsystem:
//! - Queue store access (Redis or in-memory)
//! - Blob store reads and writes
//! - Compute service lifecycle operations
//! - Requirements condition parsing
//! - Service configuration loading

use thiserror::Error;

/// Errors raised by a [`QueueStore`](crate::store::QueueStore) backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Redis connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Redis operation failed: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Failed to encode value: {0}")]
    Encode(String),

    #[error("Failed to decode stored value '{value}': {reason}")]
    Decode { value: String, reason: String },
}

/// Errors raised by a [`BlobStore`](crate::blob::BlobStore) backend.
///
/// A missing blob is not an error; `get` returns `Ok(None)` for it.
#[derive(Debug, Error)]
pub enum BlobError {
    #[error("Invalid blob hash '{0}': must be a lowercase hex digest")]
    InvalidHash(String),

    #[error("Invalid namespace id '{0}'")]
    InvalidNamespace(String),

    #[error("Blob backend error: {0}")]
    Backend(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that can occur during compute service operations.
///
/// Missing clusters or requirements discovered while dispatching work are
/// reported to clients as task statuses instead of being returned here.
#[derive(Debug, Error)]
pub enum ComputeError {
    #[error("Cluster '{0}' not found")]
    ClusterNotFound(String),

    #[error("Invalid lease payload: {0}")]
    InvalidPayload(String),

    #[error("Invalid task request: {0}")]
    InvalidRequest(String),

    #[error("Queue store error: {0}")]
    Store(#[from] StoreError),

    #[error("Blob store error: {0}")]
    Blob(#[from] BlobError),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors raised while parsing a requirements condition expression.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConditionError {
    #[error("Unexpected end of condition, expected {0}")]
    UnexpectedEnd(&'static str),

    #[error("Unexpected '{found}' at offset {offset}")]
    UnexpectedToken { found: String, offset: usize },

    #[error("Unterminated string starting at offset {0}")]
    UnterminatedString(usize),

    #[error("Condition nests deeper than {max} levels at offset {offset}")]
    TooDeep { max: usize, offset: usize },
}

/// Errors that can occur while loading service configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}
