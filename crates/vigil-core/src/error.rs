//! Error types for Vigil

use thiserror::Error;

/// Result type alias using Vigil's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for Vigil operations
#[derive(Error, Debug)]
pub enum Error {
    /// A rule's queries did not complete within the evaluation timeout
    #[error("Query timed out after {0:?}")]
    QueryTimeout(std::time::Duration),

    /// An in-flight request was cancelled by its caller
    #[error("Request cancelled")]
    Cancelled,

    /// The data source collaborator failed to execute a query
    #[error("Query execution failed: {0}")]
    QueryExecution(String),

    /// Malformed configuration (bad matcher, missing receiver reference, ...)
    #[error("Invalid configuration: {0}")]
    ConfigValidation(String),

    /// Well-formed configuration that cannot be applied
    #[error("Failed to apply configuration: {0}")]
    ConfigApply(String),

    /// Another replica holds the dispatch lease for this cycle
    #[error("Lease for {key} is held by {holder}")]
    LeaseConflict {
        /// Lease key
        key: String,
        /// Replica holding the lease
        holder: String,
    },

    /// An evaluation older than the newest completed one was discarded
    #[error("Stale evaluation result for rule {rule_uid}")]
    StaleResult {
        /// Rule the result belongs to
        rule_uid: String,
    },

    /// Not found error
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Kind of the missing entity
        entity: String,
        /// Identifier that was looked up
        id: String,
    },

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Configuration loading error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Redis error
    #[error("Redis error: {0}")]
    Redis(String),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Create a not found error
    pub fn not_found(entity: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity: entity.into(),
            id: id.into(),
        }
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a config loading error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a configuration validation error
    pub fn config_validation(msg: impl Into<String>) -> Self {
        Self::ConfigValidation(msg.into())
    }

    /// Create a configuration apply error
    pub fn config_apply(msg: impl Into<String>) -> Self {
        Self::ConfigApply(msg.into())
    }

    /// Create a query execution error
    pub fn query(msg: impl Into<String>) -> Self {
        Self::QueryExecution(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Errors that are part of normal operation and only worth a debug log
    pub fn is_expected(&self) -> bool {
        matches!(self, Self::LeaseConflict { .. } | Self::StaleResult { .. })
    }
}

impl From<redis::RedisError> for Error {
    fn from(e: redis::RedisError) -> Self {
        Self::Redis(e.to_string())
    }
}

impl From<::config::ConfigError> for Error {
    fn from(e: ::config::ConfigError) -> Self {
        Self::Config(e.to_string())
    }
}
