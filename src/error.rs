//! Error types for leadership election operations

use std::time::Duration;
use thiserror::Error;

/// Result type for election operations
pub type Result<T> = std::result::Result<T, ElectionError>;

/// Errors that can occur during leadership election
///
/// Contention — another participant holding a valid lease, or not being the
/// holder on renew/release — is never an error. Store operations report it as
/// a normal `None`/`false` return; this enum covers genuine failures only.
#[derive(Debug, Error)]
pub enum ElectionError {
    /// A store operation did not complete within the configured timeout
    #[error("'{operation}' did not complete within {timeout:?}")]
    Timeout {
        /// Name of the store operation that timed out
        operation: &'static str,
        /// The configured operation timeout
        timeout: Duration,
    },

    /// Redis backend failure
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// SQLite backend failure
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Lease payload could not be serialized or deserialized
    #[error("Lease serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Table name contains characters that are not allowed in an identifier
    #[error("Invalid table name '{0}': must start with a letter or underscore and contain only letters, digits, underscore, or hyphen")]
    InvalidTableName(String),

    /// Election name failed construction-time validation
    #[error("Invalid election name: {0}")]
    InvalidElectionName(String),

    /// Failure reported by a custom store implementation
    #[error("Store error: {0}")]
    Store(String),
}

impl ElectionError {
    /// Create a store error from any displayable value
    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }
}
