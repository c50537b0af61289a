use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while storing or delivering messages.
#[derive(Debug, Error)]
pub enum MessagingError {
    /// A payload could not be serialized or parsed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The broker rejected the send or is unreachable.
    #[error("Broker error: {0}")]
    Broker(String),

    /// The broker did not confirm the send in time.
    #[error("Broker send timed out after {0:?}")]
    Timeout(Duration),

    /// The local store failed to commit.
    #[error("Storage error: {0}")]
    Storage(String),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

/// Result type for messaging operations.
pub type Result<T> = std::result::Result<T, MessagingError>;

/// Outcome classification returned by message handlers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerError {
    /// Infrastructure hiccup (lock timeout, storage unavailable); worth retrying.
    #[error("transient failure: {0}")]
    Transient(String),

    /// The record can never be processed (malformed payload); dead-letter it.
    #[error("permanent failure: {0}")]
    Permanent(String),
}

impl HandlerError {
    pub fn is_transient(&self) -> bool {
        matches!(self, HandlerError::Transient(_))
    }
}

impl From<MessagingError> for HandlerError {
    fn from(e: MessagingError) -> Self {
        match e {
            MessagingError::Serialization(_) => HandlerError::Permanent(e.to_string()),
            _ => HandlerError::Transient(e.to_string()),
        }
    }
}
