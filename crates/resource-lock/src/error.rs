use std::time::Duration;

use thiserror::Error;

/// Errors returned by lock operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LockError {
    /// The lock could not be acquired within the wait timeout.
    #[error("lock '{key}' not acquired within {waited:?}")]
    Timeout { key: String, waited: Duration },

    /// Unlock was attempted with a token that no longer holds the lock
    /// (never acquired, already released, or the lease expired).
    #[error("lock '{key}' is not held by this token")]
    NotHeld { key: String },

    /// The backing store failed.
    #[error("lock backend error: {0}")]
    Backend(String),
}

/// Errors returned by quota counters.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QuotaError {
    /// The counter was never initialized from the authoritative store.
    #[error("quota counter '{0}' is not initialized")]
    NotInitialized(String),

    /// The backing store failed.
    #[error("quota backend error: {0}")]
    Backend(String),
}
