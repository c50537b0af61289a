//! Saga error types.

use common::{OrderId, SagaId};
use domain::DomainError;
use messaging::{HandlerError, MessagingError};
use thiserror::Error;

use crate::state::SagaStatus;

/// Errors that can occur during saga operations.
#[derive(Debug, Error)]
pub enum SagaError {
    /// The order was rejected by validation; nothing was persisted.
    #[error("Invalid order: {0}")]
    InvalidOrder(DomainError),

    #[error("Saga not found: {0}")]
    SagaNotFound(SagaId),

    #[error("Order not found: {0}")]
    OrderNotFound(OrderId),

    /// The saga cannot move from `from` to `to`.
    #[error("Invalid saga transition for {saga_id}: {from} -> {to}")]
    InvalidTransition {
        saga_id: SagaId,
        from: SagaStatus,
        to: SagaStatus,
    },

    /// The saga row was updated by someone else since it was read.
    #[error("Concurrency conflict on saga {saga_id}: expected version {expected}, found {actual}")]
    ConcurrencyConflict { saga_id: SagaId, expected: i64, actual: i64 },

    /// Domain error.
    #[error("Domain error: {0}")]
    Domain(#[from] DomainError),

    /// Local store or outbox error.
    #[error("Messaging error: {0}")]
    Messaging(#[from] MessagingError),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SagaError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, SagaError::ConcurrencyConflict { .. })
    }
}

impl From<SagaError> for HandlerError {
    fn from(e: SagaError) -> Self {
        match e {
            SagaError::Messaging(e) => e.into(),
            e @ (SagaError::Serialization(_) | SagaError::SagaNotFound(_) | SagaError::InvalidOrder(_)) => {
                HandlerError::Permanent(e.to_string())
            }
            e => HandlerError::Transient(e.to_string()),
        }
    }
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;
