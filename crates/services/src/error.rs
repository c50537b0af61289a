//! Service error types.

use domain::DomainError;
use messaging::{HandlerError, MessagingError};
use resource_lock::{LockError, QuotaError};
use thiserror::Error;

/// Errors that can occur inside a service call.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// A business rule rejected the request.
    #[error("Domain error: {0}")]
    Domain(#[from] DomainError),

    /// The resource lock could not be acquired or released.
    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    /// The quota counter is unavailable.
    #[error("Quota error: {0}")]
    Quota(#[from] QuotaError),

    /// The local store or outbox failed.
    #[error("Messaging error: {0}")]
    Messaging(#[from] MessagingError),
}

impl ServiceError {
    /// True if retrying the same request cannot succeed.
    pub fn is_business(&self) -> bool {
        matches!(self, ServiceError::Domain(e) if e.is_business())
    }

    /// True for an optimistic version mismatch.
    pub fn is_conflict(&self) -> bool {
        matches!(self, ServiceError::Domain(DomainError::ConcurrencyConflict { .. }))
    }
}

impl From<ServiceError> for HandlerError {
    fn from(e: ServiceError) -> Self {
        match e {
            ServiceError::Messaging(e) => e.into(),
            e if e.is_business() => HandlerError::Permanent(e.to_string()),
            e => HandlerError::Transient(e.to_string()),
        }
    }
}

/// Convenience type alias for service results.
pub type Result<T> = std::result::Result<T, ServiceError>;
