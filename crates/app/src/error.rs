//! Startup errors of the platform binary.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Service error: {0}")]
    Service(#[from] services::ServiceError),

    #[error("Saga error: {0}")]
    Saga(#[from] saga::SagaError),

    #[error("Messaging error: {0}")]
    Messaging(#[from] messaging::MessagingError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Metrics exporter error: {0}")]
    Metrics(String),
}

pub type Result<T> = std::result::Result<T, AppError>;
