//! Order service: saga orchestration for order fulfillment.
//!
//! An order runs through three forward steps, each owned by another
//! service and driven by commands through the outbox:
//! 1. Decrease stock
//! 2. Use coupons (skipped when the order has none)
//! 3. Use points (skipped when the amount is zero)
//!
//! If a step fails, or the order expires, every applied step is compensated
//! in reverse order and tracked in the [`CompensationRegistry`] until the
//! owning service confirms it.

pub mod compensation;
pub mod coordinator;
pub mod error;
pub mod handlers;
pub mod registry;
pub mod scheduler;
pub mod state;
pub mod store;
pub mod transaction;

pub use compensation::CompensationCoordinator;
pub use coordinator::{PlaceOrder, SagaConfig, SagaCoordinator};
pub use error::{Result, SagaError};
pub use handlers::TopicHandler;
pub use registry::{CompensationEntry, CompensationRegistry, CompensationStatus};
pub use scheduler::spawn_schedulers;
pub use state::{SagaStatus, SagaStep};
pub use store::{OrderStore, OrderTables};
pub use transaction::{CompensationCommand, SagaTransaction, StepMarkers};
