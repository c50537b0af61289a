//! Shared types for the order-fulfillment platform.
//!
//! Every service depends on this crate for:
//! - strongly typed identifiers (`OrderId`, `SagaId`, `UserId`, ...)
//! - the JSON event envelope carried on every topic
//! - topic names and the command/event payloads exchanged between services

pub mod envelope;
pub mod events;
pub mod topics;
pub mod types;

pub use envelope::EventEnvelope;
pub use types::{CouponId, OrderId, PolicyId, ProductId, SagaId, StockKey, UserId, Version};
