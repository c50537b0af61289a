//! The product, coupon and point services.
//!
//! Each service owns its tables in a [`messaging::LocalDatabase`], publishes
//! through its own outbox and consumes its commands from the broker via the
//! handlers in [`handlers`]. Every step is idempotent: a transaction history
//! row keyed by order, kind and resource is written in the same transaction
//! as the mutation, and a replayed command finds it and does nothing.

pub mod context;
pub mod coupon;
pub mod error;
pub mod handlers;
pub mod point;
pub mod product;

pub use context::{ServiceContext, ServiceStore, StepOutcome, acquire_all, release_all};
pub use coupon::{CouponService, CouponTables};
pub use error::{Result, ServiceError};
pub use handlers::TopicHandler;
pub use point::{PointService, PointTables};
pub use product::{ProductService, ProductTables};
