//! Domain layer for order fulfillment.
//!
//! This crate holds the business rules each service applies inside its own
//! local transaction:
//! - `ProductStock` reservation arithmetic
//! - `CouponPolicy` / `UserCoupon` issuance and use rules
//! - `PointBalance` with its optimistic version column
//! - `Order` validation and status
//! - `TransactionLedger`, the per-service idempotency history

pub mod coupon;
pub mod error;
pub mod history;
pub mod inventory;
pub mod order;
pub mod point;

pub use coupon::{CouponPolicy, CouponStatus, UserCoupon};
pub use error::{DomainError, Result};
pub use history::{TransactionLedger, TransactionRecord, TransactionType};
pub use inventory::ProductStock;
pub use order::{Order, OrderStatus};
pub use point::PointBalance;
