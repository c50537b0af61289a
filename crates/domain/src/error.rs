//! Domain error types.

use thiserror::Error;

/// Errors raised by domain rules.
///
/// Everything except [`ConcurrencyConflict`](DomainError::ConcurrencyConflict)
/// is a business rejection: retrying the same request will fail the same way.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DomainError {
    #[error("Insufficient stock for {stock}: requested {requested}, available {available}")]
    InsufficientStock {
        stock: String,
        requested: u32,
        available: u32,
    },

    #[error("Stock not found: {0}")]
    StockNotFound(String),

    #[error("Coupon policy not found: {0}")]
    PolicyNotFound(String),

    #[error("Coupon not found: {0}")]
    CouponNotFound(String),

    #[error("Coupon {coupon_id} does not belong to user {user_id}")]
    CouponNotOwned { coupon_id: String, user_id: String },

    #[error("Coupon already used: {0}")]
    CouponAlreadyUsed(String),

    #[error("Coupon policy {0} is outside its validity window")]
    OutsideDateWindow(String),

    #[error("Coupon policy {0} has no quantity left")]
    QuotaExhausted(String),

    #[error("User {user_id} already holds a coupon of policy {policy_id}")]
    AlreadyIssued { policy_id: String, user_id: String },

    #[error("Insufficient points: requested {requested}, available {available}")]
    InsufficientPoints { requested: i64, available: i64 },

    #[error("Point account not found for user {0}")]
    PointAccountNotFound(String),

    #[error("Invalid amount: {0} (must be greater than 0)")]
    InvalidAmount(i64),

    /// Order has no lines.
    #[error("Order has no items")]
    EmptyOrder,

    #[error("Invalid quantity for {stock}: {quantity} (must be greater than 0)")]
    InvalidQuantity { stock: String, quantity: u32 },

    #[error("Coupon {0} appears more than once in the order")]
    DuplicateCoupon(String),

    #[error("Order {order_id} is {status}, expected PENDING")]
    OrderNotPending { order_id: String, status: String },

    /// Optimistic version check failed.
    #[error("Concurrency conflict: expected version {expected}, found {actual}")]
    ConcurrencyConflict { expected: i64, actual: i64 },
}

impl DomainError {
    /// True for rule violations that must be reported as a failed step
    /// rather than retried.
    pub fn is_business(&self) -> bool {
        !matches!(self, DomainError::ConcurrencyConflict { .. })
    }
}

pub type Result<T> = std::result::Result<T, DomainError>;
