//! Topic names. Every topic has a paired dead-letter topic (`<topic>-dlt`).

pub const STOCK_DECREASE: &str = "stock-decrease";
pub const STOCK_DECREASED: &str = "stock-decreased";
pub const STOCK_DECREASE_FAILED: &str = "stock-decrease-failed";
pub const STOCK_CONFIRM: &str = "stock-confirm";

pub const COUPON_USE: &str = "coupon-use";
pub const COUPON_APPLIED: &str = "coupon-applied";
pub const COUPON_APPLY_FAILED: &str = "coupon-apply-failed";

pub const POINT_USE: &str = "point-use";
pub const POINT_USED: &str = "point-used";
pub const POINT_USE_FAILED: &str = "point-use-failed";

pub const STOCK_COMPENSATION_REQUEST: &str = "stock-compensation-request";
pub const COUPON_COMPENSATION_REQUEST: &str = "coupon-compensation-request";
pub const POINT_COMPENSATION_REQUEST: &str = "point-compensation-request";
pub const COMPENSATION_COMPLETED: &str = "compensation-completed";

/// Compensations abandoned after a non-retryable failure. Kept apart from
/// `compensation-completed-dlt`, which only carries dead letters.
pub const COMPENSATION_ABANDONED: &str = "compensation-abandoned";

const DLT_SUFFIX: &str = "-dlt";

/// Returns the dead-letter topic paired with `topic`.
pub fn dead_letter_topic(topic: &str) -> String {
    format!("{topic}{DLT_SUFFIX}")
}

/// Returns true if `topic` is a dead-letter topic.
pub fn is_dead_letter_topic(topic: &str) -> bool {
    topic.ends_with(DLT_SUFFIX)
}
