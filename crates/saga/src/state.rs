//! Saga status machine.

use serde::{Deserialize, Serialize};

/// Where a saga is in its lifecycle.
///
/// ```text
/// STARTED ─► ORDER_CREATED ─► STOCK_DECREASED ─► COUPON_USED ─► POINT_USED ─► COMPLETED
///                 │                 │                 │              │
///                 ▼                 ▼                 ▼              │
///      STOCK_DECREASE_FAILED  COUPON_USE_FAILED  POINT_USE_FAILED    │
///                 └─────────────────┴────────┬────────┘              │
///                                            ▼                       │
///     (any in-flight status, on expiry) ─► COMPENSATING ◄────────────┘
///                                            │
///                           ┌────────────────┴───────────┐
///                           ▼                            ▼
///                 COMPENSATION_COMPLETED               FAILED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SagaStatus {
    #[default]
    Started,
    OrderCreated,
    StockDecreased,
    CouponUsed,
    PointUsed,
    Completed,
    StockDecreaseFailed,
    CouponUseFailed,
    PointUseFailed,
    Compensating,
    CompensationCompleted,
    /// A compensation could not be applied and needs manual attention.
    Failed,
}

impl SagaStatus {
    /// Returns true if the saga may move from `self` to `next`.
    pub fn can_transition_to(&self, next: SagaStatus) -> bool {
        use SagaStatus::*;
        match (self, next) {
            (Started, OrderCreated)
            | (OrderCreated, StockDecreased | StockDecreaseFailed)
            | (StockDecreased, CouponUsed | CouponUseFailed)
            | (CouponUsed, PointUsed | PointUseFailed)
            | (PointUsed, Completed)
            | (Compensating, CompensationCompleted | Failed) => true,
            (from, Compensating) => from.is_failure() || from.is_in_flight(),
            _ => false,
        }
    }

    /// Returns true if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SagaStatus::Completed | SagaStatus::CompensationCompleted | SagaStatus::Failed
        )
    }

    /// Returns true for the `*_FAILED` step statuses.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            SagaStatus::StockDecreaseFailed | SagaStatus::CouponUseFailed | SagaStatus::PointUseFailed
        )
    }

    /// Returns true while the forward path is still running.
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            SagaStatus::Started
                | SagaStatus::OrderCreated
                | SagaStatus::StockDecreased
                | SagaStatus::CouponUsed
                | SagaStatus::PointUsed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SagaStatus::Started => "STARTED",
            SagaStatus::OrderCreated => "ORDER_CREATED",
            SagaStatus::StockDecreased => "STOCK_DECREASED",
            SagaStatus::CouponUsed => "COUPON_USED",
            SagaStatus::PointUsed => "POINT_USED",
            SagaStatus::Completed => "COMPLETED",
            SagaStatus::StockDecreaseFailed => "STOCK_DECREASE_FAILED",
            SagaStatus::CouponUseFailed => "COUPON_USE_FAILED",
            SagaStatus::PointUseFailed => "POINT_USE_FAILED",
            SagaStatus::Compensating => "COMPENSATING",
            SagaStatus::CompensationCompleted => "COMPENSATION_COMPLETED",
            SagaStatus::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for SagaStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A forward step of the saga, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SagaStep {
    Stock,
    Coupon,
    Point,
}

impl SagaStep {
    /// Status entered when the step succeeds.
    pub fn succeeded(&self) -> SagaStatus {
        match self {
            SagaStep::Stock => SagaStatus::StockDecreased,
            SagaStep::Coupon => SagaStatus::CouponUsed,
            SagaStep::Point => SagaStatus::PointUsed,
        }
    }

    /// Status entered when the step fails.
    pub fn failed(&self) -> SagaStatus {
        match self {
            SagaStep::Stock => SagaStatus::StockDecreaseFailed,
            SagaStep::Coupon => SagaStatus::CouponUseFailed,
            SagaStep::Point => SagaStatus::PointUseFailed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SagaStep::Stock => "STOCK",
            SagaStep::Coupon => "COUPON",
            SagaStep::Point => "POINT",
        }
    }
}

impl std::fmt::Display for SagaStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_status_is_started() {
        assert_eq!(SagaStatus::default(), SagaStatus::Started);
    }

    #[test]
    fn test_forward_path() {
        let path = [
            SagaStatus::Started,
            SagaStatus::OrderCreated,
            SagaStatus::StockDecreased,
            SagaStatus::CouponUsed,
            SagaStatus::PointUsed,
            SagaStatus::Completed,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
            assert!(!pair[1].can_transition_to(pair[0]), "{} -> {}", pair[1], pair[0]);
        }
    }

    #[test]
    fn test_no_skipping_steps() {
        assert!(!SagaStatus::OrderCreated.can_transition_to(SagaStatus::CouponUsed));
        assert!(!SagaStatus::StockDecreased.can_transition_to(SagaStatus::PointUseFailed));
    }

    #[test]
    fn test_failures_lead_to_compensation() {
        for step in [SagaStep::Stock, SagaStep::Coupon, SagaStep::Point] {
            assert!(step.failed().is_failure());
            assert!(step.failed().can_transition_to(SagaStatus::Compensating));
        }
        assert!(SagaStatus::Compensating.can_transition_to(SagaStatus::CompensationCompleted));
        assert!(SagaStatus::Compensating.can_transition_to(SagaStatus::Failed));
    }

    #[test]
    fn test_terminal_states_are_final() {
        for terminal in [
            SagaStatus::Completed,
            SagaStatus::CompensationCompleted,
            SagaStatus::Failed,
        ] {
            assert!(terminal.is_terminal());
            assert!(!terminal.can_transition_to(SagaStatus::Compensating));
        }
        assert!(!SagaStatus::Compensating.can_transition_to(SagaStatus::Compensating));
    }

    #[test]
    fn test_serialization() {
        let json = serde_json::to_string(&SagaStatus::CompensationCompleted).unwrap();
        assert_eq!(json, "\"COMPENSATION_COMPLETED\"");
        assert_eq!(SagaStatus::StockDecreaseFailed.to_string(), "STOCK_DECREASE_FAILED");
    }
}
