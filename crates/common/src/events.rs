//! Commands and events exchanged between the order, product, coupon and
//! point services.
//!
//! Each payload type is bound to exactly one topic through
//! [`IntegrationEvent`], so producers never pick a topic by hand.

use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::topics;
use crate::types::{CouponId, OrderId, SagaId, StockKey, UserId};

/// A payload that travels on a broker topic.
pub trait IntegrationEvent: Serialize + DeserializeOwned + Send + Sync {
    /// The topic this payload is published to.
    const TOPIC: &'static str;

    /// The `type` field written into the envelope.
    const EVENT_TYPE: &'static str;

    /// The order this payload belongs to; used as the partition key.
    fn order_id(&self) -> OrderId;
}

macro_rules! integration_event {
    ($name:ident => $topic:expr) => {
        impl IntegrationEvent for $name {
            const TOPIC: &'static str = $topic;
            const EVENT_TYPE: &'static str = stringify!($name);

            fn order_id(&self) -> OrderId {
                self.order_id
            }
        }
    };
}

/// One line of an order: how many units of which stock row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderLine {
    pub stock: StockKey,
    pub quantity: u32,
}

impl OrderLine {
    pub fn new(stock: StockKey, quantity: u32) -> Self {
        Self { stock, quantity }
    }
}

/// Which service a compensation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompensationType {
    Stock,
    Coupon,
    Point,
}

impl CompensationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompensationType::Stock => "STOCK",
            CompensationType::Coupon => "COUPON",
            CompensationType::Point => "POINT",
        }
    }
}

impl std::fmt::Display for CompensationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a compensation was requested.
///
/// The product service records an expired order as `CANCEL_RESERVE` rather
/// than `ROLLBACK_RESERVE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompensationReason {
    #[default]
    StepFailed,
    Expired,
}

// ---- order -> product ----

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockDecreaseRequested {
    pub saga_id: SagaId,
    pub order_id: OrderId,
    pub items: Vec<OrderLine>,
}
integration_event!(StockDecreaseRequested => topics::STOCK_DECREASE);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockConfirmRequested {
    pub saga_id: SagaId,
    pub order_id: OrderId,
}
integration_event!(StockConfirmRequested => topics::STOCK_CONFIRM);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockCompensationRequested {
    pub saga_id: SagaId,
    pub order_id: OrderId,
    pub item: OrderLine,
    #[serde(default)]
    pub reason: CompensationReason,
}
integration_event!(StockCompensationRequested => topics::STOCK_COMPENSATION_REQUEST);

// ---- product -> order ----

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockDecreased {
    pub saga_id: SagaId,
    pub order_id: OrderId,
}
integration_event!(StockDecreased => topics::STOCK_DECREASED);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockDecreaseFailed {
    pub saga_id: SagaId,
    pub order_id: OrderId,
    pub reason: String,
}
integration_event!(StockDecreaseFailed => topics::STOCK_DECREASE_FAILED);

// ---- order -> coupon ----

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CouponUseRequested {
    pub saga_id: SagaId,
    pub order_id: OrderId,
    pub user_id: UserId,
    pub coupon_ids: Vec<CouponId>,
}
integration_event!(CouponUseRequested => topics::COUPON_USE);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CouponCompensationRequested {
    pub saga_id: SagaId,
    pub order_id: OrderId,
    pub user_id: UserId,
    pub coupon_id: CouponId,
    #[serde(default)]
    pub reason: CompensationReason,
}
integration_event!(CouponCompensationRequested => topics::COUPON_COMPENSATION_REQUEST);

// ---- coupon -> order ----

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CouponApplied {
    pub saga_id: SagaId,
    pub order_id: OrderId,
    pub coupon_ids: Vec<CouponId>,
}
integration_event!(CouponApplied => topics::COUPON_APPLIED);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CouponApplyFailed {
    pub saga_id: SagaId,
    pub order_id: OrderId,
    pub reason: String,
}
integration_event!(CouponApplyFailed => topics::COUPON_APPLY_FAILED);

// ---- order -> point ----

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointUseRequested {
    pub saga_id: SagaId,
    pub order_id: OrderId,
    pub user_id: UserId,
    pub amount: i64,
}
integration_event!(PointUseRequested => topics::POINT_USE);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointCompensationRequested {
    pub saga_id: SagaId,
    pub order_id: OrderId,
    pub user_id: UserId,
    pub amount: i64,
    #[serde(default)]
    pub reason: CompensationReason,
}
integration_event!(PointCompensationRequested => topics::POINT_COMPENSATION_REQUEST);

// ---- point -> order ----

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointUsed {
    pub saga_id: SagaId,
    pub order_id: OrderId,
    pub amount: i64,
}
integration_event!(PointUsed => topics::POINT_USED);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointUseFailed {
    pub saga_id: SagaId,
    pub order_id: OrderId,
    pub reason: String,
}
integration_event!(PointUseFailed => topics::POINT_USE_FAILED);

// ---- product/coupon/point -> order ----

/// Outcome of one compensating action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompensationCompleted {
    pub saga_id: SagaId,
    pub order_id: OrderId,
    pub compensation_type: CompensationType,
    /// The compensated entity (stock key, coupon id or user id).
    pub entity: String,
    pub success: bool,
    /// Only meaningful when `success` is false.
    pub retryable: bool,
    pub reason: Option<String>,
}
integration_event!(CompensationCompleted => topics::COMPENSATION_COMPLETED);

impl CompensationCompleted {
    pub fn succeeded(
        saga_id: SagaId,
        order_id: OrderId,
        compensation_type: CompensationType,
        entity: impl Into<String>,
    ) -> Self {
        Self {
            saga_id,
            order_id,
            compensation_type,
            entity: entity.into(),
            success: true,
            retryable: false,
            reason: None,
        }
    }

    pub fn failed(
        saga_id: SagaId,
        order_id: OrderId,
        compensation_type: CompensationType,
        entity: impl Into<String>,
        reason: impl Into<String>,
        retryable: bool,
    ) -> Self {
        Self {
            saga_id,
            order_id,
            compensation_type,
            entity: entity.into(),
            success: false,
            retryable,
            reason: Some(reason.into()),
        }
    }
}

// ---- order -> alerting ----

/// A compensation the owning service refused for good; needs manual repair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompensationAbandoned {
    pub saga_id: SagaId,
    pub order_id: OrderId,
    pub compensation_type: CompensationType,
    pub entity: String,
    pub attempts: u32,
    pub reason: Option<String>,
}
integration_event!(CompensationAbandoned => topics::COMPENSATION_ABANDONED);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_types_match_struct_names() {
        assert_eq!(StockDecreased::EVENT_TYPE, "StockDecreased");
        assert_eq!(PointUseRequested::EVENT_TYPE, "PointUseRequested");
        assert_eq!(CompensationCompleted::TOPIC, topics::COMPENSATION_COMPLETED);
    }

    #[test]
    fn compensation_reason_defaults_when_absent() {
        let json = serde_json::json!({
            "saga_id": SagaId::new(),
            "order_id": OrderId::new(),
            "user_id": UserId::new(),
            "amount": 500
        });
        let request: PointCompensationRequested = serde_json::from_value(json).unwrap();
        assert_eq!(request.reason, CompensationReason::StepFailed);
    }

    #[test]
    fn compensation_type_wire_format() {
        let json = serde_json::to_string(&CompensationType::Coupon).unwrap();
        assert_eq!(json, "\"COUPON\"");
    }
}
