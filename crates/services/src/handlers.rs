//! Consumer-side adapters from topics to service calls.

use std::sync::Arc;

use async_trait::async_trait;
use common::EventEnvelope;
use common::topics;
use messaging::{BrokerRecord, HandlerError, MessageHandler};

use crate::context::StepOutcome;
use crate::coupon::CouponService;
use crate::point::PointService;
use crate::product::ProductService;

/// A topic paired with the handler that consumes it.
pub type TopicHandler = (&'static str, Arc<dyn MessageHandler>);

fn entry(topic: &'static str, handler: impl MessageHandler + 'static) -> TopicHandler {
    let handler: Arc<dyn MessageHandler> = Arc::new(handler);
    (topic, handler)
}

/// Declares a handler that decodes `$command` and calls `$service::$method`.
///
/// An undecodable payload is permanent; rejections were already published
/// as failure events and count as handled.
macro_rules! step_handler {
    ($name:ident, $service:ty, $command:ty, $method:ident, $topic:expr) => {
        pub struct $name(pub Arc<$service>);

        #[async_trait]
        impl MessageHandler for $name {
            fn name(&self) -> &'static str {
                $topic
            }

            async fn handle(&self, envelope: EventEnvelope, record: &BrokerRecord) -> Result<(), HandlerError> {
                let command: $command = envelope
                    .decode()
                    .map_err(|e| HandlerError::Permanent(format!("undecodable {}: {e}", envelope.event_type)))?;
                let outcome = self.0.$method(command).await?;
                if outcome == StepOutcome::AlreadyApplied {
                    tracing::debug!(topic = %record.topic, offset = record.offset, "duplicate delivery skipped");
                }
                Ok(())
            }
        }
    };
}

step_handler!(
    StockDecreaseHandler,
    ProductService,
    common::events::StockDecreaseRequested,
    decrease_stock,
    topics::STOCK_DECREASE
);
step_handler!(
    StockConfirmHandler,
    ProductService,
    common::events::StockConfirmRequested,
    confirm_stock,
    topics::STOCK_CONFIRM
);
step_handler!(
    StockCompensationHandler,
    ProductService,
    common::events::StockCompensationRequested,
    compensate_stock,
    topics::STOCK_COMPENSATION_REQUEST
);
step_handler!(
    CouponUseHandler,
    CouponService,
    common::events::CouponUseRequested,
    use_coupons,
    topics::COUPON_USE
);
step_handler!(
    CouponCompensationHandler,
    CouponService,
    common::events::CouponCompensationRequested,
    compensate_coupon,
    topics::COUPON_COMPENSATION_REQUEST
);
step_handler!(
    PointUseHandler,
    PointService,
    common::events::PointUseRequested,
    use_points,
    topics::POINT_USE
);
step_handler!(
    PointCompensationHandler,
    PointService,
    common::events::PointCompensationRequested,
    compensate_points,
    topics::POINT_COMPENSATION_REQUEST
);

impl ProductService {
    /// Handlers for every topic the product service consumes.
    pub fn handlers(self: &Arc<Self>) -> Vec<TopicHandler> {
        vec![
            entry(topics::STOCK_DECREASE, StockDecreaseHandler(self.clone())),
            entry(topics::STOCK_CONFIRM, StockConfirmHandler(self.clone())),
            entry(topics::STOCK_COMPENSATION_REQUEST, StockCompensationHandler(self.clone())),
        ]
    }
}

impl CouponService {
    pub fn handlers(self: &Arc<Self>) -> Vec<TopicHandler> {
        vec![
            entry(topics::COUPON_USE, CouponUseHandler(self.clone())),
            entry(topics::COUPON_COMPENSATION_REQUEST, CouponCompensationHandler(self.clone())),
        ]
    }
}

impl PointService {
    pub fn handlers(self: &Arc<Self>) -> Vec<TopicHandler> {
        vec![
            entry(topics::POINT_USE, PointUseHandler(self.clone())),
            entry(topics::POINT_COMPENSATION_REQUEST, PointCompensationHandler(self.clone())),
        ]
    }
}
