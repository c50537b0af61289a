//! Consumers of step results and compensation reports.

use std::sync::Arc;

use async_trait::async_trait;
use common::EventEnvelope;
use common::events::{
    CompensationCompleted, CouponApplied, CouponApplyFailed, PointUseFailed, PointUsed, StockDecreaseFailed,
    StockDecreased,
};
use common::topics;
use messaging::{BrokerRecord, HandlerError, MessageHandler};

use crate::coordinator::SagaCoordinator;
use crate::state::SagaStep;

/// A topic paired with the handler that consumes it.
pub type TopicHandler = (&'static str, Arc<dyn MessageHandler>);

fn entry(topic: &'static str, handler: impl MessageHandler + 'static) -> TopicHandler {
    let handler: Arc<dyn MessageHandler> = Arc::new(handler);
    (topic, handler)
}

/// Declares a handler that decodes `$event` and feeds it to the coordinator.
macro_rules! result_handler {
    ($name:ident, $event:ty, $topic:expr, |$coordinator:ident, $decoded:ident| $body:expr) => {
        pub struct $name(pub Arc<SagaCoordinator>);

        #[async_trait]
        impl MessageHandler for $name {
            fn name(&self) -> &'static str {
                $topic
            }

            async fn handle(&self, envelope: EventEnvelope, _record: &BrokerRecord) -> Result<(), HandlerError> {
                let $decoded: $event = envelope
                    .decode()
                    .map_err(|e| HandlerError::Permanent(format!("undecodable {}: {e}", envelope.event_type)))?;
                let $coordinator = &self.0;
                $body.await?;
                Ok(())
            }
        }
    };
}

result_handler!(StockDecreasedHandler, StockDecreased, topics::STOCK_DECREASED, |c, event| {
    c.on_step_succeeded(event.saga_id, SagaStep::Stock)
});
result_handler!(
    StockDecreaseFailedHandler,
    StockDecreaseFailed,
    topics::STOCK_DECREASE_FAILED,
    |c, event| c.on_step_failed(event.saga_id, SagaStep::Stock, event.reason)
);
result_handler!(CouponAppliedHandler, CouponApplied, topics::COUPON_APPLIED, |c, event| {
    c.on_step_succeeded(event.saga_id, SagaStep::Coupon)
});
result_handler!(
    CouponApplyFailedHandler,
    CouponApplyFailed,
    topics::COUPON_APPLY_FAILED,
    |c, event| c.on_step_failed(event.saga_id, SagaStep::Coupon, event.reason)
);
result_handler!(PointUsedHandler, PointUsed, topics::POINT_USED, |c, event| {
    c.on_step_succeeded(event.saga_id, SagaStep::Point)
});
result_handler!(PointUseFailedHandler, PointUseFailed, topics::POINT_USE_FAILED, |c, event| {
    c.on_step_failed(event.saga_id, SagaStep::Point, event.reason)
});
result_handler!(
    CompensationCompletedHandler,
    CompensationCompleted,
    topics::COMPENSATION_COMPLETED,
    |c, event| c.on_compensation_completed(event)
);

impl SagaCoordinator {
    /// Handlers for every topic the order service consumes.
    pub fn handlers(self: &Arc<Self>) -> Vec<TopicHandler> {
        vec![
            entry(topics::STOCK_DECREASED, StockDecreasedHandler(self.clone())),
            entry(topics::STOCK_DECREASE_FAILED, StockDecreaseFailedHandler(self.clone())),
            entry(topics::COUPON_APPLIED, CouponAppliedHandler(self.clone())),
            entry(topics::COUPON_APPLY_FAILED, CouponApplyFailedHandler(self.clone())),
            entry(topics::POINT_USED, PointUsedHandler(self.clone())),
            entry(topics::POINT_USE_FAILED, PointUseFailedHandler(self.clone())),
            entry(topics::COMPENSATION_COMPLETED, CompensationCompletedHandler(self.clone())),
        ]
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use common::events::OrderLine;
    use common::{SagaId, StockKey, UserId};
    use messaging::InMemoryBroker;

    use super::*;
    use crate::coordinator::{PlaceOrder, SagaConfig};
    use crate::state::SagaStatus;

    fn coordinator() -> Arc<SagaCoordinator> {
        Arc::new(SagaCoordinator::new(Arc::new(InMemoryBroker::new(1)), SagaConfig::default()))
    }

    fn record(topic: &str, envelope: &EventEnvelope) -> BrokerRecord {
        BrokerRecord {
            topic: topic.into(),
            partition: 0,
            offset: 0,
            key: "k".into(),
            payload: envelope.to_json().unwrap(),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_results_advance_the_saga() {
        let coordinator = coordinator();
        let order_id = coordinator
            .place_order(PlaceOrder {
                user_id: UserId::new(),
                items: vec![OrderLine::new(StockKey::new("SKU", 1), 1)],
                coupon_ids: vec![],
                point_amount: 0,
            })
            .await
            .unwrap();
        let saga_id = coordinator.find_by_order(order_id).await.unwrap().saga_id();

        let envelope = EventEnvelope::wrap(&StockDecreased { saga_id, order_id }).unwrap();
        let handler = StockDecreasedHandler(coordinator.clone());
        handler
            .handle(envelope.clone(), &record(topics::STOCK_DECREASED, &envelope))
            .await
            .unwrap();
        // Redelivery is harmless.
        handler
            .handle(envelope.clone(), &record(topics::STOCK_DECREASED, &envelope))
            .await
            .unwrap();

        assert_eq!(coordinator.get_saga(saga_id).await.unwrap().status(), SagaStatus::Completed);
    }

    #[tokio::test]
    async fn test_unknown_saga_is_permanent() {
        let coordinator = coordinator();
        let envelope = EventEnvelope::wrap(&StockDecreased {
            saga_id: SagaId::new(),
            order_id: common::OrderId::new(),
        })
        .unwrap();

        let err = StockDecreasedHandler(coordinator)
            .handle(envelope.clone(), &record(topics::STOCK_DECREASED, &envelope))
            .await
            .unwrap_err();
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_every_result_topic_has_a_handler() {
        let topics: Vec<_> = coordinator()
            .handlers()
            .into_iter()
            .map(|(topic, handler)| {
                assert_eq!(topic, handler.name());
                topic
            })
            .collect();
        assert_eq!(topics.len(), 7);
        assert!(topics.contains(&topics::COMPENSATION_COMPLETED));
    }
}
