//! Background tasks of the order service.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::coordinator::SagaCoordinator;

/// Spawns the compensation retry loop and the order expiration loop on
/// their configured schedules. Both stop when `shutdown` flips to true.
pub fn spawn_schedulers(coordinator: Arc<SagaCoordinator>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
    let config = *coordinator.config();

    let retry = {
        let coordinator = coordinator.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(config.compensation_retry.run("compensation-retry", shutdown, move || {
            let coordinator = coordinator.clone();
            async move {
                if let Err(e) = coordinator.retry_compensations().await {
                    tracing::warn!(error = %e, "compensation retry run failed");
                }
            }
        }))
    };

    let expiration = tokio::spawn(config.expiration.run("order-expiration", shutdown, move || {
        let coordinator = coordinator.clone();
        async move {
            if let Err(e) = coordinator.expire_orders(Utc::now()).await {
                tracing::warn!(error = %e, "order expiration run failed");
            }
        }
    }));

    vec![retry, expiration]
}
