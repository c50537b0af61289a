//! Order-fulfillment platform wiring.
//!
//! Builds the order, product, coupon and point services on one broker,
//! starts their consumers, outbox sweepers and schedulers, and stops them
//! together on shutdown. With a database URL the order tables and their
//! outbox are kept in PostgreSQL.

pub mod config;
pub mod error;

use std::sync::Arc;

use messaging::{ConsumerWorker, InMemoryBroker, MessageBroker, MessageRelay, PostgresOutboxStore};
use resource_lock::{InMemoryLockManager, InMemoryQuotaCounter, QuotaRestorePolicy};
use saga::{SagaCoordinator, TopicHandler};
use services::{CouponService, PointService, ProductService, ServiceContext};
use sqlx::postgres::PgPoolOptions;
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub use config::Config;
pub use error::{AppError, Result};

/// Every service of the platform plus its background tasks.
pub struct Platform {
    pub broker: InMemoryBroker,
    pub coordinator: Arc<SagaCoordinator>,
    pub product: Arc<ProductService>,
    pub coupons: Arc<CouponService>,
    pub points: Arc<PointService>,
    config: Config,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Platform {
    /// Constructs the services, all in memory, without starting anything.
    pub fn build(config: Config) -> Self {
        let broker = InMemoryBroker::with_retention(config.partitions, config.broker_retention);
        let coordinator = SagaCoordinator::new(Arc::new(broker.clone()), config.saga());
        Self::assemble(config, broker, coordinator)
    }

    /// Like [`build`](Self::build), with the order tables restored from and
    /// committed to PostgreSQL.
    pub async fn build_durable(config: Config, database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new().max_connections(5).connect(database_url).await?;
        let outbox = PostgresOutboxStore::new(pool);
        outbox.run_migrations().await?;

        let broker = InMemoryBroker::with_retention(config.partitions, config.broker_retention);
        let coordinator = SagaCoordinator::durable(outbox, Arc::new(broker.clone()), config.saga()).await?;
        tracing::info!("order tables backed by postgres");
        Ok(Self::assemble(config, broker, coordinator))
    }

    fn assemble(config: Config, broker: InMemoryBroker, coordinator: SagaCoordinator) -> Self {
        let shared: Arc<dyn MessageBroker> = Arc::new(broker.clone());
        let mut ctx = ServiceContext::new(shared, Arc::new(InMemoryLockManager::new()));
        ctx.lock_options = config.lock_options();
        ctx.relay = config.relay();

        let (shutdown, _) = watch::channel(false);
        Self {
            coordinator: Arc::new(coordinator),
            product: Arc::new(ProductService::new(&ctx)),
            coupons: Arc::new(CouponService::new(
                &ctx,
                Arc::new(InMemoryQuotaCounter::new()),
                QuotaRestorePolicy::default(),
            )),
            points: Arc::new(PointService::new(&ctx)),
            broker,
            config,
            shutdown,
            tasks: Vec::new(),
        }
    }

    /// Builds the platform and starts consumers, sweepers and schedulers.
    #[tracing::instrument(skip(config), fields(partitions = config.partitions))]
    pub async fn start(config: Config) -> Result<Self> {
        let mut platform = match config.database_url.clone() {
            Some(url) => Self::build_durable(config, &url).await?,
            None => Self::build(config),
        };

        let seeded = platform.coupons.warm_up_quota().await?;
        tracing::info!(policies = seeded, "coupon quotas seeded");

        platform.consume("order-service", platform.coordinator.handlers())?;
        platform.consume("product-service", platform.product.handlers())?;
        platform.consume("coupon-service", platform.coupons.handlers())?;
        platform.consume("point-service", platform.points.handlers())?;

        let relays = [
            platform.coordinator.relay().clone(),
            platform.product.relay().clone(),
            platform.coupons.relay().clone(),
            platform.points.relay().clone(),
        ];
        for relay in relays {
            platform.sweep(relay);
        }

        let schedulers = saga::spawn_schedulers(platform.coordinator.clone(), platform.shutdown.subscribe());
        platform.tasks.extend(schedulers);

        tracing::info!(tasks = platform.tasks.len(), "platform started");
        Ok(platform)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Signals every background task to stop and waits for them.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "background task ended abnormally");
            }
        }
        tracing::info!("platform stopped");
    }

    fn consume(&mut self, group: &str, handlers: Vec<TopicHandler>) -> Result<()> {
        for (topic, handler) in handlers {
            let subscription = self.broker.subscribe(topic, group)?;
            let workers = ConsumerWorker::spawn(
                subscription,
                handler,
                self.config.consumer_backoff(),
                Arc::new(self.broker.clone()),
                self.shutdown.subscribe(),
            );
            self.tasks.extend(workers);
        }
        Ok(())
    }

    fn sweep(&mut self, relay: Arc<MessageRelay>) {
        let shutdown = self.shutdown.subscribe();
        self.tasks.push(tokio::spawn(relay.run_sweeper(shutdown)));
    }
}
