//! The order service's local database.

use std::collections::HashMap;
use std::sync::Arc;

use common::{OrderId, SagaId};
use domain::Order;
use messaging::{LocalDatabase, MessageBroker, MessageRelay, PostgresOutboxStore, RelayConfig, Transaction};
use resource_lock::Backoff;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SagaError};
use crate::registry::CompensationRegistry;
use crate::transaction::SagaTransaction;

/// Tables owned by the order service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrderTables {
    pub orders: HashMap<OrderId, Order>,
    pub sagas: HashMap<SagaId, SagaTransaction>,
    /// Unique index on `sagas.order_id`.
    pub saga_by_order: HashMap<OrderId, SagaId>,
    pub registry: CompensationRegistry,
}

/// Order tables plus the relay that drains their outbox.
#[derive(Clone)]
pub struct OrderStore {
    db: LocalDatabase<OrderTables>,
    relay: Arc<MessageRelay>,
    retry: Backoff,
}

impl OrderStore {
    /// `retry` bounds how often a saga update is retried after losing a
    /// version race.
    pub fn open(broker: Arc<dyn MessageBroker>, relay: RelayConfig, retry: Backoff) -> Self {
        Self::with_database(LocalDatabase::new("order", OrderTables::default()), broker, relay, retry)
    }

    /// Opens the tables persisted in PostgreSQL, restoring the last
    /// committed state. The relay then drains the PostgreSQL outbox.
    pub async fn open_durable(
        outbox: PostgresOutboxStore,
        broker: Arc<dyn MessageBroker>,
        relay: RelayConfig,
        retry: Backoff,
    ) -> Result<Self> {
        let db = LocalDatabase::durable("order", outbox, OrderTables::default()).await?;
        let restored = db.read(|t| t.sagas.len()).await;
        tracing::info!(sagas = restored, "order tables restored");
        Ok(Self::with_database(db, broker, relay, retry))
    }

    fn with_database(
        db: LocalDatabase<OrderTables>,
        broker: Arc<dyn MessageBroker>,
        relay: RelayConfig,
        retry: Backoff,
    ) -> Self {
        let relay = Arc::new(MessageRelay::new("order", Arc::new(db.clone()), broker, relay));
        Self { db, relay, retry }
    }

    pub fn database(&self) -> &LocalDatabase<OrderTables> {
        &self.db
    }

    pub fn relay(&self) -> &Arc<MessageRelay> {
        &self.relay
    }

    /// Runs one local transaction and relays its outbox rows after commit.
    pub async fn commit<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut Transaction<'_, OrderTables>) -> Result<R>,
    {
        let committed = self.db.transaction(f).await?;
        self.relay.relay_after_commit(committed.messages);
        Ok(committed.value)
    }

    pub async fn read<R>(&self, f: impl FnOnce(&OrderTables) -> R) -> R {
        self.db.read(f).await
    }

    pub async fn saga(&self, saga_id: SagaId) -> Option<SagaTransaction> {
        self.read(|t| t.sagas.get(&saga_id).cloned()).await
    }

    /// Applies `change` to the saga as last read, in one transaction that
    /// first checks the stored version is still the one read. On a version
    /// conflict the saga is re-read and `change` runs again.
    pub async fn update_saga<R, F>(&self, saga_id: SagaId, change: F) -> Result<R>
    where
        F: Fn(&mut SagaTransaction, &mut Transaction<'_, OrderTables>) -> Result<R>,
    {
        let change = &change;
        self.retry
            .retry(
                || async move {
                    let mut saga = self.saga(saga_id).await.ok_or(SagaError::SagaNotFound(saga_id))?;
                    let read = saga.clone();
                    self.commit(move |tx| {
                        tx.sagas
                            .get(&saga_id)
                            .ok_or(SagaError::SagaNotFound(saga_id))?
                            .check_version(read.version())?;
                        let value = change(&mut saga, tx)?;
                        if saga != read {
                            saga.touch();
                            tx.sagas.insert(saga_id, saga);
                        }
                        Ok(value)
                    })
                    .await
                },
                SagaError::is_conflict,
            )
            .await
    }
}
