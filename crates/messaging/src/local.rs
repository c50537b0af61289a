//! In-memory service database with an embedded outbox table.

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::events::IntegrationEvent;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::outbox::{OutboxMessage, OutboxStore};
use crate::postgres::PostgresOutboxStore;
use crate::{MessagingError, Result};

type Snapshot<S> = Arc<dyn Fn(&S) -> serde_json::Result<serde_json::Value> + Send + Sync>;

/// PostgreSQL mirror of a [`LocalDatabase`]: every commit writes a snapshot
/// of the tables and the commit's outbox rows in one `sqlx` transaction.
struct Durable<S> {
    store: PostgresOutboxStore,
    snapshot: Snapshot<S>,
}

impl<S> Clone for Durable<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            snapshot: self.snapshot.clone(),
        }
    }
}

struct Tables<S> {
    state: S,
    outbox: HashMap<Uuid, OutboxMessage>,
}

/// A service-local database: business tables of type `S` plus an outbox
/// table, committed together.
///
/// [`transaction`](LocalDatabase::transaction) runs a closure against a
/// working copy of the tables. If the closure returns `Ok`, the copy and every
/// message it published become visible in one step; if it returns `Err`,
/// nothing does.
///
/// A database opened with [`durable`](LocalDatabase::durable) keeps its
/// outbox in PostgreSQL instead and persists each commit there before it
/// becomes visible in memory.
pub struct LocalDatabase<S> {
    name: &'static str,
    inner: Arc<Mutex<Tables<S>>>,
    injected_failures: Arc<AtomicUsize>,
    durable: Option<Durable<S>>,
}

impl<S> Clone for LocalDatabase<S> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            inner: self.inner.clone(),
            injected_failures: self.injected_failures.clone(),
            durable: self.durable.clone(),
        }
    }
}

/// The result of a committed transaction.
#[derive(Debug)]
pub struct Committed<R> {
    /// What the transaction closure returned.
    pub value: R,
    /// Outbox rows written by the transaction, ready to be relayed.
    pub messages: Vec<OutboxMessage>,
}

/// Working view handed to a transaction closure.
///
/// Dereferences to the business tables; outgoing events are staged with
/// [`publish`](Transaction::publish).
pub struct Transaction<'a, S> {
    state: &'a mut S,
    staged: Vec<OutboxMessage>,
}

impl<S> Transaction<'_, S> {
    /// Stages an event in the outbox of this transaction.
    pub fn publish<E: IntegrationEvent>(&mut self, event: &E) -> Result<Uuid> {
        let message = OutboxMessage::from_event(event)?;
        let id = message.id;
        self.staged.push(message);
        Ok(id)
    }
}

impl<S> Deref for Transaction<'_, S> {
    type Target = S;

    fn deref(&self) -> &S {
        self.state
    }
}

impl<S> DerefMut for Transaction<'_, S> {
    fn deref_mut(&mut self) -> &mut S {
        self.state
    }
}

impl<S: Clone + Send + 'static> LocalDatabase<S> {
    /// Creates a database named `name` holding `state`.
    pub fn new(name: &'static str, state: S) -> Self {
        Self {
            name,
            inner: Arc::new(Mutex::new(Tables {
                state,
                outbox: HashMap::new(),
            })),
            injected_failures: Arc::new(AtomicUsize::new(0)),
            durable: None,
        }
    }

    pub fn is_durable(&self) -> bool {
        self.durable.is_some()
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Runs `f` as one local transaction.
    pub async fn transaction<R, E, F>(&self, f: F) -> std::result::Result<Committed<R>, E>
    where
        F: FnOnce(&mut Transaction<'_, S>) -> std::result::Result<R, E>,
        E: From<MessagingError>,
    {
        let mut tables = self.inner.lock().await;
        let mut working = tables.state.clone();

        let mut tx = Transaction {
            state: &mut working,
            staged: Vec::new(),
        };
        let value = f(&mut tx)?;
        let Transaction { staged, .. } = tx;

        if self.take_injected_failure() {
            metrics::counter!("local_db_commit_failures_total", "db" => self.name).increment(1);
            return Err(MessagingError::Storage(format!("{}: commit failed", self.name)).into());
        }

        if let Some(durable) = &self.durable {
            let snapshot = (durable.snapshot)(&working).map_err(MessagingError::from)?;
            if let Err(e) = durable.store.commit_snapshot(self.name, &snapshot, &staged).await {
                metrics::counter!("local_db_commit_failures_total", "db" => self.name).increment(1);
                return Err(e.into());
            }
        } else {
            for message in &staged {
                tables.outbox.insert(message.id, message.clone());
            }
        }
        tables.state = working;
        Ok(Committed {
            value,
            messages: staged,
        })
    }

    /// Reads the committed tables.
    pub async fn read<R>(&self, f: impl FnOnce(&S) -> R) -> R {
        let tables = self.inner.lock().await;
        f(&tables.state)
    }

    /// Makes the next `count` commits fail with a storage error.
    ///
    /// Used to exercise rollback paths.
    pub fn fail_next_commits(&self, count: usize) {
        self.injected_failures.store(count, Ordering::SeqCst);
    }

    fn take_injected_failure(&self) -> bool {
        self.injected_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl<S> LocalDatabase<S>
where
    S: Clone + Send + Serialize + DeserializeOwned + 'static,
{
    /// Opens the database `name` backed by PostgreSQL, starting from its
    /// last committed snapshot or from `initial` when there is none.
    pub async fn durable(name: &'static str, store: PostgresOutboxStore, initial: S) -> Result<Self> {
        let state = match store.load_snapshot(name).await? {
            Some(snapshot) => serde_json::from_value(snapshot)?,
            None => initial,
        };
        tracing::info!(db = name, "opened postgres-backed database");

        let mut db = Self::new(name, state);
        db.durable = Some(Durable {
            store,
            snapshot: Arc::new(|state: &S| serde_json::to_value(state)),
        });
        Ok(db)
    }
}

#[async_trait]
impl<S: Clone + Send + 'static> OutboxStore for LocalDatabase<S> {
    async fn pending_older_than(&self, cutoff: DateTime<Utc>) -> Result<Vec<OutboxMessage>> {
        if let Some(durable) = &self.durable {
            return durable.store.pending_older_than(cutoff).await;
        }
        let tables = self.inner.lock().await;
        let mut pending: Vec<_> = tables
            .outbox
            .values()
            .filter(|m| m.created_at <= cutoff)
            .cloned()
            .collect();
        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(pending)
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        if let Some(durable) = &self.durable {
            return durable.store.delete(id).await;
        }
        Ok(self.inner.lock().await.outbox.remove(&id).is_some())
    }

    async fn get(&self, id: Uuid) -> Result<Option<OutboxMessage>> {
        if let Some(durable) = &self.durable {
            return durable.store.get(id).await;
        }
        Ok(self.inner.lock().await.outbox.get(&id).cloned())
    }

    async fn pending_count(&self) -> Result<usize> {
        if let Some(durable) = &self.durable {
            return durable.store.pending_count().await;
        }
        Ok(self.inner.lock().await.outbox.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::events::StockDecreased;
    use common::{OrderId, SagaId};

    #[derive(Debug, Clone, Default)]
    struct Counter {
        value: i64,
    }

    fn event() -> StockDecreased {
        StockDecreased {
            saga_id: SagaId::new(),
            order_id: OrderId::new(),
        }
    }

    #[tokio::test]
    async fn commit_applies_state_and_outbox_together() {
        let db = LocalDatabase::new("test", Counter::default());

        let committed = db
            .transaction(|tx| {
                tx.value += 1;
                tx.publish(&event())?;
                Ok::<_, MessagingError>(tx.value)
            })
            .await
            .unwrap();

        assert_eq!(committed.value, 1);
        assert_eq!(committed.messages.len(), 1);
        assert_eq!(db.read(|s| s.value).await, 1);
        assert_eq!(db.pending_count().await.unwrap(), 1);
        assert!(db.get(committed.messages[0].id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn closure_error_rolls_back_everything() {
        let db = LocalDatabase::new("test", Counter::default());

        let result = db
            .transaction(|tx| {
                tx.value += 1;
                tx.publish(&event())?;
                Err::<(), _>(MessagingError::Storage("business rule".into()))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(db.read(|s| s.value).await, 0);
        assert_eq!(db.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn injected_commit_failure_rolls_back() {
        let db = LocalDatabase::new("test", Counter::default());
        db.fail_next_commits(1);

        let first = db
            .transaction(|tx| {
                tx.value += 1;
                tx.publish(&event())?;
                Ok::<_, MessagingError>(())
            })
            .await;
        assert!(matches!(first, Err(MessagingError::Storage(_))));
        assert_eq!(db.pending_count().await.unwrap(), 0);

        db.transaction(|tx| {
            tx.value += 1;
            Ok::<_, MessagingError>(())
        })
        .await
        .unwrap();
        assert_eq!(db.read(|s| s.value).await, 1);
    }

    #[tokio::test]
    async fn pending_rows_are_returned_oldest_first() {
        let db = LocalDatabase::new("test", Counter::default());
        for _ in 0..3 {
            db.transaction(|tx| {
                tx.publish(&event())?;
                Ok::<_, MessagingError>(())
            })
            .await
            .unwrap();
        }

        let pending = db.pending_older_than(Utc::now()).await.unwrap();
        assert_eq!(pending.len(), 3);
        assert!(pending.windows(2).all(|w| w[0].created_at <= w[1].created_at));

        let none = db
            .pending_older_than(Utc::now() - chrono::Duration::seconds(60))
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let db = LocalDatabase::new("test", Counter::default());
        let committed = db
            .transaction(|tx| {
                tx.publish(&event())?;
                Ok::<_, MessagingError>(())
            })
            .await
            .unwrap();
        let id = committed.messages[0].id;

        assert!(db.delete(id).await.unwrap());
        assert!(!db.delete(id).await.unwrap());
    }
}
