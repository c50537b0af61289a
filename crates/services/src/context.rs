//! Plumbing shared by every service: local store, relay and locks.

use std::sync::Arc;
use std::time::Duration;

use common::events::IntegrationEvent;
use messaging::{InMemoryBroker, LocalDatabase, MessageBroker, MessageRelay, RelayConfig, Transaction};
use resource_lock::{Backoff, InMemoryLockManager, LockError, LockGuard, LockManager, LockOptions};

use crate::error::Result;

/// Dependencies a service is built from.
#[derive(Clone)]
pub struct ServiceContext {
    pub broker: Arc<dyn MessageBroker>,
    pub locks: Arc<dyn LockManager>,
    pub lock_options: LockOptions,
    pub relay: RelayConfig,
    /// Retry policy for optimistic version conflicts.
    pub optimistic_retry: Backoff,
}

impl ServiceContext {
    pub fn new(broker: Arc<dyn MessageBroker>, locks: Arc<dyn LockManager>) -> Self {
        Self {
            broker,
            locks,
            lock_options: LockOptions::default(),
            relay: RelayConfig::default(),
            optimistic_retry: Backoff::new(Duration::from_millis(10), 2.0, 5),
        }
    }

    /// Context on an in-memory broker with in-memory locks.
    pub fn in_memory(broker: &InMemoryBroker) -> Self {
        Self::new(Arc::new(broker.clone()), Arc::new(InMemoryLockManager::new()))
    }
}

/// Outcome of a step or compensation command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// The mutation was applied and the success event published.
    Applied,
    /// A business rule rejected the command; a failure event was published.
    Rejected(String),
    /// The history already holds this step; nothing was changed.
    AlreadyApplied,
}

/// A service's local database paired with the relay draining its outbox.
pub struct ServiceStore<S> {
    db: LocalDatabase<S>,
    relay: Arc<MessageRelay>,
}

impl<S: Clone + Send + Sync + 'static> ServiceStore<S> {
    pub fn open(name: &'static str, state: S, ctx: &ServiceContext) -> Self {
        let db = LocalDatabase::new(name, state);
        let relay = Arc::new(MessageRelay::new(
            name,
            Arc::new(db.clone()),
            ctx.broker.clone(),
            ctx.relay,
        ));
        Self { db, relay }
    }

    pub fn database(&self) -> &LocalDatabase<S> {
        &self.db
    }

    pub fn relay(&self) -> &Arc<MessageRelay> {
        &self.relay
    }

    /// Runs one local transaction and relays its outbox rows after commit.
    pub async fn commit<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut Transaction<'_, S>) -> Result<R>,
    {
        let committed = self.db.transaction(f).await?;
        self.relay.relay_after_commit(committed.messages);
        Ok(committed.value)
    }

    /// Publishes a single event in its own transaction.
    pub async fn publish<E: IntegrationEvent>(&self, event: &E) -> Result<()> {
        self.commit(|tx| {
            tx.publish(event)?;
            Ok(())
        })
        .await
    }

    pub async fn read<R>(&self, f: impl FnOnce(&S) -> R) -> R {
        self.db.read(f).await
    }

    /// Settles a step: a business rejection publishes `failure(reason)` and
    /// becomes [`StepOutcome::Rejected`]; infrastructure errors pass through
    /// so the consumer retries.
    pub async fn finish_step<E, F>(&self, step: &'static str, result: Result<StepOutcome>, failure: F) -> Result<StepOutcome>
    where
        E: IntegrationEvent,
        F: FnOnce(String) -> E,
    {
        match result {
            Ok(outcome) => {
                let label = match outcome {
                    StepOutcome::AlreadyApplied => "duplicate",
                    _ => "applied",
                };
                metrics::counter!("step_commands_total", "step" => step, "result" => label).increment(1);
                Ok(outcome)
            }
            Err(e) if e.is_business() => {
                let reason = e.to_string();
                tracing::info!(step, %reason, "step rejected");
                metrics::counter!("step_commands_total", "step" => step, "result" => "rejected").increment(1);
                self.publish(&failure(reason.clone())).await?;
                Ok(StepOutcome::Rejected(reason))
            }
            Err(e) => {
                tracing::warn!(step, error = %e, "step failed, will be retried");
                Err(e)
            }
        }
    }
}

/// Acquires every lock in `keys`, in sorted order so that two callers
/// locking overlapping sets cannot deadlock. On failure the locks already
/// taken are released.
pub async fn acquire_all(
    manager: &dyn LockManager,
    mut keys: Vec<String>,
    options: LockOptions,
) -> std::result::Result<Vec<LockGuard>, LockError> {
    keys.sort();
    keys.dedup();

    let mut guards = Vec::with_capacity(keys.len());
    for key in &keys {
        match LockGuard::acquire(manager, key, options).await {
            Ok(guard) => guards.push(guard),
            Err(e) => {
                release_all(guards).await;
                return Err(e);
            }
        }
    }
    Ok(guards)
}

/// Releases guards, logging (not failing on) locks whose lease already lapsed.
pub async fn release_all(guards: Vec<LockGuard>) {
    for guard in guards.into_iter().rev() {
        let key = guard.key().to_string();
        if let Err(e) = guard.release().await {
            tracing::warn!(lock = %key, error = %e, "lock release failed");
        }
    }
}
