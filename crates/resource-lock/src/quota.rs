//! Atomic quota counters.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use crate::error::QuotaError;

/// Atomic integer counters keyed by resource id (e.g. remaining coupons of a
/// policy).
///
/// Counters are seeded from the authoritative store with [`initialize`] and
/// afterwards only mutated through single atomic read-modify-write calls.
///
/// [`initialize`]: QuotaCounter::initialize
#[async_trait]
pub trait QuotaCounter: Send + Sync {
    /// Sets the counter to `value`, creating it if needed.
    async fn initialize(&self, key: &str, value: i64) -> Result<(), QuotaError>;

    /// Atomically decrements and returns the new value.
    ///
    /// A negative result means the quota is oversubscribed and the caller
    /// must abandon its attempt.
    async fn decrement_and_get(&self, key: &str) -> Result<i64, QuotaError>;

    /// Atomically increments and returns the new value.
    async fn increment_and_get(&self, key: &str) -> Result<i64, QuotaError>;

    /// Reads the current value, if the counter exists.
    async fn get(&self, key: &str) -> Result<Option<i64>, QuotaError>;
}

/// What to do with a unit that was decremented by an attempt that then
/// failed (oversubscription, duplicate issue, expired window, ...).
///
/// `Keep` (the default) never gives the unit back: the counter may end up
/// lower than the real remaining quantity, which can only under-issue, never
/// over-issue. `Restore` increments the counter again, keeping it exact at the
/// cost of a second round trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QuotaRestorePolicy {
    #[default]
    Keep,
    Restore,
}

impl QuotaRestorePolicy {
    /// Applies the policy after a failed attempt that already decremented `key`.
    pub async fn settle_failed_attempt(
        &self,
        counter: &dyn QuotaCounter,
        key: &str,
    ) -> Result<(), QuotaError> {
        match self {
            QuotaRestorePolicy::Keep => Ok(()),
            QuotaRestorePolicy::Restore => {
                counter.increment_and_get(key).await?;
                Ok(())
            }
        }
    }
}

/// Process-local counters backed by [`AtomicI64`].
#[derive(Debug, Clone, Default)]
pub struct InMemoryQuotaCounter {
    counters: Arc<RwLock<HashMap<String, Arc<AtomicI64>>>>,
}

impl InMemoryQuotaCounter {
    pub fn new() -> Self {
        Self::default()
    }

    fn counter(&self, key: &str) -> Result<Arc<AtomicI64>, QuotaError> {
        let counters = self
            .counters
            .read()
            .map_err(|_| QuotaError::Backend("quota map poisoned".into()))?;
        counters
            .get(key)
            .cloned()
            .ok_or_else(|| QuotaError::NotInitialized(key.to_string()))
    }
}

#[async_trait]
impl QuotaCounter for InMemoryQuotaCounter {
    async fn initialize(&self, key: &str, value: i64) -> Result<(), QuotaError> {
        let mut counters = self
            .counters
            .write()
            .map_err(|_| QuotaError::Backend("quota map poisoned".into()))?;
        counters
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(AtomicI64::new(0)))
            .store(value, Ordering::SeqCst);
        Ok(())
    }

    async fn decrement_and_get(&self, key: &str) -> Result<i64, QuotaError> {
        Ok(self.counter(key)?.fetch_sub(1, Ordering::SeqCst) - 1)
    }

    async fn increment_and_get(&self, key: &str) -> Result<i64, QuotaError> {
        Ok(self.counter(key)?.fetch_add(1, Ordering::SeqCst) + 1)
    }

    async fn get(&self, key: &str) -> Result<Option<i64>, QuotaError> {
        match self.counter(key) {
            Ok(counter) => Ok(Some(counter.load(Ordering::SeqCst))),
            Err(QuotaError::NotInitialized(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}
