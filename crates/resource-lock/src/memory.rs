//! In-memory lock backend.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::LockError;
use crate::lock::{DistributedLock, LockManager, LockOptions, LockToken};

#[derive(Debug)]
struct Holder {
    token: LockToken,
    expires_at: Instant,
}

/// A lease-based lock held in process memory.
///
/// Waiters park on a [`Notify`] and wake either when the holder unlocks, when
/// the holder's lease runs out, or when their own wait timeout elapses.
pub struct InMemoryLock {
    key: String,
    holder: Mutex<Option<Holder>>,
    released: Notify,
}

impl InMemoryLock {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            holder: Mutex::new(None),
            released: Notify::new(),
        }
    }

    fn poisoned(&self) -> LockError {
        LockError::Backend(format!("lock '{}' state poisoned", self.key))
    }
}

#[async_trait]
impl DistributedLock for InMemoryLock {
    fn key(&self) -> &str {
        &self.key
    }

    async fn try_lock(&self, options: LockOptions) -> Result<LockToken, LockError> {
        let started = Instant::now();
        let deadline = started + options.wait;

        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);

            let held_until = {
                let mut holder = self.holder.lock().map_err(|_| self.poisoned())?;
                let now = Instant::now();
                if let Some(current) = holder.as_ref()
                    && current.expires_at > now
                {
                    // Register interest before dropping the state lock so an
                    // unlock in between is not missed.
                    notified.as_mut().enable();
                    current.expires_at
                } else {
                    if holder.is_some() {
                        tracing::warn!(key = %self.key, "lock lease expired, taking over");
                        metrics::counter!("lock_lease_expired_total").increment(1);
                    }
                    let token = LockToken::new();
                    *holder = Some(Holder {
                        token,
                        expires_at: now + options.lease,
                    });
                    return Ok(token);
                }
            };

            if Instant::now() >= deadline {
                metrics::counter!("lock_timeouts_total").increment(1);
                tracing::debug!(key = %self.key, "lock wait timed out");
                return Err(LockError::Timeout {
                    key: self.key.clone(),
                    waited: started.elapsed(),
                });
            }

            let _ = tokio::time::timeout_at(held_until.min(deadline), notified).await;
        }
    }

    async fn unlock(&self, token: LockToken) -> Result<(), LockError> {
        let mut holder = self.holder.lock().map_err(|_| self.poisoned())?;
        match holder.as_ref() {
            Some(current) if current.token == token => {
                *holder = None;
                drop(holder);
                self.released.notify_waiters();
                Ok(())
            }
            _ => Err(LockError::NotHeld {
                key: self.key.clone(),
            }),
        }
    }

    async fn is_locked(&self) -> bool {
        match self.holder.lock() {
            Ok(holder) => holder
                .as_ref()
                .is_some_and(|current| current.expires_at > Instant::now()),
            Err(_) => true,
        }
    }
}

/// Lock manager that lazily creates one [`InMemoryLock`] per key.
#[derive(Default)]
pub struct InMemoryLockManager {
    locks: Mutex<HashMap<String, Arc<InMemoryLock>>>,
}

impl InMemoryLockManager {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LockManager for InMemoryLockManager {
    fn get_lock(&self, key: &str) -> Result<Arc<dyn DistributedLock>, LockError> {
        let mut locks = self
            .locks
            .lock()
            .map_err(|_| LockError::Backend("lock manager map poisoned".into()))?;
        let lock = locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(InMemoryLock::new(key)))
            .clone();
        Ok(lock)
    }
}
