//! Lock traits shared by every lock backend.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::LockError;

/// How long to wait for a lock and how long to hold it at most.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockOptions {
    /// Maximum time `try_lock` blocks before failing with `Timeout`.
    pub wait: Duration,
    /// Lease after which the lock is released even if the holder never unlocks.
    pub lease: Duration,
}

impl LockOptions {
    pub fn new(wait: Duration, lease: Duration) -> Self {
        Self { wait, lease }
    }
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            wait: Duration::from_secs(3),
            lease: Duration::from_secs(5),
        }
    }
}

/// Fencing token handed out on every successful acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockToken(Uuid);

impl LockToken {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

/// A single named lock.
///
/// The in-memory implementation lives in [`crate::memory`]; a Redis or
/// Postgres advisory-lock backend implements the same contract.
#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// The resource key this lock guards.
    fn key(&self) -> &str;

    /// Acquires the lock, blocking at most `options.wait`.
    async fn try_lock(&self, options: LockOptions) -> Result<LockToken, LockError>;

    /// Releases the lock if `token` still holds it.
    async fn unlock(&self, token: LockToken) -> Result<(), LockError>;

    /// Returns true if some holder currently owns an unexpired lease.
    async fn is_locked(&self) -> bool;
}

/// Hands out named locks.
pub trait LockManager: Send + Sync {
    /// Returns the lock for `key`; repeated calls return the same lock.
    fn get_lock(&self, key: &str) -> Result<Arc<dyn DistributedLock>, LockError>;
}

/// An acquired lock. Call [`LockGuard::release`] when done; a guard that is
/// dropped instead is released by lease expiry.
pub struct LockGuard {
    lock: Arc<dyn DistributedLock>,
    token: LockToken,
}

impl LockGuard {
    /// Looks up `key` on `manager` and acquires it.
    pub async fn acquire(
        manager: &dyn LockManager,
        key: &str,
        options: LockOptions,
    ) -> Result<Self, LockError> {
        let lock = manager.get_lock(key)?;
        let token = lock.try_lock(options).await?;
        Ok(Self { lock, token })
    }

    pub fn key(&self) -> &str {
        self.lock.key()
    }

    /// Releases the lock.
    pub async fn release(self) -> Result<(), LockError> {
        self.lock.unlock(self.token).await
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("key", &self.lock.key())
            .field("token", &self.token)
            .finish()
    }
}
