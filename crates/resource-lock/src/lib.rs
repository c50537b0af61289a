//! Concurrency control for scarce shared resources.
//!
//! - [`DistributedLock`] / [`LockManager`]: named mutual exclusion with a
//!   bounded wait and a lease that auto-releases a crashed holder's lock.
//! - [`QuotaCounter`]: atomic decrement-and-read counters keyed by resource id.
//! - [`Backoff`]: bounded exponential backoff with an explicit attempt limit,
//!   run by `backon`.

pub mod backoff;
pub mod error;
pub mod lock;
pub mod memory;
pub mod quota;

pub use backoff::Backoff;
pub use error::{LockError, QuotaError};
pub use lock::{DistributedLock, LockGuard, LockManager, LockOptions, LockToken};
pub use memory::{InMemoryLock, InMemoryLockManager};
pub use quota::{InMemoryQuotaCounter, QuotaCounter, QuotaRestorePolicy};
