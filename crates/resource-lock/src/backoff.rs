//! Bounded exponential backoff on top of `backon`.

use std::future::Future;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};

/// Exponential backoff with a hard attempt limit.
///
/// The first retry waits `initial`, each further one `multiplier` times
/// longer, capped at `max_delay`. After `max_attempts` calls in total the
/// last error is returned.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub initial: Duration,
    pub multiplier: f32,
    pub max_delay: Duration,
    pub max_attempts: usize,
}

impl Default for Backoff {
    /// 4 attempts, 1s base delay, doubling.
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            max_attempts: 4,
        }
    }
}

impl Backoff {
    pub fn new(initial: Duration, multiplier: f32, max_attempts: usize) -> Self {
        Self {
            initial,
            multiplier,
            max_attempts,
            ..Self::default()
        }
    }

    /// The equivalent `backon` builder. No jitter, so delays are exact.
    pub fn builder(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.initial)
            .with_factor(self.multiplier)
            .with_max_delay(self.max_delay)
            .with_max_times(self.max_attempts.saturating_sub(1))
    }

    /// Runs `op` until it succeeds, the error is not retryable, or the attempt
    /// limit is reached.
    pub async fn retry<T, E, F, Fut, R>(&self, op: F, is_retryable: R) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        R: FnMut(&E) -> bool,
    {
        op.retry(self.builder())
            .when(is_retryable)
            .notify(|_: &E, delay: Duration| {
                tracing::debug!(?delay, "attempt failed, backing off");
            })
            .await
    }
}
