//! Platform configuration loaded from environment variables.

use std::time::Duration;

use messaging::broker::DEFAULT_RETENTION;
use messaging::{FixedSchedule, RelayConfig};
use resource_lock::{Backoff, LockOptions};
use saga::SagaConfig;

/// Runtime configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `OUTBOX_SWEEP_INTERVAL_SECS` (default: `10`)
/// - `OUTBOX_SWEEP_INITIAL_DELAY_SECS` (default: `5`)
/// - `OUTBOX_GRACE_PERIOD_SECS` (default: `10`)
/// - `BROKER_SEND_TIMEOUT_MS` (default: `1000`)
/// - `BROKER_PARTITIONS` (default: `8`)
/// - `BROKER_RETENTION_RECORDS` (default: `10000`, per topic)
/// - `COMPENSATION_RETRY_INTERVAL_SECS` (default: `60`)
/// - `COMPENSATION_RETRY_INITIAL_DELAY_SECS` (default: `10`)
/// - `ORDER_EXPIRATION_INTERVAL_SECS` (default: `60`)
/// - `ORDER_TIMEOUT_SECS` (default: `1800`)
/// - `LOCK_WAIT_MS` (default: `3000`)
/// - `LOCK_LEASE_MS` (default: `5000`)
/// - `CONSUMER_MAX_ATTEMPTS` (default: `4`)
/// - `CONSUMER_BACKOFF_MS` (default: `1000`)
/// - `METRICS_PORT` (default: `9000`)
/// - `DATABASE_URL` (optional; keeps the order tables and their outbox in PostgreSQL)
///
/// Unparseable values fall back to the default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub sweep_interval: Duration,
    pub sweep_initial_delay: Duration,
    pub grace_period: Duration,
    pub send_timeout: Duration,
    pub partitions: u32,
    pub broker_retention: usize,
    pub compensation_retry_interval: Duration,
    pub compensation_retry_initial_delay: Duration,
    pub expiration_interval: Duration,
    pub order_timeout: Duration,
    pub lock_wait: Duration,
    pub lock_lease: Duration,
    pub consumer_max_attempts: usize,
    pub consumer_backoff: Duration,
    pub metrics_port: u16,
    pub database_url: Option<String>,
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration from any key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let number = |key: &str, default: u64| -> u64 {
            lookup(key).and_then(|v| v.trim().parse().ok()).unwrap_or(default)
        };
        let secs = |key: &str, default: Duration| Duration::from_secs(number(key, default.as_secs()));
        let millis = |key: &str, default: Duration| {
            let default = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
            Duration::from_millis(number(key, default))
        };

        Self {
            sweep_interval: secs("OUTBOX_SWEEP_INTERVAL_SECS", defaults.sweep_interval),
            sweep_initial_delay: secs("OUTBOX_SWEEP_INITIAL_DELAY_SECS", defaults.sweep_initial_delay),
            grace_period: secs("OUTBOX_GRACE_PERIOD_SECS", defaults.grace_period),
            send_timeout: millis("BROKER_SEND_TIMEOUT_MS", defaults.send_timeout),
            partitions: u32::try_from(number("BROKER_PARTITIONS", u64::from(defaults.partitions)))
                .unwrap_or(defaults.partitions)
                .max(1),
            broker_retention: usize::try_from(number(
                "BROKER_RETENTION_RECORDS",
                u64::try_from(defaults.broker_retention).unwrap_or(u64::MAX),
            ))
            .unwrap_or(defaults.broker_retention)
            .max(1),
            compensation_retry_interval: secs("COMPENSATION_RETRY_INTERVAL_SECS", defaults.compensation_retry_interval),
            compensation_retry_initial_delay: secs(
                "COMPENSATION_RETRY_INITIAL_DELAY_SECS",
                defaults.compensation_retry_initial_delay,
            ),
            expiration_interval: secs("ORDER_EXPIRATION_INTERVAL_SECS", defaults.expiration_interval),
            order_timeout: secs("ORDER_TIMEOUT_SECS", defaults.order_timeout),
            lock_wait: millis("LOCK_WAIT_MS", defaults.lock_wait),
            lock_lease: millis("LOCK_LEASE_MS", defaults.lock_lease),
            consumer_max_attempts: usize::try_from(number(
                "CONSUMER_MAX_ATTEMPTS",
                u64::try_from(defaults.consumer_max_attempts).unwrap_or(u64::MAX),
            ))
            .unwrap_or(defaults.consumer_max_attempts)
            .max(1),
            consumer_backoff: millis("CONSUMER_BACKOFF_MS", defaults.consumer_backoff),
            metrics_port: u16::try_from(number("METRICS_PORT", u64::from(defaults.metrics_port)))
                .unwrap_or(defaults.metrics_port),
            database_url: lookup("DATABASE_URL").filter(|url| !url.trim().is_empty()),
        }
    }

    pub fn relay(&self) -> RelayConfig {
        RelayConfig {
            send_timeout: self.send_timeout,
            grace_period: self.grace_period,
            sweep: FixedSchedule::new(self.sweep_initial_delay, self.sweep_interval),
        }
    }

    pub fn lock_options(&self) -> LockOptions {
        LockOptions::new(self.lock_wait, self.lock_lease)
    }

    /// In-place retry policy of every consumer.
    pub fn consumer_backoff(&self) -> Backoff {
        Backoff::new(self.consumer_backoff, 2.0, self.consumer_max_attempts)
    }

    pub fn saga(&self) -> SagaConfig {
        SagaConfig {
            relay: self.relay(),
            order_timeout: self.order_timeout,
            compensation_retry: FixedSchedule::new(
                self.compensation_retry_initial_delay,
                self.compensation_retry_interval,
            ),
            compensation_min_age: self.compensation_retry_interval,
            expiration: FixedSchedule::new(self.expiration_interval, self.expiration_interval),
            ..SagaConfig::default()
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(10),
            sweep_initial_delay: Duration::from_secs(5),
            grace_period: Duration::from_secs(10),
            send_timeout: Duration::from_millis(1000),
            partitions: 8,
            broker_retention: DEFAULT_RETENTION,
            compensation_retry_interval: Duration::from_secs(60),
            compensation_retry_initial_delay: Duration::from_secs(10),
            expiration_interval: Duration::from_secs(60),
            order_timeout: Duration::from_secs(1800),
            lock_wait: Duration::from_millis(3000),
            lock_lease: Duration::from_millis(5000),
            consumer_max_attempts: 4,
            consumer_backoff: Duration::from_millis(1000),
            metrics_port: 9000,
            database_url: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn from(pairs: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_default_values() {
        let config = from(&[]);
        assert_eq!(config, Config::default());
        assert_eq!(config.relay(), RelayConfig::default());
        assert_eq!(config.lock_options(), LockOptions::default());
        assert_eq!(config.consumer_backoff(), Backoff::default());
    }

    #[test]
    fn test_overrides() {
        let config = from(&[
            ("OUTBOX_SWEEP_INTERVAL_SECS", "2"),
            ("LOCK_WAIT_MS", "250"),
            ("BROKER_PARTITIONS", "16"),
            ("ORDER_TIMEOUT_SECS", "60"),
            ("DATABASE_URL", "postgres://localhost/orders"),
        ]);
        assert_eq!(config.sweep_interval, Duration::from_secs(2));
        assert_eq!(config.relay().sweep.interval, Duration::from_secs(2));
        assert_eq!(config.lock_options().wait, Duration::from_millis(250));
        assert_eq!(config.partitions, 16);
        assert_eq!(config.saga().order_timeout, Duration::from_secs(60));
        assert_eq!(config.database_url.as_deref(), Some("postgres://localhost/orders"));
    }

    #[test]
    fn test_out_of_range_numbers_fall_back() {
        let config = from(&[
            ("METRICS_PORT", "70000"),
            ("CONSUMER_MAX_ATTEMPTS", "99999999999999999999"),
            ("LOCK_LEASE_MS", "18446744073709551615"),
        ]);
        assert_eq!(config.metrics_port, 9000);
        assert_eq!(config.consumer_max_attempts, 4);
        assert_eq!(config.lock_lease, Duration::from_millis(u64::MAX));
    }

    #[test]
    fn test_saga_reissue_age_follows_retry_interval() {
        let config = from(&[("COMPENSATION_RETRY_INTERVAL_SECS", "5"), ("BROKER_RETENTION_RECORDS", "100")]);
        assert_eq!(config.saga().compensation_min_age, Duration::from_secs(5));
        assert_eq!(config.broker_retention, 100);
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let config = from(&[("METRICS_PORT", "not-a-port"), ("BROKER_PARTITIONS", "0"), ("DATABASE_URL", " ")]);
        assert_eq!(config.metrics_port, 9000);
        assert_eq!(config.partitions, 1);
        assert!(config.database_url.is_none());
    }
}
