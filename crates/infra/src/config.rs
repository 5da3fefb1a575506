//! Configuration loading and representation.
//!
//! Everything comes from environment variables with documented defaults:
//!
//! | Variable | Default |
//! |---|---|
//! | `REDIS_URL` | unset (in-memory broker) |
//! | `MODBRIDGE_KEY_PREFIX` | `modbridge` |
//! | `BROKER_CONNECT_ATTEMPTS` | 5 |
//! | `BROKER_RECONNECT_BASE_MS` / `BROKER_RECONNECT_MAX_MS` | 1000 / 30000 |
//! | `QUEUE_MAX_ATTEMPTS` / `QUEUE_BACKOFF_MS` | 3 / 2000 |
//! | `QUEUE_KEEP_COMPLETED` / `QUEUE_KEEP_FAILED` | 100 / 50 |
//! | `CIRCUIT_FAILURE_THRESHOLD` | 5 |
//! | `CIRCUIT_RECOVERY_TIMEOUT_MS` / `CIRCUIT_MONITOR_INTERVAL_MS` | 30000 / 10000 |
//! | `QUERY_TIMEOUT_MS` | 30000 |
//! | `WORKER_POLL_INTERVAL_MS` | 250 |

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use modbridge_core::Clock;

use crate::jobs::{
    BrokerConnector, InMemoryBroker, InMemoryConnector, QueueOptions, RegistryConfig, RetryPolicy,
    WorkerConfig,
};
use crate::query::QueryConfig;
use crate::resilience::CircuitBreakerConfig;
use crate::throttle::ThrottleConfig;

const MAX_BACKOFF: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Process-wide infrastructure settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfraConfig {
    pub redis_url: Option<String>,
    pub key_prefix: String,
    pub connect_attempts: u32,
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,
    pub queue_max_attempts: u32,
    pub queue_backoff: Duration,
    pub keep_completed: usize,
    pub keep_failed: usize,
    pub queue_stall_timeout: Duration,
    pub circuit_failure_threshold: u32,
    pub circuit_recovery_timeout: Duration,
    pub circuit_monitor_interval: Duration,
    pub query_timeout: Duration,
    pub worker_poll_interval: Duration,
}

impl Default for InfraConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            key_prefix: "modbridge".to_string(),
            connect_attempts: 5,
            reconnect_base: Duration::from_millis(1_000),
            reconnect_max: Duration::from_millis(30_000),
            queue_max_attempts: 3,
            queue_backoff: Duration::from_millis(2_000),
            keep_completed: 100,
            keep_failed: 50,
            queue_stall_timeout: Duration::from_millis(30_000),
            circuit_failure_threshold: 5,
            circuit_recovery_timeout: Duration::from_millis(30_000),
            circuit_monitor_interval: Duration::from_millis(10_000),
            query_timeout: Duration::from_millis(30_000),
            worker_poll_interval: Duration::from_millis(250),
        }
    }
}

impl InfraConfig {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load through an arbitrary lookup (tests pass a map).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let env = Lookup(&lookup);

        let redis_url = lookup("REDIS_URL").filter(|url| !url.trim().is_empty());
        if redis_url.is_none() {
            tracing::warn!("REDIS_URL not set; queues and throttles are process-local");
        }

        let config = Self {
            redis_url,
            key_prefix: lookup("MODBRIDGE_KEY_PREFIX")
                .filter(|p| !p.trim().is_empty())
                .unwrap_or(defaults.key_prefix),
            connect_attempts: env.positive("BROKER_CONNECT_ATTEMPTS", defaults.connect_attempts)?,
            reconnect_base: env.millis("BROKER_RECONNECT_BASE_MS", defaults.reconnect_base)?,
            reconnect_max: env.millis("BROKER_RECONNECT_MAX_MS", defaults.reconnect_max)?,
            queue_max_attempts: env.positive("QUEUE_MAX_ATTEMPTS", defaults.queue_max_attempts)?,
            queue_backoff: env.millis("QUEUE_BACKOFF_MS", defaults.queue_backoff)?,
            keep_completed: env.parse("QUEUE_KEEP_COMPLETED", defaults.keep_completed)?,
            keep_failed: env.parse("QUEUE_KEEP_FAILED", defaults.keep_failed)?,
            queue_stall_timeout: env.millis("QUEUE_STALL_TIMEOUT_MS", defaults.queue_stall_timeout)?,
            circuit_failure_threshold: env
                .positive("CIRCUIT_FAILURE_THRESHOLD", defaults.circuit_failure_threshold)?,
            circuit_recovery_timeout: env
                .millis("CIRCUIT_RECOVERY_TIMEOUT_MS", defaults.circuit_recovery_timeout)?,
            circuit_monitor_interval: env
                .millis("CIRCUIT_MONITOR_INTERVAL_MS", defaults.circuit_monitor_interval)?,
            query_timeout: env.millis("QUERY_TIMEOUT_MS", defaults.query_timeout)?,
            worker_poll_interval: env.millis("WORKER_POLL_INTERVAL_MS", defaults.worker_poll_interval)?,
        };

        if config.reconnect_max < config.reconnect_base {
            return Err(ConfigError::Invalid {
                key: "BROKER_RECONNECT_MAX_MS",
                value: config.reconnect_max.as_millis().to_string(),
                reason: "must not be below BROKER_RECONNECT_BASE_MS".to_string(),
            });
        }
        Ok(config)
    }

    pub fn queue_options(&self) -> QueueOptions {
        QueueOptions {
            retry: RetryPolicy::exponential(
                self.queue_max_attempts,
                self.queue_backoff,
                MAX_BACKOFF.max(self.queue_backoff),
            ),
            keep_completed: self.keep_completed,
            keep_failed: self.keep_failed,
            stall_timeout: self.queue_stall_timeout,
        }
    }

    pub fn circuit_breaker(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.circuit_failure_threshold,
            recovery_timeout: self.circuit_recovery_timeout,
            monitoring_interval: self.circuit_monitor_interval,
        }
    }

    pub fn registry(&self) -> RegistryConfig {
        RegistryConfig {
            connect_attempts: self.connect_attempts,
            reconnect_base: self.reconnect_base,
            reconnect_max: self.reconnect_max,
            queue_defaults: self.queue_options(),
            breaker: self.circuit_breaker(),
            ..RegistryConfig::default()
        }
    }

    pub fn query(&self) -> QueryConfig {
        QueryConfig::default().with_timeout(self.query_timeout)
    }

    pub fn worker(&self) -> WorkerConfig {
        WorkerConfig::default().with_poll_interval(self.worker_poll_interval)
    }

    pub fn throttle(&self) -> ThrottleConfig {
        ThrottleConfig::default().with_key_prefix(self.key_prefix.clone())
    }

    /// Connector for the configured broker.
    ///
    /// Without `REDIS_URL` (or without the `redis` feature) this is a fresh
    /// in-memory broker.
    pub fn broker_connector(&self, clock: Arc<dyn Clock>) -> Arc<dyn BrokerConnector> {
        #[cfg(feature = "redis")]
        if let Some(url) = &self.redis_url {
            return Arc::new(crate::jobs::RedisConnector::new(
                url.clone(),
                self.key_prefix.clone(),
                clock,
            ));
        }

        #[cfg(not(feature = "redis"))]
        if self.redis_url.is_some() {
            tracing::warn!("REDIS_URL is set but the redis feature is disabled; using in-memory broker");
        }

        Arc::new(InMemoryConnector::new(InMemoryBroker::arc(clock)))
    }
}

struct Lookup<'a, F>(&'a F);

impl<F> Lookup<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn parse<T>(&self, key: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: core::fmt::Display,
    {
        match (self.0)(key) {
            None => Ok(default),
            Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
                key,
                value: raw.clone(),
                reason: e.to_string(),
            }),
        }
    }

    fn positive(&self, key: &'static str, default: u32) -> Result<u32, ConfigError> {
        let value = self.parse(key, default)?;
        if value == 0 {
            return Err(ConfigError::Invalid {
                key,
                value: value.to_string(),
                reason: "must be greater than 0".to_string(),
            });
        }
        Ok(value)
    }

    fn millis(&self, key: &'static str, default: Duration) -> Result<Duration, ConfigError> {
        let default_ms = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
        Ok(Duration::from_millis(self.parse(key, default_ms)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<InfraConfig, ConfigError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        InfraConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn empty_environment_gives_defaults() {
        assert_eq!(load(&[]).unwrap(), InfraConfig::default());
    }

    #[test]
    fn overrides_are_applied() {
        let config = load(&[
            ("REDIS_URL", "redis://cache:6379"),
            ("MODBRIDGE_KEY_PREFIX", "bot"),
            ("QUEUE_MAX_ATTEMPTS", "5"),
            ("QUEUE_BACKOFF_MS", "500"),
            ("QUEUE_STALL_TIMEOUT_MS", "90000"),
            ("CIRCUIT_RECOVERY_TIMEOUT_MS", "1000"),
            ("QUERY_TIMEOUT_MS", " 2500 "),
        ])
        .unwrap();

        assert_eq!(config.redis_url.as_deref(), Some("redis://cache:6379"));
        assert_eq!(config.throttle().key_prefix, "bot");

        let options = config.queue_options();
        assert_eq!(options.retry.max_attempts, 5);
        assert_eq!(options.retry.backoff.delay_for_attempt(1), Duration::from_millis(500));
        assert_eq!(options.stall_timeout, Duration::from_secs(90));
        assert_eq!(config.registry().queue_defaults, options);
        assert_eq!(config.circuit_breaker().recovery_timeout, Duration::from_secs(1));
        assert_eq!(config.query().timeout, Duration::from_millis(2_500));
    }

    #[test]
    fn malformed_numbers_are_errors() {
        let err = load(&[("QUEUE_KEEP_FAILED", "lots")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "QUEUE_KEEP_FAILED", .. }));

        let err = load(&[("QUEUE_MAX_ATTEMPTS", "0")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "QUEUE_MAX_ATTEMPTS", .. }));

        let err = load(&[("BROKER_RECONNECT_BASE_MS", "5000"), ("BROKER_RECONNECT_MAX_MS", "10")])
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "BROKER_RECONNECT_MAX_MS", .. }));
    }

    #[test]
    fn defaults_match_component_defaults() {
        let config = InfraConfig::default();
        assert_eq!(config.queue_options(), QueueOptions::default());
        assert_eq!(config.circuit_breaker(), CircuitBreakerConfig::default());
        assert_eq!(config.worker().poll_interval, WorkerConfig::default().poll_interval);
    }

    #[tokio::test]
    async fn without_redis_the_connector_is_in_memory() {
        let clock: Arc<dyn Clock> = Arc::new(modbridge_core::ManualClock::starting_now());
        let connector = InfraConfig::default().broker_connector(clock);
        let broker = connector.connect().await.unwrap();
        broker.ping().await.unwrap();
    }
}
