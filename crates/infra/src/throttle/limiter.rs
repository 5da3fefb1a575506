//! Sliding-window limiter for sensitive repeated actions.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use modbridge_core::{ActorId, Clock, CoreError};
use modbridge_observability::Metrics;

use super::store::{CounterStore, CounterStoreError, WindowDecision};

/// `max` actions per `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrottleRule {
    window: Duration,
    max: u32,
}

impl ThrottleRule {
    /// # Errors
    /// Returns `Validation` if the window is shorter than 1ms or `max` is zero.
    pub fn new(window: Duration, max: u32) -> Result<Self, CoreError> {
        if window.as_millis() == 0 {
            return Err(CoreError::validation("throttle window must be at least 1ms"));
        }
        if max == 0 {
            return Err(CoreError::validation("throttle max must be greater than 0"));
        }
        Ok(Self { window, max })
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn window_ms(&self) -> u64 {
        u64::try_from(self.window.as_millis()).unwrap_or(u64::MAX)
    }

    pub fn max(&self) -> u32 {
        self.max
    }
}

/// Per-action rules plus the fallback rule.
#[derive(Debug, Clone)]
pub struct ThrottleConfig {
    pub default_rule: ThrottleRule,
    pub rules: HashMap<String, ThrottleRule>,
    /// Namespace for store keys.
    pub key_prefix: String,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        let five_secs = Duration::from_secs(5);
        let rule = |max| ThrottleRule { window: five_secs, max };

        Self {
            default_rule: rule(1),
            rules: HashMap::from([
                ("ban".to_string(), rule(1)),
                ("kick".to_string(), rule(2)),
                ("timeout".to_string(), rule(3)),
            ]),
            key_prefix: "modbridge".to_string(),
        }
    }
}

impl ThrottleConfig {
    pub fn with_rule(mut self, action: impl Into<String>, rule: ThrottleRule) -> Self {
        self.rules.insert(action.into(), rule);
        self
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn rule_for(&self, action: &str) -> ThrottleRule {
        self.rules.get(action).copied().unwrap_or(self.default_rule)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ThrottleError {
    #[error("{hint}")]
    Throttled {
        action: String,
        retry_after: Duration,
        hint: String,
    },
    /// The store could not be consulted; the action is refused.
    #[error("throttle store unavailable: {0}")]
    Unavailable(#[from] CounterStoreError),
}

impl ThrottleError {
    pub fn is_throttled(&self) -> bool {
        matches!(self, ThrottleError::Throttled { .. })
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ThrottleError::Throttled { retry_after, .. } => Some(*retry_after),
            ThrottleError::Unavailable(_) => None,
        }
    }
}

/// User-facing wait hint; seconds are rounded up.
pub fn wait_hint(action: &str, retry_after: Duration) -> String {
    let secs = retry_after.as_millis().div_ceil(1000);
    format!("You're doing that too fast. Try {action} again in {secs}s.")
}

/// Sliding-window limiter over a shared [`CounterStore`].
///
/// Holds no throttle state of its own; every decision is made by the store.
#[derive(Debug, Clone)]
pub struct SlidingWindowLimiter {
    store: Arc<dyn CounterStore>,
    config: Arc<ThrottleConfig>,
    clock: Arc<dyn Clock>,
    metrics: Arc<Metrics>,
}

impl SlidingWindowLimiter {
    pub fn new(
        store: Arc<dyn CounterStore>,
        config: ThrottleConfig,
        clock: Arc<dyn Clock>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            store,
            config: Arc::new(config),
            clock,
            metrics,
        }
    }

    pub fn config(&self) -> &ThrottleConfig {
        &self.config
    }

    fn key(&self, actor: &ActorId, action: &str) -> String {
        format!("{}:throttle:{}:{}", self.config.key_prefix, actor, action)
    }

    /// Record one `action` by `actor`, or refuse it.
    ///
    /// # Errors
    /// - `Throttled` when the window for this actor/action is full
    /// - `Unavailable` when the store fails (the action is not allowed through)
    pub async fn check(&self, actor: &ActorId, action: &str) -> Result<(), ThrottleError> {
        let rule = self.config.rule_for(action);
        let key = self.key(actor, action);
        let now_ms = self.clock.now_ms();
        let member = format!("{now_ms}-{}", uuid::Uuid::now_v7());

        let decision = match self
            .store
            .admit(&key, now_ms, rule.window_ms(), rule.max(), &member)
            .await
        {
            Ok(decision) => decision,
            Err(e) => {
                warn!(actor = %actor, action = %action, error = %e, "throttle store unavailable, refusing action");
                self.metrics.record_throttle_rejection(action);
                return Err(ThrottleError::Unavailable(e));
            }
        };

        match decision {
            WindowDecision::Admitted { count } => {
                debug!(actor = %actor, action = %action, count, max = rule.max(), "action admitted");
                Ok(())
            }
            WindowDecision::Rejected { count, oldest_ms } => {
                let retry_after = oldest_ms
                    .map(|oldest| remaining(oldest, rule.window_ms(), now_ms))
                    .unwrap_or(rule.window);
                let hint = wait_hint(action, retry_after);
                warn!(
                    actor = %actor,
                    action = %action,
                    count,
                    retry_after_ms = retry_after.as_millis() as u64,
                    "action throttled"
                );
                self.metrics.record_throttle_rejection(action);
                Err(ThrottleError::Throttled {
                    action: action.to_string(),
                    retry_after,
                    hint,
                })
            }
        }
    }

    /// Time until the oldest recorded action leaves `window`; zero if none is recorded.
    pub async fn remaining_cooldown(
        &self,
        actor: &ActorId,
        action: &str,
        window: Duration,
    ) -> Result<Duration, ThrottleError> {
        let window_ms = u64::try_from(window.as_millis()).unwrap_or(u64::MAX);
        let now_ms = self.clock.now_ms();
        let snapshot = self
            .store
            .window(&self.key(actor, action), now_ms, window_ms)
            .await?;

        Ok(snapshot
            .oldest_ms
            .map(|oldest| remaining(oldest, window_ms, now_ms))
            .unwrap_or(Duration::ZERO))
    }

    /// Administrative override: forget every recorded action for this pair.
    pub async fn clear_throttle(&self, actor: &ActorId, action: &str) -> Result<bool, ThrottleError> {
        let removed = self.store.remove(&self.key(actor, action)).await?;
        info!(actor = %actor, action = %action, removed, "throttle cleared");
        Ok(removed)
    }
}

fn remaining(oldest_ms: i64, window_ms: u64, now_ms: i64) -> Duration {
    let expires_at = oldest_ms.saturating_add(window_ms as i64);
    Duration::from_millis(expires_at.saturating_sub(now_ms).max(0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::throttle::store::{InMemoryCounterStore, WindowSnapshot};
    use modbridge_core::ManualClock;
    use modbridge_observability::metrics::names;
    use modbridge_observability::metrics::test_harness::MetricTestHarness;

    #[derive(Debug)]
    struct BrokenStore;

    #[async_trait::async_trait]
    impl CounterStore for BrokenStore {
        async fn admit(
            &self,
            _key: &str,
            _now_ms: i64,
            _window_ms: u64,
            _max: u32,
            _member: &str,
        ) -> Result<WindowDecision, CounterStoreError> {
            Err(CounterStoreError::Connection("refused".to_string()))
        }

        async fn window(
            &self,
            _key: &str,
            _now_ms: i64,
            _window_ms: u64,
        ) -> Result<WindowSnapshot, CounterStoreError> {
            Err(CounterStoreError::Connection("refused".to_string()))
        }

        async fn remove(&self, _key: &str) -> Result<bool, CounterStoreError> {
            Err(CounterStoreError::Connection("refused".to_string()))
        }
    }

    fn limiter(clock: &ManualClock) -> (SlidingWindowLimiter, MetricTestHarness, Arc<InMemoryCounterStore>) {
        let metrics = MetricTestHarness::new();
        let store = Arc::new(InMemoryCounterStore::new());
        let limiter = SlidingWindowLimiter::new(
            store.clone(),
            ThrottleConfig::default(),
            Arc::new(clock.clone()),
            metrics.metrics.clone(),
        );
        (limiter, metrics, store)
    }

    fn mod_user() -> ActorId {
        ActorId::parse("mod-1").unwrap()
    }

    #[test]
    fn rule_validation() {
        assert!(ThrottleRule::new(Duration::ZERO, 1).is_err());
        assert!(ThrottleRule::new(Duration::from_micros(500), 1).is_err());
        assert!(ThrottleRule::new(Duration::from_secs(1), 0).is_err());
        assert!(ThrottleRule::new(Duration::from_secs(1), 1).is_ok());
    }

    #[test]
    fn default_rules() {
        let config = ThrottleConfig::default();
        assert_eq!(config.rule_for("ban").max(), 1);
        assert_eq!(config.rule_for("kick").max(), 2);
        assert_eq!(config.rule_for("timeout").max(), 3);
        let fallback = config.rule_for("warn");
        assert_eq!((fallback.window_ms(), fallback.max()), (5_000, 1));
    }

    #[test]
    fn custom_rules_override_defaults() {
        let config = ThrottleConfig::default()
            .with_rule("ban", ThrottleRule::new(Duration::from_secs(60), 4).unwrap())
            .with_rule("mute", ThrottleRule::new(Duration::from_secs(10), 2).unwrap());
        assert_eq!(config.rule_for("ban").max(), 4);
        assert_eq!(config.rule_for("mute").window_ms(), 10_000);
        assert_eq!(config.rule_for("kick").max(), 2);
    }

    #[test]
    fn hint_rounds_seconds_up() {
        assert_eq!(
            wait_hint("ban", Duration::from_millis(1_200)),
            "You're doing that too fast. Try ban again in 2s."
        );
        assert_eq!(
            wait_hint("kick", Duration::from_millis(5_000)),
            "You're doing that too fast. Try kick again in 5s."
        );
    }

    #[tokio::test]
    async fn second_check_within_window_is_throttled() {
        let clock = ManualClock::starting_now();
        let (limiter, metrics, _) = limiter(&clock);

        limiter.check(&mod_user(), "ban").await.unwrap();

        clock.advance(Duration::from_millis(3_800));
        let err = limiter.check(&mod_user(), "ban").await.unwrap_err();
        assert_eq!(
            err,
            ThrottleError::Throttled {
                action: "ban".to_string(),
                retry_after: Duration::from_millis(1_200),
                hint: "You're doing that too fast. Try ban again in 2s.".to_string(),
            }
        );
        assert_eq!(metrics.counter(names::THROTTLE_REJECTIONS, &[("action", "ban")]), 1);

        clock.advance(Duration::from_millis(1_200));
        limiter.check(&mod_user(), "ban").await.unwrap();
    }

    #[tokio::test]
    async fn rules_are_per_action_and_per_actor() {
        let clock = ManualClock::starting_now();
        let (limiter, _, _) = limiter(&clock);
        let other = ActorId::parse("mod-2").unwrap();

        limiter.check(&mod_user(), "kick").await.unwrap();
        limiter.check(&mod_user(), "kick").await.unwrap();
        assert!(limiter.check(&mod_user(), "kick").await.unwrap_err().is_throttled());

        limiter.check(&other, "kick").await.unwrap();
        limiter.check(&mod_user(), "timeout").await.unwrap();
    }

    #[tokio::test]
    async fn remaining_cooldown_and_clear() {
        let clock = ManualClock::starting_now();
        let (limiter, _, store) = limiter(&clock);
        let window = Duration::from_secs(5);

        assert_eq!(
            limiter.remaining_cooldown(&mod_user(), "ban", window).await.unwrap(),
            Duration::ZERO
        );

        limiter.check(&mod_user(), "ban").await.unwrap();
        clock.advance(Duration::from_secs(2));
        assert_eq!(
            limiter.remaining_cooldown(&mod_user(), "ban", window).await.unwrap(),
            Duration::from_secs(3)
        );

        assert!(limiter.clear_throttle(&mod_user(), "ban").await.unwrap());
        assert_eq!(store.key_count(), 0);
        limiter.check(&mod_user(), "ban").await.unwrap();
    }

    #[tokio::test]
    async fn keys_are_namespaced() {
        let clock = ManualClock::starting_now();
        let (limiter, _, store) = limiter(&clock);
        limiter.check(&mod_user(), "ban").await.unwrap();

        let snap = store
            .window("modbridge:throttle:mod-1:ban", clock.now_ms(), 5_000)
            .await
            .unwrap();
        assert_eq!(snap.count, 1);
    }

    #[tokio::test]
    async fn store_failure_fails_closed() {
        let metrics = MetricTestHarness::new();
        let limiter = SlidingWindowLimiter::new(
            Arc::new(BrokenStore),
            ThrottleConfig::default(),
            Arc::new(ManualClock::starting_now()),
            metrics.metrics.clone(),
        );

        let err = limiter.check(&mod_user(), "ban").await.unwrap_err();
        assert!(matches!(err, ThrottleError::Unavailable(CounterStoreError::Connection(_))));
        assert_eq!(err.retry_after(), None);
        assert_eq!(metrics.counter(names::THROTTLE_REJECTIONS, &[("action", "ban")]), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_checks_admit_exactly_max() {
        let clock = ManualClock::starting_now();
        let (limiter, metrics, _) = limiter(&clock);

        let tasks: Vec<_> = (0..32)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move { limiter.check(&mod_user(), "ban").await })
            })
            .collect();

        let mut admitted = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(()) => admitted += 1,
                Err(e) => assert!(e.is_throttled()),
            }
        }

        assert_eq!(admitted, 1);
        assert_eq!(metrics.counter(names::THROTTLE_REJECTIONS, &[("action", "ban")]), 31);
    }
}
