//! Named breakers shared by every caller in the process.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::info;

use modbridge_core::Clock;
use modbridge_observability::Metrics;

use super::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStatus, MonitorHandle};

#[derive(Debug, Default)]
struct Entries {
    breakers: HashMap<String, Arc<CircuitBreaker>>,
    monitors: HashMap<String, MonitorHandle>,
}

/// Hands out one breaker per operation name and owns their monitors.
///
/// Constructed once at startup and passed to whoever needs a breaker; there is
/// no global instance.
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    defaults: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    metrics: Arc<Metrics>,
    monitor: bool,
    entries: Mutex<Entries>,
}

impl CircuitBreakerRegistry {
    pub fn new(
        defaults: CircuitBreakerConfig,
        clock: Arc<dyn Clock>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            defaults,
            clock,
            metrics,
            monitor: true,
            entries: Mutex::new(Entries::default()),
        }
    }

    /// Disable the periodic stats monitor for breakers created from now on.
    pub fn without_monitors(mut self) -> Self {
        self.monitor = false;
        self
    }

    /// Breaker for `name` with the registry defaults, created on first use.
    pub fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        self.get_with(name, self.defaults)
    }

    /// Breaker for `name`; `config` only applies if the breaker does not exist yet.
    pub fn get_with(&self, name: &str, config: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(existing) = entries.breakers.get(name) {
            return existing.clone();
        }

        let breaker = Arc::new(CircuitBreaker::new(
            name,
            config,
            self.clock.clone(),
            self.metrics.clone(),
        ));
        entries.breakers.insert(name.to_string(), breaker.clone());

        // Monitors need a runtime; breakers created outside one just skip it.
        if self.monitor && tokio::runtime::Handle::try_current().is_ok() {
            entries.monitors.insert(name.to_string(), breaker.spawn_monitor());
        }

        info!(breaker = %name, threshold = config.failure_threshold, "circuit breaker registered");
        breaker
    }

    pub fn find(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        let entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        entries.breakers.get(name).cloned()
    }

    /// Status of every breaker, sorted by name.
    pub fn statuses(&self) -> Vec<CircuitBreakerStatus> {
        let breakers: Vec<Arc<CircuitBreaker>> = {
            let entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
            entries.breakers.values().cloned().collect()
        };
        let mut out: Vec<_> = breakers.iter().map(|b| b.status()).collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    pub fn reset_all(&self) {
        let breakers: Vec<Arc<CircuitBreaker>> = {
            let entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
            entries.breakers.values().cloned().collect()
        };
        for breaker in breakers {
            breaker.reset();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|p| p.into_inner()).breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
