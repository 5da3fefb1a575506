//! Counter-store port for the sliding-window limiter.
//!
//! A store keeps, per key, a time-ordered set of `(score_ms, member)` entries.
//! `admit` is the whole check as one atomic step:
//!
//! 1. drop entries with `score <= now - window`
//! 2. count what is left
//! 3. if below `max`, insert `(now, member)` and expire the key after `window`
//!
//! Splitting these steps across round-trips would let two concurrent checks both
//! pass the count before either inserts.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicI64, Ordering};

use dashmap::DashMap;
use tracing::debug;

/// How often `admit` sweeps keys whose window has lapsed.
const SWEEP_INTERVAL_MS: i64 = 60_000;

/// Outcome of an atomic admit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowDecision {
    /// Entry recorded; `count` includes it.
    Admitted { count: u64 },
    /// Window full; nothing recorded.
    Rejected { count: u64, oldest_ms: Option<i64> },
}

impl WindowDecision {
    pub fn is_admitted(&self) -> bool {
        matches!(self, WindowDecision::Admitted { .. })
    }
}

/// Read-only view of one window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WindowSnapshot {
    pub count: u64,
    pub oldest_ms: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CounterStoreError {
    #[error("counter store connection error: {0}")]
    Connection(String),
    #[error("counter store command failed: {0}")]
    Command(String),
}

/// Shared, atomic sorted-set counter store.
#[async_trait::async_trait]
pub trait CounterStore: Send + Sync + core::fmt::Debug {
    async fn admit(
        &self,
        key: &str,
        now_ms: i64,
        window_ms: u64,
        max: u32,
        member: &str,
    ) -> Result<WindowDecision, CounterStoreError>;

    /// Entries still inside the window at `now_ms`, without modifying anything.
    async fn window(
        &self,
        key: &str,
        now_ms: i64,
        window_ms: u64,
    ) -> Result<WindowSnapshot, CounterStoreError>;

    /// Delete the key. Returns whether it existed.
    async fn remove(&self, key: &str) -> Result<bool, CounterStoreError>;
}

#[async_trait::async_trait]
impl<S> CounterStore for std::sync::Arc<S>
where
    S: CounterStore + ?Sized,
{
    async fn admit(
        &self,
        key: &str,
        now_ms: i64,
        window_ms: u64,
        max: u32,
        member: &str,
    ) -> Result<WindowDecision, CounterStoreError> {
        (**self).admit(key, now_ms, window_ms, max, member).await
    }

    async fn window(
        &self,
        key: &str,
        now_ms: i64,
        window_ms: u64,
    ) -> Result<WindowSnapshot, CounterStoreError> {
        (**self).window(key, now_ms, window_ms).await
    }

    async fn remove(&self, key: &str) -> Result<bool, CounterStoreError> {
        (**self).remove(key).await
    }
}

#[derive(Debug, Default)]
struct Window {
    entries: BTreeSet<(i64, String)>,
    expires_at_ms: i64,
}

impl Window {
    fn is_expired(&self, now_ms: i64) -> bool {
        now_ms >= self.expires_at_ms
    }

    fn live(&self, now_ms: i64, window_ms: u64) -> impl Iterator<Item = &(i64, String)> {
        let cutoff = now_ms.saturating_sub(window_ms as i64);
        self.entries.iter().filter(move |(score, _)| *score > cutoff)
    }
}

/// In-process counter store.
///
/// - Sharded map; `admit` holds the key's shard lock for the whole check
/// - Only correct for a single process; multi-instance deployments need Redis
/// - Lapsed keys are swept at most once per minute of caller time, from `admit`
#[derive(Debug, Default)]
pub struct InMemoryCounterStore {
    windows: DashMap<String, Window>,
    next_sweep_ms: AtomicI64,
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently held (lapsed ones included until the next sweep).
    pub fn key_count(&self) -> usize {
        self.windows.len()
    }

    fn sweep_expired(&self, now_ms: i64) {
        let due = self.next_sweep_ms.load(Ordering::Acquire);
        if now_ms < due {
            return;
        }
        let next = now_ms.saturating_add(SWEEP_INTERVAL_MS);
        if self
            .next_sweep_ms
            .compare_exchange(due, next, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // Another caller is sweeping.
            return;
        }

        let before = self.windows.len();
        self.windows.retain(|_, window| !window.is_expired(now_ms));
        let swept = before.saturating_sub(self.windows.len());
        if swept > 0 {
            debug!(swept, "lapsed throttle windows swept");
        }
    }
}

#[async_trait::async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn admit(
        &self,
        key: &str,
        now_ms: i64,
        window_ms: u64,
        max: u32,
        member: &str,
    ) -> Result<WindowDecision, CounterStoreError> {
        self.sweep_expired(now_ms);

        let mut window = self.windows.entry(key.to_string()).or_default();
        if window.is_expired(now_ms) {
            window.entries.clear();
        }

        let cutoff = now_ms.saturating_sub(window_ms as i64);
        window.entries.retain(|(score, _)| *score > cutoff);

        let count = window.entries.len() as u64;
        if count >= u64::from(max) {
            let oldest_ms = window.entries.first().map(|(score, _)| *score);
            return Ok(WindowDecision::Rejected { count, oldest_ms });
        }

        window.entries.insert((now_ms, member.to_string()));
        window.expires_at_ms = now_ms.saturating_add(window_ms as i64);
        Ok(WindowDecision::Admitted { count: count + 1 })
    }

    async fn window(
        &self,
        key: &str,
        now_ms: i64,
        window_ms: u64,
    ) -> Result<WindowSnapshot, CounterStoreError> {
        let Some(window) = self.windows.get(key).filter(|w| !w.is_expired(now_ms)) else {
            return Ok(WindowSnapshot::default());
        };

        let mut live = window.live(now_ms, window_ms).peekable();
        let oldest_ms = live.peek().map(|(score, _)| *score);
        Ok(WindowSnapshot {
            count: live.count() as u64,
            oldest_ms,
        })
    }

    async fn remove(&self, key: &str) -> Result<bool, CounterStoreError> {
        Ok(self.windows.remove(key).is_some())
    }
}
