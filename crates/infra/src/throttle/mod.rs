//! Per-actor rate limiting for sensitive actions (bans, kicks, timeouts).
//!
//! The counter store is the only source of truth: limits hold across every
//! process sharing it, and nothing is cached locally.

pub mod limiter;
#[cfg(feature = "redis")]
pub mod redis_store;
pub mod store;

pub use limiter::{SlidingWindowLimiter, ThrottleConfig, ThrottleError, ThrottleRule, wait_hint};
#[cfg(feature = "redis")]
pub use redis_store::RedisCounterStore;
pub use store::{
    CounterStore, CounterStoreError, InMemoryCounterStore, WindowDecision, WindowSnapshot,
};
