//! Failure isolation for downstream calls.

pub mod circuit_breaker;
pub mod registry;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitBreakerStatus, CircuitState,
    MonitorHandle,
};
pub use registry::CircuitBreakerRegistry;
